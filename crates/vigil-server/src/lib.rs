//! HTTP front end and process wiring for the vigil alert scheduler.

pub mod api;
pub mod app;
pub mod config;
pub mod evaluator;
pub mod logging;
pub mod state;

//! Shared data model for the vigil alert scheduler: alert keys, statuses,
//! events, incidents, actions, silences, and rule definitions.

pub mod conf;
pub mod id;
pub mod tags;
pub mod types;

pub use tags::{AlertKey, TagSet};
pub use types::{Event, IncidentState, Status};

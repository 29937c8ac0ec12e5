use crate::config::ServerConfig;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use vigil_sched::Schedule;

#[derive(Clone)]
pub struct AppState {
    pub schedule: Arc<Schedule>,
    pub config: Arc<ServerConfig>,
    pub start_time: DateTime<Utc>,
}

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Aggregate scheduler state, refreshed on every base tick.
///
/// Gauges (`open_incidents` and friends) are recomputed from the incident
/// store; counters accumulate for the life of the process.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CollectedMetrics {
    pub open_incidents: usize,
    pub need_ack: usize,
    pub unevaluated: usize,
    /// Open incidents by current status.
    pub by_status: BTreeMap<String, usize>,
    /// Evaluation failure count per alert, from the health store.
    pub alert_failures: BTreeMap<String, u64>,
    pub checks_run: u64,
    pub checks_dropped: u64,
    pub check_panics: u64,
    pub history_errors: u64,
    pub notifications_sent: u64,
    pub notifications_suppressed: u64,
    /// Pending notifications that hit a storage error while dispatching.
    pub dispatch_errors: u64,
    pub collected_at: Option<DateTime<Utc>>,
}

//! Persistence collaborators for the alert scheduler.
//!
//! The scheduler only talks to the traits defined here. Two backends are
//! provided: [`memory::MemoryStore`] for tests and ephemeral runs, and
//! [`sqlite::SqliteStore`], a single-file SQLite database (WAL mode) that
//! keeps incidents and the notification due-queue across restarts.

pub mod error;
pub mod memory;
pub mod sqlite;


use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use vigil_common::types::{AlertHealth, IncidentState, Silence};
use vigil_common::AlertKey;

pub use error::{Result, StorageError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// One entry of the durable notification due-queue.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DueNotification {
    pub alert_key: AlertKey,
    pub notification: String,
    pub due: DateTime<Utc>,
}

/// Storage of incidents and per-key bookkeeping.
///
/// Implementations must provide idempotent upserts keyed by incident id so
/// that a retried update never creates a second incident.
#[async_trait]
pub trait IncidentStore: Send + Sync {
    /// Returns the open incident for `key`, if any.
    async fn get_open_incident(&self, key: &AlertKey) -> Result<Option<IncidentState>>;

    /// Returns the most recent incident for `key`, open or closed.
    async fn get_latest_incident(&self, key: &AlertKey) -> Result<Option<IncidentState>>;

    async fn get_incident(&self, id: i64) -> Result<Option<IncidentState>>;

    /// Inserts (when `state.id == 0`) or replaces an incident and returns its id.
    async fn update_incident(&self, state: &IncidentState) -> Result<i64>;

    /// Ids of every stored incident for `key`, in ascending order.
    async fn incident_ids_for_key(&self, key: &AlertKey) -> Result<Vec<i64>>;

    async fn get_all_open_incidents(&self) -> Result<Vec<IncidentState>>;

    /// Records the unevaluated flag for keys that have no incident to carry it.
    async fn set_unevaluated(&self, key: &AlertKey, unevaluated: bool) -> Result<()>;

    /// Keys of `alert` currently flagged unevaluated, either on their open
    /// incident or through [`IncidentStore::set_unevaluated`].
    async fn get_unevaluated(&self, alert: &str) -> Result<Vec<AlertKey>>;

    /// Drops every incident and bookkeeping entry for `key`.
    async fn forget(&self, key: &AlertKey) -> Result<()>;

    /// Records that `key` produced a result at `time`.
    async fn touch_alert_key(&self, key: &AlertKey, time: DateTime<Utc>) -> Result<()>;

    /// Keys of `alert` last touched strictly before `time`.
    async fn get_untouched_since(&self, alert: &str, time: DateTime<Utc>) -> Result<Vec<AlertKey>>;
}

/// The durable notification due-queue. Entries are unique per
/// (alert key, notification); inserting again replaces the due time.
#[async_trait]
pub trait NotificationQueue: Send + Sync {
    async fn insert_due(&self, key: &AlertKey, notification: &str, due: DateTime<Utc>) -> Result<()>;

    /// Entries due at or before `now`, ordered by alert key then notification.
    async fn get_due(&self, now: DateTime<Utc>) -> Result<Vec<DueNotification>>;

    /// Removes the given entries, skipping any whose due time changed since
    /// they were read.
    async fn remove_entries(&self, entries: &[DueNotification]) -> Result<()>;

    /// Removes every entry due at or before `time`.
    async fn clear_before(&self, time: DateTime<Utc>) -> Result<()>;

    async fn clear_for_key(&self, key: &AlertKey) -> Result<()>;

    async fn next_due_time(&self) -> Result<Option<DateTime<Utc>>>;

    /// All queued entries for `key`.
    async fn entries_for_key(&self, key: &AlertKey) -> Result<Vec<DueNotification>>;
}

#[async_trait]
pub trait SilenceStore: Send + Sync {
    /// Silences with `start <= now < end`.
    async fn get_active_silences(&self, now: DateTime<Utc>) -> Result<Vec<Silence>>;

    async fn list_silences(&self) -> Result<Vec<Silence>>;

    async fn add_silence(&self, silence: &Silence) -> Result<()>;

    /// Returns true when a silence with `id` existed.
    async fn delete_silence(&self, id: &str) -> Result<bool>;
}

/// Per-alert evaluation health.
#[async_trait]
pub trait HealthStore: Send + Sync {
    async fn mark_success(&self, alert: &str, time: DateTime<Utc>) -> Result<()>;

    async fn mark_failure(&self, alert: &str, message: &str, time: DateTime<Utc>) -> Result<()>;

    async fn is_failing(&self, alert: &str) -> Result<bool>;

    async fn health(&self, alert: &str) -> Result<AlertHealth>;

    async fn all_health(&self) -> Result<BTreeMap<String, AlertHealth>>;
}

/// A backend that provides every collaborator the scheduler needs.
pub trait Store: IncidentStore + NotificationQueue + SilenceStore + HealthStore {}

impl<T> Store for T where T: IncidentStore + NotificationQueue + SilenceStore + HealthStore {}

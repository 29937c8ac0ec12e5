//! Alert scheduler, incident state machine and notification escalation.
//!
//! A [`Schedule`] owns one evaluation loop per alert definition, a base-tick
//! scheduler loop that signals them, and a notification dispatcher that
//! drains the durable due-queue. Everything it talks to (storage,
//! expression evaluation, template rendering, delivery) is injected.
//!
//! ```text
//! scheduler loop ──try_send──> alert runner ──> check_alert ──> run_history
//!                                                                   │
//!                        notification dispatcher <──wake── due-queue┘
//! ```

pub mod action;
pub mod check;
pub mod conf;
pub mod depends;
pub mod dispatch;
pub mod error;
pub mod expr;
pub mod group;
pub mod history;
pub mod lock;
pub mod metrics;
pub mod runner;
pub mod silence;

#[cfg(test)]
mod tests;

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use vigil_common::types::IncidentState;
use vigil_common::AlertKey;
use vigil_notify::{NotificationTransport, TemplateRenderer};
use vigil_storage::{HealthStore, IncidentStore, NotificationQueue, SilenceStore, Store};

pub use check::RunHistory;
pub use conf::{RuleConf, RuleSet, SystemConf, SystemSettings};
pub use error::{Result, SchedError};
pub use expr::ExpressionEvaluator;
pub use lock::LockStatus;
pub use metrics::CollectedMetrics;
pub use silence::{SilenceRequest, SilenceTester};

/// The storage collaborators a [`Schedule`] needs.
#[derive(Clone)]
pub struct Collaborators {
    pub incidents: Arc<dyn IncidentStore>,
    pub queue: Arc<dyn NotificationQueue>,
    pub silences: Arc<dyn SilenceStore>,
    pub health: Arc<dyn HealthStore>,
}

impl Collaborators {
    /// Uses one backend for every collaborator.
    pub fn from_store<S: Store + 'static>(store: Arc<S>) -> Self {
        Self {
            incidents: store.clone(),
            queue: store.clone(),
            silences: store.clone(),
            health: store,
        }
    }
}

/// State guarded by the process-wide schedule lock.
#[derive(Default)]
pub(crate) struct Shared {
    /// Incidents waiting to be sent, keyed by notification name.
    pending: BTreeMap<String, Vec<IncidentState>>,
    /// Unknown incidents waiting for the next batch flush.
    pending_unknowns: BTreeMap<String, Vec<IncidentState>>,
    last_log_times: HashMap<AlertKey, DateTime<Utc>>,
    metrics: CollectedMetrics,
}

pub struct Schedule {
    system: Arc<dyn SystemConf>,
    rules: Arc<dyn RuleConf>,
    incidents: Arc<dyn IncidentStore>,
    queue: Arc<dyn NotificationQueue>,
    silences: Arc<dyn SilenceStore>,
    health: Arc<dyn HealthStore>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    renderer: Arc<dyn TemplateRenderer>,
    transport: Arc<dyn NotificationTransport>,
    shared: lock::ScheduleLock<Shared>,
    /// Serializes incident read-modify-write between run history, actions
    /// and the dispatcher. Held across awaits, unlike `shared`.
    incident_lock: tokio::sync::Mutex<()>,
    wake_tx: mpsc::Sender<()>,
    wake_rx: Mutex<Option<mpsc::Receiver<()>>>,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    sends: TaskTracker,
}

impl Schedule {
    pub fn new(
        system: Arc<dyn SystemConf>,
        rules: Arc<dyn RuleConf>,
        stores: Collaborators,
        evaluator: Arc<dyn ExpressionEvaluator>,
        renderer: Arc<dyn TemplateRenderer>,
        transport: Arc<dyn NotificationTransport>,
    ) -> Self {
        let (wake_tx, wake_rx) = mpsc::channel(1);
        Self {
            system,
            rules,
            incidents: stores.incidents,
            queue: stores.queue,
            silences: stores.silences,
            health: stores.health,
            evaluator,
            renderer,
            transport,
            shared: lock::ScheduleLock::new(Shared::default()),
            incident_lock: tokio::sync::Mutex::new(()),
            wake_tx,
            wake_rx: Mutex::new(Some(wake_rx)),
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            sends: TaskTracker::new(),
        }
    }

    /// Overrides the process start time used for the unknown grace period.
    pub fn with_start_time(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }

    pub fn system(&self) -> &dyn SystemConf {
        self.system.as_ref()
    }

    pub fn rules(&self) -> &dyn RuleConf {
        self.rules.as_ref()
    }

    /// Every open incident keyed by alert key.
    pub async fn get_open_states(&self) -> Result<BTreeMap<AlertKey, IncidentState>> {
        let open = self.incidents.get_all_open_incidents().await?;
        Ok(open
            .into_iter()
            .map(|inc| (inc.alert_key.clone(), inc))
            .collect())
    }

    pub async fn get_incident(&self, id: i64) -> Result<Option<IncidentState>> {
        Ok(self.incidents.get_incident(id).await?)
    }

    pub fn lock_status(&self) -> LockStatus {
        self.shared.status()
    }

    pub fn metrics(&self) -> CollectedMetrics {
        self.shared.lock("metrics").metrics.clone()
    }

    /// Effective run multiplier of an alert.
    pub(crate) fn run_every(&self, alert: &vigil_common::conf::AlertDef) -> u64 {
        if alert.run_every > 0 {
            alert.run_every
        } else {
            self.system.default_run_every().max(1)
        }
    }

    /// Check frequency of one alert: base tick times its run multiplier.
    pub(crate) fn alert_frequency(&self, alert: &vigil_common::conf::AlertDef) -> chrono::Duration {
        to_chrono(self.system.check_frequency()) * self.run_every(alert) as i32
    }

    /// Nudges the dispatcher. A wake already pending absorbs this one.
    pub(crate) fn wake_dispatcher(&self) {
        let _ = self.wake_tx.try_send(());
    }
}

pub(crate) fn to_chrono(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis().min(i64::MAX as u128) as i64)
}

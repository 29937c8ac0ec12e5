//! The two configuration seams of the scheduler: static system settings
//! and the mutable set of alert and notification definitions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use vigil_common::conf::{AlertDef, Notification};

/// Static, process-wide scheduler settings.
pub trait SystemConf: Send + Sync {
    /// Base tick of the scheduler loop.
    fn check_frequency(&self) -> Duration;

    /// Run multiplier applied to alerts that do not set their own.
    fn default_run_every(&self) -> u64;

    /// Maximum number of unknown groups sent individually per notification
    /// before the rest are merged into one summary. Zero disables the limit.
    fn unknown_threshold(&self) -> usize;

    /// Minimum number of keys sharing a tag before they are batched together.
    fn min_group_size(&self) -> usize;

    /// When set, notifications are computed and logged but never sent.
    fn quiet(&self) -> bool {
        false
    }

    /// How often batched unknown notifications are flushed.
    fn unknown_batch_interval(&self) -> Duration {
        self.check_frequency() * 2
    }

    /// Delay before re-trying a due notification whose key is unevaluated.
    fn dependency_retry(&self) -> Duration {
        Duration::from_secs(60)
    }
}

/// Alert and notification definitions. Implementations may change their
/// contents at runtime; callers re-read on every use.
pub trait RuleConf: Send + Sync {
    fn alerts(&self) -> Vec<Arc<AlertDef>>;

    fn alert(&self, name: &str) -> Option<Arc<AlertDef>>;

    fn notification(&self, name: &str) -> Option<Arc<Notification>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSettings {
    #[serde(default = "default_check_frequency_secs")]
    pub check_frequency_secs: u64,
    #[serde(default = "default_run_every")]
    pub default_run_every: u64,
    #[serde(default = "default_unknown_threshold")]
    pub unknown_threshold: usize,
    #[serde(default = "default_min_group_size")]
    pub min_group_size: usize,
    #[serde(default)]
    pub quiet: bool,
    /// Defaults to twice the check frequency.
    #[serde(default)]
    pub unknown_batch_secs: Option<u64>,
    #[serde(default = "default_dependency_retry_secs")]
    pub dependency_retry_secs: u64,
}

fn default_check_frequency_secs() -> u64 {
    60
}

fn default_run_every() -> u64 {
    5
}

fn default_unknown_threshold() -> usize {
    5
}

fn default_min_group_size() -> usize {
    5
}

fn default_dependency_retry_secs() -> u64 {
    60
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            check_frequency_secs: default_check_frequency_secs(),
            default_run_every: default_run_every(),
            unknown_threshold: default_unknown_threshold(),
            min_group_size: default_min_group_size(),
            quiet: false,
            unknown_batch_secs: None,
            dependency_retry_secs: default_dependency_retry_secs(),
        }
    }
}

impl SystemConf for SystemSettings {
    fn check_frequency(&self) -> Duration {
        Duration::from_secs(self.check_frequency_secs.max(1))
    }

    fn default_run_every(&self) -> u64 {
        self.default_run_every.max(1)
    }

    fn unknown_threshold(&self) -> usize {
        self.unknown_threshold
    }

    fn min_group_size(&self) -> usize {
        self.min_group_size
    }

    fn quiet(&self) -> bool {
        self.quiet
    }

    fn unknown_batch_interval(&self) -> Duration {
        match self.unknown_batch_secs {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => self.check_frequency() * 2,
        }
    }

    fn dependency_retry(&self) -> Duration {
        Duration::from_secs(self.dependency_retry_secs)
    }
}

#[derive(Default)]
struct Rules {
    alerts: Vec<Arc<AlertDef>>,
    by_name: HashMap<String, Arc<AlertDef>>,
    notifications: HashMap<String, Arc<Notification>>,
}

/// In-memory [`RuleConf`] whose definitions can be swapped atomically.
#[derive(Default)]
pub struct RuleSet {
    inner: RwLock<Rules>,
}

impl RuleSet {
    pub fn new(alerts: Vec<AlertDef>, notifications: Vec<Notification>) -> Self {
        let set = Self::default();
        set.replace(alerts, notifications);
        set
    }

    /// Replaces every definition. Alert runners pick up changed definitions
    /// on their next check; added alerts need a scheduler restart.
    pub fn replace(&self, alerts: Vec<AlertDef>, notifications: Vec<Notification>) {
        let alerts: Vec<Arc<AlertDef>> = alerts.into_iter().map(Arc::new).collect();
        let rules = Rules {
            by_name: alerts.iter().map(|a| (a.name.clone(), a.clone())).collect(),
            alerts,
            notifications: notifications
                .into_iter()
                .map(|n| (n.name.clone(), Arc::new(n)))
                .collect(),
        };
        *self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = rules;
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Rules> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RuleConf for RuleSet {
    fn alerts(&self) -> Vec<Arc<AlertDef>> {
        self.read().alerts.clone()
    }

    fn alert(&self, name: &str) -> Option<Arc<AlertDef>> {
        self.read().by_name.get(name).cloned()
    }

    fn notification(&self, name: &str) -> Option<Arc<Notification>> {
        self.read().notifications.get(name).cloned()
    }
}

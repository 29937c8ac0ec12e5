//! Alert and notification definitions as loaded from rule configuration.

use crate::tags::{glob_matches, TagSet};
use crate::types::Status;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A tag-pattern rule exempting matching groups from evaluation. Every
/// key must be present on the group and its value must match the glob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Squelch(pub BTreeMap<String, String>);

impl Squelch {
    pub fn matches(&self, group: &TagSet) -> bool {
        !self.0.is_empty()
            && self.0.iter().all(|(k, pattern)| match group.get(k) {
                Some(v) => glob_matches(pattern, v),
                None => false,
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertDef {
    pub name: String,
    #[serde(default)]
    pub warn: Option<String>,
    #[serde(default)]
    pub crit: Option<String>,
    /// Expression whose non-zero groups mark this alert's groups unevaluated.
    #[serde(default)]
    pub depends: Option<String>,
    /// Alerts whose abnormal open incidents mark overlapping groups unevaluated.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Run multiplier over the base check frequency; 0 uses the system default.
    #[serde(default)]
    pub run_every: u64,
    /// Untouched duration after which a group is reported unknown; 0 derives
    /// it from the check frequency.
    #[serde(default)]
    pub unknown_secs: u64,
    #[serde(default)]
    pub squelch: Vec<Squelch>,
    #[serde(default)]
    pub ignore_unknown: bool,
    #[serde(default)]
    pub unknowns_normal: bool,
    #[serde(default)]
    pub log: bool,
    #[serde(default)]
    pub max_log_frequency_secs: u64,
    #[serde(default)]
    pub warn_notification: Vec<String>,
    #[serde(default)]
    pub crit_notification: Vec<String>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default = "default_time_window_secs")]
    pub time_window_secs: u64,
}

fn default_time_window_secs() -> u64 {
    300
}

impl AlertDef {
    /// A definition with only a name; callers fill in expressions.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            warn: None,
            crit: None,
            depends: None,
            depends_on: Vec::new(),
            run_every: 0,
            unknown_secs: 0,
            squelch: Vec::new(),
            ignore_unknown: false,
            unknowns_normal: false,
            log: false,
            max_log_frequency_secs: 0,
            warn_notification: Vec::new(),
            crit_notification: Vec::new(),
            template: None,
            time_window_secs: default_time_window_secs(),
        }
    }

    pub fn squelched(&self, group: &TagSet) -> bool {
        self.squelch.iter().any(|s| s.matches(group))
    }

    /// Notification names to queue for an incident at `status`.
    /// Unknown incidents share the critical set.
    pub fn notifications_for(&self, status: Status) -> &[String] {
        match status {
            Status::Critical | Status::Unknown => &self.crit_notification,
            Status::Warning => &self.warn_notification,
            Status::Normal => &[],
        }
    }

    pub fn max_log_frequency(&self) -> Duration {
        Duration::seconds(self.max_log_frequency_secs as i64)
    }

    pub fn time_window(&self) -> Duration {
        Duration::seconds(self.time_window_secs as i64)
    }

    /// Every notification name this alert can send to.
    pub fn all_notifications(&self) -> impl Iterator<Item = &String> {
        self.crit_notification
            .iter()
            .chain(self.warn_notification.iter().filter(|n| !self.crit_notification.contains(n)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub name: String,
    #[serde(default)]
    pub email: Vec<String>,
    #[serde(default)]
    pub post: Option<String>,
    #[serde(default)]
    pub get: Option<String>,
    /// Body template for post notifications; the rendered subject is used when absent.
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    /// Successor notification fired `timeout_secs` after this one.
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub timeout_secs: u64,
    #[serde(default)]
    pub run_on_actions: bool,
    #[serde(default)]
    pub print: bool,
}

fn default_content_type() -> String {
    "application/x-www-form-urlencoded".to_string()
}

impl Notification {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: Vec::new(),
            post: None,
            get: None,
            body: None,
            content_type: default_content_type(),
            next: None,
            timeout_secs: 0,
            run_on_actions: false,
            print: false,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::seconds(self.timeout_secs as i64)
    }
}

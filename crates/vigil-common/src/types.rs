use crate::tags::{glob_matches, AlertKey, TagSet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Evaluation status of an alert key, ordered from least to most severe.
///
/// `Unknown` ranks above `Critical`: losing sight of an entity is treated
/// as the worst outcome when tracking an incident's worst status.
///
/// # Examples
///
/// ```
/// use vigil_common::types::Status;
///
/// let st: Status = "warning".parse().unwrap();
/// assert_eq!(st, Status::Warning);
/// assert_eq!(st.to_string(), "warning");
/// assert!(Status::Unknown > Status::Critical);
/// assert!(!Status::Normal.is_abnormal());
/// ```
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Normal,
    Warning,
    Critical,
    Unknown,
}

impl Status {
    pub fn is_abnormal(self) -> bool {
        self != Status::Normal
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Normal => write!(f, "normal"),
            Status::Warning => write!(f, "warning"),
            Status::Critical => write!(f, "critical"),
            Status::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "normal" => Ok(Status::Normal),
            "warning" => Ok(Status::Warning),
            "critical" => Ok(Status::Critical),
            "unknown" => Ok(Status::Unknown),
            _ => Err(format!("unknown status: {s}")),
        }
    }
}

/// One intermediate value an evaluator reports alongside its result,
/// shown in notification templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Computation {
    pub text: String,
    pub value: f64,
}

/// A per-group numeric verdict returned by the expression evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExprResult {
    #[serde(default)]
    pub group: TagSet,
    pub value: f64,
    #[serde(default)]
    pub computations: Vec<Computation>,
}

impl ExprResult {
    pub fn new(group: TagSet, value: f64) -> Self {
        Self {
            group,
            value,
            computations: Vec::new(),
        }
    }
}

/// The result of one warn or crit expression for a single alert key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExprOutcome {
    pub expr: String,
    pub value: f64,
    #[serde(default)]
    pub computations: Vec<Computation>,
}

/// One evaluation outcome for an alert key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub warn: Option<ExprOutcome>,
    pub crit: Option<ExprOutcome>,
    pub status: Status,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub unevaluated: bool,
}

impl Event {
    pub fn new(status: Status, time: DateTime<Utc>) -> Self {
        Self {
            warn: None,
            crit: None,
            status,
            time,
            unevaluated: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Acknowledge,
    Close,
    DelayedClose,
    CancelClose,
    ForceClose,
    Forget,
    Purge,
    Note,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionType::Acknowledge => "acknowledge",
            ActionType::Close => "close",
            ActionType::DelayedClose => "delayed_close",
            ActionType::CancelClose => "cancel_close",
            ActionType::ForceClose => "force_close",
            ActionType::Forget => "forget",
            ActionType::Purge => "purge",
            ActionType::Note => "note",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ack" | "acknowledge" => Ok(ActionType::Acknowledge),
            "close" => Ok(ActionType::Close),
            "delayed_close" => Ok(ActionType::DelayedClose),
            "cancel_close" => Ok(ActionType::CancelClose),
            "force_close" => Ok(ActionType::ForceClose),
            "forget" => Ok(ActionType::Forget),
            "purge" => Ok(ActionType::Purge),
            "note" => Ok(ActionType::Note),
            _ => Err(format!("unknown action type: {s}")),
        }
    }
}

/// A user or system initiated change applied to an incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub user: String,
    pub message: String,
    pub time: DateTime<Utc>,
    pub action_type: ActionType,
    /// Only set on delayed closes.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fulfilled: bool,
    #[serde(default)]
    pub cancelled: bool,
}

impl Action {
    pub fn is_pending_delayed_close(&self) -> bool {
        self.action_type == ActionType::DelayedClose && !(self.fulfilled || self.cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Notification content rendered from an alert's template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderedTemplates {
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub email_subject: String,
    #[serde(default)]
    pub email_body: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub custom: HashMap<String, String>,
}

impl RenderedTemplates {
    pub fn email_subject(&self) -> &str {
        if self.email_subject.is_empty() {
            &self.subject
        } else {
            &self.email_subject
        }
    }

    pub fn email_body(&self) -> &str {
        if self.email_body.is_empty() {
            &self.body
        } else {
            &self.email_body
        }
    }
}

/// The record of one continuous abnormal (or log-only) episode for an alert key.
///
/// `id` is zero until the incident store assigns one on first persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentState {
    pub id: i64,
    pub alert_key: AlertKey,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub result: Option<ExprOutcome>,
    pub events: Vec<Event>,
    pub actions: Vec<Action>,
    pub subject: String,
    pub need_ack: bool,
    pub open: bool,
    pub unevaluated: bool,
    pub current_status: Status,
    pub worst_status: Status,
    pub last_abnormal_status: Status,
    pub last_abnormal_time: Option<DateTime<Utc>>,
    /// Earlier incidents for the same key, newest first.
    #[serde(default)]
    pub previous_ids: Vec<i64>,
    #[serde(default)]
    pub next_id: Option<i64>,
    /// Notification names that have been queued for this incident.
    #[serde(default)]
    pub notifications: Vec<String>,
    #[serde(default)]
    pub rendered: Option<RenderedTemplates>,
}

impl IncidentState {
    pub fn new(alert_key: AlertKey, start: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            alert_key,
            start,
            end: None,
            result: None,
            events: Vec::new(),
            actions: Vec::new(),
            subject: String::new(),
            need_ack: false,
            open: false,
            unevaluated: false,
            current_status: Status::Normal,
            worst_status: Status::Normal,
            last_abnormal_status: Status::Normal,
            last_abnormal_time: None,
            previous_ids: Vec::new(),
            next_id: None,
            notifications: Vec::new(),
            rendered: None,
        }
    }

    pub fn alert(&self) -> &str {
        self.alert_key.name()
    }

    /// An incident is active while its current status is abnormal.
    pub fn is_active(&self) -> bool {
        self.current_status.is_abnormal()
    }

    pub fn last_event(&self) -> Option<&Event> {
        self.events.last()
    }

    pub fn set_notified(&mut self, notification: &str) {
        if !self.notifications.iter().any(|n| n == notification) {
            self.notifications.push(notification.to_string());
        }
    }
}

/// A time-bounded suppression rule.
///
/// An empty `alert` matches every alert name; each tag in `tags` must be
/// present on the key and match its glob pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Silence {
    pub id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub alert: String,
    #[serde(default)]
    pub tags: TagSet,
    #[serde(default)]
    pub forget: bool,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub message: String,
}

impl Silence {
    pub fn active_at(&self, now: DateTime<Utc>) -> bool {
        self.start <= now && now < self.end
    }

    pub fn matches(&self, alert: &str, tags: &TagSet) -> bool {
        if !self.alert.is_empty() && !glob_matches(&self.alert, alert) {
            return false;
        }
        self.tags.iter().all(|(k, pattern)| match tags.get(k) {
            Some(value) => glob_matches(pattern, value),
            None => false,
        })
    }

    pub fn silences(&self, now: DateTime<Utc>, ak: &AlertKey) -> bool {
        self.active_at(now) && self.matches(ak.name(), ak.group())
    }
}

/// Per-alert evaluation health as recorded by the health store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertHealth {
    pub successes: u64,
    pub failures: u64,
    pub failing: bool,
    pub last_error: Option<String>,
    pub last_checked: Option<DateTime<Utc>>,
}

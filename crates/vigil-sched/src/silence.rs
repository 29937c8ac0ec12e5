use crate::error::{Result, SchedError};
use crate::Schedule;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use vigil_common::types::Silence;
use vigil_common::{AlertKey, TagSet};

/// Answers whether an alert key is silenced, over a snapshot of the
/// silences active at one instant.
#[derive(Debug, Clone, Default)]
pub struct SilenceTester {
    now: DateTime<Utc>,
    silences: Vec<Silence>,
}

impl SilenceTester {
    pub fn new(silences: Vec<Silence>, now: DateTime<Utc>) -> Self {
        Self { now, silences }
    }

    /// The latest-ending active silence matching `ak`, if any.
    pub fn silenced(&self, ak: &AlertKey) -> Option<&Silence> {
        self.silences
            .iter()
            .filter(|s| s.silences(self.now, ak))
            .max_by(|a, b| a.end.cmp(&b.end).then_with(|| b.id.cmp(&a.id)))
    }

    pub fn is_silenced(&self, ak: &AlertKey) -> bool {
        self.silenced(ak).is_some()
    }
}

/// A request to create or replace a silence.
#[derive(Debug, Clone, Deserialize)]
pub struct SilenceRequest {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub alert: String,
    /// Comma separated `key=value` glob list.
    #[serde(default)]
    pub tags: String,
    #[serde(default)]
    pub forget: bool,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub message: String,
    /// Store the silence; otherwise only report what it would match.
    #[serde(default)]
    pub confirm: bool,
    /// Id of an existing silence to replace.
    #[serde(default)]
    pub edit: Option<String>,
}

impl Schedule {
    pub async fn silence_tester(&self, now: DateTime<Utc>) -> Result<SilenceTester> {
        let active = self.silences.get_active_silences(now).await?;
        Ok(SilenceTester::new(active, now))
    }

    /// Validates a silence and returns the open alert keys it matches. The
    /// silence is only stored when `confirm` is set.
    pub async fn add_silence(&self, req: SilenceRequest, now: DateTime<Utc>) -> Result<Vec<AlertKey>> {
        let (start, end) = match (req.start, req.end) {
            (Some(start), Some(end)) => (start, end),
            _ => return Err(SchedError::InvalidSilence("start and end are required".into())),
        };
        if start >= end {
            return Err(SchedError::InvalidSilence("start must be before end".into()));
        }
        if end <= now {
            return Err(SchedError::InvalidSilence("end must be in the future".into()));
        }
        let tags = TagSet::parse_list(&req.tags)
            .map_err(|e| SchedError::InvalidSilence(e.to_string()))?;
        if req.alert.is_empty() && tags.is_empty() {
            return Err(SchedError::InvalidSilence(
                "must specify either alert or tags".into(),
            ));
        }

        let silence = Silence {
            id: vigil_common::id::next_id(),
            start,
            end,
            alert: req.alert,
            tags,
            forget: req.forget,
            user: req.user,
            message: req.message,
        };

        let mut affected: Vec<AlertKey> = self
            .incidents
            .get_all_open_incidents()
            .await?
            .into_iter()
            .map(|inc| inc.alert_key)
            .filter(|ak| silence.matches(ak.name(), ak.group()))
            .collect();
        affected.sort();
        affected.dedup();

        if !req.confirm {
            return Ok(affected);
        }

        if let Some(old) = &req.edit {
            if !self.silences.delete_silence(old).await? {
                return Err(SchedError::InvalidSilence(format!("silence {old} not found")));
            }
        }
        self.silences.add_silence(&silence).await?;
        tracing::info!(
            id = %silence.id,
            alert = %silence.alert,
            tags = %silence.tags,
            affected = affected.len(),
            "Silence added"
        );
        Ok(affected)
    }

    pub async fn clear_silence(&self, id: &str) -> Result<bool> {
        let removed = self.silences.delete_silence(id).await?;
        if removed {
            tracing::info!(id, "Silence cleared");
        }
        Ok(removed)
    }

    pub async fn list_silences(&self) -> Result<Vec<Silence>> {
        Ok(self.silences.list_silences().await?)
    }
}

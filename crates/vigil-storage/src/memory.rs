use crate::{
    DueNotification, HealthStore, IncidentStore, NotificationQueue, Result, SilenceStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use vigil_common::types::{AlertHealth, IncidentState, Silence};
use vigil_common::AlertKey;

#[derive(Default)]
struct Inner {
    next_id: i64,
    incidents: BTreeMap<i64, IncidentState>,
    unevaluated: HashMap<AlertKey, bool>,
    touched: HashMap<AlertKey, DateTime<Utc>>,
    due: BTreeMap<(AlertKey, String), DateTime<Utc>>,
    silences: BTreeMap<String, Silence>,
    health: BTreeMap<String, AlertHealth>,
}

/// In-process store backing every collaborator trait with plain maps.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of incidents stored for `key`, open or closed.
    pub fn incident_count(&self, key: &AlertKey) -> usize {
        self.lock()
            .incidents
            .values()
            .filter(|i| &i.alert_key == key)
            .count()
    }
}

#[async_trait]
impl IncidentStore for MemoryStore {
    async fn get_open_incident(&self, key: &AlertKey) -> Result<Option<IncidentState>> {
        Ok(self
            .lock()
            .incidents
            .values()
            .rev()
            .find(|i| &i.alert_key == key && i.open)
            .cloned())
    }

    async fn get_latest_incident(&self, key: &AlertKey) -> Result<Option<IncidentState>> {
        Ok(self
            .lock()
            .incidents
            .values()
            .rev()
            .find(|i| &i.alert_key == key)
            .cloned())
    }

    async fn get_incident(&self, id: i64) -> Result<Option<IncidentState>> {
        Ok(self.lock().incidents.get(&id).cloned())
    }

    async fn update_incident(&self, state: &IncidentState) -> Result<i64> {
        let mut inner = self.lock();
        let mut state = state.clone();
        if state.id == 0 {
            inner.next_id += 1;
            state.id = inner.next_id;
        }
        let id = state.id;
        inner.incidents.insert(id, state);
        Ok(id)
    }

    async fn incident_ids_for_key(&self, key: &AlertKey) -> Result<Vec<i64>> {
        Ok(self
            .lock()
            .incidents
            .values()
            .filter(|i| &i.alert_key == key)
            .map(|i| i.id)
            .collect())
    }

    async fn get_all_open_incidents(&self) -> Result<Vec<IncidentState>> {
        Ok(self
            .lock()
            .incidents
            .values()
            .filter(|i| i.open)
            .cloned()
            .collect())
    }

    async fn set_unevaluated(&self, key: &AlertKey, unevaluated: bool) -> Result<()> {
        let mut inner = self.lock();
        if unevaluated {
            inner.unevaluated.insert(key.clone(), true);
        } else {
            inner.unevaluated.remove(key);
        }
        Ok(())
    }

    async fn get_unevaluated(&self, alert: &str) -> Result<Vec<AlertKey>> {
        let inner = self.lock();
        let mut keys: Vec<AlertKey> = inner
            .unevaluated
            .keys()
            .filter(|k| k.name() == alert)
            .cloned()
            .chain(
                inner
                    .incidents
                    .values()
                    .filter(|i| i.open && i.unevaluated && i.alert() == alert)
                    .map(|i| i.alert_key.clone()),
            )
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn forget(&self, key: &AlertKey) -> Result<()> {
        let mut inner = self.lock();
        inner.incidents.retain(|_, i| &i.alert_key != key);
        inner.unevaluated.remove(key);
        inner.touched.remove(key);
        inner.due.retain(|(k, _), _| k != key);
        Ok(())
    }

    async fn touch_alert_key(&self, key: &AlertKey, time: DateTime<Utc>) -> Result<()> {
        self.lock().touched.insert(key.clone(), time);
        Ok(())
    }

    async fn get_untouched_since(&self, alert: &str, time: DateTime<Utc>) -> Result<Vec<AlertKey>> {
        let mut keys: Vec<AlertKey> = self
            .lock()
            .touched
            .iter()
            .filter(|(k, t)| k.name() == alert && **t < time)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl NotificationQueue for MemoryStore {
    async fn insert_due(&self, key: &AlertKey, notification: &str, due: DateTime<Utc>) -> Result<()> {
        self.lock()
            .due
            .insert((key.clone(), notification.to_string()), due);
        Ok(())
    }

    async fn get_due(&self, now: DateTime<Utc>) -> Result<Vec<DueNotification>> {
        Ok(self
            .lock()
            .due
            .iter()
            .filter(|(_, due)| **due <= now)
            .map(|((key, name), due)| DueNotification {
                alert_key: key.clone(),
                notification: name.clone(),
                due: *due,
            })
            .collect())
    }

    async fn remove_entries(&self, entries: &[DueNotification]) -> Result<()> {
        let mut inner = self.lock();
        for entry in entries {
            let map_key = (entry.alert_key.clone(), entry.notification.clone());
            if inner.due.get(&map_key) == Some(&entry.due) {
                inner.due.remove(&map_key);
            }
        }
        Ok(())
    }

    async fn clear_before(&self, time: DateTime<Utc>) -> Result<()> {
        self.lock().due.retain(|_, due| *due > time);
        Ok(())
    }

    async fn clear_for_key(&self, key: &AlertKey) -> Result<()> {
        self.lock().due.retain(|(k, _), _| k != key);
        Ok(())
    }

    async fn next_due_time(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.lock().due.values().min().copied())
    }

    async fn entries_for_key(&self, key: &AlertKey) -> Result<Vec<DueNotification>> {
        Ok(self
            .lock()
            .due
            .iter()
            .filter(|((k, _), _)| k == key)
            .map(|((k, name), due)| DueNotification {
                alert_key: k.clone(),
                notification: name.clone(),
                due: *due,
            })
            .collect())
    }
}

#[async_trait]
impl SilenceStore for MemoryStore {
    async fn get_active_silences(&self, now: DateTime<Utc>) -> Result<Vec<Silence>> {
        Ok(self
            .lock()
            .silences
            .values()
            .filter(|s| s.active_at(now))
            .cloned()
            .collect())
    }

    async fn list_silences(&self) -> Result<Vec<Silence>> {
        Ok(self.lock().silences.values().cloned().collect())
    }

    async fn add_silence(&self, silence: &Silence) -> Result<()> {
        self.lock()
            .silences
            .insert(silence.id.clone(), silence.clone());
        Ok(())
    }

    async fn delete_silence(&self, id: &str) -> Result<bool> {
        Ok(self.lock().silences.remove(id).is_some())
    }
}

#[async_trait]
impl HealthStore for MemoryStore {
    async fn mark_success(&self, alert: &str, time: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock();
        let health = inner.health.entry(alert.to_string()).or_default();
        health.successes += 1;
        health.failing = false;
        health.last_checked = Some(time);
        Ok(())
    }

    async fn mark_failure(&self, alert: &str, message: &str, time: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock();
        let health = inner.health.entry(alert.to_string()).or_default();
        health.failures += 1;
        health.failing = true;
        health.last_error = Some(message.to_string());
        health.last_checked = Some(time);
        Ok(())
    }

    async fn is_failing(&self, alert: &str) -> Result<bool> {
        Ok(self
            .lock()
            .health
            .get(alert)
            .map(|h| h.failing)
            .unwrap_or(false))
    }

    async fn health(&self, alert: &str) -> Result<AlertHealth> {
        Ok(self.lock().health.get(alert).cloned().unwrap_or_default())
    }

    async fn all_health(&self) -> Result<BTreeMap<String, AlertHealth>> {
        Ok(self.lock().health.clone())
    }
}

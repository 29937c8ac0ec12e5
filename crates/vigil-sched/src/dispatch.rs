use crate::error::Result;
use crate::group::group_sets;
use crate::{to_chrono, Schedule};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use vigil_common::conf::Notification;
use vigil_common::types::{IncidentState, RenderedTemplates, Status};
use vigil_common::AlertKey;

/// Longest the dispatcher sleeps when nothing is queued.
const IDLE_WAIT_SECS: i64 = 60;

/// Outcome of one unknown flush, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnknownFlush {
    pub individual: usize,
    pub summaries: usize,
}

impl Schedule {
    /// The notification dispatcher loop. Wakes on the earliest due time, on
    /// a nudge from run history, or on the unknown batch ticker.
    pub(crate) async fn dispatch_loop(self: Arc<Self>, mut wake: mpsc::Receiver<()>) {
        let period = self.system.unknown_batch_interval();
        let mut unknown_tick = interval_at(Instant::now() + period, period);
        unknown_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(unknown_batch_secs = period.as_secs(), "Notification dispatcher started");

        loop {
            let now = Utc::now();
            let next = match self.check_notifications(now).await {
                Ok(next) => next,
                Err(e) => {
                    tracing::error!(error = %e, "Notification cycle failed");
                    self.retry_at(now)
                }
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    // Pending unknowns have already left the due-queue.
                    self.flush_unknowns(Utc::now());
                    break;
                }
                _ = tokio::time::sleep(wait) => {}
                Some(()) = wake.recv() => {}
                _ = unknown_tick.tick() => {
                    self.flush_unknowns(Utc::now());
                }
            }
        }
        tracing::info!("Notification dispatcher stopped");
    }

    /// When to run the next cycle after a failed one.
    pub(crate) fn retry_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + to_chrono(self.system.check_frequency())
    }

    /// Processes every due notification entry and returns when the next
    /// one is due.
    pub async fn check_notifications(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        {
            let _serial = self.incident_lock.lock().await;
            self.take_due(now).await?;
            self.send_notifications(now).await?;
        }
        Ok(self
            .queue
            .next_due_time()
            .await?
            .unwrap_or(now + Duration::seconds(IDLE_WAIT_SECS)))
    }

    /// Moves due entries from the queue to the pending set. Entries stay
    /// queued when this fails.
    async fn take_due(&self, now: DateTime<Utc>) -> Result<()> {
        let silenced = self.silence_tester(now).await?;
        let due = self.queue.get_due(now).await?;
        let retry = to_chrono(self.system.dependency_retry());

        let mut ready: Vec<(String, IncidentState)> = Vec::new();
        for entry in &due {
            let ak = &entry.alert_key;
            if silenced.is_silenced(ak) {
                tracing::debug!(key = %ak, notification = %entry.notification, "Silenced notification dropped");
                continue;
            }
            if self.rules.notification(&entry.notification).is_none() {
                tracing::warn!(key = %ak, notification = %entry.notification, "Due entry for unknown notification dropped");
                continue;
            }
            let Some(incident) = self.incidents.get_latest_incident(ak).await? else {
                tracing::warn!(key = %ak, "Due entry without incident dropped");
                continue;
            };
            if incident.unevaluated {
                tracing::debug!(key = %ak, "Key unevaluated, re-queueing notification");
                self.queue
                    .insert_due(ak, &entry.notification, now + retry)
                    .await?;
                continue;
            }
            ready.push((entry.notification.clone(), incident));
        }

        self.queue.remove_entries(&due).await?;
        let mut shared = self.shared.lock("take_due");
        for (name, incident) in ready {
            shared.pending.entry(name).or_default().push(incident);
        }
        Ok(())
    }

    /// Sends every pending incident notification. Unknown incidents are
    /// held back for the next batch flush.
    ///
    /// A storage error on one incident is logged and counted; the rest are
    /// still sent. Pending incidents are only taken once the silence lookup
    /// succeeded, so a failure there leaves them for the next cycle.
    pub(crate) async fn send_notifications(&self, now: DateTime<Utc>) -> Result<()> {
        let idle = self.shared.lock("send_notifications").pending.is_empty();
        if idle {
            return Ok(());
        }
        let silenced = self.silence_tester(now).await?;
        let pending = std::mem::take(&mut self.shared.lock("send_notifications").pending);
        if self.system.quiet() {
            for (name, incidents) in &pending {
                for inc in incidents {
                    tracing::info!(notification = %name, key = %inc.alert_key, "Quiet mode prevented notification");
                }
            }
            return Ok(());
        }

        for (name, incidents) in pending {
            let Some(notification) = self.rules.notification(&name) else {
                tracing::warn!(notification = %name, "Pending notification no longer configured");
                continue;
            };
            for inc in incidents {
                let ak = inc.alert_key.clone();
                if silenced.is_silenced(&ak) {
                    continue;
                }
                if let Err(e) = self.send_incident(&notification, inc, now).await {
                    tracing::error!(key = %ak, notification = %name, error = %e, "Failed to dispatch notification");
                    self.shared.lock("send_notifications").metrics.dispatch_errors += 1;
                }
            }
        }
        Ok(())
    }

    async fn send_incident(
        &self,
        notification: &Arc<Notification>,
        inc: IncidentState,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let ak = inc.alert_key.clone();
        let name = &notification.name;
        let is_log = self.rules.alert(inc.alert()).is_some_and(|a| a.log);
        if !is_log && (!inc.open || !inc.need_ack) {
            tracing::error!(key = %ak, notification = %name, "Cannot notify acked or closed alert, clearing");
            self.queue.clear_for_key(&ak).await?;
            return Ok(());
        }

        if inc.current_status == Status::Unknown {
            self.shared
                .lock("send_incident")
                .pending_unknowns
                .entry(name.clone())
                .or_default()
                .push(inc);
        } else {
            let content = inc.rendered.clone().unwrap_or_else(|| RenderedTemplates {
                subject: inc.subject.clone(),
                ..Default::default()
            });
            self.spawn_send(notification.clone(), content, ak.clone());
        }

        if let Some(next) = &notification.next {
            if self.rules.notification(next).is_some() {
                let due = now + notification.timeout();
                self.queue.insert_due(&ak, next, due).await?;
                tracing::debug!(key = %ak, next = %next, due = %due, "Escalation queued");
            } else {
                tracing::warn!(notification = %name, next = %next, "Unknown next notification");
            }
        }
        Ok(())
    }

    /// Sends batched unknown notifications.
    ///
    /// Keys are grouped by shared tags; groups are taken in name order and,
    /// past the unknown threshold, the rest are merged into one summary.
    pub fn flush_unknowns(&self, now: DateTime<Utc>) -> UnknownFlush {
        let pending = std::mem::take(&mut self.shared.lock("flush_unknowns").pending_unknowns);
        let mut flush = UnknownFlush::default();
        if pending.is_empty() {
            return flush;
        }
        if self.system.quiet() {
            tracing::info!(notifications = pending.len(), "Quiet mode prevented unknown notifications");
            return flush;
        }

        let threshold = self.system.unknown_threshold();
        for (name, incidents) in pending {
            let Some(notification) = self.rules.notification(&name) else {
                continue;
            };
            let mut keys: Vec<AlertKey> = incidents.into_iter().map(|i| i.alert_key).collect();
            keys.sort();
            keys.dedup();

            let groups = group_sets(&keys, self.system.min_group_size());
            let mut overflow: BTreeMap<String, Vec<AlertKey>> = BTreeMap::new();
            for (i, (group, members)) in groups.into_iter().enumerate() {
                if threshold > 0 && i >= threshold {
                    overflow.insert(group, members);
                    continue;
                }
                let Some(first) = members.first().cloned() else {
                    continue;
                };
                let content = self.renderer.render_unknown(&group, &members);
                self.spawn_send(notification.clone(), content, first);
                flush.individual += 1;
            }
            if let Some(first) = overflow.values().flat_map(|v| v.first()).next().cloned() {
                let content = self.renderer.render_unknown_summary(&overflow);
                self.spawn_send(notification.clone(), content, first);
                flush.summaries += 1;
            }
        }
        tracing::info!(
            individual = flush.individual,
            summaries = flush.summaries,
            at = %now,
            "Unknown notifications flushed"
        );
        flush
    }

    /// Delivers in the background; failures are logged, never retried.
    pub(crate) fn spawn_send(
        &self,
        notification: Arc<Notification>,
        content: RenderedTemplates,
        ak: AlertKey,
    ) {
        if self.system.quiet() {
            tracing::info!(notification = %notification.name, key = %ak, "Quiet mode prevented notification");
            return;
        }
        self.shared.lock("spawn_send").metrics.notifications_sent += 1;
        let transport = self.transport.clone();
        self.sends.spawn(async move {
            match transport.send(&notification, &content, &ak).await {
                Ok(()) => {
                    tracing::info!(notification = %notification.name, key = %ak, subject = %content.subject, "Notification sent")
                }
                Err(e) => {
                    tracing::error!(notification = %notification.name, key = %ak, error = %e, "Notification failed")
                }
            }
        });
    }

    /// Waits until every notification spawned so far has finished.
    pub async fn wait_for_sends(&self) {
        self.sends.close();
        self.sends.wait().await;
        self.sends.reopen();
    }
}

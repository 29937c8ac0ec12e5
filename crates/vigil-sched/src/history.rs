use crate::check::RunHistory;
use crate::error::Result;
use crate::silence::SilenceTester;
use crate::Schedule;
use chrono::{DateTime, Utc};
use vigil_common::conf::AlertDef;
use vigil_common::types::{
    Action, ActionType, Event, IncidentState, RenderedTemplates, Silence, Status,
};
use vigil_common::AlertKey;
use vigil_notify::TemplateContext;

pub(crate) const SYSTEM_USER: &str = "vigil";

#[derive(Default)]
struct KeyOutcome {
    /// Notifications were queued for the key.
    queued: bool,
    /// A silenced incident went back to normal and should be closed.
    auto_close: bool,
}

fn silenced_or_ignored(alert: &AlertDef, event: &Event, silence: Option<&Silence>) -> bool {
    (alert.ignore_unknown && event.status == Status::Unknown) || silence.is_some()
}

impl Schedule {
    /// Reconciles every event of `r` with the incident ledger.
    ///
    /// Each key's read-modify-write runs under the incident lock so a
    /// concurrent action is never overwritten. Silenced incidents that went
    /// back to normal are closed once the lock is released.
    ///
    /// A storage error aborts the whole run; the events are dropped and the
    /// next tick re-derives them from the evaluator.
    pub async fn run_history(&self, r: RunHistory) -> Result<()> {
        let silenced = self.silence_tester(r.start).await?;
        let mut check_notify = false;
        let mut auto_close = Vec::new();
        for (ak, event) in &r.events {
            let Some(alert) = r.alerts.get(ak.name()) else {
                tracing::warn!(key = %ak, "Event for unknown alert dropped");
                continue;
            };
            let outcome = {
                let _serial = self.incident_lock.lock().await;
                self.run_history_key(alert, ak, event.clone(), &silenced, r.start)
                    .await?
            };
            check_notify |= outcome.queued;
            if outcome.auto_close {
                auto_close.push(ak);
            }
        }
        if check_notify {
            self.wake_dispatcher();
        }

        for ak in auto_close {
            tracing::info!(key = %ak, "Auto close because was silenced");
            if let Err(e) = self
                .action_at(
                    SYSTEM_USER,
                    "Auto close because was silenced.",
                    ActionType::Close,
                    ak,
                    None,
                    r.start,
                )
                .await
            {
                tracing::warn!(key = %ak, error = %e, "Failed to auto close silenced incident");
            }
        }
        Ok(())
    }

    /// Applies one event to the incident of `ak`. Callers hold the incident
    /// lock.
    async fn run_history_key(
        &self,
        alert: &AlertDef,
        ak: &AlertKey,
        mut event: Event,
        silenced: &SilenceTester,
        now: DateTime<Utc>,
    ) -> Result<KeyOutcome> {
        event.time = now;
        if alert.unknowns_normal && event.status == Status::Unknown {
            event.status = Status::Normal;
        }

        self.incidents.touch_alert_key(ak, now).await?;
        let silence = silenced.silenced(ak).cloned();

        let mut open = self.incidents.get_open_incident(ak).await?;
        if open.is_none() {
            self.incidents.set_unevaluated(ak, event.unevaluated).await?;
        }
        if let Some(inc) = open.as_mut() {
            inc.unevaluated = event.unevaluated;
        }

        if event.unevaluated {
            if let Some(inc) = &open {
                self.incidents.update_incident(inc).await?;
            }
            return Ok(KeyOutcome::default());
        }

        if let Some(inc) = open.take() {
            open = self.process_delayed_close(inc, &event, now).await?;
        }

        if event.status == Status::Normal && open.is_none() {
            return Ok(KeyOutcome::default());
        }

        let is_new = open.is_none();
        let mut should_notify = is_new;
        let mut incident = match open {
            Some(inc) => inc,
            None => {
                let mut inc = IncidentState::new(ak.clone(), now);
                inc.unevaluated = event.unevaluated;
                inc
            }
        };

        incident.result = match event.status {
            Status::Critical => event.crit.clone(),
            Status::Warning => event.warn.clone(),
            _ => event.crit.clone().or_else(|| event.warn.clone()),
        };
        if event.status.is_abnormal() {
            incident.last_abnormal_status = event.status;
            incident.last_abnormal_time = Some(now);
        }
        if event.status > incident.worst_status {
            incident.worst_status = event.status;
            should_notify = true;
        }
        if incident.last_event().map(|e| e.status) != Some(event.status) {
            incident.events.push(event.clone());
        }
        incident.current_status = event.status;

        let ignored = silenced_or_ignored(alert, &event, silence.as_ref());
        if is_new && !alert.log && !ignored {
            self.save_new_incident(&mut incident).await?;
        }

        if event.status.is_abnormal() {
            let rendered = self.render(alert, &incident, now);
            incident.subject = rendered.subject.clone();
            incident.rendered = Some(rendered);
            incident.open = !alert.log;
        }

        let mut to_queue: Vec<String> = Vec::new();
        if should_notify {
            incident.need_ack = false;
            self.queue.clear_for_key(ak).await?;

            let forget = silence.as_ref().is_some_and(|s| s.forget);
            if ignored {
                if is_new {
                    incident.open = false;
                }
                if forget && event.status == Status::Unknown {
                    tracing::info!(key = %ak, "Auto forget enabled, forgetting unknown key");
                    self.incidents.forget(ak).await?;
                    return Ok(KeyOutcome::default());
                }
                tracing::debug!(key = %ak, status = %event.status, "Notification suppressed");
                self.shared
                    .lock("run_history")
                    .metrics
                    .notifications_suppressed += 1;
            } else {
                incident.need_ack = true;
                to_queue = self.notifications_to_queue(alert, &incident, now);
                for name in &to_queue {
                    incident.set_notified(name);
                }
            }
        }

        if incident.id != 0 || incident.open {
            incident.id = self.incidents.update_incident(&incident).await?;
        }

        let mut check_notify = false;
        if alert.log {
            if !to_queue.is_empty() {
                let mut shared = self.shared.lock("run_history");
                for name in &to_queue {
                    shared
                        .pending
                        .entry(name.clone())
                        .or_default()
                        .push(incident.clone());
                }
                check_notify = true;
            }
        } else {
            for name in &to_queue {
                self.queue.insert_due(ak, name, now).await?;
                check_notify = true;
            }
        }

        Ok(KeyOutcome {
            queued: check_notify,
            auto_close: silence.is_some() && event.status == Status::Normal && incident.open,
        })
    }

    /// Names of the notifications to queue for `incident`. Log alerts are
    /// throttled to one notification per `max_log_frequency`.
    fn notifications_to_queue(
        &self,
        alert: &AlertDef,
        incident: &IncidentState,
        now: DateTime<Utc>,
    ) -> Vec<String> {
        let names: Vec<String> = alert
            .notifications_for(incident.current_status)
            .iter()
            .filter(|name| {
                let known = self.rules.notification(name).is_some();
                if !known {
                    tracing::warn!(alert = %alert.name, notification = %name, "Unknown notification");
                }
                known
            })
            .cloned()
            .collect();
        if names.is_empty() || !alert.log {
            return names;
        }

        let mut shared = self.shared.lock("log_frequency");
        if let Some(last) = shared.last_log_times.get(&incident.alert_key) {
            if now < *last + alert.max_log_frequency() {
                tracing::debug!(key = %incident.alert_key, "Log notification throttled");
                return Vec::new();
            }
        }
        shared.last_log_times.insert(incident.alert_key.clone(), now);
        names
    }

    /// First save of a durable incident: assigns its id and links it to the
    /// earlier incidents of the same key.
    async fn save_new_incident(&self, incident: &mut IncidentState) -> Result<()> {
        incident.id = self.incidents.update_incident(incident).await?;
        let mut previous: Vec<i64> = self
            .incidents
            .incident_ids_for_key(&incident.alert_key)
            .await?
            .into_iter()
            .filter(|id| *id < incident.id)
            .collect();
        previous.sort_unstable_by(|a, b| b.cmp(a));
        if let Some(&latest) = previous.first() {
            if let Some(mut prev) = self.incidents.get_incident(latest).await? {
                prev.next_id = Some(incident.id);
                self.incidents.update_incident(&prev).await?;
            }
        }
        incident.previous_ids = previous;
        Ok(())
    }

    /// Applies a pending delayed close. Returns the incident if it is still
    /// open afterwards.
    async fn process_delayed_close(
        &self,
        mut incident: IncidentState,
        event: &Event,
        now: DateTime<Utc>,
    ) -> Result<Option<IncidentState>> {
        let Some(idx) = incident
            .actions
            .iter()
            .position(Action::is_pending_delayed_close)
        else {
            return Ok(Some(incident));
        };

        if event.status > incident.worst_status {
            incident.actions[idx].cancelled = true;
            incident.actions.push(Action {
                user: SYSTEM_USER.to_string(),
                message: "Cancelled delayed close due to severity increase".to_string(),
                time: now,
                action_type: ActionType::CancelClose,
                deadline: None,
                fulfilled: false,
                cancelled: false,
            });
            tracing::info!(key = %incident.alert_key, "Delayed close cancelled by severity increase");
            return Ok(Some(incident));
        }

        let due = incident.actions[idx].deadline.is_some_and(|d| d <= now);
        if !due || event.status != Status::Normal {
            return Ok(Some(incident));
        }

        incident.actions[idx].fulfilled = true;
        incident.actions.push(Action {
            user: SYSTEM_USER.to_string(),
            message: "Delayed close deadline reached".to_string(),
            time: now,
            action_type: ActionType::Close,
            deadline: None,
            fulfilled: false,
            cancelled: false,
        });
        incident.need_ack = false;
        incident.open = false;
        incident.end = Some(now);
        self.incidents.update_incident(&incident).await?;
        self.queue.clear_for_key(&incident.alert_key).await?;
        tracing::info!(key = %incident.alert_key, id = incident.id, "Incident closed by delayed close");
        Ok(None)
    }

    /// Renders notification content, substituting an error notice when the
    /// template fails so the operator is still alerted.
    pub(crate) fn render(
        &self,
        alert: &AlertDef,
        incident: &IncidentState,
        now: DateTime<Utc>,
    ) -> RenderedTemplates {
        let ctx = TemplateContext {
            alert,
            incident,
            now,
        };
        match self.renderer.render(&ctx) {
            Ok(rendered) => rendered,
            Err(e) => {
                tracing::error!(key = %incident.alert_key, error = %e, "Template rendering failed");
                RenderedTemplates {
                    subject: format!(
                        "error: template rendering error for alert {}",
                        incident.alert_key
                    ),
                    body: format!(
                        "Template rendering failed for {} ({}): {e}",
                        incident.alert_key, incident.current_status
                    ),
                    ..Default::default()
                }
            }
        }
    }
}

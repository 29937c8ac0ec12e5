use crate::error::{Result, SchedError};
use crate::Schedule;
use chrono::{DateTime, Utc};
use vigil_common::types::{Action, ActionType, IncidentState};
use vigil_common::AlertKey;
use vigil_notify::ActionContext;

fn rejected(ak: &AlertKey, reason: impl Into<String>) -> SchedError {
    SchedError::ActionRejected {
        key: ak.to_string(),
        reason: reason.into(),
    }
}

impl Schedule {
    /// Applies a user action to the open incident of `ak`.
    pub async fn action(
        &self,
        user: &str,
        message: &str,
        action_type: ActionType,
        ak: &AlertKey,
    ) -> Result<()> {
        self.action_at(user, message, action_type, ak, None, Utc::now())
            .await
    }

    /// Like [`Schedule::action`] with an explicit clock. `deadline` only
    /// applies to closes of active incidents.
    ///
    /// Takes the incident lock, so it must not be called while holding it.
    pub async fn action_at(
        &self,
        user: &str,
        message: &str,
        action_type: ActionType,
        ak: &AlertKey,
        deadline: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let incident = {
            let _serial = self.incident_lock.lock().await;
            let incident = match self.incidents.get_open_incident(ak).await? {
                Some(inc) => inc,
                None if matches!(action_type, ActionType::Forget | ActionType::Purge) => self
                    .incidents
                    .get_latest_incident(ak)
                    .await?
                    .ok_or_else(|| rejected(ak, "no incident"))?,
                None => return Err(rejected(ak, "no open incident")),
            };
            self.apply_action(incident, user, message, action_type, deadline, now)
                .await?
        };
        tracing::info!(key = %ak, user, action = %action_type, "Action applied");

        if let Some(incident) = incident {
            self.action_notify(user, message, action_type, &incident);
        }
        Ok(())
    }

    /// Returns the updated incident, or `None` when the key was forgotten.
    async fn apply_action(
        &self,
        mut incident: IncidentState,
        user: &str,
        message: &str,
        action_type: ActionType,
        deadline: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Option<IncidentState>> {
        let ak = incident.alert_key.clone();
        let mut action = Action {
            user: user.to_string(),
            message: message.to_string(),
            time: now,
            action_type,
            deadline: None,
            fulfilled: false,
            cancelled: false,
        };

        match action_type {
            ActionType::Acknowledge => {
                if !incident.need_ack {
                    return Err(rejected(&ak, "alert already acknowledged"));
                }
                if !incident.open {
                    return Err(rejected(&ak, "cannot acknowledge closed alert"));
                }
                incident.need_ack = false;
                self.queue.clear_for_key(&ak).await?;
            }
            ActionType::CancelClose => {
                let pending = incident
                    .actions
                    .iter_mut()
                    .find(|a| a.is_pending_delayed_close())
                    .ok_or_else(|| rejected(&ak, "no delayed close found"))?;
                pending.cancelled = true;
            }
            ActionType::Close | ActionType::DelayedClose => {
                incident.need_ack = false;
                if incident.is_active() {
                    let deadline = match deadline {
                        Some(d) => d,
                        None => {
                            let alert = self.rules.alert(ak.name());
                            let freq = match alert {
                                Some(a) => self.alert_frequency(&a),
                                None => crate::to_chrono(self.system.check_frequency()),
                            };
                            now + freq * 2
                        }
                    };
                    if let Some(pending) = incident
                        .actions
                        .iter_mut()
                        .find(|a| a.is_pending_delayed_close())
                    {
                        pending.deadline = Some(deadline);
                        self.incidents.update_incident(&incident).await?;
                        return Ok(Some(incident));
                    }
                    action.action_type = ActionType::DelayedClose;
                    action.deadline = Some(deadline);
                } else {
                    action.action_type = ActionType::Close;
                    incident.open = false;
                    incident.end = Some(now);
                }
                self.queue.clear_for_key(&ak).await?;
            }
            ActionType::ForceClose => {
                incident.need_ack = false;
                incident.open = false;
                incident.end = Some(now);
                self.queue.clear_for_key(&ak).await?;
            }
            ActionType::Forget | ActionType::Purge => {
                if action_type == ActionType::Forget
                    && incident.last_abnormal_status != vigil_common::Status::Unknown
                {
                    return Err(rejected(&ak, "can only forget unknowns"));
                }
                self.incidents.forget(&ak).await?;
                return Ok(None);
            }
            ActionType::Note => {}
        }

        incident.actions.push(action);
        self.incidents.update_incident(&incident).await?;
        Ok(Some(incident))
    }

    /// Sends the action to every notification of the alert that asks for it.
    fn action_notify(
        &self,
        user: &str,
        message: &str,
        action_type: ActionType,
        incident: &IncidentState,
    ) {
        let Some(alert) = self.rules.alert(incident.alert()) else {
            return;
        };
        let targets: Vec<_> = alert
            .all_notifications()
            .filter_map(|name| self.rules.notification(name))
            .filter(|n| n.run_on_actions)
            .collect();
        if targets.is_empty() {
            return;
        }
        let content = self.renderer.render_action(&ActionContext {
            user,
            message,
            action_type,
            incidents: std::slice::from_ref(incident),
        });
        for notification in targets {
            self.spawn_send(notification, content.clone(), incident.alert_key.clone());
        }
    }
}

use crate::depends::mark_dependencies_unevaluated;
use crate::error::Result;
use crate::expr::is_abnormal;
use crate::{to_chrono, Schedule};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use vigil_common::conf::AlertDef;
use vigil_common::types::{Event, ExprOutcome, Status};
use vigil_common::AlertKey;

/// Events produced by one evaluation tick, keyed by alert key.
#[derive(Debug, Clone)]
pub struct RunHistory {
    pub start: DateTime<Utc>,
    pub events: BTreeMap<AlertKey, Event>,
    /// Definitions of every alert that contributed events.
    pub alerts: HashMap<String, Arc<AlertDef>>,
}

impl RunHistory {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            start,
            events: BTreeMap::new(),
            alerts: HashMap::new(),
        }
    }
}

impl Schedule {
    /// Evaluates one alert into `r`. Returns true when the check was
    /// cancelled by shutdown, in which case `r` must be discarded.
    ///
    /// Evaluation failures are recorded in the health store and suppress
    /// unknown detection for this tick; they are not returned.
    pub async fn check_alert(&self, alert: &Arc<AlertDef>, r: &mut RunHistory) -> bool {
        let now = r.start;
        r.alerts.insert(alert.name.clone(), alert.clone());

        let unknowns = match self.find_unknown_alerts(alert, now).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::error!(alert = %alert.name, error = %e, "Unknown detection failed");
                Vec::new()
            }
        };

        let evaluated = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                tracing::info!(alert = %alert.name, "Check cancelled");
                return true;
            }
            res = self.evaluate_alert(alert, unknowns, now) => res,
        };

        let recorded = match evaluated {
            Ok(events) => {
                tracing::debug!(alert = %alert.name, events = events.len(), "Alert checked");
                r.events.extend(events);
                self.health.mark_success(&alert.name, now).await
            }
            Err(e) => {
                tracing::warn!(alert = %alert.name, error = %e, "Alert evaluation failed");
                self.health.mark_failure(&alert.name, &e.to_string(), now).await
            }
        };
        if let Err(e) = recorded {
            tracing::error!(alert = %alert.name, error = %e, "Failed to record alert health");
        }
        self.shared.lock("check_alert").metrics.checks_run += 1;
        false
    }

    /// Runs the crit, warn and dependency expressions of `alert` and turns
    /// their per-group results into events. `unknowns` become unknown events
    /// for groups without a fresh result.
    async fn evaluate_alert(
        &self,
        alert: &AlertDef,
        unknowns: Vec<AlertKey>,
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<AlertKey, Event>> {
        let deps = self.dependency_groups(alert, now).await?;
        let mut events: BTreeMap<AlertKey, Event> = BTreeMap::new();

        let levels = [
            (alert.crit.as_deref(), Status::Critical),
            (alert.warn.as_deref(), Status::Warning),
        ];
        for (expr, level) in levels {
            let Some(expr) = expr else { continue };
            let results = self
                .evaluator
                .evaluate(expr, alert.time_window(), now)
                .await?;
            for result in results {
                if alert.squelched(&result.group) {
                    continue;
                }
                let ak = AlertKey::new(alert.name.clone(), result.group);
                let event = events
                    .entry(ak)
                    .or_insert_with(|| Event::new(Status::Normal, now));
                let outcome = ExprOutcome {
                    expr: expr.to_string(),
                    value: result.value,
                    computations: result.computations,
                };
                match level {
                    Status::Critical => event.crit = Some(outcome),
                    _ => event.warn = Some(outcome),
                }
                if is_abnormal(result.value) && level > event.status {
                    event.status = level;
                }
            }
        }

        for ak in unknowns {
            events
                .entry(ak)
                .or_insert_with(|| Event::new(Status::Unknown, now));
        }

        mark_dependencies_unevaluated(&mut events, &deps);
        Ok(events)
    }

    /// Keys of `alert` that stopped producing results.
    ///
    /// Nothing is reported during the first check-frequency window after
    /// start, before the alert has succeeded once, or while its last
    /// evaluation is failing.
    pub async fn find_unknown_alerts(
        &self,
        alert: &AlertDef,
        now: DateTime<Utc>,
    ) -> Result<Vec<AlertKey>> {
        let check_freq = to_chrono(self.system.check_frequency());
        if now - self.started_at < check_freq {
            return Ok(Vec::new());
        }
        let health = self.health.health(&alert.name).await?;
        if health.successes == 0 || health.failing {
            return Ok(Vec::new());
        }
        let threshold = if alert.unknown_secs > 0 {
            chrono::Duration::seconds(alert.unknown_secs as i64)
        } else {
            self.alert_frequency(alert) * 2
        };
        let keys = self
            .incidents
            .get_untouched_since(&alert.name, now - threshold)
            .await?;
        Ok(keys
            .into_iter()
            .filter(|ak| !alert.squelched(ak.group()))
            .collect())
    }
}

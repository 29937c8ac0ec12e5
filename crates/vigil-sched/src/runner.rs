use crate::check::RunHistory;
use crate::error::{Result, SchedError};
use crate::Schedule;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::MissedTickBehavior;
use vigil_common::conf::AlertDef;

/// Due-queue entries older than this are dropped by housekeeping.
const QUEUE_RETENTION_DAYS: i64 = 7;

/// Mailbox of one alert runner. Capacity one: a signal sent while the
/// previous one is still unconsumed is dropped, so a slow alert runs at
/// most one check behind.
type Mailbox = mpsc::Sender<DateTime<Utc>>;

impl Schedule {
    /// Starts the dispatcher, one runner per configured alert and the
    /// scheduler loop. Returns immediately; call [`Schedule::close`] to stop.
    pub fn run(self: &Arc<Self>) -> Result<()> {
        let wake_rx = self
            .wake_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| SchedError::Config("schedule is already running".to_string()))?;

        self.tasks.spawn(self.clone().dispatch_loop(wake_rx));

        let mut mailboxes = Vec::new();
        for alert in self.rules.alerts() {
            let (tx, rx) = mpsc::channel(1);
            self.tasks
                .spawn(self.clone().alert_runner(alert.name.clone(), rx));
            mailboxes.push((alert, tx));
        }
        tracing::info!(
            alerts = mailboxes.len(),
            check_frequency_secs = self.system.check_frequency().as_secs(),
            "Scheduler started"
        );
        self.tasks.spawn(self.clone().scheduler_loop(mailboxes));
        Ok(())
    }

    /// Ticks at the base check frequency and signals every alert whose run
    /// multiplier divides the tick counter.
    async fn scheduler_loop(self: Arc<Self>, mailboxes: Vec<(Arc<AlertDef>, Mailbox)>) {
        let mut ticker = tokio::time::interval(self.system.check_frequency());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut counter: u64 = 0;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let now = Utc::now();
            for (alert, tx) in &mailboxes {
                let current = self.rules.alert(&alert.name).unwrap_or_else(|| alert.clone());
                if counter % self.run_every(&current) != 0 {
                    continue;
                }
                match tx.try_send(now) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        tracing::debug!(alert = %alert.name, "Alert still checking, tick dropped");
                        self.shared.lock("scheduler_loop").metrics.checks_dropped += 1;
                    }
                    Err(TrySendError::Closed(_)) => {
                        tracing::warn!(alert = %alert.name, "Alert runner gone");
                    }
                }
            }
            counter = counter.wrapping_add(1);
            self.housekeeping(now).await;
        }
        tracing::info!("Scheduler loop stopped");
    }

    /// Waits on its mailbox and checks one alert per signal. A panicking
    /// check is recorded as an evaluation failure and the runner carries on.
    async fn alert_runner(self: Arc<Self>, name: String, mut rx: mpsc::Receiver<DateTime<Utc>>) {
        loop {
            let start = tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(start) => start,
                    None => break,
                },
            };
            let Some(alert) = self.rules.alert(&name) else {
                tracing::warn!(alert = %name, "Alert definition removed, skipping check");
                continue;
            };

            let this = self.clone();
            let handle = tokio::spawn(async move { this.check_and_run(alert, start).await });
            match handle.await {
                Ok(()) => {}
                Err(e) if e.is_panic() => {
                    tracing::error!(alert = %name, "Alert check panicked");
                    self.shared.lock("alert_runner").metrics.check_panics += 1;
                    if let Err(e) = self
                        .health
                        .mark_failure(&name, "panic during check", Utc::now())
                        .await
                    {
                        tracing::error!(alert = %name, error = %e, "Failed to record alert health");
                    }
                }
                Err(e) => {
                    tracing::warn!(alert = %name, error = %e, "Alert check aborted");
                }
            }
        }
        tracing::debug!(alert = %name, "Alert runner stopped");
    }

    async fn check_and_run(&self, alert: Arc<AlertDef>, start: DateTime<Utc>) {
        let mut r = RunHistory::new(start);
        if self.check_alert(&alert, &mut r).await {
            return;
        }
        if let Err(e) = self.run_history(r).await {
            tracing::error!(alert = %alert.name, error = %e, "Run history failed, events discarded");
            self.shared.lock("check_and_run").metrics.history_errors += 1;
        }
    }

    /// Checks every alert in `alerts` at `now` and applies the combined
    /// events. Nothing is applied when shutdown interrupts a check.
    pub async fn run_once(&self, alerts: &[Arc<AlertDef>], now: DateTime<Utc>) -> Result<()> {
        let mut r = RunHistory::new(now);
        for alert in alerts {
            if self.check_alert(alert, &mut r).await {
                return Ok(());
            }
        }
        self.run_history(r).await
    }

    async fn housekeeping(&self, now: DateTime<Utc>) {
        if let Err(e) = self.collect_states(now).await {
            tracing::warn!(error = %e, "Failed to collect state metrics");
        }
        if let Err(e) = self
            .queue
            .clear_before(now - Duration::days(QUEUE_RETENTION_DAYS))
            .await
        {
            tracing::warn!(error = %e, "Failed to clear stale notifications");
        }
    }

    /// Recomputes the gauges of [`crate::CollectedMetrics`] from storage.
    pub async fn collect_states(&self, now: DateTime<Utc>) -> Result<()> {
        let open = self.incidents.get_all_open_incidents().await?;
        let health = self.health.all_health().await?;

        let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
        for inc in &open {
            *by_status.entry(inc.current_status.to_string()).or_default() += 1;
        }
        let need_ack = open.iter().filter(|i| i.need_ack).count();
        let unevaluated = open.iter().filter(|i| i.unevaluated).count();
        let alert_failures = health
            .into_iter()
            .map(|(name, h)| (name, h.failures))
            .collect();

        let mut shared = self.shared.lock("collect_states");
        let metrics = &mut shared.metrics;
        metrics.open_incidents = open.len();
        metrics.need_ack = need_ack;
        metrics.unevaluated = unevaluated;
        metrics.by_status = by_status;
        metrics.alert_failures = alert_failures;
        metrics.collected_at = Some(now);
        Ok(())
    }

    /// Stops the loops and waits for in-flight checks and sends.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.sends.close();
        self.sends.wait().await;
        tracing::info!("Scheduler closed");
    }
}

use crate::conf::{RuleSet, SystemSettings};
use crate::error::{Result, SchedError};
use crate::expr::ExpressionEvaluator;
use crate::silence::SilenceRequest;
use crate::{Collaborators, Schedule};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use vigil_common::conf::{AlertDef, Notification};
use vigil_common::types::{ActionType, ExprResult, IncidentState, RenderedTemplates, Status};
use vigil_common::AlertKey;
use vigil_notify::{NotificationTransport, PlaceholderRenderer};
use vigil_storage::{
    DueNotification, HealthStore, IncidentStore, MemoryStore, NotificationQueue,
    Result as StoreResult, StorageError,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn key(s: &str) -> AlertKey {
    s.parse().unwrap()
}

#[derive(Clone)]
enum Canned {
    Results(Vec<ExprResult>),
    Fail(String),
    Hang,
}

/// Evaluator answering from canned per-expression results. Unset
/// expressions return no groups.
#[derive(Default)]
struct FakeEvaluator {
    canned: Mutex<HashMap<String, Canned>>,
}

impl FakeEvaluator {
    fn set(&self, expr: &str, results: &[(&str, f64)]) {
        let results = results
            .iter()
            .map(|(group, value)| ExprResult::new(group.parse().unwrap(), *value))
            .collect();
        self.canned
            .lock()
            .unwrap()
            .insert(expr.to_string(), Canned::Results(results));
    }

    fn fail(&self, expr: &str, message: &str) {
        self.canned
            .lock()
            .unwrap()
            .insert(expr.to_string(), Canned::Fail(message.to_string()));
    }

    fn hang(&self, expr: &str) {
        self.canned
            .lock()
            .unwrap()
            .insert(expr.to_string(), Canned::Hang);
    }
}

#[async_trait]
impl ExpressionEvaluator for FakeEvaluator {
    async fn evaluate(
        &self,
        expr: &str,
        _window: Duration,
        _now: DateTime<Utc>,
    ) -> Result<Vec<ExprResult>> {
        let canned = self.canned.lock().unwrap().get(expr).cloned();
        match canned {
            Some(Canned::Results(results)) => Ok(results),
            Some(Canned::Fail(message)) => Err(SchedError::Evaluation(message)),
            Some(Canned::Hang) => std::future::pending().await,
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Debug, Clone)]
struct Sent {
    notification: String,
    subject: String,
    key: AlertKey,
}

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<Sent>>,
}

impl RecordingTransport {
    fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    fn names(&self) -> Vec<String> {
        self.sent().into_iter().map(|s| s.notification).collect()
    }
}

#[async_trait]
impl NotificationTransport for RecordingTransport {
    async fn send(
        &self,
        notification: &Notification,
        content: &RenderedTemplates,
        key: &AlertKey,
    ) -> vigil_notify::Result<()> {
        self.sent.lock().unwrap().push(Sent {
            notification: notification.name.clone(),
            subject: content.subject.clone(),
            key: key.clone(),
        });
        Ok(())
    }
}

/// Wraps a [`MemoryStore`] to stall or fail selected calls.
///
/// An armed pause makes the next `get_open_incident` signal `reached` after
/// reading and wait for `resume` before returning.
struct FlakyStore {
    inner: Arc<MemoryStore>,
    pause_armed: Mutex<bool>,
    reached: Notify,
    resume: Notify,
    fail_insert_for: Mutex<Option<String>>,
}

impl FlakyStore {
    fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            pause_armed: Mutex::new(false),
            reached: Notify::new(),
            resume: Notify::new(),
            fail_insert_for: Mutex::new(None),
        }
    }

    fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators {
            incidents: self.clone(),
            queue: self.clone(),
            silences: self.inner.clone(),
            health: self.inner.clone(),
        }
    }

    fn arm_pause(&self) {
        *self.pause_armed.lock().unwrap() = true;
    }

    fn fail_inserts_for(&self, notification: &str) {
        *self.fail_insert_for.lock().unwrap() = Some(notification.to_string());
    }
}

#[async_trait]
impl IncidentStore for FlakyStore {
    async fn get_open_incident(&self, key: &AlertKey) -> StoreResult<Option<IncidentState>> {
        let inc = self.inner.get_open_incident(key).await?;
        let pause = std::mem::take(&mut *self.pause_armed.lock().unwrap());
        if pause {
            self.reached.notify_one();
            self.resume.notified().await;
        }
        Ok(inc)
    }

    async fn get_latest_incident(&self, key: &AlertKey) -> StoreResult<Option<IncidentState>> {
        self.inner.get_latest_incident(key).await
    }

    async fn get_incident(&self, id: i64) -> StoreResult<Option<IncidentState>> {
        self.inner.get_incident(id).await
    }

    async fn update_incident(&self, state: &IncidentState) -> StoreResult<i64> {
        self.inner.update_incident(state).await
    }

    async fn incident_ids_for_key(&self, key: &AlertKey) -> StoreResult<Vec<i64>> {
        self.inner.incident_ids_for_key(key).await
    }

    async fn get_all_open_incidents(&self) -> StoreResult<Vec<IncidentState>> {
        self.inner.get_all_open_incidents().await
    }

    async fn set_unevaluated(&self, key: &AlertKey, unevaluated: bool) -> StoreResult<()> {
        self.inner.set_unevaluated(key, unevaluated).await
    }

    async fn get_unevaluated(&self, alert: &str) -> StoreResult<Vec<AlertKey>> {
        self.inner.get_unevaluated(alert).await
    }

    async fn forget(&self, key: &AlertKey) -> StoreResult<()> {
        self.inner.forget(key).await
    }

    async fn touch_alert_key(&self, key: &AlertKey, time: DateTime<Utc>) -> StoreResult<()> {
        self.inner.touch_alert_key(key, time).await
    }

    async fn get_untouched_since(
        &self,
        alert: &str,
        time: DateTime<Utc>,
    ) -> StoreResult<Vec<AlertKey>> {
        self.inner.get_untouched_since(alert, time).await
    }
}

#[async_trait]
impl NotificationQueue for FlakyStore {
    async fn insert_due(
        &self,
        key: &AlertKey,
        notification: &str,
        due: DateTime<Utc>,
    ) -> StoreResult<()> {
        if self.fail_insert_for.lock().unwrap().as_deref() == Some(notification) {
            return Err(StorageError::Other("queue unavailable".into()));
        }
        self.inner.insert_due(key, notification, due).await
    }

    async fn get_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<DueNotification>> {
        self.inner.get_due(now).await
    }

    async fn remove_entries(&self, entries: &[DueNotification]) -> StoreResult<()> {
        self.inner.remove_entries(entries).await
    }

    async fn clear_before(&self, time: DateTime<Utc>) -> StoreResult<()> {
        self.inner.clear_before(time).await
    }

    async fn clear_for_key(&self, key: &AlertKey) -> StoreResult<()> {
        self.inner.clear_for_key(key).await
    }

    async fn next_due_time(&self) -> StoreResult<Option<DateTime<Utc>>> {
        self.inner.next_due_time().await
    }

    async fn entries_for_key(&self, key: &AlertKey) -> StoreResult<Vec<DueNotification>> {
        self.inner.entries_for_key(key).await
    }
}

struct Harness {
    sched: Arc<Schedule>,
    store: Arc<MemoryStore>,
    eval: Arc<FakeEvaluator>,
    transport: Arc<RecordingTransport>,
}

impl Harness {
    fn new(alerts: Vec<AlertDef>, notifications: Vec<Notification>) -> Self {
        Self::with_settings(alerts, notifications, SystemSettings::default())
    }

    fn with_settings(
        alerts: Vec<AlertDef>,
        notifications: Vec<Notification>,
        settings: SystemSettings,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        let stores = Collaborators::from_store(store.clone());
        Self::with_stores(alerts, notifications, settings, store, stores)
    }

    /// Runs over `stores`, with `store` as the backend tests inspect.
    fn with_stores(
        alerts: Vec<AlertDef>,
        notifications: Vec<Notification>,
        settings: SystemSettings,
        store: Arc<MemoryStore>,
        stores: Collaborators,
    ) -> Self {
        let eval = Arc::new(FakeEvaluator::default());
        let transport = Arc::new(RecordingTransport::default());
        let sched = Schedule::new(
            Arc::new(settings),
            Arc::new(RuleSet::new(alerts, notifications)),
            stores,
            eval.clone(),
            Arc::new(PlaceholderRenderer::default()),
            transport.clone(),
        )
        .with_start_time(t0() - Duration::hours(1));
        Self {
            sched: Arc::new(sched),
            store,
            eval,
            transport,
        }
    }

    async fn tick(&self, at: DateTime<Utc>) {
        let alerts = self.sched.rules().alerts();
        self.sched.run_once(&alerts, at).await.unwrap();
    }

    async fn tick_alert(&self, name: &str, at: DateTime<Utc>) {
        let alert = self.sched.rules().alert(name).unwrap();
        self.sched.run_once(&[alert], at).await.unwrap();
    }

    async fn silence(&self, alert: &str, tags: &str, forget: bool, now: DateTime<Utc>) {
        let req: SilenceRequest = serde_json::from_value(serde_json::json!({
            "start": now - Duration::minutes(1),
            "end": now + Duration::hours(1),
            "alert": alert,
            "tags": tags,
            "forget": forget,
            "user": "ops",
            "confirm": true,
        }))
        .unwrap();
        self.sched.add_silence(req, now).await.unwrap();
    }
}

fn crit_alert(name: &str, notifications: &[&str]) -> AlertDef {
    let mut alert = AlertDef::named(name);
    alert.crit = Some(format!("crit_{name}"));
    alert.crit_notification = notifications.iter().map(|n| n.to_string()).collect();
    alert
}

fn pager() -> Notification {
    Notification::named("pager")
}

#[tokio::test]
async fn critical_then_normal_keeps_incident_open() {
    let h = Harness::new(vec![crit_alert("a", &["pager"])], vec![pager()]);
    let ak = key("a{host=x}");

    h.eval.set("crit_a", &[("host=x", 1.0)]);
    h.tick(t0()).await;

    let inc = h.store.get_open_incident(&ak).await.unwrap().unwrap();
    assert_eq!(inc.current_status, Status::Critical);
    assert!(inc.need_ack);
    assert!(inc.open);
    assert_eq!(inc.subject, "critical: a{host=x}");
    let queued = h.store.entries_for_key(&ak).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].notification, "pager");
    assert_eq!(queued[0].due, t0());

    h.eval.set("crit_a", &[("host=x", 0.0)]);
    h.tick(t0() + Duration::minutes(1)).await;

    let inc = h.store.get_open_incident(&ak).await.unwrap().unwrap();
    assert_eq!(inc.current_status, Status::Normal);
    assert_eq!(inc.worst_status, Status::Critical);
    assert!(inc.open);
    assert_eq!(inc.events.len(), 2);
    let queued = h.store.entries_for_key(&ak).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].due, t0());
}

#[tokio::test]
async fn repeated_status_does_not_grow_history() {
    let h = Harness::new(vec![crit_alert("a", &["pager"])], vec![pager()]);
    let ak = key("a{host=x}");
    h.eval.set("crit_a", &[("host=x", 1.0)]);

    h.tick(t0()).await;
    h.tick(t0() + Duration::minutes(1)).await;
    h.tick(t0() + Duration::minutes(2)).await;

    let inc = h.store.get_open_incident(&ak).await.unwrap().unwrap();
    assert_eq!(inc.events.len(), 1);
    assert_eq!(h.store.incident_ids_for_key(&ak).await.unwrap().len(), 1);
}

#[tokio::test]
async fn worst_status_only_rises() {
    let mut alert = crit_alert("a", &["pager"]);
    alert.warn = Some("warn_a".into());
    alert.warn_notification = vec!["pager".into()];
    let h = Harness::new(vec![alert], vec![pager()]);
    let ak = key("a{host=x}");

    let steps = [
        (0.0, 1.0, Status::Warning, Status::Warning),
        (1.0, 1.0, Status::Critical, Status::Critical),
        (0.0, 1.0, Status::Warning, Status::Critical),
        (0.0, 0.0, Status::Normal, Status::Critical),
    ];
    for (i, (crit, warn, current, worst)) in steps.into_iter().enumerate() {
        h.eval.set("crit_a", &[("host=x", crit)]);
        h.eval.set("warn_a", &[("host=x", warn)]);
        h.tick(t0() + Duration::minutes(i as i64)).await;
        let inc = h.store.get_open_incident(&ak).await.unwrap().unwrap();
        assert_eq!(inc.current_status, current, "step {i}");
        assert_eq!(inc.worst_status, worst, "step {i}");
    }
}

#[tokio::test]
async fn nan_result_is_abnormal() {
    let h = Harness::new(vec![crit_alert("a", &["pager"])], vec![pager()]);
    h.eval.set("crit_a", &[("host=x", f64::NAN)]);
    h.tick(t0()).await;
    let inc = h
        .store
        .get_open_incident(&key("a{host=x}"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(inc.current_status, Status::Critical);
}

#[tokio::test]
async fn reopening_links_previous_incident() {
    let h = Harness::new(vec![crit_alert("a", &["pager"])], vec![pager()]);
    let ak = key("a{host=x}");

    h.eval.set("crit_a", &[("host=x", 1.0)]);
    h.tick(t0()).await;
    h.eval.set("crit_a", &[("host=x", 0.0)]);
    h.tick(t0() + Duration::minutes(1)).await;
    h.sched
        .action_at("ops", "fixed", ActionType::Close, &ak, None, t0() + Duration::minutes(2))
        .await
        .unwrap();
    h.eval.set("crit_a", &[("host=x", 1.0)]);
    h.tick(t0() + Duration::minutes(3)).await;

    let open: Vec<_> = h
        .store
        .get_all_open_incidents()
        .await
        .unwrap()
        .into_iter()
        .filter(|i| i.alert_key == ak)
        .collect();
    assert_eq!(open.len(), 1);

    let ids = h.store.incident_ids_for_key(&ak).await.unwrap();
    assert_eq!(ids.len(), 2);
    assert_eq!(open[0].id, ids[1]);
    assert_eq!(open[0].previous_ids, vec![ids[0]]);
    let first = h.store.get_incident(ids[0]).await.unwrap().unwrap();
    assert!(!first.open);
    assert_eq!(first.next_id, Some(ids[1]));
}

#[tokio::test]
async fn dependency_expression_marks_groups_unevaluated() {
    let mut alert = crit_alert("b", &["pager"]);
    alert.depends = Some("dep_b".into());
    let h = Harness::new(vec![alert], vec![pager()]);

    h.eval.set("dep_b", &[("host=x", 1.0), ("host=y", 0.0)]);
    h.eval.set("crit_b", &[("host=x", 1.0), ("host=y", 1.0)]);
    h.tick(t0()).await;

    assert!(h.store.get_open_incident(&key("b{host=x}")).await.unwrap().is_none());
    assert!(h.store.entries_for_key(&key("b{host=x}")).await.unwrap().is_empty());
    assert_eq!(
        h.store.get_unevaluated("b").await.unwrap(),
        vec![key("b{host=x}")]
    );
    assert!(h.store.get_open_incident(&key("b{host=y}")).await.unwrap().is_some());
}

#[tokio::test]
async fn depends_on_uses_open_incidents_of_other_alert() {
    let mut b = crit_alert("b", &["pager"]);
    b.depends_on = vec!["a".into()];
    let h = Harness::new(vec![crit_alert("a", &["pager"]), b], vec![pager()]);

    h.eval.set("crit_a", &[("host=x", 1.0)]);
    h.eval.set("crit_b", &[("host=x", 1.0), ("host=y", 1.0)]);
    h.tick_alert("a", t0()).await;
    h.tick_alert("b", t0()).await;

    assert!(h.store.get_open_incident(&key("b{host=x}")).await.unwrap().is_none());
    assert!(h.store.get_open_incident(&key("b{host=y}")).await.unwrap().is_some());
}

#[tokio::test]
async fn silence_suppresses_new_incident() {
    let h = Harness::new(vec![crit_alert("a", &["pager"])], vec![pager()]);
    let ak = key("a{host=x}");
    h.silence("a", "", false, t0()).await;

    h.eval.set("crit_a", &[("host=x", 1.0)]);
    h.tick(t0()).await;

    assert!(h.store.get_open_incident(&ak).await.unwrap().is_none());
    assert!(h.store.entries_for_key(&ak).await.unwrap().is_empty());
    assert_eq!(h.sched.metrics().notifications_suppressed, 1);
}

#[tokio::test]
async fn silence_on_existing_incident_updates_status_without_ack() {
    let mut alert = crit_alert("a", &["pager"]);
    alert.warn = Some("warn_a".into());
    alert.warn_notification = vec!["pager".into()];
    let h = Harness::new(vec![alert], vec![pager()]);
    let ak = key("a{host=x}");

    h.eval.set("warn_a", &[("host=x", 1.0)]);
    h.tick(t0()).await;
    assert_eq!(h.store.entries_for_key(&ak).await.unwrap().len(), 1);

    h.silence("", "host=x", false, t0() + Duration::seconds(30)).await;
    h.eval.set("crit_a", &[("host=x", 1.0)]);
    h.tick(t0() + Duration::minutes(1)).await;

    let inc = h.store.get_open_incident(&ak).await.unwrap().unwrap();
    assert_eq!(inc.current_status, Status::Critical);
    assert_eq!(inc.events.len(), 2);
    assert!(!inc.need_ack);
    assert!(h.store.entries_for_key(&ak).await.unwrap().is_empty());
}

#[tokio::test]
async fn silenced_normal_incident_is_auto_closed() {
    let h = Harness::new(vec![crit_alert("a", &["pager"])], vec![pager()]);
    let ak = key("a{host=x}");

    h.eval.set("crit_a", &[("host=x", 1.0)]);
    h.tick(t0()).await;
    h.silence("a", "", false, t0() + Duration::seconds(30)).await;
    h.eval.set("crit_a", &[("host=x", 0.0)]);
    h.tick(t0() + Duration::minutes(1)).await;

    assert!(h.store.get_open_incident(&ak).await.unwrap().is_none());
    let latest = h.store.get_latest_incident(&ak).await.unwrap().unwrap();
    let close = latest.actions.last().unwrap();
    assert_eq!(close.action_type, ActionType::Close);
    assert_eq!(close.user, "vigil");
}

/// Touches four keys at t0 and lets them go silent, so the tick at
/// t0 + 5m reports all of them unknown.
async fn make_unknowns(h: &Harness) -> Vec<AlertKey> {
    let groups = ["host=1", "host=2", "host=3", "host=4"];
    let results: Vec<(&str, f64)> = groups.iter().map(|g| (*g, 0.0)).collect();
    h.eval.set("crit_a", &results);
    h.tick(t0()).await;
    h.eval.set("crit_a", &[]);
    h.tick(t0() + Duration::minutes(5)).await;
    groups.iter().map(|g| key(&format!("a{{{g}}}"))).collect()
}

fn unknown_alert() -> AlertDef {
    let mut alert = crit_alert("a", &["pager"]);
    alert.unknown_secs = 10;
    alert
}

#[tokio::test]
async fn untouched_keys_become_unknown() {
    let h = Harness::new(vec![unknown_alert()], vec![pager()]);
    let keys = make_unknowns(&h).await;
    for ak in &keys {
        let inc = h.store.get_open_incident(ak).await.unwrap().unwrap();
        assert_eq!(inc.current_status, Status::Unknown);
        assert!(inc.need_ack);
    }
}

#[tokio::test]
async fn no_unknowns_during_startup_grace() {
    let h = Harness::new(vec![unknown_alert()], vec![pager()]);
    let sched = Schedule::new(
        Arc::new(SystemSettings::default()),
        Arc::new(RuleSet::new(vec![unknown_alert()], vec![pager()])),
        Collaborators::from_store(h.store.clone()),
        h.eval.clone(),
        Arc::new(PlaceholderRenderer::default()),
        h.transport.clone(),
    )
    .with_start_time(t0());
    let alert = sched.rules().alert("a").unwrap();

    h.eval.set("crit_a", &[("host=x", 0.0)]);
    sched.run_once(&[alert.clone()], t0()).await.unwrap();

    let early = sched
        .find_unknown_alerts(&alert, t0() + Duration::seconds(30))
        .await
        .unwrap();
    assert!(early.is_empty());

    let later = sched
        .find_unknown_alerts(&alert, t0() + Duration::seconds(90))
        .await
        .unwrap();
    assert_eq!(later, vec![key("a{host=x}")]);
}

#[tokio::test]
async fn failing_evaluation_suppresses_unknowns() {
    let h = Harness::new(vec![unknown_alert()], vec![pager()]);
    h.eval.set("crit_a", &[("host=x", 0.0)]);
    h.tick(t0()).await;

    h.eval.fail("crit_a", "backend down");
    h.tick(t0() + Duration::minutes(5)).await;
    h.tick(t0() + Duration::minutes(6)).await;

    assert!(h.store.get_open_incident(&key("a{host=x}")).await.unwrap().is_none());
    let health = h.store.health("a").await.unwrap();
    assert!(health.failing);
    assert_eq!(health.failures, 2);
    assert_eq!(health.last_error.as_deref(), Some("Sched: evaluation failed: backend down"));
}

#[tokio::test]
async fn unknowns_normal_never_opens_incident() {
    let mut alert = unknown_alert();
    alert.unknowns_normal = true;
    let h = Harness::new(vec![alert], vec![pager()]);
    let keys = make_unknowns(&h).await;
    for ak in &keys {
        assert!(h.store.get_open_incident(ak).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn forget_silence_drops_unknown_keys() {
    let h = Harness::new(vec![unknown_alert()], vec![pager()]);
    h.silence("a", "", true, t0()).await;
    let keys = make_unknowns(&h).await;
    for ak in &keys {
        assert_eq!(h.store.incident_count(ak), 0);
    }
    assert!(h
        .store
        .get_untouched_since("a", t0() + Duration::hours(1))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn unknown_batching_sends_summary_past_threshold() {
    let settings = SystemSettings {
        unknown_threshold: 2,
        min_group_size: 5,
        ..Default::default()
    };
    let h = Harness::with_settings(vec![unknown_alert()], vec![pager()], settings);
    make_unknowns(&h).await;

    h.sched
        .check_notifications(t0() + Duration::minutes(5))
        .await
        .unwrap();
    h.sched.wait_for_sends().await;
    assert!(h.transport.sent().is_empty());

    let flush = h.sched.flush_unknowns(t0() + Duration::minutes(6));
    assert_eq!(flush.individual, 2);
    assert_eq!(flush.summaries, 1);

    h.sched.wait_for_sends().await;
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 3);
    let summaries: Vec<_> = sent
        .iter()
        .filter(|s| s.subject.contains("too many unknown alerts"))
        .collect();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].subject, "vigil: too many unknown alerts (2 keys in 2 groups)");
}

#[tokio::test]
async fn unknown_batching_under_threshold_sends_each_group() {
    let settings = SystemSettings {
        unknown_threshold: 10,
        min_group_size: 5,
        ..Default::default()
    };
    let h = Harness::with_settings(vec![unknown_alert()], vec![pager()], settings);
    make_unknowns(&h).await;
    h.sched
        .check_notifications(t0() + Duration::minutes(5))
        .await
        .unwrap();

    let flush = h.sched.flush_unknowns(t0() + Duration::minutes(6));
    assert_eq!(flush.individual, 4);
    assert_eq!(flush.summaries, 0);
}

#[tokio::test]
async fn escalation_fires_next_after_timeout() {
    let mut first = pager();
    first.next = Some("boss".into());
    first.timeout_secs = 600;
    let h = Harness::new(
        vec![crit_alert("a", &["pager"])],
        vec![first, Notification::named("boss")],
    );
    let ak = key("a{host=x}");

    h.eval.set("crit_a", &[("host=x", 1.0)]);
    h.tick(t0()).await;

    let next = h.sched.check_notifications(t0()).await.unwrap();
    assert_eq!(next, t0() + Duration::minutes(10));
    h.sched.wait_for_sends().await;
    assert_eq!(h.transport.names(), vec!["pager"]);
    assert_eq!(h.transport.sent()[0].key, ak);

    h.sched
        .check_notifications(t0() + Duration::minutes(5))
        .await
        .unwrap();
    h.sched.wait_for_sends().await;
    assert_eq!(h.transport.names().len(), 1);

    h.sched
        .check_notifications(t0() + Duration::minutes(10))
        .await
        .unwrap();
    h.sched.wait_for_sends().await;
    assert_eq!(h.transport.names(), vec!["pager", "boss"]);
    assert!(h.store.entries_for_key(&ak).await.unwrap().is_empty());
}

#[tokio::test]
async fn acknowledge_stops_escalation() {
    let mut first = pager();
    first.next = Some("boss".into());
    first.timeout_secs = 600;
    let h = Harness::new(
        vec![crit_alert("a", &["pager"])],
        vec![first, Notification::named("boss")],
    );
    let ak = key("a{host=x}");

    h.eval.set("crit_a", &[("host=x", 1.0)]);
    h.tick(t0()).await;
    h.sched.check_notifications(t0()).await.unwrap();
    h.sched
        .action_at("ops", "on it", ActionType::Acknowledge, &ak, None, t0() + Duration::minutes(1))
        .await
        .unwrap();

    h.sched
        .check_notifications(t0() + Duration::minutes(10))
        .await
        .unwrap();
    h.sched.wait_for_sends().await;
    assert_eq!(h.transport.names(), vec!["pager"]);
    assert!(!h.store.get_open_incident(&ak).await.unwrap().unwrap().need_ack);
}

#[tokio::test]
async fn acknowledge_during_check_is_not_overwritten() {
    let store = Arc::new(MemoryStore::new());
    let flaky = Arc::new(FlakyStore::new(store.clone()));
    let h = Harness::with_stores(
        vec![crit_alert("a", &["pager"])],
        vec![pager()],
        SystemSettings::default(),
        store,
        flaky.collaborators(),
    );
    let ak = key("a{host=x}");
    h.eval.set("crit_a", &[("host=x", 1.0)]);
    h.tick(t0()).await;

    flaky.arm_pause();
    let sched = h.sched.clone();
    let alerts = sched.rules().alerts();
    let check =
        tokio::spawn(async move { sched.run_once(&alerts, t0() + Duration::minutes(1)).await });
    flaky.reached.notified().await;

    let sched = h.sched.clone();
    let ack_key = ak.clone();
    let ack = tokio::spawn(async move {
        sched
            .action_at("ops", "on it", ActionType::Acknowledge, &ack_key, None, t0() + Duration::minutes(1))
            .await
    });
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(!ack.is_finished(), "acknowledge must wait for the check to finish");

    flaky.resume.notify_one();
    check.await.unwrap().unwrap();
    ack.await.unwrap().unwrap();

    let inc = h.store.get_open_incident(&ak).await.unwrap().unwrap();
    assert!(!inc.need_ack);
    assert!(inc.actions.iter().any(|a| a.action_type == ActionType::Acknowledge));
    assert!(h.store.entries_for_key(&ak).await.unwrap().is_empty());
}

#[tokio::test]
async fn queue_error_on_one_incident_still_sends_the_rest() {
    let mut first = pager();
    first.next = Some("boss".into());
    first.timeout_secs = 600;
    let store = Arc::new(MemoryStore::new());
    let flaky = Arc::new(FlakyStore::new(store.clone()));
    let h = Harness::with_stores(
        vec![crit_alert("a", &["pager"])],
        vec![first, Notification::named("boss")],
        SystemSettings::default(),
        store,
        flaky.collaborators(),
    );
    h.eval.set("crit_a", &[("host=x", 1.0), ("host=y", 1.0)]);
    h.tick(t0()).await;

    flaky.fail_inserts_for("boss");
    h.sched.check_notifications(t0()).await.unwrap();
    h.sched.wait_for_sends().await;

    let mut sent: Vec<AlertKey> = h.transport.sent().into_iter().map(|s| s.key).collect();
    sent.sort();
    assert_eq!(sent, vec![key("a{host=x}"), key("a{host=y}")]);
    assert_eq!(h.sched.metrics().dispatch_errors, 2);
}

#[tokio::test]
async fn failed_cycle_retries_after_check_frequency() {
    let settings = SystemSettings {
        check_frequency_secs: 15,
        ..Default::default()
    };
    let h = Harness::with_settings(vec![], vec![], settings);
    assert_eq!(h.sched.retry_at(t0()), t0() + Duration::seconds(15));
}

#[tokio::test]
async fn stale_entry_for_closed_incident_is_cleared() {
    let h = Harness::new(vec![crit_alert("a", &["pager"])], vec![pager()]);
    let ak = key("a{host=x}");

    h.eval.set("crit_a", &[("host=x", 1.0)]);
    h.tick(t0()).await;
    h.sched
        .action_at("ops", "gone", ActionType::ForceClose, &ak, None, t0() + Duration::minutes(1))
        .await
        .unwrap();
    h.store
        .insert_due(&ak, "pager", t0() + Duration::minutes(1))
        .await
        .unwrap();

    h.sched
        .check_notifications(t0() + Duration::minutes(2))
        .await
        .unwrap();
    h.sched.wait_for_sends().await;
    assert!(h.transport.sent().is_empty());
    assert!(h.store.entries_for_key(&ak).await.unwrap().is_empty());
}

#[tokio::test]
async fn unevaluated_key_requeues_due_notification() {
    let mut alert = crit_alert("b", &["pager"]);
    alert.depends = Some("dep_b".into());
    let h = Harness::new(vec![alert], vec![pager()]);
    let ak = key("b{host=x}");

    h.eval.set("crit_b", &[("host=x", 1.0)]);
    h.tick(t0()).await;
    h.eval.set("dep_b", &[("host=x", 1.0)]);
    let now = t0() + Duration::seconds(30);
    h.tick(now).await;
    assert!(h.store.get_open_incident(&ak).await.unwrap().unwrap().unevaluated);

    h.sched.check_notifications(now).await.unwrap();
    h.sched.wait_for_sends().await;
    assert!(h.transport.sent().is_empty());
    let queued = h.store.entries_for_key(&ak).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].due, now + Duration::seconds(60));
}

#[tokio::test]
async fn silenced_due_entry_is_dropped() {
    let h = Harness::new(vec![crit_alert("a", &["pager"])], vec![pager()]);
    let ak = key("a{host=x}");
    h.eval.set("crit_a", &[("host=x", 1.0)]);
    h.tick(t0()).await;
    h.silence("a", "", false, t0() + Duration::seconds(10)).await;

    h.sched
        .check_notifications(t0() + Duration::seconds(20))
        .await
        .unwrap();
    h.sched.wait_for_sends().await;
    assert!(h.transport.sent().is_empty());
    assert!(h.store.entries_for_key(&ak).await.unwrap().is_empty());
}

#[tokio::test]
async fn close_of_active_incident_is_delayed() {
    let h = Harness::new(vec![crit_alert("a", &["pager"])], vec![pager()]);
    let ak = key("a{host=x}");

    h.eval.set("crit_a", &[("host=x", 1.0)]);
    h.tick(t0()).await;
    h.sched
        .action_at("ops", "closing", ActionType::Close, &ak, None, t0() + Duration::minutes(1))
        .await
        .unwrap();

    let inc = h.store.get_open_incident(&ak).await.unwrap().unwrap();
    let delayed = inc.actions.last().unwrap();
    assert_eq!(delayed.action_type, ActionType::DelayedClose);
    // Default alert frequency is 60s x 5, doubled.
    assert_eq!(delayed.deadline, Some(t0() + Duration::minutes(11)));
    assert!(!inc.need_ack);

    h.eval.set("crit_a", &[("host=x", 0.0)]);
    h.tick(t0() + Duration::minutes(5)).await;
    assert!(h.store.get_open_incident(&ak).await.unwrap().is_some());

    h.tick(t0() + Duration::minutes(12)).await;
    assert!(h.store.get_open_incident(&ak).await.unwrap().is_none());
    let closed = h.store.get_latest_incident(&ak).await.unwrap().unwrap();
    assert!(closed.actions.iter().any(|a| a.action_type == ActionType::DelayedClose && a.fulfilled));
    assert_eq!(closed.end, Some(t0() + Duration::minutes(12)));
}

#[tokio::test]
async fn severity_increase_cancels_delayed_close() {
    let mut alert = crit_alert("a", &["pager"]);
    alert.warn = Some("warn_a".into());
    let h = Harness::new(vec![alert], vec![pager()]);
    let ak = key("a{host=x}");

    h.eval.set("warn_a", &[("host=x", 1.0)]);
    h.tick(t0()).await;
    h.sched
        .action_at("ops", "closing", ActionType::Close, &ak, None, t0())
        .await
        .unwrap();
    h.eval.set("crit_a", &[("host=x", 1.0)]);
    h.tick(t0() + Duration::minutes(1)).await;

    let inc = h.store.get_open_incident(&ak).await.unwrap().unwrap();
    assert!(inc.actions.iter().all(|a| !a.is_pending_delayed_close()));
    assert!(inc.actions.iter().any(|a| a.action_type == ActionType::CancelClose));
    assert!(inc.need_ack);
    assert_eq!(h.store.entries_for_key(&ak).await.unwrap().len(), 1);
}

#[tokio::test]
async fn action_rules_are_enforced() {
    let h = Harness::new(vec![crit_alert("a", &["pager"])], vec![pager()]);
    let ak = key("a{host=x}");

    let err = h
        .sched
        .action_at("ops", "", ActionType::Note, &ak, None, t0())
        .await
        .unwrap_err();
    assert!(matches!(err, SchedError::ActionRejected { .. }));

    h.eval.set("crit_a", &[("host=x", 1.0)]);
    h.tick(t0()).await;

    h.sched
        .action_at("ops", "mine", ActionType::Acknowledge, &ak, None, t0())
        .await
        .unwrap();
    let again = h
        .sched
        .action_at("ops", "mine", ActionType::Acknowledge, &ak, None, t0())
        .await;
    assert!(matches!(again, Err(SchedError::ActionRejected { .. })));

    let forget = h
        .sched
        .action_at("ops", "", ActionType::Forget, &ak, None, t0())
        .await;
    assert!(matches!(forget, Err(SchedError::ActionRejected { .. })));

    h.sched
        .action_at("ops", "see ticket", ActionType::Note, &ak, None, t0())
        .await
        .unwrap();
    h.sched
        .action_at("ops", "done", ActionType::ForceClose, &ak, None, t0())
        .await
        .unwrap();
    let closed = h.store.get_latest_incident(&ak).await.unwrap().unwrap();
    assert!(!closed.open);
    assert_eq!(closed.actions.len(), 3);

    h.sched
        .action_at("ops", "", ActionType::Purge, &ak, None, t0())
        .await
        .unwrap();
    assert_eq!(h.store.incident_count(&ak), 0);
}

#[tokio::test]
async fn actions_notify_run_on_actions_targets() {
    let mut chat = Notification::named("chat");
    chat.run_on_actions = true;
    let h = Harness::new(vec![crit_alert("a", &["pager", "chat"])], vec![pager(), chat]);
    let ak = key("a{host=x}");

    h.eval.set("crit_a", &[("host=x", 1.0)]);
    h.tick(t0()).await;
    h.sched.action("alice", "looking", ActionType::Acknowledge, &ak).await.unwrap();
    h.sched.wait_for_sends().await;

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].notification, "chat");
    assert!(sent[0].subject.starts_with("alice acknowledge: #"));
}

#[tokio::test]
async fn log_alert_notifications_are_throttled() {
    let mut alert = crit_alert("a", &["pager"]);
    alert.log = true;
    alert.max_log_frequency_secs = 3600;
    let h = Harness::new(vec![alert], vec![pager()]);
    let ak = key("a{host=x}");
    h.eval.set("crit_a", &[("host=x", 1.0)]);

    for (mins, expected) in [(0, 1), (1, 1), (30, 1), (120, 2)] {
        let now = t0() + Duration::minutes(mins);
        h.tick(now).await;
        h.sched.check_notifications(now).await.unwrap();
        h.sched.wait_for_sends().await;
        assert_eq!(h.transport.sent().len(), expected, "at +{mins}m");
    }
    assert!(h.store.get_open_incident(&ak).await.unwrap().is_none());
    assert!(h.store.entries_for_key(&ak).await.unwrap().is_empty());
}

#[tokio::test]
async fn template_error_still_notifies() {
    let mut alert = crit_alert("a", &["pager"]);
    alert.template = Some("missing".into());
    let h = Harness::new(vec![alert], vec![pager()]);

    h.eval.set("crit_a", &[("host=x", 1.0)]);
    h.tick(t0()).await;
    h.sched.check_notifications(t0()).await.unwrap();
    h.sched.wait_for_sends().await;

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "error: template rendering error for alert a{host=x}");
}

#[tokio::test]
async fn quiet_mode_sends_nothing() {
    let settings = SystemSettings {
        quiet: true,
        ..Default::default()
    };
    let h = Harness::with_settings(vec![crit_alert("a", &["pager"])], vec![pager()], settings);
    h.eval.set("crit_a", &[("host=x", 1.0)]);
    h.tick(t0()).await;
    h.sched.check_notifications(t0()).await.unwrap();
    h.sched.wait_for_sends().await;
    assert!(h.transport.sent().is_empty());
    assert_eq!(h.sched.metrics().notifications_sent, 0);
}

#[tokio::test]
async fn dry_run_silence_reports_matching_keys() {
    let h = Harness::new(vec![crit_alert("a", &["pager"])], vec![pager()]);
    h.eval.set("crit_a", &[("host=x", 1.0), ("host=y", 1.0)]);
    h.tick(t0()).await;

    let req: SilenceRequest = serde_json::from_value(serde_json::json!({
        "start": t0(),
        "end": t0() + Duration::hours(1),
        "tags": "host=x",
    }))
    .unwrap();
    let affected = h.sched.add_silence(req, t0()).await.unwrap();
    assert_eq!(affected, vec![key("a{host=x}")]);
    assert!(h.sched.list_silences().await.unwrap().is_empty());

    let bad: SilenceRequest = serde_json::from_value(serde_json::json!({
        "start": t0(),
        "end": t0() + Duration::hours(1),
    }))
    .unwrap();
    assert!(matches!(
        h.sched.add_silence(bad, t0()).await,
        Err(SchedError::InvalidSilence(_))
    ));
}

#[tokio::test]
async fn collected_states_and_groups() {
    let h = Harness::new(vec![crit_alert("a", &["pager"])], vec![pager()]);
    h.eval.set("crit_a", &[("host=x", 1.0), ("host=y", 1.0)]);
    h.tick(t0()).await;
    h.sched
        .action_at("ops", "", ActionType::Acknowledge, &key("a{host=y}"), None, t0())
        .await
        .unwrap();

    h.sched.collect_states(t0()).await.unwrap();
    let metrics = h.sched.metrics();
    assert_eq!(metrics.open_incidents, 2);
    assert_eq!(metrics.need_ack, 1);
    assert_eq!(metrics.by_status.get("critical"), Some(&2));
    assert_eq!(metrics.checks_run, 1);
    assert_eq!(metrics.collected_at, Some(t0()));

    let grouped = h.sched.group_states(t0()).await.unwrap();
    assert_eq!(grouped.len(), 2);
    assert_eq!(h.sched.get_open_states().await.unwrap().len(), 2);
    assert!(!h.sched.lock_status().held);
}

#[tokio::test]
async fn run_twice_is_rejected() {
    let h = Harness::new(vec![], vec![]);
    h.sched.run().unwrap();
    assert!(matches!(h.sched.run(), Err(SchedError::Config(_))));
    h.sched.close().await;
}

#[tokio::test(start_paused = true)]
async fn running_schedule_notifies_and_closes() {
    let mut alert = crit_alert("a", &["pager"]);
    alert.run_every = 1;
    let h = Harness::new(vec![alert], vec![pager()]);
    h.eval.set("crit_a", &[("host=x", 1.0)]);

    h.sched.run().unwrap();
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    h.sched.close().await;

    assert!(h.store.get_open_incident(&key("a{host=x}")).await.unwrap().is_some());
    assert_eq!(h.transport.names(), vec!["pager"]);
}

#[tokio::test(start_paused = true)]
async fn busy_alert_drops_ticks() {
    let mut alert = crit_alert("a", &["pager"]);
    alert.run_every = 1;
    let settings = SystemSettings {
        check_frequency_secs: 1,
        ..Default::default()
    };
    let h = Harness::with_settings(vec![alert], vec![pager()], settings);
    h.eval.hang("crit_a");

    h.sched.run().unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(3500)).await;
    assert!(h.sched.metrics().checks_dropped >= 1);
    h.sched.close().await;
    assert_eq!(h.sched.metrics().checks_run, 0);
}

#[tokio::test(start_paused = true)]
async fn close_flushes_pending_unknowns() {
    let settings = SystemSettings {
        unknown_threshold: 10,
        min_group_size: 5,
        ..Default::default()
    };
    let h = Harness::with_settings(vec![unknown_alert()], vec![pager()], settings);
    let keys = make_unknowns(&h).await;
    h.sched
        .check_notifications(t0() + Duration::minutes(5))
        .await
        .unwrap();
    h.sched.wait_for_sends().await;
    assert!(h.transport.sent().is_empty());

    h.sched.run().unwrap();
    h.sched.close().await;

    let mut sent: Vec<AlertKey> = h.transport.sent().into_iter().map(|s| s.key).collect();
    sent.sort();
    assert_eq!(sent, keys);
}

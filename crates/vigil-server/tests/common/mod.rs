#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tower::util::ServiceExt;
use vigil_common::types::ExprResult;
use vigil_notify::{ChannelTransport, PlaceholderRenderer};
use vigil_sched::{Collaborators, ExpressionEvaluator, RuleSet, Schedule};
use vigil_server::app;
use vigil_server::config::ServerConfig;
use vigil_server::state::AppState;
use vigil_storage::MemoryStore;

pub const CONFIG: &str = r#"
[evaluator]
url = "http://127.0.0.1:1/unused"

[[notification]]
name = "log"
print = true

[[alert]]
name = "cpu_high"
crit = "cpu"
crit_notification = ["log"]
"#;

/// Evaluator returning fixed per-expression results.
#[derive(Default)]
pub struct StaticEvaluator {
    results: Mutex<HashMap<String, Vec<ExprResult>>>,
}

impl StaticEvaluator {
    pub fn set(&self, expr: &str, results: &[(&str, f64)]) {
        let results = results
            .iter()
            .map(|(g, v)| ExprResult::new(g.parse().expect("group should parse"), *v))
            .collect();
        self.results
            .lock()
            .expect("evaluator lock")
            .insert(expr.to_string(), results);
    }
}

#[async_trait]
impl ExpressionEvaluator for StaticEvaluator {
    async fn evaluate(
        &self,
        expr: &str,
        _window: Duration,
        _now: DateTime<Utc>,
    ) -> vigil_sched::Result<Vec<ExprResult>> {
        Ok(self
            .results
            .lock()
            .expect("evaluator lock")
            .get(expr)
            .cloned()
            .unwrap_or_default())
    }
}

pub struct TestContext {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub evaluator: Arc<StaticEvaluator>,
    pub app: axum::Router,
}

pub fn build_test_context() -> TestContext {
    vigil_common::id::init(1, 1);
    let config = ServerConfig::from_toml(CONFIG).expect("config should parse");
    config.validate().expect("config should validate");

    let store = Arc::new(MemoryStore::new());
    let evaluator = Arc::new(StaticEvaluator::default());
    let schedule = Schedule::new(
        Arc::new(config.system.clone()),
        Arc::new(RuleSet::new(
            config.alerts.clone(),
            config.notifications.clone(),
        )),
        Collaborators::from_store(store.clone()),
        evaluator.clone(),
        Arc::new(PlaceholderRenderer::default()),
        Arc::new(ChannelTransport::new(None).expect("transport should build")),
    );

    let state = AppState {
        schedule: Arc::new(schedule),
        config: Arc::new(config),
        start_time: Utc::now(),
    };
    let app = app::build_http_app(state.clone());
    TestContext {
        state,
        store,
        evaluator,
        app,
    }
}

/// Runs one evaluation of every configured alert.
pub async fn run_checks(ctx: &TestContext) {
    let alerts = ctx.state.schedule.rules().alerts();
    ctx.state
        .schedule
        .run_once(&alerts, Utc::now())
        .await
        .expect("checks should run");
}

pub async fn request(
    app: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value, Option<String>) {
    let mut builder = Request::builder().method(method).uri(uri);
    let req_body = match body {
        Some(body) => {
            builder = builder.header("Content-Type", "application/json");
            Body::from(body.to_string())
        }
        None => Body::empty(),
    };
    let req = builder.body(req_body).expect("request should build");

    let resp = app
        .clone()
        .oneshot(req)
        .await
        .expect("request should be handled");
    let status = resp.status();
    let trace_id = resp
        .headers()
        .get("x-trace-id")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string());
    let bytes = to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("body should read");
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice::<Value>(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).to_string()))
    };
    (status, json, trace_id)
}

pub fn assert_ok_envelope(json: &Value) {
    assert_eq!(json["err_code"], 0);
    assert!(json["err_msg"].is_string());
    assert!(json.get("trace_id").is_some());
}

pub fn assert_err_envelope(json: &Value, err_code: i32) {
    assert_eq!(json["err_code"], err_code);
    assert!(json["err_msg"].is_string());
    assert!(json["data"].is_null());
}

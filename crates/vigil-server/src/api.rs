use crate::logging::TraceId;
use crate::state::AppState;
use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vigil_common::types::{ActionType, IncidentState};
use vigil_common::AlertKey;
use vigil_sched::{SchedError, SilenceRequest};

/// Uniform response envelope.
#[derive(Serialize)]
pub struct ApiResponse<T>
where
    T: Serialize,
{
    /// Zero on success.
    pub err_code: i32,
    pub err_msg: String,
    pub trace_id: String,
    pub data: Option<T>,
}

pub fn success_response<T>(status: StatusCode, trace_id: &str, data: T) -> Response
where
    T: Serialize,
{
    (
        status,
        Json(ApiResponse {
            err_code: 0,
            err_msg: "success".to_string(),
            trace_id: trace_id.to_string(),
            data: Some(data),
        }),
    )
        .into_response()
}

pub fn success_empty_response(status: StatusCode, trace_id: &str, msg: &str) -> Response {
    (
        status,
        Json(ApiResponse::<Value> {
            err_code: 0,
            err_msg: msg.to_string(),
            trace_id: trace_id.to_string(),
            data: None,
        }),
    )
        .into_response()
}

fn to_custom_error_code(code: &str) -> i32 {
    match code {
        "bad_request" => 1001,
        "not_found" => 1004,
        "action_rejected" => 1201,
        "invalid_silence" => 1202,
        "unknown_alert" => 1203,
        "internal_error" => 1500,
        "storage_error" => 1501,
        "evaluation_error" => 1502,
        _ => 1999,
    }
}

pub fn error_response(status: StatusCode, trace_id: &str, code: &str, msg: &str) -> Response {
    (
        status,
        Json(ApiResponse::<Value> {
            err_code: to_custom_error_code(code),
            err_msg: msg.to_string(),
            trace_id: trace_id.to_string(),
            data: None,
        }),
    )
        .into_response()
}

fn sched_error_response(trace_id: &str, err: &SchedError) -> Response {
    let (status, code) = match err {
        SchedError::ActionRejected { .. } => (StatusCode::BAD_REQUEST, "action_rejected"),
        SchedError::InvalidSilence(_) => (StatusCode::BAD_REQUEST, "invalid_silence"),
        SchedError::UnknownAlert(_) | SchedError::UnknownNotification(_) => {
            (StatusCode::NOT_FOUND, "unknown_alert")
        }
        SchedError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
        SchedError::Evaluation(_) => (StatusCode::INTERNAL_SERVER_ERROR, "evaluation_error"),
        SchedError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };
    if status.is_server_error() {
        tracing::error!(trace_id, error = %err, "Request failed");
    }
    error_response(status, trace_id, code, &err.to_string())
}

#[derive(Serialize)]
struct HealthResponse {
    version: String,
    uptime_secs: i64,
    alerts: usize,
    open_incidents: usize,
    quiet: bool,
}

async fn health(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
) -> Response {
    let uptime = (Utc::now() - state.start_time).num_seconds();
    let open = match state.schedule.get_open_states().await {
        Ok(open) => open.len(),
        Err(e) => return sched_error_response(&trace_id, &e),
    };
    success_response(
        StatusCode::OK,
        &trace_id,
        HealthResponse {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: uptime,
            alerts: state.schedule.rules().alerts().len(),
            open_incidents: open,
            quiet: state.config.system.quiet,
        },
    )
}

async fn open_incidents(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
) -> Response {
    match state.schedule.get_open_states().await {
        Ok(open) => {
            let items: Vec<IncidentState> = open.into_values().collect();
            success_response(StatusCode::OK, &trace_id, items)
        }
        Err(e) => sched_error_response(&trace_id, &e),
    }
}

async fn grouped_incidents(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
) -> Response {
    match state.schedule.group_states(Utc::now()).await {
        Ok(groups) => success_response(StatusCode::OK, &trace_id, groups),
        Err(e) => sched_error_response(&trace_id, &e),
    }
}

async fn get_incident(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Response {
    match state.schedule.get_incident(id).await {
        Ok(Some(incident)) => success_response(StatusCode::OK, &trace_id, incident),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            &trace_id,
            "not_found",
            &format!("incident {id} not found"),
        ),
        Err(e) => sched_error_response(&trace_id, &e),
    }
}

#[derive(Deserialize)]
struct ActionRequest {
    user: String,
    #[serde(default)]
    message: String,
    #[serde(rename = "type")]
    action_type: ActionType,
    keys: Vec<AlertKey>,
}

#[derive(Serialize)]
struct ActionResult {
    key: AlertKey,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Applies one action to every listed key. Per-key rejections are reported
/// in the response; storage failures abort the request.
async fn create_action(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Json(req): Json<ActionRequest>,
) -> Response {
    if req.user.trim().is_empty() || req.keys.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            &trace_id,
            "bad_request",
            "user and keys are required",
        );
    }
    let mut results = Vec::with_capacity(req.keys.len());
    for key in req.keys {
        match state
            .schedule
            .action(&req.user, &req.message, req.action_type, &key)
            .await
        {
            Ok(()) => results.push(ActionResult {
                key,
                ok: true,
                error: None,
            }),
            Err(e @ SchedError::ActionRejected { .. }) => results.push(ActionResult {
                key,
                ok: false,
                error: Some(e.to_string()),
            }),
            Err(e) => return sched_error_response(&trace_id, &e),
        }
    }
    success_response(StatusCode::OK, &trace_id, results)
}

#[derive(Serialize)]
struct SilenceResponse {
    confirmed: bool,
    affected: Vec<AlertKey>,
}

async fn create_silence(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Json(req): Json<SilenceRequest>,
) -> Response {
    let confirmed = req.confirm;
    match state.schedule.add_silence(req, Utc::now()).await {
        Ok(affected) => success_response(
            StatusCode::OK,
            &trace_id,
            SilenceResponse {
                confirmed,
                affected,
            },
        ),
        Err(e) => sched_error_response(&trace_id, &e),
    }
}

async fn list_silences(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
) -> Response {
    match state.schedule.list_silences().await {
        Ok(silences) => success_response(StatusCode::OK, &trace_id, silences),
        Err(e) => sched_error_response(&trace_id, &e),
    }
}

async fn delete_silence(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    match state.schedule.clear_silence(&id).await {
        Ok(true) => success_empty_response(StatusCode::OK, &trace_id, "silence cleared"),
        Ok(false) => error_response(
            StatusCode::NOT_FOUND,
            &trace_id,
            "not_found",
            &format!("silence {id} not found"),
        ),
        Err(e) => sched_error_response(&trace_id, &e),
    }
}

async fn lock_status(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
) -> Response {
    success_response(StatusCode::OK, &trace_id, state.schedule.lock_status())
}

async fn scheduler_metrics(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
) -> Response {
    success_response(StatusCode::OK, &trace_id, state.schedule.metrics())
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/incidents/open", get(open_incidents))
        .route("/v1/incidents/grouped", get(grouped_incidents))
        .route("/v1/incidents/{id}", get(get_incident))
        .route("/v1/actions", post(create_action))
        .route("/v1/silences", post(create_silence).get(list_silences))
        .route("/v1/silences/{id}", delete(delete_silence))
        .route("/v1/scheduler/lock", get(lock_status))
        .route("/v1/scheduler/metrics", get(scheduler_metrics))
}

use axum::{
    body::Body,
    extract::Request,
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use rand::Rng;
use std::fmt::Write;
use std::time::Instant;

/// Trace id of the current request, stored in request extensions.
#[derive(Clone)]
pub struct TraceId(pub String);

impl std::ops::Deref for TraceId {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

/// 16 hex characters from 8 random bytes.
fn generate_trace_id() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    let mut s = String::with_capacity(16);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

const MAX_BODY_LOG_CHARS: usize = 200;

/// Larger request bodies are answered with 413 before reaching handlers.
const MAX_REQUEST_BODY: usize = 1024 * 1024;

fn snippet(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) if s.len() > MAX_BODY_LOG_CHARS => {
            let mut end = MAX_BODY_LOG_CHARS;
            while end > 0 && !s.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &s[..end])
        }
        Ok(s) => s.to_string(),
        Err(_) => "<non-utf8 body>".to_string(),
    }
}

/// Logs every request and response and tags the response with `X-Trace-Id`.
pub async fn request_logging(mut req: Request, next: Next) -> Response {
    let trace_id = generate_trace_id();
    req.extensions_mut().insert(TraceId(trace_id.clone()));

    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let req = if matches!(method.as_str(), "POST" | "PUT" | "DELETE") {
        let (parts, body) = req.into_parts();
        let Ok(bytes) = axum::body::to_bytes(body, MAX_REQUEST_BODY).await else {
            tracing::warn!(trace_id = %trace_id, method = %method, path = %path, "Request body too large");
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        };
        tracing::info!(trace_id = %trace_id, method = %method, path = %path, body = %snippet(&bytes), "--> request");
        Request::from_parts(parts, Body::from(bytes))
    } else {
        tracing::info!(trace_id = %trace_id, method = %method, path = %path, "--> request");
        req
    };

    let start = Instant::now();
    let response = next.run(req).await;
    let elapsed_ms = start.elapsed().as_millis() as u64;
    let status = response.status();

    let (parts, body) = response.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .unwrap_or_default();

    if status.is_server_error() {
        tracing::error!(trace_id = %trace_id, status = status.as_u16(), elapsed_ms, body = %snippet(&bytes), "<-- response");
    } else if status.is_client_error() {
        tracing::warn!(trace_id = %trace_id, status = status.as_u16(), elapsed_ms, body = %snippet(&bytes), "<-- response");
    } else {
        tracing::info!(trace_id = %trace_id, status = status.as_u16(), elapsed_ms, "<-- response");
    }

    let mut response = Response::from_parts(parts, Body::from(bytes));
    if let Ok(val) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert("X-Trace-Id", val);
    }
    if !response.headers().contains_key(header::CACHE_CONTROL) {
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    }
    response
}

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use vigil_common::types::ExprResult;

/// Executes one expression against a time-series backend.
///
/// Each returned result is a per-group verdict: zero is normal, anything
/// else (including NaN) is abnormal for the expression's level.
#[async_trait]
pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluates `expr` over the window `[now - window, now]`.
    async fn evaluate(
        &self,
        expr: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExprResult>>;
}

/// True when a result marks its group abnormal.
pub fn is_abnormal(value: f64) -> bool {
    value != 0.0
}

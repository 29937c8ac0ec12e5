use crate::config::EvaluatorConfig;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use vigil_common::types::ExprResult;
use vigil_common::TagSet;
use vigil_sched::{ExpressionEvaluator, SchedError};

#[derive(Serialize)]
struct QueryRequest<'a> {
    expr: &'a str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
}

/// One group of a query response. A `null` value is read as NaN.
#[derive(Deserialize)]
struct QueryResult {
    #[serde(default)]
    group: TagSet,
    value: Option<f64>,
}

/// Evaluates expressions by POSTing them to an external query endpoint.
pub struct HttpEvaluator {
    client: reqwest::Client,
    url: String,
}

impl HttpEvaluator {
    pub fn new(config: &EvaluatorConfig) -> Result<Self, SchedError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SchedError::Config(format!("evaluator client: {e}")))?;
        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }
}

#[async_trait]
impl ExpressionEvaluator for HttpEvaluator {
    async fn evaluate(
        &self,
        expr: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> vigil_sched::Result<Vec<ExprResult>> {
        let request = QueryRequest {
            expr,
            from: now - window,
            to: now,
        };
        let resp = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| SchedError::Evaluation(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SchedError::Evaluation(format!(
                "query endpoint returned {status}: {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        let results: Vec<QueryResult> = resp
            .json()
            .await
            .map_err(|e| SchedError::Evaluation(format!("invalid query response: {e}")))?;
        tracing::debug!(expr, groups = results.len(), "Expression evaluated");
        Ok(results
            .into_iter()
            .map(|r| ExprResult::new(r.group, r.value.unwrap_or(f64::NAN)))
            .collect())
    }
}

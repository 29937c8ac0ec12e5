use crate::error::{NotifyError, Result};
use crate::utils::{fill_placeholders, form_encode, truncate_string, MAX_BODY_LENGTH};
use std::collections::BTreeMap;
use std::time::Duration;
use vigil_common::conf::Notification;
use vigil_common::types::RenderedTemplates;
use vigil_common::AlertKey;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP POST and GET delivery.
pub struct HttpChannel {
    client: reqwest::Client,
}

impl Default for HttpChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpChannel {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    /// Builds the POST body. Without a body template the rendered subject is
    /// sent, form-encoded for the default content type.
    pub fn render_body(
        notification: &Notification,
        content: &RenderedTemplates,
        key: &AlertKey,
    ) -> String {
        match &notification.body {
            Some(template) => {
                let mut vars = BTreeMap::new();
                vars.insert("subject".to_string(), content.subject.clone());
                vars.insert("body".to_string(), content.body.clone());
                vars.insert("key".to_string(), key.to_string());
                vars.insert("alert".to_string(), key.name().to_string());
                vars.insert("group".to_string(), key.group().to_string());
                fill_placeholders(template, &vars)
            }
            None if notification.content_type == "application/x-www-form-urlencoded" => {
                format!("subject={}", form_encode(&content.subject))
            }
            None => content.subject.clone(),
        }
    }

    pub async fn post(
        &self,
        url: &str,
        notification: &Notification,
        content: &RenderedTemplates,
        key: &AlertKey,
    ) -> Result<()> {
        let body = Self::render_body(notification, content, key);
        let resp = self
            .client
            .post(url)
            .header("Content-Type", notification.content_type.as_str())
            .body(body)
            .send()
            .await?;
        Self::check_status(&notification.name, resp).await
    }

    pub async fn get(&self, url: &str, notification: &Notification) -> Result<()> {
        let resp = self.client.get(url).send().await?;
        Self::check_status(&notification.name, resp).await
    }

    async fn check_status(service: &str, resp: reqwest::Response) -> Result<()> {
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = match resp.text().await {
            Ok(text) => truncate_string(&text, MAX_BODY_LENGTH),
            Err(e) => format!("[Failed to read response body: {e}]"),
        };
        Err(NotifyError::ApiError {
            service: service.to_string(),
            status: status.as_u16(),
            body,
        })
    }
}

use crate::channels::{EmailChannel, HttpChannel, SmtpConfig};
use crate::error::{NotifyError, Result};
use crate::NotificationTransport;
use async_trait::async_trait;
use vigil_common::conf::Notification;
use vigil_common::types::RenderedTemplates;
use vigil_common::AlertKey;

/// Delivers a notification through every target it names: log output,
/// email recipients, a POST url and a GET url.
///
/// All targets are attempted; the first failure is returned after the rest
/// have run.
pub struct ChannelTransport {
    email: Option<EmailChannel>,
    http: HttpChannel,
}

impl ChannelTransport {
    pub fn new(smtp: Option<&SmtpConfig>) -> Result<Self> {
        let email = smtp.map(EmailChannel::new).transpose()?;
        Ok(Self {
            email,
            http: HttpChannel::new(),
        })
    }
}

#[async_trait]
impl NotificationTransport for ChannelTransport {
    async fn send(
        &self,
        notification: &Notification,
        content: &RenderedTemplates,
        key: &AlertKey,
    ) -> Result<()> {
        let mut first_err: Option<NotifyError> = None;
        let mut record = |result: Result<()>, channel: &str| {
            if let Err(e) = result {
                tracing::error!(
                    notification = %notification.name,
                    key = %key,
                    channel,
                    error = %e,
                    "Notification delivery failed"
                );
                first_err.get_or_insert(e);
            }
        };

        if notification.print {
            tracing::info!(
                notification = %notification.name,
                key = %key,
                subject = %content.subject,
                body = %content.body,
                "Notification"
            );
        }

        if !notification.email.is_empty() {
            let result = match &self.email {
                Some(channel) => channel.send(&notification.email, content).await,
                None => Err(NotifyError::InvalidConfig(format!(
                    "notification '{}' has email recipients but no smtp is configured",
                    notification.name
                ))),
            };
            record(result, "email");
        }

        if let Some(url) = &notification.post {
            let result = self.http.post(url, notification, content, key).await;
            record(result, "post");
        }

        if let Some(url) = &notification.get {
            let result = self.http.get(url, notification).await;
            record(result, "get");
        }

        match first_err {
            Some(e) => Err(e),
            None => {
                tracing::debug!(notification = %notification.name, key = %key, "Notification sent");
                Ok(())
            }
        }
    }
}

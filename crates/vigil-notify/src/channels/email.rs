use crate::error::{NotifyError, Result};
use lettre::message::header::ContentType;
use lettre::message::{Attachment, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Deserialize;
use vigil_common::types::RenderedTemplates;

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub from: String,
    /// Use STARTTLS/TLS relay; plain SMTP when false.
    #[serde(default = "default_tls")]
    pub tls: bool,
}

fn default_smtp_port() -> u16 {
    25
}

fn default_tls() -> bool {
    true
}

pub struct EmailChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
}

impl EmailChannel {
    pub fn new(config: &SmtpConfig) -> Result<Self> {
        let builder = if config.tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };
        let mut builder = builder.port(config.port);

        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        if config.from.trim().is_empty() {
            return Err(NotifyError::InvalidConfig("smtp from address is empty".into()));
        }

        Ok(Self {
            transport: builder.build(),
            from: config.from.clone(),
        })
    }

    fn build_message(&self, recipients: &[String], content: &RenderedTemplates) -> Result<Message> {
        let mut builder = Message::builder()
            .from(self.from.parse()?)
            .subject(content.email_subject());
        for recipient in recipients {
            builder = builder.to(recipient.parse()?);
        }

        let text = SinglePart::builder()
            .header(ContentType::TEXT_PLAIN)
            .body(content.email_body().to_string());
        if content.attachments.is_empty() {
            return Ok(builder.singlepart(text)?);
        }

        let mut multipart = MultiPart::mixed().singlepart(text);
        for att in &content.attachments {
            let content_type = ContentType::parse(&att.content_type).map_err(|e| {
                NotifyError::InvalidConfig(format!(
                    "attachment '{}' has invalid content type: {e}",
                    att.filename
                ))
            })?;
            multipart = multipart
                .singlepart(Attachment::new(att.filename.clone()).body(att.data.clone(), content_type));
        }
        Ok(builder.multipart(multipart)?)
    }

    /// Sends one message addressed to every recipient.
    pub async fn send(&self, recipients: &[String], content: &RenderedTemplates) -> Result<()> {
        if recipients.is_empty() {
            return Ok(());
        }
        let message = self.build_message(recipients, content)?;
        self.transport.send(message).await?;
        tracing::debug!(recipients = recipients.len(), "Email sent");
        Ok(())
    }
}

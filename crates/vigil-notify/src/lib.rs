//! Notification delivery and content rendering for the vigil scheduler.
//!
//! The scheduler decides *when* to notify; this crate decides *how*.
//! [`NotificationTransport`] delivers rendered content for one alert key,
//! [`renderer::TemplateRenderer`] produces that content from an incident.
//! Built-in delivery covers email (SMTP), HTTP POST/GET and log output.

pub mod channels;
pub mod error;
pub mod renderer;
pub mod transport;
pub mod utils;


use async_trait::async_trait;
use vigil_common::conf::Notification;
use vigil_common::types::RenderedTemplates;
use vigil_common::AlertKey;

pub use error::{NotifyError, Result};
pub use renderer::{ActionContext, PlaceholderRenderer, TemplateContext, TemplateDef, TemplateRenderer};
pub use transport::ChannelTransport;

/// Delivers rendered notification content to the targets named by a
/// [`Notification`] definition.
///
/// Callers treat delivery as fire-and-forget: failures are logged and never
/// retried beyond the notification's own `next` chain.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn send(
        &self,
        notification: &Notification,
        content: &RenderedTemplates,
        key: &AlertKey,
    ) -> Result<()>;
}

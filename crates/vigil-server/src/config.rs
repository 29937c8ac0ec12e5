use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use vigil_common::conf::{AlertDef, Notification};
use vigil_notify::channels::SmtpConfig;
use vigil_notify::TemplateDef;
use vigil_sched::SystemSettings;

/// Errors raised while loading or validating the server configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config: failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Config: parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub system: SystemSettings,
    pub evaluator: EvaluatorConfig,
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
    #[serde(default)]
    pub templates: HashMap<String, TemplateDef>,
    #[serde(default, rename = "alert")]
    pub alerts: Vec<AlertDef>,
    #[serde(default, rename = "notification")]
    pub notifications: Vec<Notification>,
}

/// Where expressions are sent for evaluation.
#[derive(Debug, Clone, Deserialize)]
pub struct EvaluatorConfig {
    pub url: String,
    #[serde(default = "default_evaluator_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_http_port() -> u16 {
    8080
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_evaluator_timeout_secs() -> u64 {
    30
}

impl ServerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Checks cross references between alerts, notifications and templates.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut notifications = HashSet::new();
        for n in &self.notifications {
            if !notifications.insert(n.name.as_str()) {
                return Err(invalid(format!("duplicate notification '{}'", n.name)));
            }
            if n.email.is_empty() && n.post.is_none() && n.get.is_none() && !n.print {
                return Err(invalid(format!("notification '{}' has no target", n.name)));
            }
            if !n.email.is_empty() && self.smtp.is_none() {
                return Err(invalid(format!(
                    "notification '{}' sends email but [smtp] is not configured",
                    n.name
                )));
            }
        }
        for n in &self.notifications {
            if let Some(next) = &n.next {
                if !notifications.contains(next.as_str()) {
                    return Err(invalid(format!(
                        "notification '{}' has unknown next '{next}'",
                        n.name
                    )));
                }
                if n.timeout_secs == 0 {
                    return Err(invalid(format!(
                        "notification '{}' sets next without a timeout",
                        n.name
                    )));
                }
            }
        }

        let mut alerts = HashSet::new();
        for a in &self.alerts {
            if !alerts.insert(a.name.as_str()) {
                return Err(invalid(format!("duplicate alert '{}'", a.name)));
            }
        }
        for a in &self.alerts {
            if a.crit.is_none() && a.warn.is_none() {
                return Err(invalid(format!("alert '{}' has neither crit nor warn", a.name)));
            }
            for name in a.all_notifications() {
                if !notifications.contains(name.as_str()) {
                    return Err(invalid(format!(
                        "alert '{}' references unknown notification '{name}'",
                        a.name
                    )));
                }
            }
            for dep in &a.depends_on {
                if dep == &a.name || !alerts.contains(dep.as_str()) {
                    return Err(invalid(format!(
                        "alert '{}' has invalid depends_on '{dep}'",
                        a.name
                    )));
                }
            }
            if let Some(template) = &a.template {
                if !self.templates.contains_key(template) {
                    return Err(invalid(format!(
                        "alert '{}' references unknown template '{template}'",
                        a.name
                    )));
                }
            }
        }
        Ok(())
    }
}

fn invalid(msg: String) -> ConfigError {
    ConfigError::Invalid(msg)
}

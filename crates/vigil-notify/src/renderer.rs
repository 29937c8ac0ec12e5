use crate::error::{NotifyError, Result};
use crate::utils::fill_placeholders;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use vigil_common::conf::AlertDef;
use vigil_common::types::{ActionType, IncidentState, RenderedTemplates};
use vigil_common::AlertKey;

/// Everything a template may refer to when rendering one incident.
pub struct TemplateContext<'a> {
    pub alert: &'a AlertDef,
    pub incident: &'a IncidentState,
    pub now: DateTime<Utc>,
}

/// An action taken on one or more incidents, rendered for `run_on_actions`
/// notifications.
pub struct ActionContext<'a> {
    pub user: &'a str,
    pub message: &'a str,
    pub action_type: ActionType,
    pub incidents: &'a [IncidentState],
}

/// Turns incidents into human readable notification content.
///
/// Only [`TemplateRenderer::render`] is required. The unknown and action
/// forms have plain defaults so simple renderers need not implement them.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, ctx: &TemplateContext<'_>) -> Result<RenderedTemplates>;

    /// Content for a batch of unknown keys sharing a group label.
    fn render_unknown(&self, group: &str, keys: &[AlertKey]) -> RenderedTemplates {
        let subject = format!("vigil: {} unknown alert{}: {group}", keys.len(), plural(keys.len()));
        let body = keys
            .iter()
            .map(|k| k.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        RenderedTemplates {
            subject,
            body,
            ..Default::default()
        }
    }

    /// Content for the overflow summary once the unknown threshold is exceeded.
    fn render_unknown_summary(&self, groups: &BTreeMap<String, Vec<AlertKey>>) -> RenderedTemplates {
        let total: usize = groups.values().map(Vec::len).sum();
        let body = groups
            .iter()
            .map(|(name, keys)| format!("{name}: {} key{}", keys.len(), plural(keys.len())))
            .collect::<Vec<_>>()
            .join("\n");
        RenderedTemplates {
            subject: format!(
                "vigil: too many unknown alerts ({total} keys in {} groups)",
                groups.len()
            ),
            body,
            ..Default::default()
        }
    }

    fn render_action(&self, ctx: &ActionContext<'_>) -> RenderedTemplates {
        let subjects = ctx
            .incidents
            .iter()
            .map(|i| format!("#{} {}", i.id, i.subject))
            .collect::<Vec<_>>();
        let subject = if subjects.len() == 1 {
            format!("{} {}: {}", ctx.user, ctx.action_type, subjects[0])
        } else {
            format!("{} {} {} incidents", ctx.user, ctx.action_type, subjects.len())
        };
        RenderedTemplates {
            subject,
            body: format!("{}\n\n{}", ctx.message, subjects.join("\n")),
            ..Default::default()
        }
    }
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

/// A named template made of `{{placeholder}}` strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateDef {
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub email_subject: Option<String>,
    #[serde(default)]
    pub email_body: Option<String>,
}

const DEFAULT_SUBJECT: &str = "{{status}}: {{key}}";
const DEFAULT_BODY: &str = "Alert {{key}} is {{status}} (worst {{worst_status}}) since {{start}}.\n\
Expression: {{expr}}\nValue: {{value}}";

/// Renderer substituting `{{name}}` placeholders from the incident.
///
/// Supported names: `alert`, `key`, `group`, `status`, `worst_status`,
/// `expr`, `value`, `start`, `id`, `now`, and `tag.<name>` for each tag of
/// the key's group.
#[derive(Debug, Clone, Default)]
pub struct PlaceholderRenderer {
    templates: HashMap<String, TemplateDef>,
}

impl PlaceholderRenderer {
    pub fn new(templates: HashMap<String, TemplateDef>) -> Self {
        Self { templates }
    }

    fn vars(ctx: &TemplateContext<'_>) -> BTreeMap<String, String> {
        let inc = ctx.incident;
        let mut vars = BTreeMap::new();
        vars.insert("alert".to_string(), inc.alert().to_string());
        vars.insert("key".to_string(), inc.alert_key.to_string());
        vars.insert("group".to_string(), inc.alert_key.group().to_string());
        vars.insert("status".to_string(), inc.current_status.to_string());
        vars.insert("worst_status".to_string(), inc.worst_status.to_string());
        vars.insert("start".to_string(), inc.start.to_rfc3339());
        vars.insert("id".to_string(), inc.id.to_string());
        vars.insert("now".to_string(), ctx.now.to_rfc3339());
        let (expr, value) = match &inc.result {
            Some(r) => (r.expr.clone(), format!("{:.2}", r.value)),
            None => (String::new(), String::new()),
        };
        vars.insert("expr".to_string(), expr);
        vars.insert("value".to_string(), value);
        for (k, v) in inc.alert_key.group().iter() {
            vars.insert(format!("tag.{k}"), v.to_string());
        }
        vars
    }
}

impl TemplateRenderer for PlaceholderRenderer {
    fn render(&self, ctx: &TemplateContext<'_>) -> Result<RenderedTemplates> {
        let default_def;
        let def = match &ctx.alert.template {
            Some(name) => self
                .templates
                .get(name)
                .ok_or_else(|| NotifyError::TemplateError(format!("unknown template '{name}'")))?,
            None => {
                default_def = TemplateDef {
                    subject: DEFAULT_SUBJECT.to_string(),
                    body: DEFAULT_BODY.to_string(),
                    ..Default::default()
                };
                &default_def
            }
        };
        let vars = Self::vars(ctx);
        let subject = fill_placeholders(&def.subject, &vars);
        if subject.trim().is_empty() {
            return Err(NotifyError::TemplateError(format!(
                "template for alert '{}' rendered an empty subject",
                ctx.alert.name
            )));
        }
        Ok(RenderedTemplates {
            subject,
            body: fill_placeholders(&def.body, &vars),
            email_subject: def
                .email_subject
                .as_deref()
                .map(|t| fill_placeholders(t, &vars))
                .unwrap_or_default(),
            email_body: def
                .email_body
                .as_deref()
                .map(|t| fill_placeholders(t, &vars))
                .unwrap_or_default(),
            ..Default::default()
        })
    }
}

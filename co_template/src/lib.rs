//! ABOUTME: Template renderer producing channel-specific payloads
//! ABOUTME: Resolution is cached (bounded LRU, 1-hour TTL); substitution is pure

use co_core::{ChannelKind, Error, Result};
use co_db::{Db, Template, TemplateRepository, TtlLruCache};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, warn};

/// Rendered, channel-specific payload ready for an adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum RenderedPayload {
    Email {
        subject: String,
        html: Option<String>,
        text: String,
    },
    Sms {
        body: String,
    },
    Push {
        title: String,
        body: String,
        data: HashMap<String, String>,
    },
    InApp {
        title: String,
        body: String,
        action_url: Option<String>,
        icon: Option<String>,
    },
}

impl RenderedPayload {
    pub fn channel(&self) -> ChannelKind {
        match self {
            Self::Email { .. } => ChannelKind::Email,
            Self::Sms { .. } => ChannelKind::Sms,
            Self::Push { .. } => ChannelKind::Push,
            Self::InApp { .. } => ChannelKind::InApp,
        }
    }

    /// Parse an explicit producer-supplied payload for a channel.
    ///
    /// Used when a notification carries a payload instead of a template id.
    pub fn from_explicit(channel: ChannelKind, value: &serde_json::Value) -> Result<Self> {
        let title = value
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let body = value
            .get("body")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let payload = match channel {
            ChannelKind::Email => Self::Email {
                subject: value
                    .get("subject")
                    .and_then(|v| v.as_str())
                    .unwrap_or(&title)
                    .to_string(),
                html: value.get("html").and_then(|v| v.as_str()).map(String::from),
                text: body,
            },
            ChannelKind::Sms => Self::Sms { body },
            ChannelKind::Push => Self::Push {
                title,
                body,
                data: value
                    .get("data")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default(),
            },
            ChannelKind::InApp => Self::InApp {
                title,
                body,
                action_url: value
                    .get("action_url")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                icon: value.get("icon").and_then(|v| v.as_str()).map(String::from),
            },
        };

        Ok(payload)
    }
}

/// Substitute `{{name}}` placeholders by textual replacement.
///
/// Unknown or non-whitelisted variables render as empty strings; this
/// never fails. Deterministic: equal inputs produce equal output.
pub fn substitute(
    input: &str,
    variables: &HashMap<String, String>,
    whitelist: &[String],
) -> String {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let re = PLACEHOLDER
        .get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.-]+)\s*\}\}").expect("valid regex"));

    re.replace_all(input, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        if !whitelist.is_empty() && !whitelist.iter().any(|w| w == name) {
            warn!(variable = %name, "Placeholder not in template whitelist, rendering empty");
            return String::new();
        }
        match variables.get(name) {
            Some(value) => value.clone(),
            None => {
                debug!(variable = %name, "Unknown placeholder, rendering empty");
                String::new()
            }
        }
    })
    .into_owned()
}

/// Template renderer with a bounded, TTL'd resolution cache
pub struct Renderer {
    repo: TemplateRepository,
    cache: TtlLruCache<Template>,
}

impl Renderer {
    /// Cache bounds: 512 templates, 1-hour TTL
    pub fn new(db: Db) -> Self {
        Self {
            repo: TemplateRepository::new(db),
            cache: TtlLruCache::new(512, Duration::from_secs(3600)),
        }
    }

    /// Render the (template_id, channel) template with the given variables
    pub async fn render(
        &self,
        template_id: &str,
        channel: ChannelKind,
        variables: &HashMap<String, String>,
    ) -> Result<RenderedPayload> {
        let template = self.resolve(template_id, channel).await?;

        if !template.active {
            return Err(Error::TemplateInactive(template_id.to_string()));
        }

        let whitelist = &template.variables;
        let body = substitute(&template.body, variables, whitelist);

        let payload = match channel {
            ChannelKind::Email => RenderedPayload::Email {
                subject: substitute(
                    template.subject.as_deref().unwrap_or_default(),
                    variables,
                    whitelist,
                ),
                html: template
                    .html
                    .as_deref()
                    .map(|html| substitute(html, variables, whitelist)),
                text: body,
            },
            ChannelKind::Sms => RenderedPayload::Sms { body },
            ChannelKind::Push => {
                let data = match &template.data {
                    Some(value) => {
                        let raw: HashMap<String, String> =
                            serde_json::from_value(value.clone()).unwrap_or_default();
                        raw.into_iter()
                            .map(|(k, v)| (k, substitute(&v, variables, whitelist)))
                            .collect()
                    }
                    None => HashMap::new(),
                };
                RenderedPayload::Push {
                    title: substitute(
                        template.title.as_deref().unwrap_or_default(),
                        variables,
                        whitelist,
                    ),
                    body,
                    data,
                }
            }
            ChannelKind::InApp => RenderedPayload::InApp {
                title: substitute(
                    template.title.as_deref().unwrap_or_default(),
                    variables,
                    whitelist,
                ),
                body,
                action_url: None,
                icon: None,
            },
        };

        Ok(payload)
    }

    /// Whether any channel variant exists for a template id
    pub async fn template_exists(&self, template_id: &str) -> Result<bool> {
        self.repo.exists(template_id).await
    }

    /// Drop a template id from the cache (after mutation)
    pub fn invalidate(&self, template_id: &str, channel: ChannelKind) {
        self.cache
            .invalidate(&cache_key(template_id, channel));
    }

    async fn resolve(&self, template_id: &str, channel: ChannelKind) -> Result<Template> {
        let key = cache_key(template_id, channel);
        if let Some(template) = self.cache.get(&key) {
            return Ok(template);
        }

        let template = self
            .repo
            .find(template_id, channel)
            .await?
            .ok_or_else(|| Error::TemplateNotFound(template_id.to_string()))?;

        self.cache.put(key, template.clone());
        Ok(template)
    }
}

fn cache_key(template_id: &str, channel: ChannelKind) -> String {
    format!("{}:{}", template_id, channel.as_str())
}

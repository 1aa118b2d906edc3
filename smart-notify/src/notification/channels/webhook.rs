//! HTTP webhook notification channel.

use async_trait::async_trait;
use reqwest::{Client, header::HeaderMap};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::NotificationChannel;
use crate::notification::model::{AlertType, ChannelKind, Notification, NotificationPriority};
use crate::{Error, Result};

/// Webhook channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Stable channel instance identifier.
    #[serde(default)]
    pub id: Option<String>,
    /// Optional display name for this channel instance.
    #[serde(default)]
    pub name: Option<String>,
    /// Whether the channel is enabled.
    pub enabled: bool,
    /// Channel kind this endpoint represents. Slack and Discord get their
    /// native payload shapes; everything else gets the generic JSON body.
    #[serde(default = "default_kind")]
    pub kind: ChannelKind,
    /// Webhook URL.
    pub url: String,
    /// HTTP method (default: POST).
    #[serde(default = "default_method")]
    pub method: String,
    /// Custom headers.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Authentication type.
    #[serde(default)]
    pub auth: Option<WebhookAuth>,
    /// Minimum priority level to send (default: Lowest).
    #[serde(default = "default_min_priority")]
    pub min_priority: NotificationPriority,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_kind() -> ChannelKind {
    ChannelKind::Webhook
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_min_priority() -> NotificationPriority {
    NotificationPriority::Lowest
}

fn default_timeout() -> u64 {
    30
}

/// Webhook authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WebhookAuth {
    /// Bearer token authentication.
    Bearer { token: String },
    /// Basic authentication.
    Basic { username: String, password: String },
    /// Custom header authentication.
    Header { name: String, value: String },
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            id: None,
            name: None,
            enabled: false,
            kind: ChannelKind::Webhook,
            url: String::new(),
            method: "POST".to_string(),
            headers: Vec::new(),
            auth: None,
            min_priority: NotificationPriority::Lowest,
            timeout_secs: 30,
        }
    }
}

/// HTTP webhook notification channel.
pub struct WebhookChannel {
    id: String,
    config: WebhookConfig,
    client: Client,
}

impl WebhookChannel {
    /// Create a new webhook channel.
    pub fn new(config: WebhookConfig) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();

        let id = config
            .id
            .clone()
            .unwrap_or_else(|| format!("{}:{}", config.kind, config.url));

        Self { id, config, client }
    }

    /// Build the request headers.
    fn build_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        for (name, value) in &self.config.headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<reqwest::header::HeaderName>(),
                value.parse::<reqwest::header::HeaderValue>(),
            ) {
                headers.insert(name, value);
            }
        }

        if let Some(auth) = &self.config.auth {
            match auth {
                WebhookAuth::Bearer { token } => {
                    if let Ok(value) = format!("Bearer {}", token).parse() {
                        headers.insert(reqwest::header::AUTHORIZATION, value);
                    }
                }
                WebhookAuth::Header { name, value } => {
                    if let (Ok(name), Ok(value)) = (
                        name.parse::<reqwest::header::HeaderName>(),
                        value.parse::<reqwest::header::HeaderValue>(),
                    ) {
                        headers.insert(name, value);
                    }
                }
                // Applied on the request builder.
                WebhookAuth::Basic { .. } => {}
            }
        }

        headers
    }

    fn discord_color(notification: &Notification) -> u32 {
        notification
            .style
            .discord_color
            .unwrap_or(match notification.priority {
                NotificationPriority::Lowest | NotificationPriority::Low => 0x808080,
                NotificationPriority::Normal => 0x3498db,
                NotificationPriority::High => 0xf39c12,
                NotificationPriority::Emergency => 0xe74c3c,
            })
    }

    fn slack_color(notification: &Notification) -> String {
        notification.style.slack_color.clone().unwrap_or_else(|| {
            match notification.priority {
                NotificationPriority::Emergency => "danger",
                NotificationPriority::High => "warning",
                NotificationPriority::Normal => "good",
                _ => "#808080",
            }
            .to_string()
        })
    }

    /// Build the JSON payload.
    fn build_payload(&self, notification: &Notification) -> serde_json::Value {
        match self.config.kind {
            ChannelKind::Slack => json!({
                "text": format!("*{}*", notification.title),
                "attachments": [{
                    "color": Self::slack_color(notification),
                    "text": notification.message,
                    "footer": format!("{} | {}", notification.alert_type, notification.priority),
                    "ts": notification.timestamp.timestamp(),
                }]
            }),
            ChannelKind::Discord => json!({
                "embeds": [{
                    "title": notification.title,
                    "description": notification.message,
                    "color": Self::discord_color(notification),
                    "timestamp": notification.timestamp.to_rfc3339(),
                    "footer": {
                        "text": format!(
                            "Priority: {} | Type: {}",
                            notification.priority, notification.alert_type
                        )
                    }
                }]
            }),
            _ => json!({
                "type": notification.alert_type,
                "priority": notification.priority.to_string(),
                "priority_level": notification.priority.level(),
                "title": notification.title,
                "message": notification.message,
                "timestamp": notification.timestamp.to_rfc3339(),
                "subject": notification.style.email_subject,
                "sound": notification.style.pushover_sound,
                "context": notification.context,
            }),
        }
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn kind(&self) -> ChannelKind {
        self.config.kind
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled && !self.config.url.is_empty()
    }

    fn accepts(&self, notification: &Notification) -> bool {
        if !self.is_enabled() || !notification.targets(self.kind()) {
            return false;
        }
        if notification.priority < self.config.min_priority {
            debug!(
                channel = %self.id,
                priority = %notification.priority,
                min_priority = %self.config.min_priority,
                "Skipping webhook notification below minimum priority"
            );
            return false;
        }
        true
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        if !self.is_enabled() {
            return Err(Error::config(format!(
                "webhook channel '{}' is disabled or has no URL",
                self.id
            )));
        }

        let payload = self.build_payload(notification);
        let headers = self.build_headers();

        let mut request = match self.config.method.to_uppercase().as_str() {
            "PUT" => self.client.put(&self.config.url),
            _ => self.client.post(&self.config.url),
        };

        request = request.headers(headers).json(&payload);

        if let Some(WebhookAuth::Basic { username, password }) = &self.config.auth {
            request = request.basic_auth(username, Some(password));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(format!("webhook '{}': {}", self.id, e))
            } else {
                Error::transport(self.config.kind.as_str(), format!("request failed: {}", e))
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(channel = %self.id, %status, "Webhook delivery failed");
            return Err(Error::transport(
                self.config.kind.as_str(),
                format!("HTTP {} - {}", status, body),
            ));
        }

        debug!(channel = %self.id, title = %notification.title, "Webhook notification sent");
        Ok(())
    }

    async fn test(&self) -> Result<()> {
        let notification = Notification::new(
            AlertType::SystemHealth,
            "Test notification",
            "Channel configuration test",
            NotificationPriority::Low,
        );
        self.send(&notification).await
    }
}

//! Notification channels.
//!
//! Each concrete sender implements [`NotificationChannel`]. The bundled
//! [`WebhookChannel`] covers generic HTTP endpoints as well as chat-service
//! incoming webhooks (Slack, Discord) through its configurable `kind`.

mod webhook;

pub use webhook::{WebhookAuth, WebhookChannel, WebhookConfig};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::model::{ChannelKind, Notification};
use crate::Result;

/// Trait for notification channels.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Which channel kind this sender delivers to.
    fn kind(&self) -> ChannelKind;

    /// Stable identifier of this channel instance.
    fn id(&self) -> &str;

    /// Check if the channel is enabled.
    fn is_enabled(&self) -> bool;

    /// Whether this channel should receive `notification` at all.
    fn accepts(&self, notification: &Notification) -> bool {
        self.is_enabled() && notification.targets(self.kind())
    }

    /// Send a notification through this channel.
    async fn send(&self, notification: &Notification) -> Result<()>;

    /// Test the channel configuration.
    async fn test(&self) -> Result<()>;
}

/// Channel configuration wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelConfig {
    /// Generic or chat-service webhook channel.
    Webhook(WebhookConfig),
}

impl ChannelConfig {
    pub fn is_enabled(&self) -> bool {
        match self {
            Self::Webhook(c) => c.enabled,
        }
    }

    /// Build the runtime channel for this configuration.
    pub fn build(&self) -> Arc<dyn NotificationChannel> {
        match self {
            Self::Webhook(c) => Arc::new(WebhookChannel::new(c.clone())),
        }
    }
}

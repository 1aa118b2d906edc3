//! Notification dispatch.
//!
//! This module provides:
//! - The notification data model and fingerprinting
//! - Near-duplicate detection
//! - Adaptive per-priority rate limiting with a delivery queue
//! - Suppression rules, quiet hours and statistics
//! - Timed escalation chains
//! - Channels and the multi-channel transport
//! - The [`SmartNotificationManager`] that ties them together

pub mod channels;
pub mod dedup;
pub mod escalation;
pub mod model;
pub mod queue;
pub mod rate_limiter;
pub mod smart_manager;
pub mod stats;
pub mod suppression;
pub mod transport;

pub use channels::{ChannelConfig, NotificationChannel, WebhookChannel, WebhookConfig};
pub use dedup::Deduplicator;
pub use escalation::{EscalationConfig, EscalationManager, EscalationRequest};
pub use model::{
    AlertType, ChannelKind, Context, ContextExt, ContextValue, EmergencyLevel, Notification,
    NotificationPriority, NotificationStyle,
};
pub use queue::PriorityQueue;
pub use rate_limiter::AdaptiveRateLimiter;
pub use smart_manager::{NotificationRecord, SendOutcome, SmartManagerConfig, SmartNotificationManager};
pub use stats::NotificationStats;
pub use suppression::{SuppressionReason, SuppressionRule};
pub use transport::{DeliveryReport, MultiChannelNotifier, NotificationTransport};

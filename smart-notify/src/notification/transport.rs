//! Outbound transport: fan-out of one notification to every eligible channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::channels::{ChannelConfig, NotificationChannel};
use super::model::{ChannelKind, Notification};
use crate::{Error, Result};

/// Result of a fan-out in which at least one channel accepted the notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub delivered: Vec<ChannelKind>,
    /// `(channel id, error)` for channels that failed.
    pub failed: Vec<(String, String)>,
}

impl DeliveryReport {
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Anything able to deliver a notification.
///
/// `Err` means nothing was delivered. Partial failures are reported in the
/// returned [`DeliveryReport`].
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<DeliveryReport>;

    /// Channel kinds currently able to deliver.
    fn enabled_channels(&self) -> Vec<ChannelKind>;
}

/// Circuit breaker settings for [`MultiChannelNotifier`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before a channel is skipped.
    pub threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 10,
            cooldown_secs: 300,
        }
    }
}

#[derive(Debug, Clone)]
struct CircuitBreakerState {
    failures: u32,
    total_failures: u64,
    total_sent: u64,
    is_open: bool,
    opened_at: Option<DateTime<Utc>>,
    cooldown: Duration,
}

impl CircuitBreakerState {
    fn new(cooldown_secs: u64) -> Self {
        Self {
            failures: 0,
            total_failures: 0,
            total_sent: 0,
            is_open: false,
            opened_at: None,
            cooldown: Duration::from_secs(cooldown_secs),
        }
    }

    fn record_failure(&mut self, threshold: u32, now: DateTime<Utc>) {
        self.failures += 1;
        self.total_failures += 1;

        // A failure while half-open restarts the cooldown.
        if self.is_open {
            self.opened_at = Some(now);
            return;
        }

        if self.failures >= threshold {
            self.is_open = true;
            self.opened_at = Some(now);
            warn!(failures = self.failures, "Circuit breaker opened");
        }
    }

    fn record_success(&mut self) {
        self.failures = 0;
        self.total_sent += 1;
        self.is_open = false;
        self.opened_at = None;
    }

    fn is_allowed(&self, now: DateTime<Utc>) -> bool {
        if !self.is_open {
            return true;
        }
        self.opened_at.is_some_and(|opened_at| {
            now.signed_duration_since(opened_at).num_seconds().max(0) as u64
                >= self.cooldown.as_secs()
        })
    }
}

/// Per-channel delivery status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub id: String,
    pub kind: ChannelKind,
    pub enabled: bool,
    pub circuit_open: bool,
    pub consecutive_failures: u32,
    pub total_sent: u64,
    pub total_failures: u64,
}

/// Fans a notification out to every enabled channel concurrently.
pub struct MultiChannelNotifier {
    channels: Vec<Arc<dyn NotificationChannel>>,
    breakers: DashMap<String, CircuitBreakerState>,
    breaker_config: CircuitBreakerConfig,
}

impl MultiChannelNotifier {
    pub fn new(
        channels: Vec<Arc<dyn NotificationChannel>>,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        let breakers = DashMap::new();
        for channel in &channels {
            breakers.insert(
                channel.id().to_string(),
                CircuitBreakerState::new(breaker_config.cooldown_secs),
            );
        }

        info!(
            channels = channels.len(),
            enabled = channels.iter().filter(|c| c.is_enabled()).count(),
            "Multi-channel notifier initialized"
        );

        Self {
            channels,
            breakers,
            breaker_config,
        }
    }

    pub fn from_configs(configs: &[ChannelConfig]) -> Self {
        Self::new(
            configs.iter().map(ChannelConfig::build).collect(),
            CircuitBreakerConfig::default(),
        )
    }

    /// Send a low-priority test notification through every enabled channel.
    pub async fn test_channels(&self) -> Vec<(String, Result<()>)> {
        let enabled: Vec<_> = self.channels.iter().filter(|c| c.is_enabled()).collect();
        let results = join_all(enabled.iter().map(|c| c.test())).await;
        enabled
            .iter()
            .map(|c| c.id().to_string())
            .zip(results)
            .collect()
    }

    pub fn channel_status(&self) -> Vec<ChannelStatus> {
        self.channels
            .iter()
            .map(|channel| {
                let breaker = self
                    .breakers
                    .get(channel.id())
                    .map(|b| b.clone())
                    .unwrap_or_else(|| CircuitBreakerState::new(self.breaker_config.cooldown_secs));
                ChannelStatus {
                    id: channel.id().to_string(),
                    kind: channel.kind(),
                    enabled: channel.is_enabled(),
                    circuit_open: breaker.is_open,
                    consecutive_failures: breaker.failures,
                    total_sent: breaker.total_sent,
                    total_failures: breaker.total_failures,
                }
            })
            .collect()
    }

    fn is_allowed(&self, id: &str, now: DateTime<Utc>) -> bool {
        self.breakers
            .get(id)
            .map(|b| b.is_allowed(now))
            .unwrap_or(true)
    }
}

#[async_trait]
impl NotificationTransport for MultiChannelNotifier {
    async fn send(&self, notification: &Notification) -> Result<DeliveryReport> {
        let now = Utc::now();
        let accepting: Vec<&Arc<dyn NotificationChannel>> = self
            .channels
            .iter()
            .filter(|c| c.accepts(notification))
            .collect();
        if accepting.is_empty() {
            return Err(Error::config(format!(
                "no enabled channel accepts '{}'",
                notification.title
            )));
        }

        let (targets, tripped): (Vec<_>, Vec<_>) = accepting
            .into_iter()
            .partition(|c| self.is_allowed(c.id(), now));
        for channel in &tripped {
            debug!(channel = %channel.id(), "Skipping channel with open circuit");
        }

        // Open circuits close again after the cooldown, so this is a
        // delivery failure rather than a configuration problem.
        if targets.is_empty() {
            let summary = tripped
                .iter()
                .map(|c| format!("{}: circuit open", c.id()))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(Error::AllChannelsFailed(summary));
        }

        let results = join_all(targets.iter().map(|c| c.send(notification))).await;

        let mut report = DeliveryReport::default();
        for (channel, result) in targets.iter().zip(results) {
            let mut breaker = self
                .breakers
                .entry(channel.id().to_string())
                .or_insert_with(|| CircuitBreakerState::new(self.breaker_config.cooldown_secs));
            match result {
                Ok(()) => {
                    breaker.record_success();
                    if !report.delivered.contains(&channel.kind()) {
                        report.delivered.push(channel.kind());
                    }
                }
                Err(e) => {
                    breaker.record_failure(self.breaker_config.threshold, now);
                    warn!(channel = %channel.id(), error = %e, "Notification channel failed");
                    report.failed.push((channel.id().to_string(), e.to_string()));
                }
            }
        }

        if report.delivered.is_empty() {
            let summary = report
                .failed
                .iter()
                .map(|(id, e)| format!("{}: {}", id, e))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(Error::AllChannelsFailed(summary));
        }

        if report.is_partial() {
            warn!(
                delivered = report.delivered.len(),
                failed = report.failed.len(),
                "Some notification channels failed"
            );
        }
        Ok(report)
    }

    fn enabled_channels(&self) -> Vec<ChannelKind> {
        let mut kinds: Vec<ChannelKind> = self
            .channels
            .iter()
            .filter(|c| c.is_enabled())
            .map(|c| c.kind())
            .collect();
        kinds.sort();
        kinds.dedup();
        kinds
    }
}

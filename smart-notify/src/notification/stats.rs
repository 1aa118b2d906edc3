//! Aggregate counters for the smart manager.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::model::{AlertType, ChannelKind, NotificationPriority};

/// Snapshot of manager statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationStats {
    pub total_sent: u64,
    pub total_suppressed: u64,
    pub total_failed: u64,
    pub total_deduplicated: u64,
    pub total_rate_limited: u64,
    pub total_queued: u64,
    pub total_expired: u64,
    pub adaptive_adjustments: u64,
    pub by_priority: BTreeMap<NotificationPriority, u64>,
    pub by_type: BTreeMap<String, u64>,
    pub by_channel: BTreeMap<ChannelKind, u64>,
    /// Delivered notifications in the trailing hour, refreshed by maintenance.
    pub last_hour: u64,
    /// Delivered notifications in the trailing day, refreshed by maintenance.
    pub last_day: u64,
    pub average_latency_ms: f64,
    pub max_latency_ms: f64,
    /// Delivered / (delivered + failed).
    pub success_rate: f64,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Thread-safe holder for [`NotificationStats`].
#[derive(Default)]
pub struct StatsCollector {
    inner: RwLock<NotificationStats>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> NotificationStats {
        self.inner.read().clone()
    }

    pub fn record_delivery(
        &self,
        priority: NotificationPriority,
        alert_type: &AlertType,
        channels: &[ChannelKind],
        latency_ms: f64,
        now: DateTime<Utc>,
    ) {
        let mut stats = self.inner.write();
        stats.total_sent += 1;
        *stats.by_priority.entry(priority).or_default() += 1;
        *stats.by_type.entry(alert_type.to_string()).or_default() += 1;
        for channel in channels {
            *stats.by_channel.entry(*channel).or_default() += 1;
        }

        // Exponential moving average, seeded by the first sample.
        stats.average_latency_ms = if stats.total_sent == 1 {
            latency_ms
        } else {
            stats.average_latency_ms * 0.9 + latency_ms * 0.1
        };
        stats.max_latency_ms = stats.max_latency_ms.max(latency_ms);
        Self::touch(&mut stats, now);
    }

    pub fn record_failure(&self, now: DateTime<Utc>) {
        let mut stats = self.inner.write();
        stats.total_failed += 1;
        Self::touch(&mut stats, now);
    }

    pub fn record_suppressed(&self, now: DateTime<Utc>) {
        let mut stats = self.inner.write();
        stats.total_suppressed += 1;
        Self::touch(&mut stats, now);
    }

    pub fn record_deduplicated(&self, now: DateTime<Utc>) {
        let mut stats = self.inner.write();
        stats.total_deduplicated += 1;
        Self::touch(&mut stats, now);
    }

    /// A rate-limited notification is always queued for later delivery.
    pub fn record_rate_limited(&self, now: DateTime<Utc>) {
        let mut stats = self.inner.write();
        stats.total_rate_limited += 1;
        stats.total_queued += 1;
        Self::touch(&mut stats, now);
    }

    /// Refresh derived values computed during maintenance.
    pub fn update_windows(
        &self,
        last_hour: u64,
        last_day: u64,
        adaptive_adjustments: u64,
        total_expired: u64,
        now: DateTime<Utc>,
    ) {
        let mut stats = self.inner.write();
        stats.last_hour = last_hour;
        stats.last_day = last_day;
        stats.adaptive_adjustments = adaptive_adjustments;
        stats.total_expired = total_expired;
        Self::touch(&mut stats, now);
    }

    fn touch(stats: &mut NotificationStats, now: DateTime<Utc>) {
        let attempts = stats.total_sent + stats.total_failed;
        stats.success_rate = if attempts > 0 {
            stats.total_sent as f64 / attempts as f64
        } else {
            0.0
        };
        stats.last_updated = Some(now);
    }
}

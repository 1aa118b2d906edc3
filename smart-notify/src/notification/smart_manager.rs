//! Smart notification manager.
//!
//! Wraps the transport with suppression, deduplication, rate limiting,
//! history, statistics and failure-driven priority escalation:
//!
//! 1. Compute the content fingerprint
//! 2. Check quiet hours, low-priority days and suppression rules
//! 3. Check for (near-)duplicates
//! 4. Ask the rate limiter; queue the notification when denied
//! 5. Call the transport under a timeout and record the outcome
//!
//! A maintenance loop drains the queue while capacity allows, trims history,
//! refreshes time-windowed statistics and drops expired rules.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::dedup::{DedupStats, Deduplicator};
use super::model::{
    AlertType, ChannelKind, Context, Notification, NotificationPriority, short_fingerprint,
};
use super::queue::{PriorityQueue, QueueStats};
use super::rate_limiter::{AdaptiveRateLimiter, RateLimiterStatus, TierLimit};
use super::stats::{NotificationStats, StatsCollector};
use super::suppression::{
    QuietHours, SuppressionPolicy, SuppressionReason, SuppressionRule, parse_clock, parse_timezone,
};
use super::transport::NotificationTransport;
use crate::{Error, Result};

/// Smart manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmartManagerConfig {
    /// Ceiling for adaptive capacity growth of any tier.
    pub max_notifications_per_hour: u32,

    pub emergency_rate_limit: u32,
    pub high_rate_limit: u32,
    pub normal_rate_limit: u32,
    /// Also drives the lowest tier at half capacity.
    pub low_rate_limit: u32,

    pub emergency_cooldown_secs: u64,
    pub high_cooldown_secs: u64,
    pub normal_cooldown_secs: u64,
    /// Also drives the lowest tier at twice the cooldown.
    pub low_cooldown_secs: u64,

    pub deduplication_enabled: bool,
    pub deduplication_window_secs: u64,
    pub similarity_threshold: f64,

    pub adaptive_rate_limiting: bool,

    pub priority_escalation: bool,
    /// Failures of one alert type within the window that trigger escalation.
    pub escalation_threshold: usize,
    pub escalation_window_secs: u64,
    /// Delay before the escalated notification is sent.
    pub escalation_delay_secs: u64,

    pub quiet_hours: bool,
    /// `HH:MM`
    pub quiet_hours_start: String,
    /// `HH:MM`
    pub quiet_hours_end: String,
    /// IANA timezone for quiet hours and day-based suppression.
    pub timezone: String,
    pub suppress_low_priority_days: Vec<String>,

    pub history_retention_secs: u64,
    pub max_history_size: usize,

    pub send_timeout_secs: u64,
    pub maintenance_interval_secs: u64,
}

impl Default for SmartManagerConfig {
    fn default() -> Self {
        Self {
            max_notifications_per_hour: 60,
            emergency_rate_limit: 100,
            high_rate_limit: 30,
            normal_rate_limit: 20,
            low_rate_limit: 10,
            emergency_cooldown_secs: 30,
            high_cooldown_secs: 120,
            normal_cooldown_secs: 300,
            low_cooldown_secs: 900,
            deduplication_enabled: true,
            deduplication_window_secs: 600,
            similarity_threshold: 0.8,
            adaptive_rate_limiting: true,
            priority_escalation: true,
            escalation_threshold: 3,
            escalation_window_secs: 300,
            escalation_delay_secs: 300,
            quiet_hours: false,
            quiet_hours_start: "22:00".to_string(),
            quiet_hours_end: "08:00".to_string(),
            timezone: "UTC".to_string(),
            suppress_low_priority_days: vec!["saturday".to_string(), "sunday".to_string()],
            history_retention_secs: 7 * 24 * 3600,
            max_history_size: 1000,
            send_timeout_secs: 30,
            maintenance_interval_secs: 60,
        }
    }
}

impl SmartManagerConfig {
    /// Token bucket limits per priority tier.
    pub fn tier_limits(&self) -> Vec<(NotificationPriority, TierLimit)> {
        let tier = |per_hour: f64, cooldown_secs: u64| TierLimit {
            per_hour,
            cooldown_secs,
        };
        vec![
            (
                NotificationPriority::Emergency,
                tier(self.emergency_rate_limit as f64, self.emergency_cooldown_secs),
            ),
            (
                NotificationPriority::High,
                tier(self.high_rate_limit as f64, self.high_cooldown_secs),
            ),
            (
                NotificationPriority::Normal,
                tier(self.normal_rate_limit as f64, self.normal_cooldown_secs),
            ),
            (
                NotificationPriority::Low,
                tier(self.low_rate_limit as f64, self.low_cooldown_secs),
            ),
            (
                NotificationPriority::Lowest,
                tier(
                    (self.low_rate_limit as f64 / 2.0).max(1.0),
                    self.low_cooldown_secs * 2,
                ),
            ),
        ]
    }

    pub fn quiet_hours_window(&self) -> Result<QuietHours> {
        Ok(QuietHours {
            enabled: self.quiet_hours,
            start: parse_clock(&self.quiet_hours_start)?,
            end: parse_clock(&self.quiet_hours_end)?,
            timezone: parse_timezone(&self.timezone)?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(Error::config(format!(
                "similarity_threshold must be within [0, 1], got {}",
                self.similarity_threshold
            )));
        }
        if self.escalation_threshold == 0 {
            return Err(Error::config("escalation_threshold must be at least 1"));
        }
        if self.send_timeout_secs == 0 {
            return Err(Error::config("send_timeout_secs must be positive"));
        }
        self.quiet_hours_window()
            .map_err(|e| Error::config(e.to_string()))?;
        Ok(())
    }
}

/// What happened to a notification handed to the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered { channels: Vec<ChannelKind> },
    Suppressed(SuppressionReason),
    Deduplicated,
    /// Denied by the rate limiter and queued for later delivery.
    RateLimited,
}

/// Audit entry for one send attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub priority: NotificationPriority,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub channels: Vec<ChannelKind>,
    pub success: bool,
    pub error: Option<String>,
    pub context: Context,
    pub fingerprint: String,
    pub suppressed: bool,
    pub deduplicated: bool,
    pub escalated: bool,
}

impl NotificationRecord {
    fn new(notification: &Notification, fingerprint: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: format!("notif_{}", Uuid::new_v4().simple()),
            alert_type: notification.alert_type.clone(),
            priority: notification.priority,
            title: notification.title.clone(),
            message: notification.message.clone(),
            timestamp: now,
            channels: Vec::new(),
            success: false,
            error: None,
            context: notification.context.clone(),
            fingerprint: fingerprint.to_string(),
            suppressed: false,
            deduplicated: false,
            escalated: false,
        }
    }
}

/// Top-level dispatch orchestrator.
pub struct SmartNotificationManager {
    config: SmartManagerConfig,
    transport: Arc<dyn NotificationTransport>,
    deduplicator: Arc<Deduplicator>,
    rate_limiter: Arc<AdaptiveRateLimiter>,
    queue: PriorityQueue,
    suppression: SuppressionPolicy,
    stats: StatsCollector,
    history: Mutex<VecDeque<NotificationRecord>>,
    cancellation_token: CancellationToken,
}

impl SmartNotificationManager {
    pub fn new(config: SmartManagerConfig, transport: Arc<dyn NotificationTransport>) -> Result<Self> {
        config.validate()?;

        let suppression =
            SuppressionPolicy::new(config.quiet_hours_window()?, &config.suppress_low_priority_days)?;
        let deduplicator = Arc::new(Deduplicator::new(
            TimeDelta::seconds(config.deduplication_window_secs as i64),
            config.similarity_threshold,
        ));
        let rate_limiter = Arc::new(AdaptiveRateLimiter::new(
            config.tier_limits(),
            config.max_notifications_per_hour as f64,
            config.adaptive_rate_limiting,
        ));

        info!(
            deduplication = config.deduplication_enabled,
            adaptive = config.adaptive_rate_limiting,
            quiet_hours = config.quiet_hours,
            "Smart notification manager initialized"
        );

        Ok(Self {
            config,
            transport,
            deduplicator,
            rate_limiter,
            queue: PriorityQueue::new(),
            suppression,
            stats: StatsCollector::new(),
            history: Mutex::new(VecDeque::new()),
            cancellation_token: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &SmartManagerConfig {
        &self.config
    }

    pub fn quiet_hours(&self) -> &QuietHours {
        self.suppression.quiet_hours()
    }

    pub fn transport(&self) -> &Arc<dyn NotificationTransport> {
        &self.transport
    }

    pub async fn send_notification(&self, notification: Notification) -> Result<SendOutcome> {
        self.send_notification_at(notification, Utc::now()).await
    }

    /// Run the full pipeline with `now` as the decision time.
    ///
    /// Suppressed, duplicate and rate-limited notifications are successful
    /// outcomes. Only a transport failure is returned as an error.
    pub async fn send_notification_at(
        &self,
        notification: Notification,
        now: DateTime<Utc>,
    ) -> Result<SendOutcome> {
        let fingerprint = notification.fingerprint();

        if let Some(reason) = self.suppression.check_at(&notification, now) {
            debug!(
                alert_type = %notification.alert_type,
                priority = %notification.priority,
                reason = %reason,
                "Notification suppressed"
            );
            let mut record = NotificationRecord::new(&notification, &fingerprint, now);
            record.suppressed = true;
            self.push_history(record);
            self.stats.record_suppressed(now);
            return Ok(SendOutcome::Suppressed(reason));
        }

        if self.config.deduplication_enabled
            && self
                .deduplicator
                .is_duplicate_at(&notification, &fingerprint, now)
        {
            debug!(
                fingerprint = short_fingerprint(&fingerprint),
                "Notification deduplicated"
            );
            let mut record = NotificationRecord::new(&notification, &fingerprint, now);
            record.deduplicated = true;
            self.push_history(record);
            self.stats.record_deduplicated(now);
            return Ok(SendOutcome::Deduplicated);
        }

        if !self.rate_limiter.allow_at(notification.priority, now) {
            debug!(
                priority = %notification.priority,
                "Notification rate limited, queued for later"
            );
            self.queue.enqueue_at(notification, now);
            self.stats.record_rate_limited(now);
            return Ok(SendOutcome::RateLimited);
        }

        self.dispatch(notification, &fingerprint, now).await
    }

    async fn dispatch(
        &self,
        notification: Notification,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<SendOutcome> {
        let started = Instant::now();
        let timeout = Duration::from_secs(self.config.send_timeout_secs);
        let result = match tokio::time::timeout(timeout, self.transport.send(&notification)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "transport did not finish within {}s",
                self.config.send_timeout_secs
            ))),
        };
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        let mut record = NotificationRecord::new(&notification, fingerprint, now);
        match result {
            Ok(report) => {
                self.stats.record_delivery(
                    notification.priority,
                    &notification.alert_type,
                    &report.delivered,
                    latency_ms,
                    now,
                );
                info!(
                    alert_type = %notification.alert_type,
                    priority = %notification.priority,
                    channels = report.delivered.len(),
                    fingerprint = short_fingerprint(fingerprint),
                    "Notification delivered"
                );
                record.success = true;
                record.channels = report.delivered.clone();
                self.push_history(record);
                Ok(SendOutcome::Delivered {
                    channels: report.delivered,
                })
            }
            Err(e) => {
                self.stats.record_failure(now);
                warn!(
                    alert_type = %notification.alert_type,
                    error = %e,
                    "Notification delivery failed"
                );
                record.error = Some(e.to_string());

                let failures = self.recent_failures(&notification.alert_type, now);
                let escalate = self.config.priority_escalation
                    && notification.priority < NotificationPriority::Emergency
                    && failures + 1 >= self.config.escalation_threshold
                    && !self.recently_escalated(&notification.alert_type, now);
                record.escalated = escalate;
                self.push_history(record);

                if escalate {
                    self.schedule_escalation(&notification, failures + 1);
                }
                Err(e)
            }
        }
    }

    fn escalation_window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - TimeDelta::seconds(self.config.escalation_window_secs as i64)
    }

    fn recent_failures(&self, alert_type: &AlertType, now: DateTime<Utc>) -> usize {
        let cutoff = self.escalation_window_start(now);
        self.history
            .lock()
            .iter()
            .filter(|r| {
                &r.alert_type == alert_type
                    && r.timestamp > cutoff
                    && !r.success
                    && !r.suppressed
                    && !r.deduplicated
            })
            .count()
    }

    fn recently_escalated(&self, alert_type: &AlertType, now: DateTime<Utc>) -> bool {
        let cutoff = self.escalation_window_start(now);
        self.history
            .lock()
            .iter()
            .any(|r| &r.alert_type == alert_type && r.timestamp > cutoff && r.escalated)
    }

    /// Send an emergency copy of `notification` after the escalation delay.
    fn schedule_escalation(&self, notification: &Notification, failures: usize) {
        let escalated = Notification::builder(
            notification.alert_type.clone(),
            format!("🚨 ESCALATED: {}", notification.title),
            format!(
                "Multiple failures detected. Original: {}",
                notification.message
            ),
        )
        .priority(NotificationPriority::Emergency)
        .with_context(notification.context.clone())
        .build();

        warn!(
            alert_type = %notification.alert_type,
            failures,
            delay_secs = self.config.escalation_delay_secs,
            "Escalating notification due to repeated failures"
        );

        let transport = Arc::clone(&self.transport);
        let delay = Duration::from_secs(self.config.escalation_delay_secs);
        let timeout = Duration::from_secs(self.config.send_timeout_secs);
        let token = self.cancellation_token.child_token();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    warn!(title = %escalated.title, "Escalated notification aborted by shutdown");
                }
                _ = tokio::time::sleep(delay) => {
                    match tokio::time::timeout(timeout, transport.send(&escalated)).await {
                        Ok(Ok(_)) => info!(title = %escalated.title, "Escalated notification sent"),
                        Ok(Err(e)) => error!(error = %e, "Failed to send escalated notification"),
                        Err(_) => error!("Escalated notification timed out"),
                    }
                }
            }
        });
    }

    fn push_history(&self, record: NotificationRecord) {
        let mut history = self.history.lock();
        history.push_back(record);
        while history.len() > self.config.max_history_size {
            history.pop_front();
        }
    }

    pub async fn perform_maintenance(&self) -> usize {
        self.perform_maintenance_at(Utc::now()).await
    }

    /// One maintenance pass. Returns the number of queued notifications sent.
    pub async fn perform_maintenance_at(&self, now: DateTime<Utc>) -> usize {
        let (last_hour, last_day) = {
            let mut history = self.history.lock();
            let cutoff = now - TimeDelta::seconds(self.config.history_retention_secs as i64);
            history.retain(|r| r.timestamp > cutoff);
            while history.len() > self.config.max_history_size {
                history.pop_front();
            }

            let hour_ago = now - TimeDelta::hours(1);
            let day_ago = now - TimeDelta::days(1);
            history.iter().filter(|r| r.success).fold((0, 0), |(h, d), r| {
                (
                    h + u64::from(r.timestamp > hour_ago),
                    d + u64::from(r.timestamp > day_ago),
                )
            })
        };

        let drained = self.drain_queue_at(now).await;
        self.suppression.remove_expired_at(now);

        self.stats.update_windows(
            last_hour,
            last_day,
            self.rate_limiter.adjustments(),
            self.queue.stats_at(now).total_expired,
            now,
        );

        if drained > 0 {
            debug!(drained, remaining = self.queue.len(), "Processed queued notifications");
        }
        drained
    }

    /// Send queued notifications until the head is denied by the limiter.
    async fn drain_queue_at(&self, now: DateTime<Utc>) -> usize {
        let mut sent = 0;
        while let Some(entry) = self.queue.dequeue_entry_at(now) {
            if !self.rate_limiter.allow_at(entry.priority(), now) {
                self.queue.restore(entry);
                break;
            }

            let notification = entry.notification;
            let fingerprint = notification.fingerprint();
            match self.dispatch(notification, &fingerprint, now).await {
                Ok(_) => sent += 1,
                Err(e) => warn!(error = %e, "Failed to send queued notification"),
            }
        }
        sent
    }

    /// Start the maintenance, deduplication and rate-adjustment loops.
    pub fn start(self: &Arc<Self>) {
        self.deduplicator.start();
        self.rate_limiter.start();

        let manager = Arc::clone(self);
        let token = self.cancellation_token.clone();
        let period = Duration::from_secs(self.config.maintenance_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Maintenance loop shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        manager.perform_maintenance().await;
                    }
                }
            }
        });
    }

    /// Stop all loops and abort pending delayed sends.
    pub fn stop(&self) {
        self.cancellation_token.cancel();
        self.deduplicator.stop();
        self.rate_limiter.stop();
        info!("Smart notification manager stopped");
    }

    pub fn stats(&self) -> NotificationStats {
        self.stats.snapshot()
    }

    /// Most recent records, newest first. Zero means all.
    pub fn history(&self, limit: usize) -> Vec<NotificationRecord> {
        let history = self.history.lock();
        let limit = if limit == 0 { history.len() } else { limit };
        history.iter().rev().take(limit).cloned().collect()
    }

    pub fn add_suppression_rule(&self, rule: SuppressionRule) -> Result<String> {
        self.suppression.add_rule_at(rule, Utc::now())
    }

    pub fn add_suppression_rule_at(&self, rule: SuppressionRule, now: DateTime<Utc>) -> Result<String> {
        self.suppression.add_rule_at(rule, now)
    }

    pub fn remove_suppression_rule(&self, id: &str) -> bool {
        self.suppression.remove_rule(id)
    }

    pub fn suppression_rules(&self) -> Vec<SuppressionRule> {
        self.suppression.rules()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn rate_limiter_status(&self) -> RateLimiterStatus {
        self.rate_limiter.status()
    }

    pub fn dedup_stats(&self) -> DedupStats {
        self.deduplicator.stats()
    }
}

//! Adaptive per-priority rate limiting.
//!
//! One token bucket per priority tier with lazy refill and an independent
//! cooldown. A periodic adjustment widens every non-emergency bucket when
//! too many requests are denied and narrows them during quiet periods.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::model::NotificationPriority;

/// How often capacities are re-evaluated.
pub const ADJUSTMENT_INTERVAL: Duration = Duration::from_secs(5 * 60);

const HIGH_DENIAL_RATE: f64 = 0.30;
const LOW_DENIAL_RATE: f64 = 0.05;
const GROWTH_FACTOR: f64 = 1.2;
const SHRINK_FACTOR: f64 = 0.9;

/// Static limit for one priority tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierLimit {
    /// Bucket capacity and hourly refill rate.
    pub per_hour: f64,
    /// Minimum spacing between two admitted notifications.
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    cooldown: TimeDelta,
    last_refill: DateTime<Utc>,
    last_used: Option<DateTime<Utc>>,
}

impl TokenBucket {
    fn new(limit: TierLimit, now: DateTime<Utc>) -> Self {
        Self {
            capacity: limit.per_hour,
            tokens: limit.per_hour,
            refill_rate: limit.per_hour,
            cooldown: TimeDelta::seconds(limit.cooldown_secs as i64),
            last_refill: now,
            last_used: None,
        }
    }

    fn refill(&mut self, now: DateTime<Utc>) {
        let elapsed = now - self.last_refill;
        // Clock moved backwards: rebase without adding tokens.
        if elapsed < TimeDelta::zero() {
            self.last_refill = now;
            return;
        }
        if elapsed < TimeDelta::minutes(1) {
            return;
        }
        let hours = elapsed.num_milliseconds() as f64 / 3_600_000.0;
        self.tokens = (self.tokens + hours * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self, now: DateTime<Utc>) -> bool {
        if let Some(last_used) = self.last_used
            && now - last_used < self.cooldown
        {
            return false;
        }

        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            self.last_used = Some(now);
            true
        } else {
            false
        }
    }
}

/// Snapshot of one tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierStatus {
    pub priority: NotificationPriority,
    pub capacity: f64,
    pub tokens: f64,
    pub refill_rate: f64,
    pub cooldown_secs: i64,
    pub last_used: Option<DateTime<Utc>>,
}

/// Snapshot of the whole limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterStatus {
    pub tiers: Vec<TierStatus>,
    pub allowed_since_adjustment: u64,
    pub denied_since_adjustment: u64,
    pub adjustments: u64,
}

/// Per-priority token-bucket admission control.
pub struct AdaptiveRateLimiter {
    buckets: Mutex<BTreeMap<NotificationPriority, TokenBucket>>,
    ceiling: f64,
    adaptive: bool,
    allowed: AtomicU64,
    denied: AtomicU64,
    adjustments: AtomicU64,
    cancellation_token: CancellationToken,
}

impl AdaptiveRateLimiter {
    /// Create a limiter. Tiers missing from `limits` are never throttled.
    ///
    /// `ceiling` caps any capacity reached through adaptive growth.
    pub fn new(
        limits: impl IntoIterator<Item = (NotificationPriority, TierLimit)>,
        ceiling: f64,
        adaptive: bool,
    ) -> Self {
        let now = Utc::now();
        let buckets = limits
            .into_iter()
            .map(|(priority, limit)| (priority, TokenBucket::new(limit, now)))
            .collect();

        Self {
            buckets: Mutex::new(buckets),
            ceiling: ceiling.max(1.0),
            adaptive,
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            adjustments: AtomicU64::new(0),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Try to admit one notification of `priority`.
    pub fn allow(&self, priority: NotificationPriority) -> bool {
        self.allow_at(priority, Utc::now())
    }

    pub fn allow_at(&self, priority: NotificationPriority, now: DateTime<Utc>) -> bool {
        let allowed = if priority == NotificationPriority::Emergency {
            true
        } else {
            let mut buckets = self.buckets.lock();
            match buckets.get_mut(&priority) {
                Some(bucket) => bucket.try_take(now),
                None => true,
            }
        };

        if allowed {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.denied.fetch_add(1, Ordering::Relaxed);
            debug!(priority = %priority, "Rate limit denied notification");
        }
        allowed
    }

    /// Tokens currently available for `priority`, without refilling.
    pub fn tokens(&self, priority: NotificationPriority) -> Option<f64> {
        self.buckets.lock().get(&priority).map(|b| b.tokens)
    }

    /// Re-evaluate capacities from the denial rate observed since the last call.
    ///
    /// Returns the applied factor, if any. Counters always reset.
    pub fn adjust(&self) -> Option<f64> {
        let allowed = self.allowed.swap(0, Ordering::Relaxed);
        let denied = self.denied.swap(0, Ordering::Relaxed);
        let total = allowed + denied;
        if total == 0 {
            return None;
        }

        let denial_rate = denied as f64 / total as f64;
        let factor = if denial_rate > HIGH_DENIAL_RATE {
            GROWTH_FACTOR
        } else if denial_rate < LOW_DENIAL_RATE {
            SHRINK_FACTOR
        } else {
            return None;
        };

        {
            let mut buckets = self.buckets.lock();
            for (priority, bucket) in buckets.iter_mut() {
                if *priority == NotificationPriority::Emergency {
                    continue;
                }
                let scaled = bucket.capacity * factor;
                // The ceiling only bounds growth; a tier configured above it
                // keeps its capacity until traffic shrinks it.
                bucket.capacity = if factor > 1.0 {
                    scaled.min(self.ceiling.max(bucket.capacity))
                } else {
                    scaled.max(1.0)
                };
                bucket.refill_rate = bucket.capacity;
                bucket.tokens = bucket.tokens.min(bucket.capacity);
            }
        }

        self.adjustments.fetch_add(1, Ordering::Relaxed);
        info!(
            denial_rate,
            factor,
            allowed,
            denied,
            "Adjusted notification rate limits"
        );
        Some(factor)
    }

    pub fn status(&self) -> RateLimiterStatus {
        let tiers = self
            .buckets
            .lock()
            .iter()
            .map(|(priority, bucket)| TierStatus {
                priority: *priority,
                capacity: bucket.capacity,
                tokens: bucket.tokens,
                refill_rate: bucket.refill_rate,
                cooldown_secs: bucket.cooldown.num_seconds(),
                last_used: bucket.last_used,
            })
            .collect();

        RateLimiterStatus {
            tiers,
            allowed_since_adjustment: self.allowed.load(Ordering::Relaxed),
            denied_since_adjustment: self.denied.load(Ordering::Relaxed),
            adjustments: self.adjustments.load(Ordering::Relaxed),
        }
    }

    /// Number of capacity adjustments applied so far.
    pub fn adjustments(&self) -> u64 {
        self.adjustments.load(Ordering::Relaxed)
    }

    /// Start the periodic adjustment loop. No-op when adaptation is disabled.
    pub fn start(self: &Arc<Self>) {
        if !self.adaptive {
            return;
        }

        let this = Arc::clone(self);
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            let mut ticker = interval(ADJUSTMENT_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Rate limiter adjustment task shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        this.adjust();
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        self.cancellation_token.cancel();
    }
}

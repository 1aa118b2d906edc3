//! Near-duplicate detection.
//!
//! A notification is a duplicate when its exact fingerprint was seen inside the
//! window, or when a weighted similarity against any still-fresh notification
//! reaches the configured threshold.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::model::{Context, Notification, short_fingerprint};

const TYPE_WEIGHT: f64 = 0.30;
const PRIORITY_WEIGHT: f64 = 0.10;
const TITLE_WEIGHT: f64 = 0.30;
const MESSAGE_WEIGHT: f64 = 0.25;
const CONTEXT_WEIGHT: f64 = 0.05;

/// How often stale fingerprints are swept.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

struct SeenEntry {
    last_seen: DateTime<Utc>,
    notification: Notification,
}

/// Deduplication statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DedupStats {
    pub total_checked: u64,
    pub duplicates_found: u64,
    pub duplicate_rate: f64,
    pub active_fingerprints: usize,
}

/// Time-windowed fingerprint and similarity deduplicator.
pub struct Deduplicator {
    window: TimeDelta,
    similarity_threshold: f64,
    entries: Mutex<HashMap<String, SeenEntry>>,
    total_checked: AtomicU64,
    duplicates_found: AtomicU64,
    cancellation_token: CancellationToken,
}

impl Deduplicator {
    pub fn new(window: TimeDelta, similarity_threshold: f64) -> Self {
        Self {
            window,
            similarity_threshold,
            entries: Mutex::new(HashMap::new()),
            total_checked: AtomicU64::new(0),
            duplicates_found: AtomicU64::new(0),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Check whether `notification` duplicates something seen recently.
    ///
    /// Non-duplicates are recorded under `fingerprint`.
    pub fn is_duplicate(&self, notification: &Notification, fingerprint: &str) -> bool {
        self.is_duplicate_at(notification, fingerprint, Utc::now())
    }

    pub fn is_duplicate_at(
        &self,
        notification: &Notification,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> bool {
        self.total_checked.fetch_add(1, Ordering::Relaxed);

        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get(fingerprint)
            && now - entry.last_seen < self.window
        {
            self.duplicates_found.fetch_add(1, Ordering::Relaxed);
            debug!(
                fingerprint = short_fingerprint(fingerprint),
                "Exact duplicate notification"
            );
            return true;
        }

        for (seen_fingerprint, entry) in entries.iter() {
            if now - entry.last_seen >= self.window {
                continue;
            }
            let score = notification_similarity(notification, &entry.notification);
            if score >= self.similarity_threshold {
                self.duplicates_found.fetch_add(1, Ordering::Relaxed);
                debug!(
                    fingerprint = short_fingerprint(fingerprint),
                    similar_to = short_fingerprint(seen_fingerprint),
                    score,
                    "Similar notification treated as duplicate"
                );
                return true;
            }
        }

        entries.insert(
            fingerprint.to_string(),
            SeenEntry {
                last_seen: now,
                notification: notification.clone(),
            },
        );
        false
    }

    /// Evict entries older than the window. Returns the number removed.
    pub fn cleanup_at(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| now - entry.last_seen < self.window);
        before - entries.len()
    }

    /// Forget every recorded fingerprint.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn stats(&self) -> DedupStats {
        let total_checked = self.total_checked.load(Ordering::Relaxed);
        let duplicates_found = self.duplicates_found.load(Ordering::Relaxed);
        DedupStats {
            total_checked,
            duplicates_found,
            duplicate_rate: if total_checked > 0 {
                duplicates_found as f64 / total_checked as f64
            } else {
                0.0
            },
            active_fingerprints: self.entries.lock().len(),
        }
    }

    /// Start the periodic cleanup sweep.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            let mut ticker = interval(CLEANUP_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Deduplicator cleanup task shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = this.cleanup_at(Utc::now());
                        if removed > 0 {
                            debug!(removed, "Evicted stale notification fingerprints");
                        }
                    }
                }
            }
        });

        info!(
            window_secs = self.window.num_seconds(),
            threshold = self.similarity_threshold,
            "Deduplicator started"
        );
    }

    pub fn stop(&self) {
        self.cancellation_token.cancel();
    }
}

/// Weighted similarity of two notifications in `[0, 1]`.
pub fn notification_similarity(a: &Notification, b: &Notification) -> f64 {
    let mut score = 0.0;

    if a.alert_type == b.alert_type {
        score += TYPE_WEIGHT;
    }

    let priority_diff = (a.priority.level() - b.priority.level()).abs() as f64;
    score += PRIORITY_WEIGHT * (1.0 - priority_diff / 4.0);

    score += TITLE_WEIGHT * string_similarity(&a.title, &b.title);
    score += MESSAGE_WEIGHT * string_similarity(&a.message, &b.message);
    score += CONTEXT_WEIGHT * context_similarity(&a.context, &b.context);

    score
}

/// Edit-distance similarity on case-folded, trimmed strings.
pub fn string_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }

    1.0 - levenshtein(&a, &b) as f64 / max_len as f64
}

/// Levenshtein distance over Unicode scalar values.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Fraction of matching key/value pairs over the union of keys.
pub fn context_similarity(a: &Context, b: &Context) -> f64 {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return 1.0,
        (true, false) | (false, true) => return 0.0,
        _ => {}
    }

    let union = a.keys().chain(b.keys().filter(|k| !a.contains_key(*k))).count();
    let matching = a
        .iter()
        .filter(|(k, v)| b.get(*k).is_some_and(|other| other == *v))
        .count();

    matching as f64 / union as f64
}

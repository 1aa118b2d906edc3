//! Priority delivery queue for notifications that could not be sent immediately.
//!
//! Max-heap ordered by priority weight, FIFO within a weight. Items older than
//! their priority's maximum age are dropped on dequeue.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::model::{Notification, NotificationPriority};

/// A notification awaiting delivery capacity.
#[derive(Debug, Clone)]
pub struct QueuedNotification {
    pub notification: Notification,
    pub enqueued_at: DateTime<Utc>,
    pub weight: u32,
    pub sequence: u64,
}

impl QueuedNotification {
    pub fn priority(&self) -> NotificationPriority {
        self.notification.priority
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.enqueued_at > self.notification.priority.max_queue_age()
    }
}

impl PartialEq for QueuedNotification {
    fn eq(&self, other: &Self) -> bool {
        self.weight == other.weight && self.sequence == other.sequence
    }
}

impl Eq for QueuedNotification {}

impl PartialOrd for QueuedNotification {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedNotification {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher weight first, then lower sequence first.
        self.weight
            .cmp(&other.weight)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub current_size: usize,
    pub max_size: usize,
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub total_expired: u64,
    pub priority_distribution: BTreeMap<NotificationPriority, usize>,
    /// Average age in seconds per priority.
    pub average_age_by_priority: BTreeMap<NotificationPriority, f64>,
    pub average_age_secs: f64,
    pub max_age_secs: f64,
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedNotification>,
    next_sequence: u64,
    max_size: usize,
    total_enqueued: u64,
    total_dequeued: u64,
    total_expired: u64,
}

/// Bounded-lifetime priority queue.
#[derive(Default)]
pub struct PriorityQueue {
    state: Mutex<QueueState>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, notification: Notification) -> u64 {
        self.enqueue_at(notification, Utc::now())
    }

    /// Push with `now` as the enqueue time. Returns the assigned sequence number.
    pub fn enqueue_at(&self, notification: Notification, now: DateTime<Utc>) -> u64 {
        let mut state = self.state.lock();
        let sequence = state.next_sequence;
        state.next_sequence += 1;

        let weight = notification.priority.queue_weight();
        debug!(
            priority = %notification.priority,
            sequence,
            "Queued notification for later delivery"
        );
        state.heap.push(QueuedNotification {
            notification,
            enqueued_at: now,
            weight,
            sequence,
        });
        state.total_enqueued += 1;
        state.max_size = state.max_size.max(state.heap.len());
        sequence
    }

    pub fn dequeue(&self) -> Option<Notification> {
        self.dequeue_entry_at(Utc::now())
            .map(|entry| entry.notification)
    }

    /// Pop the highest-priority entry that has not outlived its max age.
    ///
    /// Expired entries encountered on the way are discarded.
    pub fn dequeue_entry_at(&self, now: DateTime<Utc>) -> Option<QueuedNotification> {
        let mut state = self.state.lock();
        while let Some(entry) = state.heap.pop() {
            if entry.is_expired(now) {
                state.total_expired += 1;
                warn!(
                    priority = %entry.priority(),
                    title = %entry.notification.title,
                    age_secs = (now - entry.enqueued_at).num_seconds(),
                    "Dropping expired queued notification"
                );
                continue;
            }
            state.total_dequeued += 1;
            return Some(entry);
        }
        None
    }

    /// Put a previously dequeued entry back, keeping its position.
    pub fn restore(&self, entry: QueuedNotification) {
        let mut state = self.state.lock();
        state.total_dequeued = state.total_dequeued.saturating_sub(1);
        state.heap.push(entry);
        state.max_size = state.max_size.max(state.heap.len());
    }

    /// The entry `dequeue` would consider next, without removing it.
    pub fn peek(&self) -> Option<Notification> {
        self.state
            .lock()
            .heap
            .peek()
            .map(|entry| entry.notification.clone())
    }

    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().heap.is_empty()
    }

    pub fn clear(&self) {
        self.state.lock().heap.clear();
    }

    pub fn stats(&self) -> QueueStats {
        self.stats_at(Utc::now())
    }

    pub fn stats_at(&self, now: DateTime<Utc>) -> QueueStats {
        let state = self.state.lock();

        let mut priority_distribution: BTreeMap<NotificationPriority, usize> = BTreeMap::new();
        let mut age_sums: BTreeMap<NotificationPriority, f64> = BTreeMap::new();
        let mut total_age = 0.0;
        let mut max_age: f64 = 0.0;

        for entry in state.heap.iter() {
            let age = (now - entry.enqueued_at).num_milliseconds().max(0) as f64 / 1000.0;
            *priority_distribution.entry(entry.priority()).or_default() += 1;
            *age_sums.entry(entry.priority()).or_default() += age;
            total_age += age;
            max_age = max_age.max(age);
        }

        let average_age_by_priority = age_sums
            .into_iter()
            .map(|(priority, sum)| {
                let count = priority_distribution.get(&priority).copied().unwrap_or(1);
                (priority, sum / count as f64)
            })
            .collect();

        let size = state.heap.len();
        QueueStats {
            current_size: size,
            max_size: state.max_size,
            total_enqueued: state.total_enqueued,
            total_dequeued: state.total_dequeued,
            total_expired: state.total_expired,
            priority_distribution,
            average_age_by_priority,
            average_age_secs: if size > 0 { total_age / size as f64 } else { 0.0 },
            max_age_secs: max_age,
        }
    }
}

//! Outcome history and the per-alert-type preferences learned from it.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::notification::{AlertType, ChannelKind, Context, NotificationPriority};

/// Default cap on retained notification patterns.
pub const DEFAULT_MAX_PATTERNS: usize = 1000;

/// Learned hours need at least this average effectiveness.
const OPTIMAL_HOUR_THRESHOLD: f64 = 0.8;

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPattern {
    pub alert_type: AlertType,
    pub priority: NotificationPriority,
    pub channels: Vec<ChannelKind>,
    /// Local hour of day the attempt was made.
    pub hour: u32,
    pub success: bool,
    pub effectiveness: f64,
    pub processing_ms: f64,
    pub seen_at: DateTime<Utc>,
    #[serde(default)]
    pub context: Context,
}

/// How quickly the operator responds in a given weekday/hour slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserBehaviorPattern {
    pub weekday: Weekday,
    pub hour: u32,
    pub preferred_channels: Vec<ChannelKind>,
    pub average_response_secs: f64,
    /// 0-1, grows with the number of responses seen in this slot.
    pub activity_level: f64,
    pub confidence: f64,
    pub samples: u64,
}

/// Effectiveness of a single attempt: errors cost 90%, slow processing 10-20%.
pub fn effectiveness_score(success: bool, processing: Duration) -> f64 {
    let mut score = 1.0;
    if !success {
        score *= 0.1;
    }
    if processing > Duration::from_secs(5) {
        score *= 0.8;
    } else if processing > Duration::from_secs(1) {
        score *= 0.9;
    }
    score
}

pub fn average(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Confidence from sample variance: `1 / (1 + variance)`, or 0.5 with fewer than two samples.
pub fn confidence(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.5;
    }
    let avg = average(values);
    let variance =
        values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    (1.0 / (1.0 + variance)).min(1.0)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LearningData {
    pub patterns: VecDeque<NotificationPattern>,
    pub user_behavior: Vec<UserBehaviorPattern>,
    /// Best channels first.
    pub optimal_channels: BTreeMap<AlertType, Vec<ChannelKind>>,
    /// Best local hours first.
    pub optimal_hours: BTreeMap<AlertType, Vec<u32>>,
    pub optimal_priorities: BTreeMap<AlertType, NotificationPriority>,
    /// Average effectiveness per alert type.
    pub weights: BTreeMap<AlertType, f64>,
    pub confidence: BTreeMap<AlertType, f64>,
    pub last_training: Option<DateTime<Utc>>,
}

impl LearningData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a pattern, keeping only the newest `cap`.
    pub fn record(&mut self, pattern: NotificationPattern, cap: usize) {
        self.patterns.push_back(pattern);
        while self.patterns.len() > cap.max(1) {
            self.patterns.pop_front();
        }
    }

    pub fn patterns_for<'a>(
        &'a self,
        alert_type: &'a AlertType,
    ) -> impl Iterator<Item = &'a NotificationPattern> + 'a {
        self.patterns.iter().filter(move |p| &p.alert_type == alert_type)
    }

    /// Recompute every learned preference from the retained patterns.
    ///
    /// Channel, priority and hour preferences for a type are only derived
    /// once that type has `min_samples` patterns.
    pub fn retrain_at(&mut self, now: DateTime<Utc>, min_samples: usize) {
        let mut by_type: BTreeMap<AlertType, Vec<&NotificationPattern>> = BTreeMap::new();
        for pattern in &self.patterns {
            by_type.entry(pattern.alert_type.clone()).or_default().push(pattern);
        }

        let mut weights = BTreeMap::new();
        let mut confidences = BTreeMap::new();
        let mut optimal_channels = BTreeMap::new();
        let mut optimal_hours = BTreeMap::new();
        let mut optimal_priorities = BTreeMap::new();

        for (alert_type, patterns) in &by_type {
            let scores: Vec<f64> = patterns.iter().map(|p| p.effectiveness).collect();
            weights.insert(alert_type.clone(), average(&scores));
            confidences.insert(alert_type.clone(), confidence(&scores));

            if patterns.len() < min_samples {
                continue;
            }

            let channels = rank_by_effectiveness(
                patterns
                    .iter()
                    .flat_map(|p| p.channels.iter().map(move |c| (*c, p.effectiveness))),
            );
            if !channels.is_empty() {
                optimal_channels.insert(
                    alert_type.clone(),
                    channels.into_iter().map(|(c, _)| c).collect::<Vec<_>>(),
                );
            }

            let hours: Vec<u32> =
                rank_by_effectiveness(patterns.iter().map(|p| (p.hour, p.effectiveness)))
                    .into_iter()
                    .filter(|(_, score)| *score >= OPTIMAL_HOUR_THRESHOLD)
                    .map(|(hour, _)| hour)
                    .collect();
            if !hours.is_empty() {
                optimal_hours.insert(alert_type.clone(), hours);
            }

            if let Some((priority, _)) =
                rank_by_effectiveness(patterns.iter().map(|p| (p.priority, p.effectiveness)))
                    .into_iter()
                    .next()
            {
                optimal_priorities.insert(alert_type.clone(), priority);
            }
        }

        self.weights = weights;
        self.confidence = confidences;
        self.optimal_channels = optimal_channels;
        self.optimal_hours = optimal_hours;
        self.optimal_priorities = optimal_priorities;
        self.last_training = Some(now);

        debug!(
            patterns = self.patterns.len(),
            alert_types = self.weights.len(),
            "Learning model retrained"
        );
    }

    /// Average effectiveness of every pattern that used each channel.
    pub fn channel_effectiveness(&self) -> BTreeMap<ChannelKind, f64> {
        let mut samples: BTreeMap<ChannelKind, Vec<f64>> = BTreeMap::new();
        for pattern in &self.patterns {
            for channel in &pattern.channels {
                samples.entry(*channel).or_default().push(pattern.effectiveness);
            }
        }
        samples
            .into_iter()
            .map(|(channel, values)| (channel, average(&values)))
            .collect()
    }

    /// Fold an operator response into the weekday/hour behaviour slot.
    pub fn record_user_response(
        &mut self,
        weekday: Weekday,
        hour: u32,
        channel: ChannelKind,
        response_secs: f64,
    ) {
        let index = match self
            .user_behavior
            .iter()
            .position(|p| p.weekday == weekday && p.hour == hour)
        {
            Some(index) => index,
            None => {
                self.user_behavior.push(UserBehaviorPattern {
                    weekday,
                    hour,
                    preferred_channels: Vec::new(),
                    average_response_secs: response_secs,
                    activity_level: 0.0,
                    confidence: 0.0,
                    samples: 0,
                });
                self.user_behavior.len() - 1
            }
        };

        let slot = &mut self.user_behavior[index];
        slot.samples += 1;
        let n = slot.samples as f64;
        slot.average_response_secs += (response_secs - slot.average_response_secs) / n;
        slot.activity_level = (n / 10.0).min(1.0);
        slot.confidence = 1.0 - 1.0 / (1.0 + n);
        if !slot.preferred_channels.contains(&channel) {
            slot.preferred_channels.push(channel);
        }
    }

    /// Mean of the per-type weights.
    pub fn model_accuracy(&self) -> f64 {
        average(&self.weights.values().copied().collect::<Vec<_>>())
    }

    /// Mean of the per-type confidences.
    pub fn prediction_confidence(&self) -> f64 {
        average(&self.confidence.values().copied().collect::<Vec<_>>())
    }
}

/// Group scores by key and rank keys by average score, best first.
///
/// Ties keep the key with more samples first, then the natural key order.
fn rank_by_effectiveness<K: Ord + Copy>(items: impl Iterator<Item = (K, f64)>) -> Vec<(K, f64)> {
    let mut grouped: BTreeMap<K, Vec<f64>> = BTreeMap::new();
    for (key, score) in items {
        grouped.entry(key).or_default().push(score);
    }
    let mut ranked: Vec<(K, f64, usize)> = grouped
        .into_iter()
        .map(|(key, scores)| (key, average(&scores), scores.len()))
        .collect();
    ranked.sort_by(|a, b| {
        b.1.total_cmp(&a.1)
            .then_with(|| b.2.cmp(&a.2))
            .then_with(|| a.0.cmp(&b.0))
    });
    ranked.into_iter().map(|(key, score, _)| (key, score)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn pattern(
        alert_type: AlertType,
        priority: NotificationPriority,
        channels: &[ChannelKind],
        hour: u32,
        success: bool,
    ) -> NotificationPattern {
        NotificationPattern {
            alert_type,
            priority,
            channels: channels.to_vec(),
            hour,
            success,
            effectiveness: effectiveness_score(success, Duration::from_millis(50)),
            processing_ms: 50.0,
            seen_at: Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap(),
            context: Context::new(),
        }
    }

    #[test]
    fn test_effectiveness_score() {
        assert_eq!(effectiveness_score(true, Duration::from_millis(10)), 1.0);
        assert!((effectiveness_score(false, Duration::from_millis(10)) - 0.1).abs() < 1e-9);
        assert!((effectiveness_score(true, Duration::from_secs(2)) - 0.9).abs() < 1e-9);
        assert!((effectiveness_score(false, Duration::from_secs(6)) - 0.08).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_from_variance() {
        assert_eq!(confidence(&[1.0]), 0.5);
        assert_eq!(confidence(&[1.0, 1.0, 1.0]), 1.0);
        // Sample variance of [1.0, 0.1] is 0.405.
        assert!((confidence(&[1.0, 0.1]) - 1.0 / 1.405).abs() < 1e-9);
    }

    #[test]
    fn test_pattern_cap() {
        let mut data = LearningData::new();
        for hour in 0..5 {
            data.record(
                pattern(AlertType::Failover, NotificationPriority::High, &[], hour, true),
                3,
            );
        }
        assert_eq!(data.patterns.len(), 3);
        assert_eq!(data.patterns.front().map(|p| p.hour), Some(2));
    }

    #[test]
    fn test_retrain_learns_preferences() {
        let mut data = LearningData::new();
        for _ in 0..3 {
            data.record(
                pattern(
                    AlertType::DataLimit,
                    NotificationPriority::Low,
                    &[ChannelKind::Email],
                    10,
                    true,
                ),
                DEFAULT_MAX_PATTERNS,
            );
        }
        data.record(
            pattern(
                AlertType::DataLimit,
                NotificationPriority::Normal,
                &[ChannelKind::Pushover],
                23,
                false,
            ),
            DEFAULT_MAX_PATTERNS,
        );
        data.record(
            pattern(AlertType::Thermal, NotificationPriority::High, &[ChannelKind::Pushover], 3, true),
            DEFAULT_MAX_PATTERNS,
        );

        let now = Utc::now();
        data.retrain_at(now, 4);

        assert!((data.weights[&AlertType::DataLimit] - 0.775).abs() < 1e-9);
        assert_eq!(data.weights[&AlertType::Thermal], 1.0);
        assert_eq!(data.confidence[&AlertType::Thermal], 0.5);
        assert_eq!(
            data.optimal_channels[&AlertType::DataLimit],
            vec![ChannelKind::Email, ChannelKind::Pushover]
        );
        assert_eq!(data.optimal_hours[&AlertType::DataLimit], vec![10]);
        assert_eq!(
            data.optimal_priorities[&AlertType::DataLimit],
            NotificationPriority::Low
        );
        // Thermal is below the sample floor.
        assert!(!data.optimal_channels.contains_key(&AlertType::Thermal));
        assert_eq!(data.last_training, Some(now));
    }

    #[test]
    fn test_user_response_slots() {
        let mut data = LearningData::new();
        data.record_user_response(Weekday::Mon, 9, ChannelKind::Pushover, 60.0);
        data.record_user_response(Weekday::Mon, 9, ChannelKind::Email, 120.0);
        data.record_user_response(Weekday::Tue, 9, ChannelKind::Email, 30.0);

        assert_eq!(data.user_behavior.len(), 2);
        let monday = &data.user_behavior[0];
        assert_eq!(monday.samples, 2);
        assert_eq!(monday.average_response_secs, 90.0);
        assert!((monday.confidence - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(
            monday.preferred_channels,
            vec![ChannelKind::Pushover, ChannelKind::Email]
        );
    }

    #[test]
    fn test_channel_effectiveness() {
        let mut data = LearningData::new();
        data.record(
            pattern(AlertType::Failover, NotificationPriority::High, &[ChannelKind::Slack], 1, true),
            10,
        );
        data.record(
            pattern(AlertType::Failover, NotificationPriority::High, &[ChannelKind::Slack], 1, false),
            10,
        );
        let effectiveness = data.channel_effectiveness();
        assert!((effectiveness[&ChannelKind::Slack] - 0.55).abs() < 1e-9);
    }
}

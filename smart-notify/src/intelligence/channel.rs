//! Channel scoring and selection.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::state::DecisionContext;
use crate::notification::{AlertType, ChannelKind, ContextExt, NotificationPriority};

/// Share of the base score taken from observed delivery effectiveness.
const OBSERVED_WEIGHT: f64 = 0.3;

/// Static characteristics of a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelProfile {
    pub kind: ChannelKind,
    /// Expected effectiveness before any adjustment, 0-1.
    pub effectiveness: f64,
    pub response_time_secs: u64,
}

impl ChannelProfile {
    pub fn new(kind: ChannelKind, effectiveness: f64, response_time_secs: u64) -> Self {
        Self {
            kind,
            effectiveness,
            response_time_secs,
        }
    }
}

pub fn default_channel_profiles() -> Vec<ChannelProfile> {
    vec![
        ChannelProfile::new(ChannelKind::Pushover, 0.95, 30),
        ChannelProfile::new(ChannelKind::Email, 0.85, 300),
        ChannelProfile::new(ChannelKind::Slack, 0.90, 60),
        ChannelProfile::new(ChannelKind::Discord, 0.88, 60),
        ChannelProfile::new(ChannelKind::Telegram, 0.92, 45),
        ChannelProfile::new(ChannelKind::Webhook, 0.80, 120),
        ChannelProfile::new(ChannelKind::Sms, 0.90, 60),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelScore {
    pub channel: ChannelKind,
    /// Final score clamped to 0-1.
    pub score: f64,
    pub effectiveness: f64,
    pub response_time_secs: u64,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct ChannelIntelligence {
    profiles: Vec<ChannelProfile>,
    learning_enabled: bool,
}

impl ChannelIntelligence {
    pub fn new(profiles: Vec<ChannelProfile>, learning_enabled: bool) -> Self {
        Self {
            profiles,
            learning_enabled,
        }
    }

    pub fn profiles(&self) -> &[ChannelProfile] {
        &self.profiles
    }

    /// Score `candidates` (every profiled channel when empty), best first.
    ///
    /// `observed` holds measured effectiveness per channel; when present it is
    /// blended into the profile value.
    pub fn score_channels(
        &self,
        ctx: &DecisionContext<'_>,
        candidates: &[ChannelKind],
        observed: &BTreeMap<ChannelKind, f64>,
    ) -> Vec<ChannelScore> {
        let candidates: Vec<ChannelKind> = if candidates.is_empty() {
            self.profiles.iter().map(|p| p.kind).collect()
        } else {
            candidates.to_vec()
        };

        let mut scores: Vec<ChannelScore> = candidates
            .into_iter()
            .map(|channel| self.score_channel(ctx, channel, observed))
            .collect();
        scores.sort_by(|a, b| b.score.total_cmp(&a.score));
        scores
    }

    /// Pick channels for a notification.
    ///
    /// `force_all_channels` in the notification data selects every candidate
    /// and `preferred_channels` overrides the choice. Otherwise the selection
    /// width depends on priority. At least one channel is always returned when
    /// there is any candidate.
    pub fn select(
        &self,
        ctx: &DecisionContext<'_>,
        candidates: &[ChannelKind],
        observed: &BTreeMap<ChannelKind, f64>,
    ) -> Vec<ChannelKind> {
        let scores = self.score_channels(ctx, candidates, observed);
        let Some(top) = scores.first() else {
            return Vec::new();
        };

        if ctx.data.flag("force_all_channels") {
            return scores.iter().map(|s| s.channel).collect();
        }

        let preferred: Vec<ChannelKind> = ctx
            .data
            .text_list("preferred_channels")
            .iter()
            .filter_map(|name| name.parse::<ChannelKind>().ok())
            .filter(|kind| scores.iter().any(|s| s.channel == *kind))
            .collect();
        if !preferred.is_empty() {
            return preferred;
        }

        let (width, threshold) = match ctx.priority {
            NotificationPriority::Emergency => (3, 0.6),
            NotificationPriority::High => (2, 0.7),
            NotificationPriority::Normal => (1, 0.8),
            NotificationPriority::Low | NotificationPriority::Lowest => (0, 0.5),
        };
        let mut selected: Vec<ChannelKind> = scores
            .iter()
            .enumerate()
            .filter(|(i, s)| *i < width || (width > 0 && s.score > threshold))
            .map(|(_, s)| s.channel)
            .collect();
        if width == 0 && top.score > threshold {
            selected.push(top.channel);
        }
        if selected.is_empty() {
            selected.push(top.channel);
        }

        debug!(
            alert_type = %ctx.alert_type,
            priority = %ctx.priority,
            candidates = scores.len(),
            selected = selected.len(),
            top = %top.channel,
            top_score = top.score,
            "Channel selection completed"
        );
        selected
    }

    fn score_channel(
        &self,
        ctx: &DecisionContext<'_>,
        channel: ChannelKind,
        observed: &BTreeMap<ChannelKind, f64>,
    ) -> ChannelScore {
        let profile = self.profiles.iter().find(|p| p.kind == channel);
        let mut effectiveness = profile.map_or(0.5, |p| p.effectiveness);
        if let Some(measured) = observed.get(&channel) {
            effectiveness = effectiveness * (1.0 - OBSERVED_WEIGHT) + measured * OBSERVED_WEIGHT;
        }

        let context = context_adjustment(channel, ctx);
        let learning = self.learning_adjustment(channel, ctx);
        let time = time_adjustment(channel, ctx);
        let priority = priority_adjustment(channel, ctx.priority);
        let user = user_adjustment(channel, ctx);

        let raw = effectiveness + context + learning + time + priority + user;
        ChannelScore {
            channel,
            score: raw.clamp(0.0, 1.0),
            effectiveness,
            response_time_secs: profile.map_or(120, |p| p.response_time_secs),
            reason: format!(
                "base {:.2}, context {:+.2}, learning {:+.2}, time {:+.2}, priority {:+.2}, user {:+.2}",
                effectiveness, context, learning, time, priority, user
            ),
        }
    }

    fn learning_adjustment(&self, channel: ChannelKind, ctx: &DecisionContext<'_>) -> f64 {
        if !self.learning_enabled {
            return 0.0;
        }
        let learning = ctx.learning;
        let mut adjustment = 0.0;

        if let Some(rank) = learning
            .optimal_channels
            .get(ctx.alert_type)
            .and_then(|ranked| ranked.iter().position(|c| *c == channel))
        {
            adjustment += 0.3 * (1.0 - rank as f64 * 0.1).max(0.0);
        }

        let used: Vec<f64> = learning
            .patterns_for(ctx.alert_type)
            .filter(|p| p.channels.contains(&channel))
            .map(|p| p.effectiveness)
            .collect();
        if !used.is_empty() {
            adjustment += used.iter().sum::<f64>() / used.len() as f64 * 0.1;
        }
        adjustment
    }
}

fn context_adjustment(channel: ChannelKind, ctx: &DecisionContext<'_>) -> f64 {
    let mut adjustment = match ctx.alert_type {
        AlertType::Failover | AlertType::SystemHealth => {
            if channel.is_push() {
                0.2
            } else if channel.is_chat() {
                0.1
            } else if channel == ChannelKind::Email {
                -0.1
            } else {
                0.0
            }
        }
        AlertType::DataLimit | AlertType::Obstruction => match channel {
            ChannelKind::Email => 0.1,
            ChannelKind::Slack => 0.05,
            _ => 0.0,
        },
        AlertType::Predictive => match channel {
            ChannelKind::Email | ChannelKind::Slack => 0.15,
            ChannelKind::Webhook => 0.1,
            _ => 0.0,
        },
        _ => 0.0,
    };

    if ctx.state.maintenance_mode {
        if channel.is_push() {
            adjustment -= 0.2;
        } else if matches!(channel, ChannelKind::Email | ChannelKind::Slack) {
            adjustment += 0.1;
        }
    }

    if !ctx.state.business_hours {
        if channel.is_push() {
            adjustment += 0.1;
        } else if channel.is_chat() {
            adjustment -= 0.1;
        }
    }
    adjustment
}

fn time_adjustment(channel: ChannelKind, ctx: &DecisionContext<'_>) -> f64 {
    let hour = ctx.local_hour();
    let mut adjustment = if hour >= 22 || hour <= 6 {
        if channel.is_push() {
            -0.2
        } else if channel == ChannelKind::Email {
            0.1
        } else {
            0.0
        }
    } else if (9..=17).contains(&hour) {
        if channel.is_chat() {
            0.1
        } else if channel == ChannelKind::Email {
            0.05
        } else {
            0.0
        }
    } else {
        0.0
    };

    if let Some(presence) = &ctx.state.user_presence {
        if !presence.is_active {
            adjustment += match channel {
                ChannelKind::Email => 0.15,
                ChannelKind::Pushover => 0.1,
                _ => 0.0,
            };
        }
        if presence.quiet_hours_active {
            if channel.is_push() {
                adjustment -= 0.3;
            } else if channel == ChannelKind::Email {
                adjustment += 0.2;
            }
        }
    }
    adjustment
}

fn priority_adjustment(channel: ChannelKind, priority: NotificationPriority) -> f64 {
    match priority {
        NotificationPriority::Emergency => {
            if channel.is_push() {
                0.3
            } else if channel.is_chat() {
                0.2
            } else {
                0.1
            }
        }
        NotificationPriority::High => {
            if channel.is_push() {
                0.2
            } else if channel == ChannelKind::Slack {
                0.1
            } else {
                0.0
            }
        }
        NotificationPriority::Normal => 0.0,
        NotificationPriority::Low | NotificationPriority::Lowest => {
            if channel == ChannelKind::Email {
                0.1
            } else if channel.is_push() {
                -0.1
            } else {
                0.0
            }
        }
    }
}

fn user_adjustment(channel: ChannelKind, ctx: &DecisionContext<'_>) -> f64 {
    let Some(presence) = &ctx.state.user_presence else {
        return 0.0;
    };
    let mut adjustment = 0.0;

    if let Some(rank) = presence.preferred_channels.iter().position(|c| *c == channel) {
        adjustment += 0.2 * (1.0 - rank as f64 * 0.05).max(0.0);
    }

    if let Some(history) = &presence.response_history {
        if let Some(rate) = history.response_rate.get(&channel) {
            adjustment += rate * 0.1;
        }
        if let Some(secs) = history.average_response_secs.get(&channel) {
            if *secs < 60.0 {
                adjustment += 0.1;
            } else if *secs > 600.0 {
                adjustment -= 0.1;
            }
        }
    }
    adjustment
}

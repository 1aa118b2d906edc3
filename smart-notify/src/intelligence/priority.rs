//! Context-aware priority adjustment.

use serde::Serialize;
use tracing::debug;

use super::state::DecisionContext;
use crate::notification::{AlertType, ContextExt, NotificationPriority};

/// Bound on the learning score so a long pattern history cannot dominate.
const MAX_LEARNING_SCORE: f64 = 0.5;

/// Component scores behind a priority decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriorityDecision {
    pub priority: NotificationPriority,
    pub context_score: f64,
    pub learning_score: f64,
    pub urgency_score: f64,
    pub business_score: f64,
}

#[derive(Debug, Clone)]
pub struct PriorityOptimizer {
    adaptation_rate: f64,
    learning_enabled: bool,
    confidence_threshold: f64,
}

impl PriorityOptimizer {
    pub fn new(adaptation_rate: f64, learning_enabled: bool, confidence_threshold: f64) -> Self {
        Self {
            adaptation_rate,
            learning_enabled,
            confidence_threshold,
        }
    }

    /// `base + round(rate * (0.3 context + 0.2 learning + 0.4 urgency + 0.1 business) * 2)`, clamped.
    pub fn optimize(&self, ctx: &DecisionContext<'_>) -> PriorityDecision {
        let context_score = self.context_score(ctx);
        let learning_score = self.learning_score(ctx);
        let urgency_score = self.urgency_score(ctx);
        let business_score = self.business_score(ctx);

        let total = context_score * 0.3 + learning_score * 0.2 + urgency_score * 0.4 + business_score * 0.1;
        let steps = (total * self.adaptation_rate * 2.0).round() as i64;
        let priority = ctx.priority.shifted(steps);

        debug!(
            alert_type = %ctx.alert_type,
            base = %ctx.priority,
            optimized = %priority,
            context_score,
            learning_score,
            urgency_score,
            business_score,
            "Priority optimized"
        );

        PriorityDecision {
            priority,
            context_score,
            learning_score,
            urgency_score,
            business_score,
        }
    }

    fn context_score(&self, ctx: &DecisionContext<'_>) -> f64 {
        let state = ctx.state;
        let mut score = 0.0;

        if let Some(health) = &state.system_health {
            score += band(health.cpu_usage, &[(80.0, 0.3), (60.0, 0.1)]);
            score += band(health.memory_usage, &[(90.0, 0.4), (70.0, 0.2)]);
            score += band(health.temperature, &[(70.0, 0.3), (60.0, 0.1)]);
        }

        if let Some(network) = &state.network_health {
            if !network.primary_interface_up {
                score += 0.5;
            }
            if network.backup_interfaces_up < 2 {
                score += 0.2;
            }
            score += band(network.average_packet_loss, &[(10.0, 0.3), (5.0, 0.1)]);
        }

        score += state.active_incidents.len() as f64 * 0.1;
        score += state.severe_incident_count() as f64 * 0.2;

        if !state.business_hours && !matches!(ctx.alert_type, AlertType::Failover | AlertType::SystemHealth) {
            score -= 0.1;
        }
        if state.maintenance_mode && !matches!(ctx.alert_type, AlertType::SystemHealth | AlertType::Thermal) {
            score -= 0.3;
        }

        score
    }

    fn learning_score(&self, ctx: &DecisionContext<'_>) -> f64 {
        if !self.learning_enabled {
            return 0.0;
        }
        let learning = ctx.learning;
        let mut score = 0.0;

        if let Some(optimal) = learning.optimal_priorities.get(ctx.alert_type) {
            score += (optimal.level() - ctx.priority.level()) as f64 * 0.2;
        }

        for pattern in learning.patterns_for(ctx.alert_type) {
            if pattern.effectiveness > 0.8 {
                score += 0.1;
            } else if pattern.effectiveness < 0.3 {
                score -= 0.1;
            }
        }

        if let Some(confidence) = learning.confidence.get(ctx.alert_type) {
            score *= if *confidence > self.confidence_threshold { 1.2 } else { 0.5 };
        }

        score.clamp(-MAX_LEARNING_SCORE, MAX_LEARNING_SCORE)
    }

    fn urgency_score(&self, ctx: &DecisionContext<'_>) -> f64 {
        let data = ctx.data;
        let mut score = match ctx.alert_type {
            AlertType::Failover => 0.4 + data.number("recent_failover_count").unwrap_or(0.0) * 0.1,
            AlertType::SystemHealth => {
                0.3 + match data.text("severity") {
                    Some("critical") => 0.5,
                    Some("high") => 0.3,
                    Some("medium") => 0.1,
                    _ => 0.0,
                }
            }
            AlertType::Thermal => {
                0.4 + data
                    .number("temperature")
                    .map_or(0.0, |t| band(t, &[(80.0, 0.4), (70.0, 0.2)]))
            }
            AlertType::DataLimit => data
                .number("usage_percent")
                .map_or(0.0, |u| band(u, &[(95.0, 0.3), (85.0, 0.1)])),
            AlertType::Predictive => {
                let confidence = data.number("confidence").map_or(0.0, |c| c / 100.0 * 0.3);
                let imminence = data.number("time_to_failure").map_or(0.0, |secs| {
                    if secs < 300.0 {
                        0.4
                    } else if secs < 900.0 {
                        0.2
                    } else if secs < 3600.0 {
                        0.1
                    } else {
                        0.0
                    }
                });
                confidence + imminence
            }
            _ => 0.0,
        };

        score += band(ctx.state.recent_failures.len() as f64, &[(5.0, 0.2), (2.0, 0.1)]);
        if let Some(duration) = data.number("duration") {
            score += if duration > 1800.0 {
                0.3
            } else if duration > 600.0 {
                0.1
            } else {
                0.0
            };
        }
        score
    }

    fn business_score(&self, ctx: &DecisionContext<'_>) -> f64 {
        let data = ctx.data;
        let mut score = 0.0;

        if ctx.state.business_hours {
            score += match ctx.alert_type {
                AlertType::Failover | AlertType::ConnectivityIssue => 0.2,
                AlertType::SystemHealth => 0.1,
                _ => 0.0,
            };
        }

        let affected = data.text_list("affected_systems").len();
        score += (affected as f64 * 0.05).min(0.3);

        if let Some(availability) = data.number("service_availability")
            && availability < 0.9
        {
            score += (0.9 - availability) * 2.0;
        }
        if let Some(users) = data.number("affected_users") {
            score += band(users, &[(100.0, 0.3), (10.0, 0.1)]);
        }
        if let Some(cost) = data.number("estimated_cost") {
            score += if cost > 1000.0 {
                0.3
            } else if cost > 100.0 {
                0.1
            } else {
                0.0
            };
        }
        score
    }
}

/// Bonus of the first band whose bound `value` exceeds, bands highest first.
fn band(value: f64, bands: &[(f64, f64)]) -> f64 {
    bands
        .iter()
        .find(|(bound, _)| value > *bound)
        .map_or(0.0, |(_, bonus)| *bonus)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intelligence::learning::{LearningData, NotificationPattern};
    use crate::intelligence::state::{ActiveIncident, NetworkHealth, SystemHealth, SystemState};
    use crate::notification::{Context, EmergencyLevel};
    use chrono::{DateTime, TimeZone, Utc};
    use chrono_tz::Tz;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn decide(
        optimizer: &PriorityOptimizer,
        alert_type: AlertType,
        priority: NotificationPriority,
        data: &Context,
        state: &SystemState,
        learning: &LearningData,
    ) -> PriorityDecision {
        optimizer.optimize(&DecisionContext {
            alert_type: &alert_type,
            priority,
            data,
            state,
            learning,
            now: now(),
            timezone: Tz::UTC,
        })
    }

    fn severe_incident(id: &str) -> ActiveIncident {
        ActiveIncident {
            id: id.to_string(),
            incident_type: "thermal".to_string(),
            severity: EmergencyLevel::High,
            start_time: now(),
            description: String::new(),
            affected_systems: Vec::new(),
            escalated: false,
            context: Context::new(),
        }
    }

    #[test]
    fn test_default_rate_keeps_mild_alerts() {
        let optimizer = PriorityOptimizer::new(0.1, true, 0.7);
        let decision = decide(
            &optimizer,
            AlertType::Failover,
            NotificationPriority::Normal,
            &Context::new(),
            &SystemState::default(),
            &LearningData::new(),
        );
        assert_eq!(decision.priority, NotificationPriority::Normal);
        assert!((decision.urgency_score - 0.4).abs() < 1e-9);
        assert_eq!(decision.context_score, 0.0);
    }

    #[test]
    fn test_network_outage_raises_priority() {
        let optimizer = PriorityOptimizer::new(1.0, true, 0.7);
        let state = SystemState {
            network_health: Some(NetworkHealth {
                primary_interface_up: false,
                backup_interfaces_up: 0,
                total_interfaces: 2,
                ..Default::default()
            }),
            business_hours: true,
            ..Default::default()
        };
        let mut data = Context::new();
        data.insert("recent_failover_count".to_string(), 2.0.into());

        let decision = decide(
            &optimizer,
            AlertType::Failover,
            NotificationPriority::Normal,
            &data,
            &state,
            &LearningData::new(),
        );
        assert!((decision.context_score - 0.7).abs() < 1e-9);
        assert!((decision.urgency_score - 0.6).abs() < 1e-9);
        assert!((decision.business_score - 0.2).abs() < 1e-9);
        assert_eq!(decision.priority, NotificationPriority::High);
    }

    #[test]
    fn test_result_is_clamped() {
        let optimizer = PriorityOptimizer::new(1.0, false, 0.7);
        let state = SystemState {
            system_health: Some(SystemHealth {
                cpu_usage: 85.0,
                memory_usage: 95.0,
                temperature: 75.0,
                ..Default::default()
            }),
            active_incidents: vec![severe_incident("a"), severe_incident("b")],
            business_hours: true,
            ..Default::default()
        };
        let mut data = Context::new();
        data.insert("temperature".to_string(), 85.0.into());

        let decision = decide(
            &optimizer,
            AlertType::Thermal,
            NotificationPriority::High,
            &data,
            &state,
            &LearningData::new(),
        );
        assert!((decision.context_score - 1.6).abs() < 1e-9);
        assert_eq!(decision.priority, NotificationPriority::Emergency);
    }

    #[test]
    fn test_learning_score_is_bounded() {
        let optimizer = PriorityOptimizer::new(0.1, true, 0.7);
        let mut learning = LearningData::new();
        learning
            .optimal_priorities
            .insert(AlertType::Failover, NotificationPriority::High);
        learning.confidence.insert(AlertType::Failover, 1.0);
        for _ in 0..3 {
            learning.record(
                NotificationPattern {
                    alert_type: AlertType::Failover,
                    priority: NotificationPriority::High,
                    channels: Vec::new(),
                    hour: 10,
                    success: true,
                    effectiveness: 1.0,
                    processing_ms: 10.0,
                    seen_at: now(),
                    context: Context::new(),
                },
                100,
            );
        }

        let decision = decide(
            &optimizer,
            AlertType::Failover,
            NotificationPriority::Normal,
            &Context::new(),
            &SystemState::default(),
            &learning,
        );
        assert_eq!(decision.learning_score, MAX_LEARNING_SCORE);

        let without = PriorityOptimizer::new(0.1, false, 0.7);
        let decision = decide(
            &without,
            AlertType::Failover,
            NotificationPriority::Normal,
            &Context::new(),
            &SystemState::default(),
            &learning,
        );
        assert_eq!(decision.learning_score, 0.0);
    }

    #[test]
    fn test_business_impact() {
        let optimizer = PriorityOptimizer::new(0.1, false, 0.7);
        let mut data = Context::new();
        data.insert(
            "affected_systems".to_string(),
            vec!["wan".to_string(), "vpn".to_string()].into(),
        );
        data.insert("service_availability".to_string(), 0.8.into());
        data.insert("affected_users".to_string(), 150.0.into());
        data.insert("estimated_cost".to_string(), 500.0.into());

        let decision = decide(
            &optimizer,
            AlertType::ConnectivityIssue,
            NotificationPriority::Normal,
            &data,
            &SystemState::default(),
            &LearningData::new(),
        );
        // 0.1 systems + 0.2 availability + 0.3 users + 0.1 cost
        assert!((decision.business_score - 0.7).abs() < 1e-9);
    }
}

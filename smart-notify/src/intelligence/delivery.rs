//! Delivery timing: decide whether a notification should wait for a better moment.

use chrono::{DateTime, Datelike, NaiveDate, TimeDelta, Timelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tracing::debug;

use super::state::{DecisionContext, is_business_hours, is_weekday};
use crate::notification::suppression::QuietHours;
use crate::notification::{AlertType, ContextExt, EmergencyLevel, NotificationPriority};

/// Delays longer than this also get a compromise alternative.
const LONG_DELAY: TimeDelta = TimeDelta::hours(2);
const COMPROMISE_DELAY: TimeDelta = TimeDelta::hours(1);
/// Assumed maintenance length when no end time was reported.
const DEFAULT_MAINTENANCE: TimeDelta = TimeDelta::hours(2);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryPlan {
    pub delay: bool,
    pub optimal_time: DateTime<Utc>,
    pub reason: String,
    pub confidence: f64,
    pub estimated_delay_secs: i64,
    pub alternative_time: Option<DateTime<Utc>>,
}

impl DeliveryPlan {
    fn immediate(now: DateTime<Utc>, reason: &str) -> Self {
        Self {
            delay: false,
            optimal_time: now,
            reason: reason.to_string(),
            confidence: 1.0,
            estimated_delay_secs: 0,
            alternative_time: None,
        }
    }
}

/// Longest acceptable delay per alert type.
pub fn max_delay(alert_type: &AlertType) -> TimeDelta {
    match alert_type {
        AlertType::DataLimit => TimeDelta::hours(4),
        AlertType::Obstruction => TimeDelta::hours(2),
        AlertType::Predictive => TimeDelta::hours(6),
        AlertType::Failback => TimeDelta::minutes(30),
        _ => TimeDelta::hours(1),
    }
}

/// Local hours at which an alert type is best delivered when nothing was learned.
fn default_hours(alert_type: &AlertType) -> &'static [u32] {
    match alert_type {
        AlertType::DataLimit => &[9, 10, 14, 15],
        AlertType::Obstruction => &[8, 9, 16, 17],
        AlertType::Predictive => &[9, 10, 13, 14],
        _ => &[],
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryOptimizer {
    quiet_hours: QuietHours,
}

impl DeliveryOptimizer {
    pub fn new(quiet_hours: QuietHours) -> Self {
        Self { quiet_hours }
    }

    pub fn plan(&self, ctx: &DecisionContext<'_>) -> DeliveryPlan {
        let now = ctx.now;
        if ctx.priority >= NotificationPriority::Emergency {
            return DeliveryPlan::immediate(now, "Emergency priority - immediate delivery");
        }
        if ctx.data.flag("bypass_delivery_optimization") {
            return DeliveryPlan::immediate(now, "Delivery optimization bypassed");
        }

        let optimal = self.optimal_time(ctx);
        if optimal <= now {
            return DeliveryPlan::immediate(now, "Current time is optimal for delivery");
        }

        let delay = optimal - now;
        if !should_delay(ctx, delay) {
            return DeliveryPlan::immediate(now, "Optimal time calculated but delay not justified");
        }

        let plan = DeliveryPlan {
            delay: true,
            optimal_time: optimal,
            reason: self.delay_reason(ctx, delay),
            confidence: confidence(ctx),
            estimated_delay_secs: delay.num_seconds(),
            alternative_time: (delay > LONG_DELAY).then(|| now + COMPROMISE_DELAY),
        };
        debug!(
            alert_type = %ctx.alert_type,
            priority = %ctx.priority,
            delay_secs = plan.estimated_delay_secs,
            confidence = plan.confidence,
            "Delivery delayed"
        );
        plan
    }

    /// The latest of every applicable timing preference.
    pub fn optimal_time(&self, ctx: &DecisionContext<'_>) -> DateTime<Utc> {
        let now = ctx.now;
        let tz = ctx.timezone;

        let mut candidates = vec![now];
        candidates.extend(user_optimal_time(ctx));

        if ctx.alert_type.is_business_relevant() && !is_business_hours(now, tz) {
            candidates.push(next_business_start(now, tz));
        }

        if self.quiet_hours_apply(ctx) {
            candidates.push(self.quiet_hours.next_end_after(now));
        }

        if ctx.priority <= NotificationPriority::Normal {
            let hours = ctx
                .learning
                .optimal_hours
                .get(ctx.alert_type)
                .map(Vec::as_slice)
                .unwrap_or_else(|| default_hours(ctx.alert_type));
            candidates.extend(next_preferred_hour(now, tz, hours));
        }

        if ctx.state.maintenance_mode {
            candidates.push(
                ctx.state
                    .maintenance_until
                    .unwrap_or(now + DEFAULT_MAINTENANCE),
            );
        }

        candidates.into_iter().max().unwrap_or(now)
    }

    fn quiet_hours_apply(&self, ctx: &DecisionContext<'_>) -> bool {
        self.quiet_hours.is_active_at(ctx.now)
            || (ctx.state.quiet_hours_reported() && self.quiet_hours.covers(ctx.now))
    }

    fn delay_reason(&self, ctx: &DecisionContext<'_>, delay: TimeDelta) -> String {
        let mut reasons = Vec::new();
        if self.quiet_hours_apply(ctx) {
            reasons.push("avoiding quiet hours");
        }
        if ctx.state.maintenance_mode {
            reasons.push("waiting for maintenance to end");
        }
        if ctx.alert_type.is_business_relevant() && !is_business_hours(ctx.now, ctx.timezone) {
            reasons.push("waiting for business hours");
        }
        if reasons.is_empty() {
            reasons.push("optimizing for user availability");
        }
        format!("Delaying {} min for {}", delay.num_minutes(), reasons.join(" and "))
    }
}

fn should_delay(ctx: &DecisionContext<'_>, delay: TimeDelta) -> bool {
    ctx.priority < NotificationPriority::High
        && ctx.state.emergency_level < EmergencyLevel::High
        && !ctx.state.has_severe_incident()
        && delay <= max_delay(ctx.alert_type)
}

fn confidence(ctx: &DecisionContext<'_>) -> f64 {
    let mut confidence = 0.5;
    if ctx.state.response_history().is_some() {
        confidence += 0.2;
    }
    if ctx.learning.optimal_hours.contains_key(ctx.alert_type) {
        confidence += 0.2;
    }
    if ctx.state.emergency_level == EmergencyLevel::None && ctx.state.active_incidents.is_empty() {
        confidence += 0.1;
    }
    confidence
}

/// Start of the operator's most responsive slot today, from learned behaviour.
fn user_optimal_time(ctx: &DecisionContext<'_>) -> Option<DateTime<Utc>> {
    ctx.state.response_history()?;
    let local = ctx.now.with_timezone(&ctx.timezone);

    let best = ctx
        .learning
        .user_behavior
        .iter()
        .filter(|p| p.weekday == local.weekday() && p.confidence > 0.5)
        .map(|p| {
            let bonus = if p.average_response_secs < 300.0 { 0.2 } else { 0.0 };
            (p.hour, p.activity_level * p.confidence + bonus)
        })
        .max_by(|a, b| a.1.total_cmp(&b.1))?;

    let today = local_hour_at(local.date_naive(), best.0, ctx.timezone)?;
    if today > ctx.now {
        Some(today)
    } else {
        local_hour_at(local.date_naive() + TimeDelta::days(7), best.0, ctx.timezone)
    }
}

/// `None` when the current local hour is already preferred or no hours are given.
fn next_preferred_hour(now: DateTime<Utc>, tz: Tz, hours: &[u32]) -> Option<DateTime<Utc>> {
    let local = now.with_timezone(&tz);
    if hours.is_empty() || hours.contains(&local.hour()) {
        return None;
    }
    let today = local.date_naive();
    hours
        .iter()
        .filter_map(|hour| {
            let at = local_hour_at(today, *hour, tz)?;
            if at > now {
                Some(at)
            } else {
                local_hour_at(today + TimeDelta::days(1), *hour, tz)
            }
        })
        .min()
}

/// Next 09:00 local on a weekday, strictly after `now`.
pub fn next_business_start(now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let today = now.with_timezone(&tz).date_naive();
    (0..8)
        .map(|days| today + TimeDelta::days(days))
        .filter(|date| is_weekday(date.weekday()))
        .filter_map(|date| local_hour_at(date, 9, tz))
        .find(|start| *start > now)
        .unwrap_or(now)
}

fn local_hour_at(date: NaiveDate, hour: u32, tz: Tz) -> Option<DateTime<Utc>> {
    date.and_hms_opt(hour, 0, 0)?
        .and_local_timezone(tz)
        .earliest()
        .map(|at| at.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intelligence::learning::LearningData;
    use crate::intelligence::state::{ActiveIncident, ResponseHistory, SystemState, UserPresence};
    use crate::notification::Context;
    use crate::notification::suppression::parse_clock;
    use chrono::{TimeZone, Weekday};

    fn quiet(enabled: bool) -> QuietHours {
        QuietHours {
            enabled,
            start: parse_clock("22:00").unwrap(),
            end: parse_clock("08:00").unwrap(),
            timezone: Tz::UTC,
        }
    }

    // 2024-05-01 is a Wednesday.
    fn wednesday(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0).unwrap()
    }

    fn plan_for(
        optimizer: &DeliveryOptimizer,
        alert_type: AlertType,
        priority: NotificationPriority,
        data: &Context,
        state: &SystemState,
        learning: &LearningData,
        now: DateTime<Utc>,
    ) -> DeliveryPlan {
        optimizer.plan(&DecisionContext {
            alert_type: &alert_type,
            priority,
            data,
            state,
            learning,
            now,
            timezone: Tz::UTC,
        })
    }

    #[test]
    fn test_emergency_and_bypass_are_immediate() {
        let optimizer = DeliveryOptimizer::new(quiet(true));
        let now = wednesday(23, 0);
        let plan = plan_for(
            &optimizer,
            AlertType::DataLimit,
            NotificationPriority::Emergency,
            &Context::new(),
            &SystemState::default(),
            &LearningData::new(),
            now,
        );
        assert!(!plan.delay);
        assert_eq!(plan.optimal_time, now);

        let mut data = Context::new();
        data.insert("bypass_delivery_optimization".to_string(), true.into());
        let plan = plan_for(
            &optimizer,
            AlertType::DataLimit,
            NotificationPriority::Low,
            &data,
            &SystemState::default(),
            &LearningData::new(),
            now,
        );
        assert!(!plan.delay);
        assert_eq!(plan.reason, "Delivery optimization bypassed");
    }

    #[test]
    fn test_data_limit_waits_for_preferred_hour() {
        let optimizer = DeliveryOptimizer::new(quiet(false));
        let now = wednesday(8, 0);
        let plan = plan_for(
            &optimizer,
            AlertType::DataLimit,
            NotificationPriority::Normal,
            &Context::new(),
            &SystemState::default(),
            &LearningData::new(),
            now,
        );
        assert!(plan.delay);
        assert_eq!(plan.optimal_time, wednesday(9, 0));
        assert_eq!(plan.estimated_delay_secs, 3600);
        assert!((plan.confidence - 0.6).abs() < 1e-9);
        assert!(plan.alternative_time.is_none());
    }

    #[test]
    fn test_severe_incident_prevents_delay() {
        let optimizer = DeliveryOptimizer::new(quiet(false));
        let now = wednesday(8, 0);
        let state = SystemState {
            active_incidents: vec![ActiveIncident {
                id: "inc".to_string(),
                incident_type: "thermal".to_string(),
                severity: EmergencyLevel::Critical,
                start_time: now,
                description: String::new(),
                affected_systems: Vec::new(),
                escalated: false,
                context: Context::new(),
            }],
            ..Default::default()
        };
        let plan = plan_for(
            &optimizer,
            AlertType::DataLimit,
            NotificationPriority::Normal,
            &Context::new(),
            &state,
            &LearningData::new(),
            now,
        );
        assert!(!plan.delay);
    }

    #[test]
    fn test_weekend_business_alert_exceeds_cap() {
        let optimizer = DeliveryOptimizer::new(quiet(false));
        let saturday = Utc.with_ymd_and_hms(2024, 5, 4, 10, 0, 0).unwrap();
        assert_eq!(
            next_business_start(saturday, Tz::UTC),
            Utc.with_ymd_and_hms(2024, 5, 6, 9, 0, 0).unwrap()
        );
        let plan = plan_for(
            &optimizer,
            AlertType::Thermal,
            NotificationPriority::Normal,
            &Context::new(),
            &SystemState::default(),
            &LearningData::new(),
            saturday,
        );
        assert!(!plan.delay);
        assert_eq!(plan.reason, "Optimal time calculated but delay not justified");
    }

    #[test]
    fn test_quiet_hours_end() {
        let optimizer = DeliveryOptimizer::new(quiet(true));
        let plan = plan_for(
            &optimizer,
            AlertType::Failback,
            NotificationPriority::Low,
            &Context::new(),
            &SystemState::default(),
            &LearningData::new(),
            wednesday(7, 45),
        );
        assert!(plan.delay);
        assert_eq!(plan.optimal_time, wednesday(8, 0));
        assert!(plan.reason.contains("avoiding quiet hours"));
    }

    #[test]
    fn test_long_delay_offers_alternative() {
        let optimizer = DeliveryOptimizer::new(quiet(false));
        let now = wednesday(5, 0);
        let plan = plan_for(
            &optimizer,
            AlertType::Predictive,
            NotificationPriority::Low,
            &Context::new(),
            &SystemState::default(),
            &LearningData::new(),
            now,
        );
        assert!(plan.delay);
        assert_eq!(plan.optimal_time, wednesday(9, 0));
        assert_eq!(plan.alternative_time, Some(wednesday(6, 0)));
        assert!(plan.reason.contains("waiting for business hours"));
    }

    #[test]
    fn test_user_behaviour_slot() {
        let optimizer = DeliveryOptimizer::new(quiet(false));
        let state = SystemState {
            user_presence: Some(UserPresence {
                response_history: Some(ResponseHistory::default()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut learning = LearningData::new();
        for _ in 0..3 {
            learning.record_user_response(Weekday::Wed, 11, crate::notification::ChannelKind::Email, 60.0);
        }

        let plan = plan_for(
            &optimizer,
            AlertType::Maintenance,
            NotificationPriority::Normal,
            &Context::new(),
            &state,
            &learning,
            wednesday(10, 30),
        );
        assert!(plan.delay);
        assert_eq!(plan.optimal_time, wednesday(11, 0));
        // Response history and a stable system.
        assert!((plan.confidence - 0.8).abs() < 1e-9);
        assert!(plan.reason.contains("optimizing for user availability"));
    }
}

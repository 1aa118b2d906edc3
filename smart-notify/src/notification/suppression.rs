//! Suppression policy: quiet hours, low-priority days and declarative rules.
//!
//! Emergency notifications are exempt from every check in this module.

use std::fmt;

use chrono::{DateTime, Datelike, NaiveTime, TimeDelta, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::model::{AlertType, ChannelKind, ContextValue, Notification, NotificationPriority};
use crate::{Error, Result};

/// Parse an `HH:MM` clock time.
pub fn parse_clock(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|_| Error::validation(format!("Invalid time '{}', expected HH:MM", value)))
}

/// Resolve an IANA timezone name. Empty means UTC.
pub fn parse_timezone(name: &str) -> Result<Tz> {
    if name.trim().is_empty() {
        return Ok(Tz::UTC);
    }
    name.trim()
        .parse::<Tz>()
        .map_err(|_| Error::validation(format!("Unknown timezone '{}'", name)))
}

fn parse_weekday(name: &str) -> Result<Weekday> {
    name.trim()
        .parse::<Weekday>()
        .map_err(|_| Error::validation(format!("Unknown weekday '{}'", name)))
}

/// Lowercase English weekday name.
pub fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

/// Whether `time` falls in the daily window `[start, end)`.
///
/// A window whose start is after its end wraps past midnight. Equal bounds
/// describe an empty window.
pub fn in_daily_window(time: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    let time = NaiveTime::from_hms_opt(time.hour(), time.minute(), 0).unwrap_or(time);
    if start <= end {
        time >= start && time < end
    } else {
        time >= start || time < end
    }
}

/// A recurring time window used by suppression rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// `HH:MM`
    pub start: String,
    /// `HH:MM`
    pub end: String,
    /// Weekday names; empty means every day.
    #[serde(default)]
    pub days: Vec<String>,
    /// IANA timezone; empty means UTC.
    #[serde(default)]
    pub timezone: String,
}

#[derive(Debug, Clone)]
struct CompiledTimeRange {
    start: NaiveTime,
    end: NaiveTime,
    days: Vec<Weekday>,
    timezone: Tz,
}

impl CompiledTimeRange {
    fn compile(range: &TimeRange) -> Result<Self> {
        Ok(Self {
            start: parse_clock(&range.start)?,
            end: parse_clock(&range.end)?,
            days: range
                .days
                .iter()
                .map(|d| parse_weekday(d))
                .collect::<Result<_>>()?,
            timezone: parse_timezone(&range.timezone)?,
        })
    }

    fn contains(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.timezone);
        if !self.days.is_empty() && !self.days.contains(&local.weekday()) {
            return false;
        }
        in_daily_window(local.time(), self.start, self.end)
    }
}

/// Comparison operator of a rule condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    /// Case-insensitive substring match.
    Contains,
    Regex,
    Gt,
    Lt,
}

/// A field condition such as `context.interface equals wwan0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuppressionCondition {
    /// `title`, `message`, `type`, `priority` or `context.<key>`.
    pub field: String,
    pub operator: ConditionOperator,
    pub value: ContextValue,
}

impl SuppressionCondition {
    pub fn new(
        field: impl Into<String>,
        operator: ConditionOperator,
        value: impl Into<ContextValue>,
    ) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    fn field_value(&self, notification: &Notification) -> Option<ContextValue> {
        match self.field.as_str() {
            "title" => Some(ContextValue::Text(notification.title.clone())),
            "message" => Some(ContextValue::Text(notification.message.clone())),
            "type" => Some(ContextValue::Text(notification.alert_type.to_string())),
            "priority" => Some(ContextValue::Number(notification.priority.level() as f64)),
            field => field
                .strip_prefix("context.")
                .and_then(|key| notification.context.get(key))
                .cloned(),
        }
    }
}

/// A declarative silence condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuppressionRule {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Priorities to suppress; empty matches any.
    #[serde(default)]
    pub priorities: Vec<NotificationPriority>,
    /// Alert types to suppress; empty matches any.
    #[serde(default)]
    pub types: Vec<AlertType>,
    /// Matches notifications explicitly targeting one of these channels.
    #[serde(default)]
    pub channels: Vec<ChannelKind>,
    #[serde(default)]
    pub time_ranges: Vec<TimeRange>,
    #[serde(default)]
    pub conditions: Vec<SuppressionCondition>,
    /// Lifetime in seconds from creation; unset means permanent.
    #[serde(default)]
    pub duration_secs: Option<u64>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

impl SuppressionRule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            enabled: true,
            priorities: Vec::new(),
            types: Vec::new(),
            channels: Vec::new(),
            time_ranges: Vec::new(),
            conditions: Vec::new(),
            duration_secs: None,
            created_at: None,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| now > expires)
    }
}

struct CompiledRule {
    rule: SuppressionRule,
    time_ranges: Vec<CompiledTimeRange>,
    patterns: Vec<Option<Regex>>,
}

impl CompiledRule {
    fn compile(rule: SuppressionRule) -> Result<Self> {
        let time_ranges = rule
            .time_ranges
            .iter()
            .map(CompiledTimeRange::compile)
            .collect::<Result<Vec<_>>>()?;

        let mut patterns = Vec::with_capacity(rule.conditions.len());
        for condition in &rule.conditions {
            let is_known_field = matches!(
                condition.field.as_str(),
                "title" | "message" | "type" | "priority"
            ) || condition
                .field
                .strip_prefix("context.")
                .is_some_and(|key| !key.is_empty());
            if !is_known_field {
                return Err(Error::validation(format!(
                    "Unknown condition field '{}'",
                    condition.field
                )));
            }

            match condition.operator {
                ConditionOperator::Regex => {
                    let pattern = condition.value.as_str().ok_or_else(|| {
                        Error::validation("regex condition requires a string pattern")
                    })?;
                    let regex = Regex::new(pattern).map_err(|e| {
                        Error::validation(format!("Invalid regex '{}': {}", pattern, e))
                    })?;
                    patterns.push(Some(regex));
                }
                ConditionOperator::Gt | ConditionOperator::Lt => {
                    if !condition.value.is_ordered() {
                        return Err(Error::validation(format!(
                            "{:?} condition on '{}' requires a number or time operand",
                            condition.operator, condition.field
                        )));
                    }
                    patterns.push(None);
                }
                ConditionOperator::Equals | ConditionOperator::Contains => patterns.push(None),
            }
        }

        Ok(Self {
            rule,
            time_ranges,
            patterns,
        })
    }

    fn matches(&self, notification: &Notification, now: DateTime<Utc>) -> bool {
        let rule = &self.rule;
        if !rule.enabled || rule.is_expired(now) {
            return false;
        }
        if !rule.priorities.is_empty() && !rule.priorities.contains(&notification.priority) {
            return false;
        }
        if !rule.types.is_empty() && !rule.types.contains(&notification.alert_type) {
            return false;
        }
        if !rule.channels.is_empty()
            && !notification.channels.iter().any(|c| rule.channels.contains(c))
        {
            return false;
        }
        if !self.time_ranges.is_empty() && !self.time_ranges.iter().any(|r| r.contains(now)) {
            return false;
        }

        rule.conditions
            .iter()
            .zip(self.patterns.iter())
            .all(|(condition, pattern)| condition_matches(condition, pattern.as_ref(), notification))
    }
}

fn condition_matches(
    condition: &SuppressionCondition,
    pattern: Option<&Regex>,
    notification: &Notification,
) -> bool {
    let Some(field_value) = condition.field_value(notification) else {
        return false;
    };

    match condition.operator {
        ConditionOperator::Equals => field_value.loosely_equals(&condition.value),
        ConditionOperator::Contains => field_value
            .to_string()
            .to_lowercase()
            .contains(&condition.value.to_string().to_lowercase()),
        ConditionOperator::Regex => {
            pattern.is_some_and(|re| re.is_match(&field_value.to_string()))
        }
        ConditionOperator::Gt | ConditionOperator::Lt => {
            match field_value.compare(&condition.value) {
                Some(ordering) => {
                    if condition.operator == ConditionOperator::Gt {
                        ordering.is_gt()
                    } else {
                        ordering.is_lt()
                    }
                }
                None => {
                    debug!(
                        field = %condition.field,
                        "Ignoring condition with incompatible operand types"
                    );
                    false
                }
            }
        }
    }
}

/// Why a notification was suppressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SuppressionReason {
    QuietHours,
    LowPriorityDay { day: String },
    Rule { id: String, name: String },
}

impl fmt::Display for SuppressionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QuietHours => write!(f, "quiet hours"),
            Self::LowPriorityDay { day } => write!(f, "low priority suppressed on {}", day),
            Self::Rule { name, id } => write!(f, "rule '{}' ({})", name, id),
        }
    }
}

/// Quiet hours and day-based settings.
#[derive(Debug, Clone)]
pub struct QuietHours {
    pub enabled: bool,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub timezone: Tz,
}

impl QuietHours {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.covers(now)
    }

    /// Whether `now` falls inside the configured window, enabled or not.
    pub fn covers(&self, now: DateTime<Utc>) -> bool {
        in_daily_window(now.with_timezone(&self.timezone).time(), self.start, self.end)
    }

    /// Next local end of quiet hours strictly after `now`.
    pub fn next_end_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        next_clock_time(now, self.end, self.timezone)
    }
}

/// Next occurrence of clock time `at` in `tz` strictly after `now`.
pub fn next_clock_time(now: DateTime<Utc>, at: NaiveTime, tz: Tz) -> DateTime<Utc> {
    let local = now.with_timezone(&tz);
    let mut date = local.date_naive();
    for _ in 0..3 {
        if let Some(candidate) = date.and_time(at).and_local_timezone(tz).earliest() {
            let candidate = candidate.with_timezone(&Utc);
            if candidate > now {
                return candidate;
            }
        }
        date = date.succ_opt().unwrap_or(date);
    }
    now + TimeDelta::days(1)
}

/// Owner of suppression state for the smart manager.
pub struct SuppressionPolicy {
    quiet_hours: QuietHours,
    low_priority_days: Vec<Weekday>,
    rules: RwLock<Vec<CompiledRule>>,
}

impl SuppressionPolicy {
    pub fn new(quiet_hours: QuietHours, low_priority_days: &[String]) -> Result<Self> {
        let low_priority_days = low_priority_days
            .iter()
            .map(|d| parse_weekday(d))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            quiet_hours,
            low_priority_days,
            rules: RwLock::new(Vec::new()),
        })
    }

    pub fn quiet_hours(&self) -> &QuietHours {
        &self.quiet_hours
    }

    /// Evaluate every suppression source. Emergency notifications always pass.
    pub fn check_at(
        &self,
        notification: &Notification,
        now: DateTime<Utc>,
    ) -> Option<SuppressionReason> {
        if notification.priority == NotificationPriority::Emergency {
            return None;
        }

        if self.quiet_hours.is_active_at(now) {
            return Some(SuppressionReason::QuietHours);
        }

        if notification.priority < NotificationPriority::Normal {
            let today = now.with_timezone(&self.quiet_hours.timezone).weekday();
            if self.low_priority_days.contains(&today) {
                return Some(SuppressionReason::LowPriorityDay {
                    day: weekday_name(today).to_string(),
                });
            }
        }

        self.rules
            .read()
            .iter()
            .find(|compiled| compiled.matches(notification, now))
            .map(|compiled| SuppressionReason::Rule {
                id: compiled.rule.id.clone(),
                name: compiled.rule.name.clone(),
            })
    }

    /// Validate and install a rule. Returns the assigned id.
    pub fn add_rule_at(&self, mut rule: SuppressionRule, now: DateTime<Utc>) -> Result<String> {
        if rule.id.is_empty() {
            rule.id = format!("rule_{}", Uuid::new_v4().simple());
        }
        rule.created_at = Some(now);
        if let Some(secs) = rule.duration_secs.filter(|s| *s > 0) {
            rule.expires_at = Some(now + TimeDelta::seconds(secs as i64));
        }

        let compiled = CompiledRule::compile(rule)?;
        let id = compiled.rule.id.clone();

        let mut rules = self.rules.write();
        if rules.iter().any(|r| r.rule.id == id) {
            return Err(Error::validation(format!(
                "Suppression rule '{}' already exists",
                id
            )));
        }
        info!(
            id = %id,
            name = %compiled.rule.name,
            expires_at = ?compiled.rule.expires_at,
            "Added suppression rule"
        );
        rules.push(compiled);
        Ok(id)
    }

    pub fn remove_rule(&self, id: &str) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| r.rule.id != id);
        let removed = rules.len() != before;
        if removed {
            info!(id = %id, "Removed suppression rule");
        }
        removed
    }

    pub fn rules(&self) -> Vec<SuppressionRule> {
        self.rules.read().iter().map(|r| r.rule.clone()).collect()
    }

    /// Drop expired rules. Returns the number removed.
    pub fn remove_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| !r.rule.is_expired(now));
        let removed = before - rules.len();
        if removed > 0 {
            debug!(removed, "Removed expired suppression rules");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn policy(quiet: bool) -> SuppressionPolicy {
        SuppressionPolicy::new(
            QuietHours {
                enabled: quiet,
                start: parse_clock("22:00").unwrap(),
                end: parse_clock("08:00").unwrap(),
                timezone: Tz::UTC,
            },
            &["saturday".to_string(), "sunday".to_string()],
        )
        .unwrap()
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn notification(priority: NotificationPriority) -> Notification {
        Notification::builder(AlertType::InterfaceDown, "Interface down", "wwan0 lost carrier")
            .priority(priority)
            .context("interface", "wwan0")
            .context("signal", ContextValue::Number(-95.0))
            .build()
    }

    #[test]
    fn test_daily_window_wraps_midnight() {
        let start = parse_clock("22:00").unwrap();
        let end = parse_clock("08:00").unwrap();
        assert!(in_daily_window(parse_clock("23:30").unwrap(), start, end));
        assert!(in_daily_window(parse_clock("22:00").unwrap(), start, end));
        assert!(in_daily_window(parse_clock("07:59").unwrap(), start, end));
        assert!(!in_daily_window(parse_clock("08:00").unwrap(), start, end));
        assert!(!in_daily_window(parse_clock("12:00").unwrap(), start, end));
    }

    #[test]
    fn test_quiet_hours_suppress_non_emergency() {
        let policy = policy(true);
        // 2024-05-01 is a Wednesday.
        let night = at(2024, 5, 1, 23, 0);
        assert_eq!(
            policy.check_at(&notification(NotificationPriority::High), night),
            Some(SuppressionReason::QuietHours)
        );
        assert_eq!(
            policy.check_at(&notification(NotificationPriority::Emergency), night),
            None
        );
        assert_eq!(
            policy.check_at(&notification(NotificationPriority::High), at(2024, 5, 1, 12, 0)),
            None
        );
    }

    #[test]
    fn test_low_priority_weekend_suppression() {
        let policy = policy(false);
        let saturday = at(2024, 5, 4, 12, 0);
        assert_eq!(
            policy.check_at(&notification(NotificationPriority::Low), saturday),
            Some(SuppressionReason::LowPriorityDay {
                day: "saturday".to_string()
            })
        );
        assert_eq!(
            policy.check_at(&notification(NotificationPriority::Normal), saturday),
            None
        );
    }

    #[test]
    fn test_rule_with_conditions() {
        let policy = policy(false);
        let now = at(2024, 5, 1, 12, 0);
        let mut rule = SuppressionRule::new("mute wwan0");
        rule.types = vec![AlertType::InterfaceDown];
        rule.conditions = vec![
            SuppressionCondition::new("context.interface", ConditionOperator::Equals, "wwan0"),
            SuppressionCondition::new("message", ConditionOperator::Contains, "CARRIER"),
            SuppressionCondition::new("context.signal", ConditionOperator::Lt, ContextValue::Number(-90.0)),
            SuppressionCondition::new("title", ConditionOperator::Regex, "^Interface"),
        ];
        let id = policy.add_rule_at(rule, now).unwrap();

        match policy.check_at(&notification(NotificationPriority::High), now) {
            Some(SuppressionReason::Rule { id: matched, .. }) => assert_eq!(matched, id),
            other => panic!("expected rule suppression, got {:?}", other),
        }
        assert_eq!(
            policy.check_at(&notification(NotificationPriority::Emergency), now),
            None
        );

        let mut other = notification(NotificationPriority::High);
        other.context.insert("interface".into(), "eth0".into());
        assert_eq!(policy.check_at(&other, now), None);
    }

    #[test]
    fn test_incompatible_comparison_never_matches() {
        let policy = policy(false);
        let now = at(2024, 5, 1, 12, 0);
        let mut rule = SuppressionRule::new("gt on text");
        rule.conditions = vec![SuppressionCondition::new(
            "context.interface",
            ConditionOperator::Gt,
            ContextValue::Number(1.0),
        )];
        policy.add_rule_at(rule, now).unwrap();
        assert_eq!(policy.check_at(&notification(NotificationPriority::High), now), None);
    }

    #[test]
    fn test_invalid_rules_rejected() {
        let policy = policy(false);
        let now = Utc::now();

        let mut bad_regex = SuppressionRule::new("bad regex");
        bad_regex.conditions = vec![SuppressionCondition::new(
            "title",
            ConditionOperator::Regex,
            "([unclosed",
        )];
        assert!(policy.add_rule_at(bad_regex, now).is_err());

        let mut bad_gt = SuppressionRule::new("bad gt");
        bad_gt.conditions = vec![SuppressionCondition::new(
            "context.signal",
            ConditionOperator::Gt,
            "loud",
        )];
        assert!(policy.add_rule_at(bad_gt, now).is_err());

        let mut bad_time = SuppressionRule::new("bad time");
        bad_time.time_ranges = vec![TimeRange {
            start: "25:00".into(),
            end: "08:00".into(),
            days: vec![],
            timezone: String::new(),
        }];
        assert!(policy.add_rule_at(bad_time, now).is_err());

        assert!(policy.rules().is_empty());
    }

    #[test]
    fn test_time_range_with_days_and_timezone() {
        let policy = policy(false);
        let mut rule = SuppressionRule::new("office nights");
        rule.time_ranges = vec![TimeRange {
            start: "18:00".into(),
            end: "20:00".into(),
            days: vec!["wednesday".into()],
            timezone: "Europe/Stockholm".into(),
        }];
        policy.add_rule_at(rule, at(2024, 5, 1, 0, 0)).unwrap();

        // 17:30 UTC is 19:30 in Stockholm (CEST).
        assert!(policy
            .check_at(&notification(NotificationPriority::High), at(2024, 5, 1, 17, 30))
            .is_some());
        assert!(policy
            .check_at(&notification(NotificationPriority::High), at(2024, 5, 2, 17, 30))
            .is_none());
    }

    #[test]
    fn test_rule_expiry() {
        let policy = policy(false);
        let now = at(2024, 5, 1, 12, 0);
        let mut rule = SuppressionRule::new("temporary");
        rule.duration_secs = Some(600);
        let id = policy.add_rule_at(rule, now).unwrap();

        assert!(policy.check_at(&notification(NotificationPriority::High), now).is_some());
        let later = now + TimeDelta::minutes(11);
        assert!(policy.check_at(&notification(NotificationPriority::High), later).is_none());
        assert_eq!(policy.remove_expired_at(later), 1);
        assert!(!policy.remove_rule(&id));
    }

    #[test]
    fn test_channel_filter_requires_explicit_target() {
        let policy = policy(false);
        let now = at(2024, 5, 1, 12, 0);
        let mut rule = SuppressionRule::new("no email");
        rule.channels = vec![ChannelKind::Email];
        policy.add_rule_at(rule, now).unwrap();

        assert!(policy.check_at(&notification(NotificationPriority::High), now).is_none());
        let mut targeted = notification(NotificationPriority::High);
        targeted.channels = vec![ChannelKind::Email];
        assert!(policy.check_at(&targeted, now).is_some());
    }

    #[test]
    fn test_next_clock_time() {
        let end = parse_clock("08:00").unwrap();
        assert_eq!(next_clock_time(at(2024, 5, 1, 23, 0), end, Tz::UTC), at(2024, 5, 2, 8, 0));
        assert_eq!(next_clock_time(at(2024, 5, 1, 6, 0), end, Tz::UTC), at(2024, 5, 1, 8, 0));
    }
}

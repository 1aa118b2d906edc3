//! Notification data model.
//!
//! Defines the canonical priority ordinal, alert and channel kinds, the
//! tagged context value type and the immutable [`Notification`] itself.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Notification priority levels.
///
/// This is the single ordinal used across the crate. Integer levels coming from
/// outside are mapped through [`NotificationPriority::from_level`], which clamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    /// Lowest priority - digest material.
    Lowest = -2,
    /// Low priority - informational only.
    Low = -1,
    /// Normal priority - standard notifications.
    Normal = 0,
    /// High priority - important events.
    High = 1,
    /// Emergency priority - never suppressed, delayed or rate limited.
    Emergency = 2,
}

impl Default for NotificationPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl NotificationPriority {
    /// All priorities, lowest first.
    pub const ALL: [Self; 5] = [
        Self::Lowest,
        Self::Low,
        Self::Normal,
        Self::High,
        Self::Emergency,
    ];

    /// Ordinal level in `-2..=2`.
    pub fn level(self) -> i64 {
        self as i64
    }

    /// Map an arbitrary integer onto the ordinal range, clamping out-of-range values.
    pub fn from_level(level: i64) -> Self {
        match level {
            i64::MIN..=-2 => Self::Lowest,
            -1 => Self::Low,
            0 => Self::Normal,
            1 => Self::High,
            _ => Self::Emergency,
        }
    }

    /// Shift by `steps` levels, clamped.
    pub fn shifted(self, steps: i64) -> Self {
        Self::from_level(self.level().saturating_add(steps))
    }

    /// Heap weight used by the delivery queue.
    pub fn queue_weight(self) -> u32 {
        match self {
            Self::Emergency => 1000,
            Self::High => 800,
            Self::Normal => 600,
            Self::Low => 400,
            Self::Lowest => 200,
        }
    }

    /// How long a queued notification of this priority stays deliverable.
    pub fn max_queue_age(self) -> TimeDelta {
        match self {
            Self::Emergency => TimeDelta::minutes(5),
            Self::High => TimeDelta::minutes(15),
            Self::Normal => TimeDelta::minutes(30),
            Self::Low => TimeDelta::hours(1),
            Self::Lowest => TimeDelta::hours(2),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lowest => "lowest",
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Emergency => "emergency",
        }
    }
}

impl fmt::Display for NotificationPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationPriority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "lowest" => Ok(Self::Lowest),
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "emergency" | "critical" => Ok(Self::Emergency),
            other => other
                .parse::<i64>()
                .map(Self::from_level)
                .map_err(|_| Error::validation(format!("Unknown notification priority: {}", s))),
        }
    }
}

/// Five-point severity summary produced by emergency detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyLevel {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl Default for EmergencyLevel {
    fn default() -> Self {
        Self::None
    }
}

impl EmergencyLevel {
    /// Minimum notification priority implied by this level.
    pub fn to_priority(self) -> NotificationPriority {
        match self {
            Self::None | Self::Low => NotificationPriority::Normal,
            Self::Medium => NotificationPriority::High,
            Self::High | Self::Critical => NotificationPriority::Emergency,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for EmergencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmergencyLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(Error::validation(format!("Unknown emergency level: {}", s))),
        }
    }
}

/// Kind of alert raised by the monitoring daemon.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AlertType {
    Failover,
    Failback,
    InterfaceDown,
    InterfaceUp,
    Predictive,
    PerformanceDegradation,
    DataLimit,
    Thermal,
    Obstruction,
    SignalLoss,
    ConnectivityIssue,
    SystemHealth,
    Maintenance,
    Security,
    Custom(String),
}

impl AlertType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Failover => "failover",
            Self::Failback => "failback",
            Self::InterfaceDown => "interface_down",
            Self::InterfaceUp => "interface_up",
            Self::Predictive => "predictive",
            Self::PerformanceDegradation => "performance_degradation",
            Self::DataLimit => "data_limit",
            Self::Thermal => "thermal",
            Self::Obstruction => "obstruction",
            Self::SignalLoss => "signal_loss",
            Self::ConnectivityIssue => "connectivity_issue",
            Self::SystemHealth => "system_health",
            Self::Maintenance => "maintenance",
            Self::Security => "security",
            Self::Custom(name) => name,
        }
    }

    /// Alert types whose timing and priority are biased by business hours.
    pub fn is_business_relevant(&self) -> bool {
        matches!(
            self,
            Self::Failover
                | Self::SystemHealth
                | Self::ConnectivityIssue
                | Self::Thermal
                | Self::Predictive
        )
    }
}

impl From<&str> for AlertType {
    fn from(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "failover" => Self::Failover,
            "failback" => Self::Failback,
            "interface_down" => Self::InterfaceDown,
            "interface_up" => Self::InterfaceUp,
            "predictive" => Self::Predictive,
            "performance_degradation" => Self::PerformanceDegradation,
            "data_limit" => Self::DataLimit,
            "thermal" => Self::Thermal,
            "obstruction" => Self::Obstruction,
            "signal_loss" => Self::SignalLoss,
            "connectivity_issue" | "connectivity" => Self::ConnectivityIssue,
            "system_health" => Self::SystemHealth,
            "maintenance" => Self::Maintenance,
            "security" => Self::Security,
            _ => Self::Custom(value.to_string()),
        }
    }
}

impl From<String> for AlertType {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<AlertType> for String {
    fn from(value: AlertType) -> Self {
        match value {
            AlertType::Custom(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery channel family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Pushover,
    Email,
    Slack,
    Discord,
    Telegram,
    Webhook,
    Sms,
}

impl ChannelKind {
    pub const ALL: [Self; 7] = [
        Self::Pushover,
        Self::Email,
        Self::Slack,
        Self::Discord,
        Self::Telegram,
        Self::Webhook,
        Self::Sms,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pushover => "pushover",
            Self::Email => "email",
            Self::Slack => "slack",
            Self::Discord => "discord",
            Self::Telegram => "telegram",
            Self::Webhook => "webhook",
            Self::Sms => "sms",
        }
    }

    /// Push-style channels that reach a phone immediately.
    pub fn is_push(self) -> bool {
        matches!(self, Self::Pushover | Self::Telegram | Self::Sms)
    }

    /// Team chat channels.
    pub fn is_chat(self) -> bool {
        matches!(self, Self::Slack | Self::Discord)
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| Error::validation(format!("Unknown channel: {}", s)))
    }
}

/// A dynamically typed context value.
///
/// Untagged so that plain JSON objects deserialize naturally. RFC 3339 strings
/// become [`ContextValue::Time`]; any other string stays text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    Bool(bool),
    Number(f64),
    Time(DateTime<Utc>),
    Text(String),
    List(Vec<ContextValue>),
    Map(BTreeMap<String, ContextValue>),
}

impl ContextValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Time(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ContextValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Whether the value can take part in `gt`/`lt` comparisons.
    pub fn is_ordered(&self) -> bool {
        matches!(self, Self::Number(_) | Self::Time(_))
    }

    /// Order two values of the same comparable kind.
    ///
    /// Returns `None` when the kinds differ or are not ordered.
    pub fn compare(&self, other: &ContextValue) -> Option<Ordering> {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a.partial_cmp(b),
            (Self::Time(a), Self::Time(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Equality that compares numbers numerically and everything else by text form.
    pub fn loosely_equals(&self, other: &ContextValue) -> bool {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Time(a), Self::Time(b)) => a == b,
            _ => self.to_string() == other.to_string(),
        }
    }
}

impl fmt::Display for ContextValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Self::Number(n) => write!(f, "{}", n),
            Self::Time(t) => write!(f, "{}", t.to_rfc3339()),
            Self::Text(s) => f.write_str(s),
            Self::List(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            Self::Map(map) => {
                let parts: Vec<String> = map.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
        }
    }
}

impl From<bool> for ContextValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for ContextValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for ContextValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<i32> for ContextValue {
    fn from(value: i32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<u32> for ContextValue {
    fn from(value: u32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<&str> for ContextValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<DateTime<Utc>> for ContextValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Time(value)
    }
}

impl From<Vec<String>> for ContextValue {
    fn from(value: Vec<String>) -> Self {
        Self::List(value.into_iter().map(Self::Text).collect())
    }
}

/// Free-form notification context.
pub type Context = BTreeMap<String, ContextValue>;

/// Typed lookups on a [`Context`].
pub trait ContextExt {
    fn number(&self, key: &str) -> Option<f64>;
    fn flag(&self, key: &str) -> bool;
    fn text(&self, key: &str) -> Option<&str>;
    fn time(&self, key: &str) -> Option<DateTime<Utc>>;
    /// Text items of a list value, or a single text value as a one-item list.
    fn text_list(&self, key: &str) -> Vec<String>;
}

impl ContextExt for Context {
    fn number(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(ContextValue::as_f64)
    }

    fn flag(&self, key: &str) -> bool {
        self.get(key).and_then(ContextValue::as_bool).unwrap_or(false)
    }

    fn text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(ContextValue::as_str)
    }

    fn time(&self, key: &str) -> Option<DateTime<Utc>> {
        self.get(key).and_then(ContextValue::as_time)
    }

    fn text_list(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(ContextValue::List(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(ContextValue::Text(s)) => vec![s.clone()],
            _ => Vec::new(),
        }
    }
}

/// Per-channel presentation hints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationStyle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pushover_sound: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discord_color: Option<u32>,
}

/// One deliverable message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub priority: NotificationPriority,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: Context,
    #[serde(default)]
    pub style: NotificationStyle,
    /// Explicit target channels. Empty means every enabled channel.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<ChannelKind>,
}

impl Notification {
    pub fn new(
        alert_type: AlertType,
        title: impl Into<String>,
        message: impl Into<String>,
        priority: NotificationPriority,
    ) -> Self {
        Self::builder(alert_type, title, message)
            .priority(priority)
            .build()
    }

    pub fn builder(
        alert_type: AlertType,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> NotificationBuilder {
        NotificationBuilder {
            inner: Notification {
                alert_type,
                title: title.into(),
                message: message.into(),
                priority: NotificationPriority::Normal,
                timestamp: Utc::now(),
                context: Context::new(),
                style: NotificationStyle::default(),
                channels: Vec::new(),
            },
        }
    }

    /// Lowercase hex SHA-256 of `type|title|message`.
    pub fn fingerprint(&self) -> String {
        let content = format!("{}|{}|{}", self.alert_type, self.title, self.message);
        hex::encode(Sha256::digest(content.as_bytes()))
    }

    /// Whether this notification is allowed on `channel`.
    pub fn targets(&self, channel: ChannelKind) -> bool {
        self.channels.is_empty() || self.channels.contains(&channel)
    }
}

/// Shortened fingerprint for log output.
pub fn short_fingerprint(fingerprint: &str) -> &str {
    &fingerprint[..fingerprint.len().min(8)]
}

/// Builder for [`Notification`].
#[derive(Debug, Clone)]
pub struct NotificationBuilder {
    inner: Notification,
}

impl NotificationBuilder {
    pub fn priority(mut self, priority: NotificationPriority) -> Self {
        self.inner.priority = priority;
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.inner.timestamp = timestamp;
        self
    }

    pub fn context(mut self, key: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        self.inner.context.insert(key.into(), value.into());
        self
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.inner.context.extend(context);
        self
    }

    pub fn style(mut self, style: NotificationStyle) -> Self {
        self.inner.style = style;
        self
    }

    pub fn channels(mut self, channels: impl IntoIterator<Item = ChannelKind>) -> Self {
        self.inner.channels = channels.into_iter().collect();
        self
    }

    pub fn build(self) -> Notification {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_clamps_to_ordinal_range() {
        assert_eq!(NotificationPriority::from_level(-7), NotificationPriority::Lowest);
        assert_eq!(NotificationPriority::from_level(9), NotificationPriority::Emergency);
        assert_eq!(NotificationPriority::from_level(0), NotificationPriority::Normal);
        assert_eq!(
            NotificationPriority::High.shifted(3),
            NotificationPriority::Emergency
        );
        assert!(NotificationPriority::Lowest < NotificationPriority::Emergency);
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!(
            "Critical".parse::<NotificationPriority>().unwrap(),
            NotificationPriority::Emergency
        );
        assert_eq!(
            "-1".parse::<NotificationPriority>().unwrap(),
            NotificationPriority::Low
        );
        assert!("urgent".parse::<NotificationPriority>().is_err());
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = Notification::new(
            AlertType::InterfaceDown,
            "Interface down",
            "wwan0 lost carrier",
            NotificationPriority::High,
        );
        let mut b = a.clone();
        b.priority = NotificationPriority::Low;
        b.context.insert("interface".into(), "wwan0".into());

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
        assert_eq!(short_fingerprint(&a.fingerprint()).len(), 8);

        let c = Notification::new(
            AlertType::InterfaceDown,
            "Interface down",
            "wwan1 lost carrier",
            NotificationPriority::High,
        );
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_alert_type_round_trips_through_string() {
        assert_eq!(AlertType::from("data_limit"), AlertType::DataLimit);
        assert_eq!(
            AlertType::from("wifi_scan"),
            AlertType::Custom("wifi_scan".to_string())
        );
        let json = serde_json::to_string(&AlertType::ConnectivityIssue).unwrap();
        assert_eq!(json, "\"connectivity_issue\"");
    }

    #[test]
    fn test_context_value_untagged_deserialization() {
        let ctx: Context = serde_json::from_str(
            r#"{"cpu": 91.5, "primary": false, "iface": "wwan0", "since": "2024-05-01T10:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(ctx.number("cpu"), Some(91.5));
        assert!(!ctx.flag("primary"));
        assert_eq!(ctx.text("iface"), Some("wwan0"));
        assert!(ctx.time("since").is_some());
    }

    #[test]
    fn test_context_value_comparison() {
        let a = ContextValue::Number(5.0);
        let b = ContextValue::Number(7.0);
        assert_eq!(a.compare(&b), Some(Ordering::Less));
        assert_eq!(a.compare(&ContextValue::from("7")), None);
        assert!(ContextValue::Number(3.0).loosely_equals(&ContextValue::from("3")));
    }

    #[test]
    fn test_emergency_level_to_priority() {
        assert_eq!(EmergencyLevel::None.to_priority(), NotificationPriority::Normal);
        assert_eq!(EmergencyLevel::Medium.to_priority(), NotificationPriority::High);
        assert_eq!(
            EmergencyLevel::Critical.to_priority(),
            NotificationPriority::Emergency
        );
    }
}

//! Snapshot of host, network and operator conditions used by the optimizers.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, TimeDelta, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::learning::LearningData;
use crate::notification::{AlertType, ChannelKind, Context, EmergencyLevel, NotificationPriority};

/// Host resource usage. Percentages are 0-100, temperature in °C.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemHealth {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub temperature: f64,
    pub load_average: f64,
    pub uptime_secs: u64,
    pub last_check: Option<DateTime<Utc>>,
}

/// Uplink health as reported by the monitoring daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkHealth {
    pub primary_interface_up: bool,
    pub backup_interfaces_up: u32,
    pub total_interfaces: u32,
    pub average_latency_ms: f64,
    /// Percent.
    pub average_packet_loss: f64,
    pub throughput_mbps: f64,
    pub last_check: Option<DateTime<Utc>>,
}

impl Default for NetworkHealth {
    fn default() -> Self {
        Self {
            primary_interface_up: true,
            backup_interfaces_up: 0,
            total_interfaces: 1,
            average_latency_ms: 0.0,
            average_packet_loss: 0.0,
            throughput_mbps: 0.0,
            last_check: None,
        }
    }
}

/// An ongoing incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveIncident {
    pub id: String,
    #[serde(rename = "type")]
    pub incident_type: String,
    pub severity: EmergencyLevel,
    pub start_time: DateTime<Utc>,
    pub description: String,
    #[serde(default)]
    pub affected_systems: Vec<String>,
    #[serde(default)]
    pub escalated: bool,
    #[serde(default)]
    pub context: Context,
}

/// A component failure observed by the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub component: String,
    pub failure_type: String,
    #[serde(default)]
    pub severity: EmergencyLevel,
    #[serde(default)]
    pub duration_secs: u64,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub context: Context,
}

impl FailureRecord {
    pub fn new(component: impl Into<String>, failure_type: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            component: component.into(),
            failure_type: failure_type.into(),
            severity: EmergencyLevel::None,
            duration_secs: 0,
            resolved: false,
            context: Context::new(),
        }
    }
}

/// How the operator has responded to past notifications.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseHistory {
    pub average_response_secs: BTreeMap<ChannelKind, f64>,
    /// Fraction of notifications answered, 0-1.
    pub response_rate: BTreeMap<ChannelKind, f64>,
    pub responses: BTreeMap<ChannelKind, u64>,
    pub last_response: Option<DateTime<Utc>>,
}

impl ResponseHistory {
    /// Fold one response into the running per-channel average.
    pub fn record(&mut self, channel: ChannelKind, response_secs: f64, at: DateTime<Utc>) {
        let count = self.responses.entry(channel).or_default();
        *count += 1;
        let n = *count as f64;
        let average = self.average_response_secs.entry(channel).or_insert(response_secs);
        *average += (response_secs - *average) / n;
        self.last_response = Some(at);
    }
}

/// Operator availability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPresence {
    pub is_active: bool,
    pub last_activity: Option<DateTime<Utc>>,
    /// Most preferred first.
    pub preferred_channels: Vec<ChannelKind>,
    pub timezone: String,
    pub quiet_hours_active: bool,
    pub response_history: Option<ResponseHistory>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemState {
    pub timestamp: Option<DateTime<Utc>>,
    pub emergency_level: EmergencyLevel,
    pub system_health: Option<SystemHealth>,
    pub network_health: Option<NetworkHealth>,
    pub active_incidents: Vec<ActiveIncident>,
    pub recent_failures: Vec<FailureRecord>,
    pub user_presence: Option<UserPresence>,
    pub maintenance_mode: bool,
    pub maintenance_until: Option<DateTime<Utc>>,
    pub business_hours: bool,
}

impl SystemState {
    /// Any active incident at High severity or above.
    pub fn has_severe_incident(&self) -> bool {
        self.active_incidents
            .iter()
            .any(|i| i.severity >= EmergencyLevel::High)
    }

    pub fn severe_incident_count(&self) -> usize {
        self.active_incidents
            .iter()
            .filter(|i| i.severity >= EmergencyLevel::High)
            .count()
    }

    pub fn quiet_hours_reported(&self) -> bool {
        self.user_presence
            .as_ref()
            .is_some_and(|p| p.quiet_hours_active)
    }

    pub fn response_history(&self) -> Option<&ResponseHistory> {
        self.user_presence
            .as_ref()
            .and_then(|p| p.response_history.as_ref())
    }

    /// Drop incidents and failures that started before `now - retention`.
    ///
    /// Returns the number of records removed.
    pub fn cleanup_at(&mut self, now: DateTime<Utc>, retention: TimeDelta) -> usize {
        let cutoff = now - retention;
        let before = self.active_incidents.len() + self.recent_failures.len();
        self.active_incidents.retain(|i| i.start_time > cutoff);
        self.recent_failures.retain(|f| f.timestamp > cutoff);
        before - self.active_incidents.len() - self.recent_failures.len()
    }

    /// Leave maintenance once its scheduled end has passed.
    pub fn expire_maintenance_at(&mut self, now: DateTime<Utc>) {
        if self.maintenance_mode && self.maintenance_until.is_some_and(|until| until <= now) {
            self.maintenance_mode = false;
            self.maintenance_until = None;
        }
    }
}

/// Everything an optimizer looks at for one notification.
#[derive(Debug, Clone, Copy)]
pub struct DecisionContext<'a> {
    pub alert_type: &'a AlertType,
    pub priority: NotificationPriority,
    pub data: &'a Context,
    pub state: &'a SystemState,
    pub learning: &'a LearningData,
    pub now: DateTime<Utc>,
    pub timezone: Tz,
}

impl DecisionContext<'_> {
    /// Local hour of day of `now`.
    pub fn local_hour(&self) -> u32 {
        self.now.with_timezone(&self.timezone).hour()
    }
}

/// Business hours are Monday to Friday, 09:00 to 17:00 local time.
pub fn is_business_hours(now: DateTime<Utc>, tz: Tz) -> bool {
    let local = now.with_timezone(&tz);
    is_weekday(local.weekday()) && (9..17).contains(&local.hour())
}

pub fn is_weekday(day: Weekday) -> bool {
    !matches!(day, Weekday::Sat | Weekday::Sun)
}

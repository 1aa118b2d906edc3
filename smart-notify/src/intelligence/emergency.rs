//! Emergency detection.
//!
//! Five independent checks each map the current state to an
//! [`EmergencyLevel`]; the detector reports the highest of them:
//!
//! 1. Host resources against the emergency thresholds (100% / 80% / 60% bands)
//! 2. Network health: total outage, packet loss and latency
//! 3. Cascading failures: clustered severe incidents or a high failure rate
//! 4. Alert-specific data such as temperatures and prediction confidence
//! 5. Long-running incidents and repeatedly failing components

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::state::{ActiveIncident, FailureRecord, NetworkHealth, SystemHealth, SystemState};
use crate::notification::{AlertType, Context, ContextExt, EmergencyLevel};

/// Thresholds at which conditions count as an emergency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmergencyThresholds {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub temperature: f64,
    pub disk_usage: f64,
    pub packet_loss: f64,
    pub latency_ms: f64,
    /// Failures per minute.
    pub failure_rate: f64,
    /// Severe incidents within ten minutes.
    pub cascading_failure_count: usize,
    pub service_downtime_secs: u64,
    pub recovery_time_secs: u64,
}

impl Default for EmergencyThresholds {
    fn default() -> Self {
        Self {
            cpu_usage: 90.0,
            memory_usage: 95.0,
            temperature: 85.0,
            disk_usage: 95.0,
            packet_loss: 50.0,
            latency_ms: 5000.0,
            failure_rate: 5.0,
            cascading_failure_count: 3,
            service_downtime_secs: 300,
            recovery_time_secs: 900,
        }
    }
}

/// Failures of one component within an hour that count as a pattern.
const REPEATED_COMPONENT_FAILURES: usize = 5;

#[derive(Debug, Clone)]
pub struct EmergencyDetector {
    enabled: bool,
    thresholds: EmergencyThresholds,
}

impl EmergencyDetector {
    pub fn new(enabled: bool, thresholds: EmergencyThresholds) -> Self {
        Self {
            enabled,
            thresholds,
        }
    }

    pub fn thresholds(&self) -> &EmergencyThresholds {
        &self.thresholds
    }

    /// Highest level reported by any check. `None` when detection is disabled.
    pub fn detect_at(
        &self,
        state: &SystemState,
        alert_type: &AlertType,
        data: &Context,
        now: DateTime<Utc>,
    ) -> EmergencyLevel {
        if !self.enabled {
            return EmergencyLevel::None;
        }

        let level = [
            state
                .system_health
                .as_ref()
                .map_or(EmergencyLevel::None, |h| self.check_system_health(h)),
            state
                .network_health
                .as_ref()
                .map_or(EmergencyLevel::None, |h| self.check_network_health(h)),
            self.check_cascading_failures(&state.active_incidents, &state.recent_failures, now),
            self.check_alert(alert_type, data),
            self.check_temporal(&state.active_incidents, &state.recent_failures, now),
        ]
        .into_iter()
        .max()
        .unwrap_or(EmergencyLevel::None);

        if level > EmergencyLevel::None {
            let health = state.system_health.clone().unwrap_or_default();
            warn!(
                level = %level,
                alert_type = %alert_type,
                cpu = health.cpu_usage,
                memory = health.memory_usage,
                temperature = health.temperature,
                "Emergency condition detected"
            );
        }
        level
    }

    pub fn check_system_health(&self, health: &SystemHealth) -> EmergencyLevel {
        let t = &self.thresholds;
        let reaches = |factor: f64| {
            health.cpu_usage >= t.cpu_usage * factor
                || health.memory_usage >= t.memory_usage * factor
                || health.temperature >= t.temperature * factor
                || health.disk_usage >= t.disk_usage * factor
        };

        if reaches(1.0) {
            EmergencyLevel::Critical
        } else if reaches(0.8) {
            EmergencyLevel::High
        } else if reaches(0.6) {
            EmergencyLevel::Medium
        } else {
            EmergencyLevel::None
        }
    }

    pub fn check_network_health(&self, health: &NetworkHealth) -> EmergencyLevel {
        let t = &self.thresholds;
        let degraded = |factor: f64| {
            health.average_packet_loss >= t.packet_loss * factor
                || health.average_latency_ms >= t.latency_ms * factor
        };

        if !health.primary_interface_up && health.backup_interfaces_up == 0 {
            return EmergencyLevel::Critical;
        }
        if degraded(1.0) {
            return EmergencyLevel::Critical;
        }
        if !health.primary_interface_up || health.backup_interfaces_up < health.total_interfaces / 2 {
            return EmergencyLevel::High;
        }
        if degraded(0.6) {
            return EmergencyLevel::High;
        }
        if degraded(0.3) {
            return EmergencyLevel::Medium;
        }
        EmergencyLevel::None
    }

    pub fn check_cascading_failures(
        &self,
        incidents: &[ActiveIncident],
        failures: &[FailureRecord],
        now: DateTime<Utc>,
    ) -> EmergencyLevel {
        let t = &self.thresholds;

        let clustered = incidents
            .iter()
            .filter(|i| i.severity >= EmergencyLevel::High && now - i.start_time < TimeDelta::minutes(10))
            .count();
        if clustered >= t.cascading_failure_count {
            return EmergencyLevel::Critical;
        }

        let cutoff = now - TimeDelta::minutes(1);
        let rate = failures.iter().filter(|f| f.timestamp > cutoff).count() as f64;
        if rate >= t.failure_rate {
            EmergencyLevel::High
        } else if rate >= t.failure_rate * 0.6 {
            EmergencyLevel::Medium
        } else {
            EmergencyLevel::None
        }
    }

    pub fn check_alert(&self, alert_type: &AlertType, data: &Context) -> EmergencyLevel {
        let t = &self.thresholds;

        let level = match alert_type {
            AlertType::Thermal => match data.number("temperature") {
                Some(temp) if temp >= t.temperature => EmergencyLevel::Critical,
                Some(temp) if temp >= t.temperature * 0.8 => EmergencyLevel::High,
                _ => EmergencyLevel::None,
            },
            AlertType::Failover => match data.number("recent_failover_count") {
                Some(count) if count >= 3.0 => EmergencyLevel::High,
                _ => EmergencyLevel::None,
            },
            AlertType::ConnectivityIssue => {
                if data.number("packet_loss").is_some_and(|loss| loss >= t.packet_loss) {
                    EmergencyLevel::Critical
                } else if data.number("latency").is_some_and(|ms| ms >= t.latency_ms) {
                    EmergencyLevel::High
                } else {
                    EmergencyLevel::None
                }
            }
            AlertType::SystemHealth => data
                .text("severity")
                .and_then(|s| s.parse::<EmergencyLevel>().ok())
                .filter(|level| *level >= EmergencyLevel::Medium)
                .unwrap_or(EmergencyLevel::None),
            AlertType::DataLimit => match data.number("usage_percent") {
                Some(usage) if usage >= 100.0 => EmergencyLevel::Medium,
                _ => EmergencyLevel::None,
            },
            AlertType::Predictive => match data.number("confidence") {
                Some(c) if c >= 90.0 => EmergencyLevel::High,
                Some(c) if c >= 70.0 => EmergencyLevel::Medium,
                _ => EmergencyLevel::None,
            },
            _ => EmergencyLevel::None,
        };

        if level == EmergencyLevel::None && data.flag("emergency") {
            return EmergencyLevel::High;
        }
        level
    }

    pub fn check_temporal(
        &self,
        incidents: &[ActiveIncident],
        failures: &[FailureRecord],
        now: DateTime<Utc>,
    ) -> EmergencyLevel {
        let downtime = TimeDelta::seconds(self.thresholds.service_downtime_secs as i64);

        // The oldest prolonged incident decides.
        if let Some(incident) = incidents
            .iter()
            .filter(|i| now - i.start_time >= downtime)
            .min_by_key(|i| i.start_time)
        {
            return if incident.severity >= EmergencyLevel::High {
                EmergencyLevel::Critical
            } else {
                EmergencyLevel::High
            };
        }

        let cutoff = now - TimeDelta::hours(1);
        let mut per_component: BTreeMap<&str, usize> = BTreeMap::new();
        for failure in failures.iter().filter(|f| f.timestamp > cutoff) {
            *per_component.entry(failure.component.as_str()).or_default() += 1;
        }
        if let Some((component, count)) = per_component
            .into_iter()
            .find(|(_, count)| *count >= REPEATED_COMPONENT_FAILURES)
        {
            warn!(component, failures = count, "Repeated component failures detected");
            return EmergencyLevel::Medium;
        }

        EmergencyLevel::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn detector() -> EmergencyDetector {
        EmergencyDetector::new(true, EmergencyThresholds::default())
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn cpu(usage: f64) -> SystemHealth {
        SystemHealth {
            cpu_usage: usage,
            ..Default::default()
        }
    }

    fn incident(severity: EmergencyLevel, started: DateTime<Utc>) -> ActiveIncident {
        ActiveIncident {
            id: format!("inc-{}", started.timestamp()),
            incident_type: "failover".to_string(),
            severity,
            start_time: started,
            description: String::new(),
            affected_systems: Vec::new(),
            escalated: false,
            context: Context::new(),
        }
    }

    #[test]
    fn test_cpu_bands() {
        let d = detector();
        assert_eq!(d.check_system_health(&cpu(90.0)), EmergencyLevel::Critical);
        assert_eq!(d.check_system_health(&cpu(72.0)), EmergencyLevel::High);
        assert_eq!(d.check_system_health(&cpu(54.0)), EmergencyLevel::Medium);
        assert_eq!(d.check_system_health(&cpu(53.9)), EmergencyLevel::None);
    }

    #[test]
    fn test_network_checks() {
        let d = detector();
        let outage = NetworkHealth {
            primary_interface_up: false,
            backup_interfaces_up: 0,
            total_interfaces: 3,
            ..Default::default()
        };
        assert_eq!(d.check_network_health(&outage), EmergencyLevel::Critical);

        let on_backup = NetworkHealth {
            primary_interface_up: false,
            backup_interfaces_up: 2,
            total_interfaces: 3,
            ..Default::default()
        };
        assert_eq!(d.check_network_health(&on_backup), EmergencyLevel::High);

        let lossy = NetworkHealth {
            backup_interfaces_up: 2,
            total_interfaces: 3,
            average_packet_loss: 20.0,
            ..Default::default()
        };
        assert_eq!(d.check_network_health(&lossy), EmergencyLevel::Medium);

        let healthy = NetworkHealth {
            backup_interfaces_up: 2,
            total_interfaces: 3,
            ..Default::default()
        };
        assert_eq!(d.check_network_health(&healthy), EmergencyLevel::None);
    }

    #[test]
    fn test_cascading_failures() {
        let d = detector();
        let now = now();
        let incidents: Vec<_> = (0..3)
            .map(|i| incident(EmergencyLevel::High, now - TimeDelta::minutes(i)))
            .collect();
        assert_eq!(
            d.check_cascading_failures(&incidents, &[], now),
            EmergencyLevel::Critical
        );

        let failures: Vec<_> = (0..3)
            .map(|i| FailureRecord::new(format!("c{}", i), "down", now - TimeDelta::seconds(10)))
            .collect();
        assert_eq!(d.check_cascading_failures(&[], &failures, now), EmergencyLevel::Medium);
    }

    #[test]
    fn test_alert_specific_rules() {
        let d = detector();
        let mut data = Context::new();
        data.insert("temperature".to_string(), 70.0.into());
        assert_eq!(d.check_alert(&AlertType::Thermal, &data), EmergencyLevel::High);

        let mut data = Context::new();
        data.insert("confidence".to_string(), 75.0.into());
        assert_eq!(d.check_alert(&AlertType::Predictive, &data), EmergencyLevel::Medium);

        let mut data = Context::new();
        data.insert("severity".to_string(), "critical".into());
        assert_eq!(d.check_alert(&AlertType::SystemHealth, &data), EmergencyLevel::Critical);

        let mut data = Context::new();
        data.insert("emergency".to_string(), true.into());
        assert_eq!(d.check_alert(&AlertType::Maintenance, &data), EmergencyLevel::High);

        assert_eq!(d.check_alert(&AlertType::Failover, &Context::new()), EmergencyLevel::None);
    }

    #[test]
    fn test_temporal_patterns() {
        let d = detector();
        let now = now();
        let prolonged = vec![incident(EmergencyLevel::Medium, now - TimeDelta::minutes(6))];
        assert_eq!(d.check_temporal(&prolonged, &[], now), EmergencyLevel::High);

        let failures: Vec<_> = (0..5)
            .map(|i| FailureRecord::new("wwan0", "link_down", now - TimeDelta::minutes(i * 10)))
            .collect();
        assert_eq!(d.check_temporal(&[], &failures, now), EmergencyLevel::Medium);
        assert_eq!(d.check_temporal(&[], &failures[..4], now), EmergencyLevel::None);
    }

    #[test]
    fn test_detect_takes_maximum() {
        let d = detector();
        let state = SystemState {
            system_health: Some(cpu(55.0)),
            ..Default::default()
        };
        let mut data = Context::new();
        data.insert("temperature".to_string(), 90.0.into());
        assert_eq!(
            d.detect_at(&state, &AlertType::Thermal, &data, now()),
            EmergencyLevel::Critical
        );
        assert_eq!(
            d.detect_at(&state, &AlertType::Failover, &Context::new(), now()),
            EmergencyLevel::Medium
        );

        let disabled = EmergencyDetector::new(false, EmergencyThresholds::default());
        assert_eq!(
            disabled.detect_at(&state, &AlertType::Thermal, &data, now()),
            EmergencyLevel::None
        );
    }
}

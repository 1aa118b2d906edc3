//! Intelligence engine.
//!
//! Wraps the [`SmartNotificationManager`] with context-aware decisions for
//! every inbound alert:
//!
//! 1. Refresh the system state snapshot
//! 2. Detect emergencies; an emergency is sent at emergency priority to every
//!    channel, recorded as an incident and optionally escalated
//! 3. Otherwise adjust the priority, select channels and plan delivery timing
//! 4. Send now or schedule a deferred send
//! 5. Record the outcome as a learning pattern
//!
//! A periodic cycle refreshes the state, retrains the learned preferences and
//! reports anomalies.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, TimeDelta, Timelike, Utc};
use chrono_tz::Tz;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::channel::{ChannelIntelligence, ChannelProfile, default_channel_profiles};
use super::delivery::{DeliveryOptimizer, DeliveryPlan};
use super::emergency::{EmergencyDetector, EmergencyThresholds};
use super::learning::{
    DEFAULT_MAX_PATTERNS, LearningData, NotificationPattern, effectiveness_score,
};
use super::priority::PriorityOptimizer;
use super::probe::SystemProbe;
use super::state::{
    ActiveIncident, DecisionContext, FailureRecord, NetworkHealth, SystemHealth, SystemState,
    UserPresence, is_business_hours,
};
use crate::notification::escalation::EscalationRecord;
use crate::notification::suppression::parse_timezone;
use crate::notification::{
    AlertType, ChannelKind, Context, ContextExt, EmergencyLevel, EscalationManager,
    EscalationRequest, Notification, NotificationPriority, SendOutcome, SmartNotificationManager,
};
use crate::{Error, Result};

/// More retained failures than this raises an anomaly.
const HIGH_FAILURE_COUNT: usize = 10;
/// More concurrent severe incidents than this raises an anomaly.
const MULTIPLE_EMERGENCY_COUNT: usize = 3;

/// Intelligence engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntelligenceConfig {
    pub emergency_detection: bool,
    pub priority_optimization: bool,
    pub learning_enabled: bool,
    pub channel_intelligence: bool,
    pub delivery_optimization: bool,
    pub escalation_enabled: bool,

    pub adaptation_rate: f64,
    pub max_escalation_level: u32,
    pub escalation_cooldown_secs: u64,
    /// Minimum time between periodic retraining runs.
    pub learning_window_secs: u64,
    pub min_samples_for_learning: usize,
    pub confidence_threshold: f64,

    pub thresholds: EmergencyThresholds,
    /// Detected levels below this only raise the priority floor.
    pub emergency_trigger_level: EmergencyLevel,
    /// IANA timezone for business hours and time-of-day preferences.
    pub timezone: String,
    pub channel_profiles: Vec<ChannelProfile>,

    pub cycle_interval_secs: u64,
    /// How long incidents and failures stay in the state snapshot.
    pub record_retention_secs: u64,
    /// Maintenance length when none is given.
    pub maintenance_default_secs: u64,
    pub max_patterns: usize,
}

impl Default for IntelligenceConfig {
    fn default() -> Self {
        Self {
            emergency_detection: true,
            priority_optimization: true,
            learning_enabled: true,
            channel_intelligence: true,
            delivery_optimization: true,
            escalation_enabled: true,
            adaptation_rate: 0.1,
            max_escalation_level: 3,
            escalation_cooldown_secs: 900,
            learning_window_secs: 3600,
            min_samples_for_learning: 10,
            confidence_threshold: 0.7,
            thresholds: EmergencyThresholds::default(),
            emergency_trigger_level: EmergencyLevel::High,
            timezone: "UTC".to_string(),
            channel_profiles: default_channel_profiles(),
            cycle_interval_secs: 60,
            record_retention_secs: 24 * 3600,
            maintenance_default_secs: 2 * 3600,
            max_patterns: DEFAULT_MAX_PATTERNS,
        }
    }
}

impl IntelligenceConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.adaptation_rate) {
            return Err(Error::config(format!(
                "adaptation_rate must be within [0, 1], got {}",
                self.adaptation_rate
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(Error::config(format!(
                "confidence_threshold must be within [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if self.emergency_trigger_level == EmergencyLevel::None {
            return Err(Error::config("emergency_trigger_level must be above none"));
        }
        if self.min_samples_for_learning == 0 || self.max_patterns == 0 {
            return Err(Error::config(
                "min_samples_for_learning and max_patterns must be positive",
            ));
        }
        if self.max_escalation_level == 0 {
            return Err(Error::config("max_escalation_level must be at least 1"));
        }
        parse_timezone(&self.timezone).map_err(|e| Error::config(e.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntelligenceMetrics {
    pub emergencies_detected: u64,
    pub escalations_triggered: u64,
    pub priority_adjustments: u64,
    pub delivery_optimizations: u64,
    pub learning_iterations: u64,
    pub channel_effectiveness: BTreeMap<ChannelKind, f64>,
    pub model_accuracy: f64,
    pub prediction_confidence: f64,
    pub last_updated: Option<DateTime<Utc>>,
}

/// What the engine did with an alert.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Sent(SendOutcome),
    /// Scheduled for later delivery.
    Deferred(DeliveryPlan),
    Emergency {
        level: EmergencyLevel,
        incident_id: String,
        outcome: SendOutcome,
        escalation_id: Option<String>,
    },
}

/// Conditions worth an operator's attention, found by the periodic cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    HighFailureRate { failures: usize },
    MultipleEmergencies { incidents: usize },
}

pub struct IntelligenceEngine {
    config: IntelligenceConfig,
    timezone: Tz,
    manager: Arc<SmartNotificationManager>,
    escalation: Option<Arc<EscalationManager>>,
    probe: Option<Arc<dyn SystemProbe>>,
    detector: EmergencyDetector,
    priority: PriorityOptimizer,
    channels: ChannelIntelligence,
    delivery: DeliveryOptimizer,
    state: RwLock<SystemState>,
    learning: RwLock<LearningData>,
    metrics: RwLock<IntelligenceMetrics>,
    cancellation_token: CancellationToken,
}

impl IntelligenceEngine {
    pub fn new(
        config: IntelligenceConfig,
        manager: Arc<SmartNotificationManager>,
        escalation: Option<Arc<EscalationManager>>,
    ) -> Result<Self> {
        config.validate()?;
        let timezone = parse_timezone(&config.timezone)?;

        let detector = EmergencyDetector::new(config.emergency_detection, config.thresholds.clone());
        let priority = PriorityOptimizer::new(
            config.adaptation_rate,
            config.learning_enabled,
            config.confidence_threshold,
        );
        let channels = ChannelIntelligence::new(config.channel_profiles.clone(), config.learning_enabled);
        let delivery = DeliveryOptimizer::new(manager.quiet_hours().clone());

        info!(
            emergency_detection = config.emergency_detection,
            learning = config.learning_enabled,
            escalation = escalation.is_some() && config.escalation_enabled,
            timezone = %timezone,
            "Notification intelligence engine initialized"
        );

        Ok(Self {
            config,
            timezone,
            manager,
            escalation,
            probe: None,
            detector,
            priority,
            channels,
            delivery,
            state: RwLock::new(SystemState::default()),
            learning: RwLock::new(LearningData::new()),
            metrics: RwLock::new(IntelligenceMetrics::default()),
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Sample host health from `probe` on every state refresh.
    pub fn with_probe(mut self, probe: Arc<dyn SystemProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn config(&self) -> &IntelligenceConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<SmartNotificationManager> {
        &self.manager
    }

    pub async fn process(self: &Arc<Self>, alert_type: AlertType, data: Context) -> Result<ProcessOutcome> {
        self.process_at(alert_type, data, Utc::now()).await
    }

    /// Handle one alert with `now` as the decision time.
    ///
    /// `title`, `message` and `priority` are read from `data` when present.
    pub async fn process_at(
        self: &Arc<Self>,
        alert_type: AlertType,
        data: Context,
        now: DateTime<Utc>,
    ) -> Result<ProcessOutcome> {
        self.refresh_state_at(now);

        let title = data
            .text("title")
            .map(str::to_string)
            .unwrap_or_else(|| default_title(&alert_type));
        let message = data
            .text("message")
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} condition reported", alert_type));
        let requested = requested_priority(&data);

        let level = {
            let state = self.state.read();
            self.detector.detect_at(&state, &alert_type, &data, now)
        };

        if level > EmergencyLevel::None && level >= self.config.emergency_trigger_level {
            return self
                .handle_emergency(alert_type, data, title, message, level, now)
                .await;
        }

        let base = requested.max(level.to_priority());
        let observed = self.metrics.read().channel_effectiveness.clone();
        let candidates = self.manager.transport().enabled_channels();
        let state = self.state.read().clone();

        let (priority, channels, plan) = {
            let learning = self.learning.read();
            let mut ctx = DecisionContext {
                alert_type: &alert_type,
                priority: base,
                data: &data,
                state: &state,
                learning: &learning,
                now,
                timezone: self.timezone,
            };

            if self.config.priority_optimization {
                ctx.priority = self.priority.optimize(&ctx).priority;
            }
            let channels = if self.config.channel_intelligence {
                self.channels.select(&ctx, &candidates, &observed)
            } else {
                Vec::new()
            };
            let plan = self
                .config
                .delivery_optimization
                .then(|| self.delivery.plan(&ctx));
            (ctx.priority, channels, plan)
        };

        if priority != base {
            self.metrics.write().priority_adjustments += 1;
        }

        let notification = Notification::builder(alert_type, title, message)
            .priority(priority)
            .with_context(data)
            .channels(channels)
            .timestamp(now)
            .build();

        if let Some(plan) = plan.filter(|p| p.delay) {
            self.metrics.write().delivery_optimizations += 1;
            info!(
                alert_type = %notification.alert_type,
                delay_secs = plan.estimated_delay_secs,
                reason = %plan.reason,
                "Notification deferred"
            );
            self.schedule_deferred(notification, &plan, now);
            return Ok(ProcessOutcome::Deferred(plan));
        }

        self.send_and_learn(notification, now)
            .await
            .map(ProcessOutcome::Sent)
    }

    async fn handle_emergency(
        &self,
        alert_type: AlertType,
        data: Context,
        title: String,
        message: String,
        level: EmergencyLevel,
        now: DateTime<Utc>,
    ) -> Result<ProcessOutcome> {
        let incident_id = format!("emergency_{}", Uuid::new_v4().simple());
        error!(
            incident_id = %incident_id,
            alert_type = %alert_type,
            level = %level,
            "Emergency detected, bypassing normal dispatch"
        );

        {
            let mut state = self.state.write();
            state.active_incidents.push(ActiveIncident {
                id: incident_id.clone(),
                incident_type: alert_type.to_string(),
                severity: level,
                start_time: now,
                description: title.clone(),
                affected_systems: vec!["notification_system".to_string()],
                escalated: false,
                context: data.clone(),
            });
            state.emergency_level = state.emergency_level.max(level);
        }
        self.metrics.write().emergencies_detected += 1;

        let notification = Notification::builder(alert_type.clone(), title.clone(), message.clone())
            .priority(NotificationPriority::Emergency)
            .with_context(data.clone())
            .context("emergency_level", level.as_str())
            .context("emergency_detected_at", now)
            .timestamp(now)
            .build();

        let outcome = self.send_and_learn(notification, now).await?;

        // Any non-error outcome keeps the incident eligible, including a
        // repeat that the deduplicator absorbed.
        let mut escalation_id = None;
        if let (Some(escalation), true) = (&self.escalation, self.config.escalation_enabled) {
            let request = EscalationRequest {
                incident_id: incident_id.clone(),
                alert_type,
                severity: level,
                title,
                message,
                context: data,
            };
            match escalation.trigger_and_send_at(request, now).await {
                Ok(Some(id)) => {
                    self.metrics.write().escalations_triggered += 1;
                    if let Some(incident) = self
                        .state
                        .write()
                        .active_incidents
                        .iter_mut()
                        .find(|i| i.id == incident_id)
                    {
                        incident.escalated = true;
                    }
                    escalation_id = Some(id);
                }
                Ok(None) => {}
                Err(e) => warn!(incident_id = %incident_id, error = %e, "Failed to start escalation"),
            }
        }

        Ok(ProcessOutcome::Emergency {
            level,
            incident_id,
            outcome,
            escalation_id,
        })
    }

    async fn send_and_learn(&self, notification: Notification, now: DateTime<Utc>) -> Result<SendOutcome> {
        let started = Instant::now();
        let result = self
            .manager
            .send_notification_at(notification.clone(), now)
            .await;
        let elapsed = started.elapsed();

        match &result {
            Ok(SendOutcome::Delivered { channels }) => {
                self.learn(&notification, channels, true, elapsed, now)
            }
            Err(_) => self.learn(&notification, &notification.channels, false, elapsed, now),
            Ok(_) => {}
        }
        result
    }

    fn schedule_deferred(self: &Arc<Self>, notification: Notification, plan: &DeliveryPlan, now: DateTime<Utc>) {
        let engine = Arc::clone(self);
        let token = self.cancellation_token.child_token();
        let delay = (plan.optimal_time - now).to_std().unwrap_or(Duration::ZERO);

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    warn!(title = %notification.title, "Deferred notification aborted by shutdown");
                }
                _ = tokio::time::sleep(delay) => {
                    match engine.send_and_learn(notification, Utc::now()).await {
                        Ok(outcome) => debug!(?outcome, "Deferred notification processed"),
                        Err(e) => error!(error = %e, "Failed to send deferred notification"),
                    }
                }
            }
        });
    }

    fn learn(
        &self,
        notification: &Notification,
        channels: &[ChannelKind],
        success: bool,
        elapsed: Duration,
        now: DateTime<Utc>,
    ) {
        if !self.config.learning_enabled {
            return;
        }
        let pattern = NotificationPattern {
            alert_type: notification.alert_type.clone(),
            priority: notification.priority,
            channels: channels.to_vec(),
            hour: now.with_timezone(&self.timezone).hour(),
            success,
            effectiveness: effectiveness_score(success, elapsed),
            processing_ms: elapsed.as_secs_f64() * 1000.0,
            seen_at: now,
            context: notification.context.clone(),
        };

        let mut learning = self.learning.write();
        learning.record(pattern, self.config.max_patterns);
        if learning.patterns_for(&notification.alert_type).count() >= self.config.min_samples_for_learning {
            learning.retrain_at(now, self.config.min_samples_for_learning);
        }
    }

    /// Bring the state snapshot up to date with `now`.
    pub fn refresh_state_at(&self, now: DateTime<Utc>) {
        let sample = self.probe.as_ref().map(|probe| probe.sample());
        let retention = TimeDelta::seconds(self.config.record_retention_secs as i64);

        let mut state = self.state.write();
        if let Some(mut health) = sample {
            // Temperature comes from the caller, not the probe.
            if let Some(previous) = &state.system_health {
                health.temperature = previous.temperature;
            }
            health.last_check = Some(now);
            state.system_health = Some(health);
        }
        state.timestamp = Some(now);
        state.business_hours = is_business_hours(now, self.timezone);
        state.expire_maintenance_at(now);
        let removed = state.cleanup_at(now, retention);
        if removed > 0 {
            debug!(removed, "Expired incidents and failures dropped");
        }
        state.emergency_level = state
            .active_incidents
            .iter()
            .map(|i| i.severity)
            .max()
            .unwrap_or_default();
    }

    pub fn run_intelligence_cycle(&self) -> Vec<Anomaly> {
        self.run_intelligence_cycle_at(Utc::now())
    }

    /// One periodic pass: refresh state, retrain when due, update metrics and
    /// report anomalies.
    pub fn run_intelligence_cycle_at(&self, now: DateTime<Utc>) -> Vec<Anomaly> {
        self.refresh_state_at(now);

        let mut retrained = false;
        if self.config.learning_enabled {
            let window = TimeDelta::seconds(self.config.learning_window_secs as i64);
            let mut learning = self.learning.write();
            let due = learning.last_training.is_none_or(|at| now - at >= window);
            if due && !learning.patterns.is_empty() {
                learning.retrain_at(now, self.config.min_samples_for_learning);
                retrained = true;
            }
        }

        let (effectiveness, accuracy, confidence) = {
            let learning = self.learning.read();
            (
                learning.channel_effectiveness(),
                learning.model_accuracy(),
                learning.prediction_confidence(),
            )
        };
        {
            let mut metrics = self.metrics.write();
            if retrained {
                metrics.learning_iterations += 1;
            }
            metrics.channel_effectiveness = effectiveness;
            metrics.model_accuracy = accuracy;
            metrics.prediction_confidence = confidence;
            metrics.last_updated = Some(now);
        }

        let (failures, severe) = {
            let state = self.state.read();
            (state.recent_failures.len(), state.severe_incident_count())
        };
        let mut anomalies = Vec::new();
        if failures > HIGH_FAILURE_COUNT {
            warn!(failures, "Anomaly: high failure rate");
            anomalies.push(Anomaly::HighFailureRate { failures });
        }
        if severe > MULTIPLE_EMERGENCY_COUNT {
            warn!(incidents = severe, "Anomaly: multiple concurrent emergencies");
            anomalies.push(Anomaly::MultipleEmergencies { incidents: severe });
        }
        anomalies
    }

    pub fn update_system_health(&self, mut health: SystemHealth) {
        health.last_check.get_or_insert_with(Utc::now);
        self.state.write().system_health = Some(health);
    }

    pub fn update_network_health(&self, mut health: NetworkHealth) {
        health.last_check.get_or_insert_with(Utc::now);
        self.state.write().network_health = Some(health);
    }

    pub fn record_failure(&self, failure: FailureRecord) {
        debug!(component = %failure.component, failure_type = %failure.failure_type, "Failure recorded");
        self.state.write().recent_failures.push(failure);
    }

    /// Add an externally detected incident. Returns its id.
    pub fn report_incident(&self, incident: ActiveIncident) -> String {
        let id = incident.id.clone();
        let mut state = self.state.write();
        state.emergency_level = state.emergency_level.max(incident.severity);
        state.active_incidents.push(incident);
        id
    }

    /// Remove an incident and cancel its escalation, if any.
    pub fn resolve_incident(&self, incident_id: &str) -> Result<()> {
        {
            let mut state = self.state.write();
            let before = state.active_incidents.len();
            state.active_incidents.retain(|i| i.id != incident_id);
            if state.active_incidents.len() == before {
                return Err(Error::not_found("Incident", incident_id));
            }
            state.emergency_level = state
                .active_incidents
                .iter()
                .map(|i| i.severity)
                .max()
                .unwrap_or_default();
        }

        if let Some(escalation) = &self.escalation
            && let Some(escalation_id) = escalation.active_for_incident(incident_id)
        {
            escalation.cancel(&escalation_id, "incident resolved")?;
        }
        info!(incident_id, "Incident resolved");
        Ok(())
    }

    /// Enter or leave maintenance. `duration` defaults to the configured length.
    pub fn set_maintenance_mode(&self, enabled: bool, duration: Option<Duration>) {
        let now = Utc::now();
        let duration = duration.unwrap_or(Duration::from_secs(self.config.maintenance_default_secs));
        let mut state = self.state.write();
        state.maintenance_mode = enabled;
        state.maintenance_until = if enabled {
            TimeDelta::from_std(duration).ok().map(|d| now + d)
        } else {
            None
        };
        info!(enabled, until = ?state.maintenance_until, "Maintenance mode changed");
    }

    pub fn set_user_presence(&self, presence: UserPresence) {
        self.state.write().user_presence = Some(presence);
    }

    pub fn record_user_response(&self, channel: ChannelKind, response_secs: f64) {
        self.record_user_response_at(channel, response_secs, Utc::now());
    }

    /// Feed an operator response into the behaviour model and the response history.
    pub fn record_user_response_at(&self, channel: ChannelKind, response_secs: f64, at: DateTime<Utc>) {
        let local = at.with_timezone(&self.timezone);
        self.learning
            .write()
            .record_user_response(local.weekday(), local.hour(), channel, response_secs);

        let mut state = self.state.write();
        let presence = state.user_presence.get_or_insert_with(UserPresence::default);
        presence.last_activity = Some(at);
        presence
            .response_history
            .get_or_insert_with(Default::default)
            .record(channel, response_secs, at);
    }

    pub fn acknowledge_escalation(&self, escalation_id: &str, acknowledged_by: &str) -> Result<EscalationRecord> {
        match &self.escalation {
            Some(escalation) => escalation.acknowledge(escalation_id, acknowledged_by),
            None => Err(Error::not_found("EscalationChain", escalation_id)),
        }
    }

    pub fn metrics(&self) -> IntelligenceMetrics {
        self.metrics.read().clone()
    }

    pub fn system_state(&self) -> SystemState {
        self.state.read().clone()
    }

    pub fn learning_data(&self) -> LearningData {
        self.learning.read().clone()
    }

    /// Spawn the periodic intelligence cycle.
    pub fn start(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let token = self.cancellation_token.clone();
        let period = Duration::from_secs(self.config.cycle_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Intelligence loop shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        engine.run_intelligence_cycle();
                    }
                }
            }
        });
    }

    /// Stop the cycle and abort deferred sends.
    pub fn stop(&self) {
        self.cancellation_token.cancel();
        info!("Notification intelligence engine stopped");
    }
}

/// Priority requested in the alert data, by name or level.
fn requested_priority(data: &Context) -> NotificationPriority {
    data.text("priority")
        .and_then(|p| p.parse().ok())
        .or_else(|| {
            data.number("priority")
                .map(|level| NotificationPriority::from_level(level.round() as i64))
        })
        .unwrap_or_default()
}

/// `interface_down` becomes `Interface Down Alert`.
fn default_title(alert_type: &AlertType) -> String {
    let words: Vec<String> = alert_type
        .as_str()
        .split('_')
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect();
    format!("{} Alert", words.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::escalation::EscalationConfig;
    use crate::notification::transport::{DeliveryReport, NotificationTransport};
    use crate::notification::SmartManagerConfig;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Notification>>);

    #[async_trait]
    impl NotificationTransport for Recorder {
        async fn send(&self, notification: &Notification) -> Result<DeliveryReport> {
            self.0.lock().push(notification.clone());
            let delivered = if notification.channels.is_empty() {
                ChannelKind::ALL.to_vec()
            } else {
                notification.channels.clone()
            };
            Ok(DeliveryReport {
                delivered,
                failed: Vec::new(),
            })
        }

        fn enabled_channels(&self) -> Vec<ChannelKind> {
            ChannelKind::ALL.to_vec()
        }
    }

    // 2024-05-01 is a Wednesday.
    fn wednesday(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    fn manager_config() -> SmartManagerConfig {
        SmartManagerConfig {
            deduplication_enabled: false,
            normal_cooldown_secs: 0,
            ..Default::default()
        }
    }

    fn engine_with(
        config: IntelligenceConfig,
        escalation: bool,
    ) -> (Arc<IntelligenceEngine>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let manager = Arc::new(SmartNotificationManager::new(manager_config(), recorder.clone()).unwrap());
        let escalation = escalation.then(|| Arc::new(EscalationManager::new(EscalationConfig::default(), recorder.clone())));
        let engine = IntelligenceEngine::new(config, manager, escalation).unwrap();
        (Arc::new(engine), recorder)
    }

    fn data(pairs: &[(&str, crate::notification::ContextValue)]) -> Context {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_config_validation() {
        assert!(IntelligenceConfig::default().validate().is_ok());

        let config = IntelligenceConfig {
            adaptation_rate: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = IntelligenceConfig {
            timezone: "Mars/Olympus".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = IntelligenceConfig {
            emergency_trigger_level: EmergencyLevel::None,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_title() {
        assert_eq!(default_title(&AlertType::InterfaceDown), "Interface Down Alert");
        assert_eq!(default_title(&AlertType::Thermal), "Thermal Alert");
    }

    #[test]
    fn test_requested_priority() {
        assert_eq!(requested_priority(&Context::new()), NotificationPriority::Normal);
        assert_eq!(
            requested_priority(&data(&[("priority", "high".into())])),
            NotificationPriority::High
        );
        assert_eq!(
            requested_priority(&data(&[("priority", (-5i64).into())])),
            NotificationPriority::Lowest
        );
    }

    #[tokio::test]
    async fn test_emergency_path_escalates() {
        let (engine, recorder) = engine_with(IntelligenceConfig::default(), true);
        let outcome = engine
            .process_at(
                AlertType::Thermal,
                data(&[("temperature", 91.0.into())]),
                wednesday(3),
            )
            .await
            .unwrap();

        let ProcessOutcome::Emergency {
            level,
            incident_id,
            outcome,
            escalation_id,
        } = outcome
        else {
            panic!("expected emergency outcome");
        };
        assert_eq!(level, EmergencyLevel::Critical);
        assert!(matches!(outcome, SendOutcome::Delivered { .. }));
        assert!(escalation_id.is_some());

        let sent = recorder.0.lock().clone();
        assert_eq!(sent[0].priority, NotificationPriority::Emergency);
        assert!(sent[0].channels.is_empty());
        assert_eq!(sent[0].context.text("emergency_level"), Some("critical"));

        let state = engine.system_state();
        assert_eq!(state.emergency_level, EmergencyLevel::Critical);
        let incident = state
            .active_incidents
            .iter()
            .find(|i| i.id == incident_id)
            .unwrap();
        assert!(incident.escalated);

        let metrics = engine.metrics();
        assert_eq!(metrics.emergencies_detected, 1);
        assert_eq!(metrics.escalations_triggered, 1);

        engine.resolve_incident(&incident_id).unwrap();
        assert!(engine.escalation.as_ref().unwrap().active_for_incident(&incident_id).is_none());
        assert!(engine.resolve_incident(&incident_id).is_err());
    }

    #[tokio::test]
    async fn test_normal_path_selects_channels() {
        let (engine, recorder) = engine_with(IntelligenceConfig::default(), false);
        let outcome = engine
            .process_at(
                AlertType::DataLimit,
                data(&[("title", "Data usage".into()), ("message", "80% used".into())]),
                wednesday(10),
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ProcessOutcome::Sent(SendOutcome::Delivered {
                channels: vec![ChannelKind::Email, ChannelKind::Pushover],
            })
        );
        let sent = recorder.0.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].title, "Data usage");
        assert_eq!(sent[0].priority, NotificationPriority::Normal);
        assert_eq!(engine.learning_data().patterns.len(), 1);
    }

    #[tokio::test]
    async fn test_low_level_emergency_below_trigger_raises_floor() {
        let config = IntelligenceConfig {
            emergency_trigger_level: EmergencyLevel::High,
            delivery_optimization: false,
            ..Default::default()
        };
        let (engine, recorder) = engine_with(config, false);
        // Usage at the cap is a Medium emergency.
        let outcome = engine
            .process_at(
                AlertType::DataLimit,
                data(&[("usage_percent", 100.0.into()), ("priority", "low".into())]),
                wednesday(10),
            )
            .await
            .unwrap();

        assert!(matches!(outcome, ProcessOutcome::Sent(SendOutcome::Delivered { .. })));
        assert_eq!(recorder.0.lock()[0].priority, NotificationPriority::High);
        assert_eq!(engine.metrics().emergencies_detected, 0);
    }

    struct FixedProbe(SystemHealth);

    impl SystemProbe for FixedProbe {
        fn sample(&self) -> SystemHealth {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn test_moderately_loaded_host_sends_normally() {
        let thresholds = EmergencyThresholds::default();
        let probe = FixedProbe(SystemHealth {
            memory_usage: thresholds.memory_usage * 0.6,
            disk_usage: thresholds.disk_usage * 0.6,
            ..Default::default()
        });
        let recorder = Arc::new(Recorder::default());
        let manager = Arc::new(SmartNotificationManager::new(manager_config(), recorder.clone()).unwrap());
        let escalation = Arc::new(EscalationManager::new(EscalationConfig::default(), recorder.clone()));
        let engine = Arc::new(
            IntelligenceEngine::new(IntelligenceConfig::default(), manager, Some(escalation))
                .unwrap()
                .with_probe(Arc::new(probe)),
        );

        // A second alert an hour later must not see incidents left by the first.
        for hour in [10, 11] {
            let outcome = engine
                .process_at(
                    AlertType::DataLimit,
                    data(&[
                        ("message", format!("usage report {}", hour).into()),
                        ("bypass_delivery_optimization", true.into()),
                    ]),
                    wednesday(hour),
                )
                .await
                .unwrap();
            assert!(
                matches!(outcome, ProcessOutcome::Sent(SendOutcome::Delivered { .. })),
                "unexpected outcome {:?}",
                outcome
            );
        }

        assert_eq!(engine.metrics().emergencies_detected, 0);
        assert!(engine.system_state().active_incidents.is_empty());
        assert_eq!(recorder.0.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_deferred_delivery() {
        let (engine, recorder) = engine_with(IntelligenceConfig::default(), false);
        let outcome = engine
            .process_at(AlertType::DataLimit, Context::new(), wednesday(8))
            .await
            .unwrap();

        let ProcessOutcome::Deferred(plan) = outcome else {
            panic!("expected deferred outcome");
        };
        assert_eq!(plan.optimal_time, wednesday(9));
        assert!(recorder.0.lock().is_empty());
        assert_eq!(engine.metrics().delivery_optimizations, 1);
        engine.stop();
    }

    #[tokio::test]
    async fn test_learning_retrains_after_min_samples() {
        let config = IntelligenceConfig {
            min_samples_for_learning: 2,
            ..Default::default()
        };
        let (engine, _recorder) = engine_with(config, false);
        for i in 0..2 {
            engine
                .process_at(
                    AlertType::DataLimit,
                    data(&[("message", format!("usage report {}", i).into())]),
                    wednesday(10),
                )
                .await
                .unwrap();
        }

        let learning = engine.learning_data();
        assert_eq!(learning.patterns.len(), 2);
        assert!(learning.weights.contains_key(&AlertType::DataLimit));
        assert!(learning.optimal_channels.contains_key(&AlertType::DataLimit));
    }

    #[test]
    fn test_cycle_reports_anomalies() {
        let (engine, _recorder) = engine_with(IntelligenceConfig::default(), false);
        let now = Utc::now();
        for i in 0..11 {
            engine.record_failure(FailureRecord::new(format!("wan{}", i), "link_down", now));
        }
        for i in 0..4 {
            engine.report_incident(ActiveIncident {
                id: format!("inc-{}", i),
                incident_type: "failover".to_string(),
                severity: EmergencyLevel::High,
                start_time: now,
                description: String::new(),
                affected_systems: Vec::new(),
                escalated: false,
                context: Context::new(),
            });
        }

        let anomalies = engine.run_intelligence_cycle_at(now);
        assert_eq!(
            anomalies,
            vec![
                Anomaly::HighFailureRate { failures: 11 },
                Anomaly::MultipleEmergencies { incidents: 4 },
            ]
        );
        assert_eq!(engine.metrics().last_updated, Some(now));
        assert_eq!(engine.system_state().emergency_level, EmergencyLevel::High);
    }

    #[test]
    fn test_operator_inputs() {
        let (engine, _recorder) = engine_with(IntelligenceConfig::default(), false);

        engine.set_maintenance_mode(true, Some(Duration::from_secs(600)));
        let state = engine.system_state();
        assert!(state.maintenance_mode);
        assert!(state.maintenance_until.is_some());
        engine.set_maintenance_mode(false, None);
        assert!(engine.system_state().maintenance_until.is_none());

        engine.record_user_response_at(ChannelKind::Pushover, 45.0, wednesday(11));
        let state = engine.system_state();
        let history = state.response_history().unwrap();
        assert_eq!(history.responses[&ChannelKind::Pushover], 1);
        assert_eq!(engine.learning_data().user_behavior.len(), 1);

        assert!(engine.acknowledge_escalation("missing", "ops").is_err());
    }
}

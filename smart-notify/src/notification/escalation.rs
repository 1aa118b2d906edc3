//! Timed multi-level escalation of emergency incidents.
//!
//! Each incident gets an [`EscalationChain`] that notifies increasingly senior
//! contacts until someone acknowledges it, it is cancelled, or it times out at
//! its highest level. Finished chains are archived as [`EscalationRecord`]s.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::model::{AlertType, ChannelKind, Context, EmergencyLevel, Notification, NotificationPriority};
use super::transport::NotificationTransport;
use crate::{Error, Result};

/// One step of an escalation chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationContact {
    pub level: u32,
    pub name: String,
    pub channels: Vec<ChannelKind>,
    pub response_timeout_secs: u64,
}

impl EscalationContact {
    pub fn new(level: u32, name: &str, channels: &[ChannelKind], response_timeout_secs: u64) -> Self {
        Self {
            level,
            name: name.to_string(),
            channels: channels.to_vec(),
            response_timeout_secs,
        }
    }
}

/// Escalation manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    pub enabled: bool,
    /// Delay before level 2; later levels wait `first_delay_secs * level`.
    pub first_delay_secs: u64,
    pub tick_interval_secs: u64,
    /// How long a chain may sit at its top level before it is completed.
    pub cooldown_secs: u64,
    pub max_level: u32,
    pub max_history: usize,
    pub send_timeout_secs: u64,
    /// Ordered contacts, one per level.
    pub contacts: Vec<EscalationContact>,
    /// Extra top-level contact appended for critical incidents.
    pub critical_contact: Option<EscalationContact>,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        use ChannelKind::*;
        Self {
            enabled: true,
            first_delay_secs: 300,
            tick_interval_secs: 30,
            cooldown_secs: 900,
            max_level: 3,
            max_history: 100,
            send_timeout_secs: 30,
            contacts: vec![
                EscalationContact::new(1, "On-Call Engineer", &[Pushover, Slack], 300),
                EscalationContact::new(2, "Team Lead", &[Pushover, Email, Slack], 600),
                EscalationContact::new(3, "Engineering Manager", &[Pushover, Email, Slack, Telegram], 900),
            ],
            critical_contact: Some(EscalationContact::new(
                4,
                "VP Engineering",
                &[Pushover, Email, Telegram],
                1200,
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    Active,
    /// Acknowledged; no further levels are contacted.
    Paused,
    Completed,
    Cancelled,
}

impl EscalationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Input for starting an escalation.
#[derive(Debug, Clone)]
pub struct EscalationRequest {
    pub incident_id: String,
    pub alert_type: AlertType,
    pub severity: EmergencyLevel,
    pub title: String,
    pub message: String,
    pub context: Context,
}

/// An active escalation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationChain {
    pub id: String,
    pub incident_id: String,
    pub alert_type: AlertType,
    pub severity: EmergencyLevel,
    pub title: String,
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub current_level: u32,
    pub max_level: u32,
    pub next_escalation: DateTime<Utc>,
    pub contacts: Vec<EscalationContact>,
    pub status: EscalationStatus,
    pub context: Context,
    /// Set when the next level has no contact; the chain waits for timeout.
    pub stalled: bool,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl EscalationChain {
    fn contact(&self, level: u32) -> Option<&EscalationContact> {
        self.contacts.iter().find(|c| c.level == level)
    }
}

/// Archived escalation outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub id: String,
    pub incident_id: String,
    pub alert_type: AlertType,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: i64,
    pub max_level_reached: u32,
    pub total_contacts: usize,
    pub response_time_secs: i64,
    pub status: EscalationStatus,
    pub acknowledged_by: Option<String>,
    pub effectiveness: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EscalationStats {
    pub active_escalations: usize,
    pub total_escalations: u64,
    pub completed: u64,
    pub acknowledged: u64,
    pub cancelled: u64,
    pub average_response_time_secs: f64,
    pub average_effectiveness: f64,
}

/// Score in `[0, 1]` for how well an escalation went.
pub fn escalation_effectiveness(
    status: EscalationStatus,
    final_level: u32,
    response_time: TimeDelta,
) -> f64 {
    let mut effectiveness = 1.0;

    if response_time > TimeDelta::minutes(30) {
        effectiveness *= 0.3;
    } else if response_time > TimeDelta::minutes(15) {
        effectiveness *= 0.6;
    } else if response_time > TimeDelta::minutes(5) {
        effectiveness *= 0.8;
    }

    if status == EscalationStatus::Cancelled {
        effectiveness *= 0.2;
    }

    if final_level > 2 {
        effectiveness *= 0.7;
    }

    effectiveness
}

fn escalation_notification(chain: &EscalationChain, contact: &EscalationContact, now: DateTime<Utc>) -> Notification {
    let elapsed = (now - chain.started_at).num_seconds().max(0);
    let mut message = format!(
        "EMERGENCY ESCALATION - Level {level}/{max}\n\n\
         Incident: {incident}\n\
         Alert type: {alert}\n\
         Duration: {mins}m {secs}s\n\
         Escalated to: {name}\n\
         Response required within: {timeout} min\n\n\
         {title}\n{body}\n\n\
         To acknowledge: ACK {id}",
        level = contact.level,
        max = chain.max_level,
        incident = chain.incident_id,
        alert = chain.alert_type,
        mins = elapsed / 60,
        secs = elapsed % 60,
        name = contact.name,
        timeout = contact.response_timeout_secs / 60,
        title = chain.title,
        body = chain.message,
        id = chain.id,
    );
    if !chain.context.is_empty() {
        message.push_str("\n\nContext:");
        for (key, value) in &chain.context {
            message.push_str(&format!("\n- {}: {}", key, value));
        }
    }

    Notification::builder(
        chain.alert_type.clone(),
        format!("🚨 ESCALATION LEVEL {}: {}", contact.level, chain.alert_type),
        message,
    )
    .priority(NotificationPriority::Emergency)
    .timestamp(now)
    .with_context(chain.context.clone())
    .context("escalation_id", chain.id.as_str())
    .context("incident_id", chain.incident_id.as_str())
    .context("escalation_level", contact.level)
    .context("contact_name", contact.name.as_str())
    .channels(contact.channels.iter().copied())
    .build()
}

/// Owner of all escalation chains.
pub struct EscalationManager {
    config: EscalationConfig,
    transport: Arc<dyn NotificationTransport>,
    active: DashMap<String, EscalationChain>,
    /// incident id -> escalation id of its active chain
    by_incident: DashMap<String, String>,
    history: Mutex<VecDeque<EscalationRecord>>,
    total: AtomicU64,
    cancellation_token: CancellationToken,
}

impl EscalationManager {
    pub fn new(config: EscalationConfig, transport: Arc<dyn NotificationTransport>) -> Self {
        Self {
            config,
            transport,
            active: DashMap::new(),
            by_incident: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            total: AtomicU64::new(0),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &EscalationConfig {
        &self.config
    }

    /// Start an escalation and deliver its first level.
    ///
    /// Returns the chain id, or `None` when escalation is disabled or the
    /// incident is already escalating.
    pub async fn trigger(&self, request: EscalationRequest) -> Result<Option<String>> {
        self.trigger_and_send_at(request, Utc::now()).await
    }

    /// [`trigger`](Self::trigger) with `now` as the start time.
    pub async fn trigger_and_send_at(
        &self,
        request: EscalationRequest,
        now: DateTime<Utc>,
    ) -> Result<Option<String>> {
        match self.trigger_at(request, now)? {
            Some((id, notification)) => {
                self.deliver(&notification).await;
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    /// Create the chain and return the level-1 notification without sending it.
    pub fn trigger_at(
        &self,
        request: EscalationRequest,
        now: DateTime<Utc>,
    ) -> Result<Option<(String, Notification)>> {
        if !self.config.enabled {
            return Ok(None);
        }
        let mut contacts = self.config.contacts.clone();
        let mut max_level = self.config.max_level;
        if request.severity >= EmergencyLevel::Critical
            && let Some(critical) = &self.config.critical_contact
        {
            let mut critical = critical.clone();
            critical.level = max_level + 1;
            contacts.push(critical);
            max_level += 1;
        }

        let chain = EscalationChain {
            id: format!("esc_{}_{}", request.incident_id, now.timestamp_millis()),
            incident_id: request.incident_id,
            alert_type: request.alert_type,
            severity: request.severity,
            title: request.title,
            message: request.message,
            started_at: now,
            current_level: 1,
            max_level,
            next_escalation: now + TimeDelta::seconds(self.config.first_delay_secs as i64),
            contacts,
            status: EscalationStatus::Active,
            context: request.context,
            stalled: false,
            acknowledged_by: None,
            acknowledged_at: None,
        };

        let contact = chain.contact(1).cloned().ok_or_else(|| {
            Error::config("escalation contact list has no level 1 contact")
        })?;
        let notification = escalation_notification(&chain, &contact, now);
        let id = chain.id.clone();

        // At most one active chain per incident.
        match self.by_incident.entry(chain.incident_id.clone()) {
            Entry::Occupied(existing) => {
                debug!(
                    incident_id = %chain.incident_id,
                    escalation_id = %existing.get(),
                    "Escalation already active for incident"
                );
                return Ok(None);
            }
            Entry::Vacant(slot) => {
                slot.insert(id.clone());
            }
        }

        info!(
            escalation_id = %id,
            incident_id = %chain.incident_id,
            alert_type = %chain.alert_type,
            severity = %chain.severity,
            contacts = chain.contacts.len(),
            "Emergency escalation triggered"
        );

        self.active.insert(id.clone(), chain);
        self.total.fetch_add(1, Ordering::Relaxed);
        Ok(Some((id, notification)))
    }

    /// Advance due chains and time out finished ones.
    ///
    /// Returns the notifications for newly reached levels; the caller sends them.
    pub fn process_escalations_at(&self, now: DateTime<Utc>) -> Vec<Notification> {
        let mut notifications = Vec::new();
        let mut timed_out = Vec::new();
        let cooldown = TimeDelta::seconds(self.config.cooldown_secs as i64);

        for mut entry in self.active.iter_mut() {
            let chain = entry.value_mut();
            if chain.status != EscalationStatus::Active {
                continue;
            }

            if !chain.stalled && chain.current_level < chain.max_level && now >= chain.next_escalation {
                let next_level = chain.current_level + 1;
                match chain.contact(next_level).cloned() {
                    Some(contact) => {
                        chain.current_level = next_level;
                        chain.next_escalation = now
                            + TimeDelta::seconds((self.config.first_delay_secs * next_level as u64) as i64);
                        info!(
                            escalation_id = %chain.id,
                            new_level = next_level,
                            max_level = chain.max_level,
                            contact = %contact.name,
                            "Escalating to next level"
                        );
                        notifications.push(escalation_notification(chain, &contact, now));
                    }
                    None => {
                        error!(
                            escalation_id = %chain.id,
                            level = next_level,
                            "No contact found for escalation level"
                        );
                        chain.stalled = true;
                    }
                }
            }

            if (chain.current_level >= chain.max_level || chain.stalled)
                && now - chain.started_at > cooldown
            {
                warn!(
                    escalation_id = %chain.id,
                    level = chain.current_level,
                    "Escalation reached its top level and timed out"
                );
                chain.status = EscalationStatus::Completed;
                timed_out.push(chain.id.clone());
            }
        }

        for id in timed_out {
            self.archive(&id, now);
        }
        notifications
    }

    /// One tick of the escalation loop.
    pub async fn tick(&self) {
        for notification in self.process_escalations_at(Utc::now()) {
            self.deliver(&notification).await;
        }
    }

    async fn deliver(&self, notification: &Notification) {
        let timeout = Duration::from_secs(self.config.send_timeout_secs);
        match tokio::time::timeout(timeout, self.transport.send(notification)).await {
            Ok(Ok(report)) => debug!(
                title = %notification.title,
                delivered = report.delivered.len(),
                "Escalation notification sent"
            ),
            Ok(Err(e)) => error!(title = %notification.title, error = %e, "Escalation notification failed"),
            Err(_) => error!(title = %notification.title, "Escalation notification timed out"),
        }
    }

    pub fn acknowledge(&self, escalation_id: &str, acknowledged_by: &str) -> Result<EscalationRecord> {
        self.acknowledge_at(escalation_id, acknowledged_by, Utc::now())
    }

    /// Stop escalating and archive the chain.
    pub fn acknowledge_at(
        &self,
        escalation_id: &str,
        acknowledged_by: &str,
        now: DateTime<Utc>,
    ) -> Result<EscalationRecord> {
        {
            let mut chain = self
                .active
                .get_mut(escalation_id)
                .ok_or_else(|| Error::not_found("EscalationChain", escalation_id))?;
            if chain.status != EscalationStatus::Active {
                return Err(Error::InvalidStateTransition {
                    from: chain.status.as_str().to_string(),
                    to: EscalationStatus::Paused.as_str().to_string(),
                });
            }
            chain.status = EscalationStatus::Paused;
            chain.acknowledged_by = Some(acknowledged_by.to_string());
            chain.acknowledged_at = Some(now);
            info!(
                escalation_id,
                acknowledged_by,
                elapsed_secs = (now - chain.started_at).num_seconds(),
                "Escalation acknowledged"
            );
        }
        self.archive(escalation_id, now)
            .ok_or_else(|| Error::not_found("EscalationChain", escalation_id))
    }

    pub fn cancel(&self, escalation_id: &str, reason: &str) -> Result<EscalationRecord> {
        self.cancel_at(escalation_id, reason, Utc::now())
    }

    pub fn cancel_at(
        &self,
        escalation_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<EscalationRecord> {
        {
            let mut chain = self
                .active
                .get_mut(escalation_id)
                .ok_or_else(|| Error::not_found("EscalationChain", escalation_id))?;
            chain.status = EscalationStatus::Cancelled;
            info!(escalation_id, reason, "Escalation cancelled");
        }
        self.archive(escalation_id, now)
            .ok_or_else(|| Error::not_found("EscalationChain", escalation_id))
    }

    /// Id of the active chain for `incident_id`, if any.
    pub fn active_for_incident(&self, incident_id: &str) -> Option<String> {
        self.by_incident
            .get(incident_id)
            .map(|entry| entry.value().clone())
    }

    fn archive(&self, escalation_id: &str, now: DateTime<Utc>) -> Option<EscalationRecord> {
        let (_, chain) = self.active.remove(escalation_id)?;
        self.by_incident
            .remove_if(&chain.incident_id, |_, id| id == escalation_id);

        let response_time = chain.acknowledged_at.unwrap_or(now) - chain.started_at;
        let record = EscalationRecord {
            id: chain.id,
            incident_id: chain.incident_id,
            alert_type: chain.alert_type,
            started_at: chain.started_at,
            ended_at: now,
            duration_secs: (now - chain.started_at).num_seconds(),
            max_level_reached: chain.current_level,
            total_contacts: chain.contacts.len(),
            response_time_secs: response_time.num_seconds(),
            status: chain.status,
            acknowledged_by: chain.acknowledged_by,
            effectiveness: escalation_effectiveness(chain.status, chain.current_level, response_time),
        };

        let mut history = self.history.lock();
        history.push_back(record.clone());
        while history.len() > self.config.max_history {
            history.pop_front();
        }
        Some(record)
    }

    pub fn active_escalations(&self) -> Vec<EscalationChain> {
        self.active.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Most recent `limit` records, oldest first. Zero means all.
    pub fn history(&self, limit: usize) -> Vec<EscalationRecord> {
        let history = self.history.lock();
        let limit = if limit == 0 { history.len() } else { limit.min(history.len()) };
        history.iter().skip(history.len() - limit).cloned().collect()
    }

    pub fn stats(&self) -> EscalationStats {
        let active_escalations = self.active.len();
        let history = self.history.lock();
        let count = history.len();

        let mut stats = EscalationStats {
            active_escalations,
            total_escalations: self.total.load(Ordering::Relaxed),
            ..Default::default()
        };
        for record in history.iter() {
            match record.status {
                EscalationStatus::Completed => stats.completed += 1,
                EscalationStatus::Paused => stats.acknowledged += 1,
                EscalationStatus::Cancelled => stats.cancelled += 1,
                EscalationStatus::Active => {}
            }
        }
        if count > 0 {
            stats.average_response_time_secs =
                history.iter().map(|r| r.response_time_secs as f64).sum::<f64>() / count as f64;
            stats.average_effectiveness =
                history.iter().map(|r| r.effectiveness).sum::<f64>() / count as f64;
        }
        stats
    }

    /// Spawn the escalation ticker.
    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            return;
        }
        let manager = Arc::clone(self);
        let token = self.cancellation_token.clone();
        let period = Duration::from_secs(self.config.tick_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Escalation loop shutting down");
                        break;
                    }
                    _ = ticker.tick() => manager.tick().await,
                }
            }
        });
    }

    pub fn stop(&self) {
        self.cancellation_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::transport::DeliveryReport;
    use async_trait::async_trait;

    struct Recorder(Mutex<Vec<Notification>>);

    #[async_trait]
    impl NotificationTransport for Recorder {
        async fn send(&self, notification: &Notification) -> Result<DeliveryReport> {
            self.0.lock().push(notification.clone());
            Ok(DeliveryReport {
                delivered: notification.channels.clone(),
                failed: Vec::new(),
            })
        }

        fn enabled_channels(&self) -> Vec<ChannelKind> {
            ChannelKind::ALL.to_vec()
        }
    }

    fn manager(config: EscalationConfig) -> (EscalationManager, Arc<Recorder>) {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        (EscalationManager::new(config, recorder.clone()), recorder)
    }

    fn request(severity: EmergencyLevel) -> EscalationRequest {
        EscalationRequest {
            incident_id: "inc_1".to_string(),
            alert_type: AlertType::Failover,
            severity,
            title: "All uplinks down".to_string(),
            message: "starlink and wwan0 unreachable".to_string(),
            context: Context::new(),
        }
    }

    #[test]
    fn test_progression_and_acknowledge() {
        let (manager, _) = manager(EscalationConfig::default());
        let t0 = Utc::now();
        let (id, first) = manager.trigger_at(request(EmergencyLevel::High), t0).unwrap().unwrap();
        assert_eq!(first.title, "🚨 ESCALATION LEVEL 1: failover");
        assert_eq!(first.priority, NotificationPriority::Emergency);
        assert_eq!(first.channels, vec![ChannelKind::Pushover, ChannelKind::Slack]);

        assert!(manager.process_escalations_at(t0 + TimeDelta::minutes(4)).is_empty());

        let sent = manager.process_escalations_at(t0 + TimeDelta::minutes(5));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].title, "🚨 ESCALATION LEVEL 2: failover");
        assert_eq!(manager.active_escalations()[0].current_level, 2);

        let record = manager
            .acknowledge_at(&id, "alice", t0 + TimeDelta::minutes(6))
            .unwrap();
        assert_eq!(record.status, EscalationStatus::Paused);
        assert_eq!(record.max_level_reached, 2);
        assert!((record.effectiveness - 0.8).abs() < 1e-9);

        assert!(manager.process_escalations_at(t0 + TimeDelta::hours(1)).is_empty());
        assert!(manager.active_escalations().is_empty());
        assert!(matches!(
            manager.acknowledge_at(&id, "bob", t0 + TimeDelta::hours(1)),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_backoff_grows_with_level() {
        let (manager, _) = manager(EscalationConfig::default());
        let t0 = Utc::now();
        manager.trigger_at(request(EmergencyLevel::High), t0).unwrap();

        let t1 = t0 + TimeDelta::minutes(5);
        assert_eq!(manager.process_escalations_at(t1).len(), 1);
        // Level 3 is due 10 minutes after reaching level 2.
        assert!(manager.process_escalations_at(t1 + TimeDelta::minutes(9)).is_empty());
        assert_eq!(manager.process_escalations_at(t1 + TimeDelta::minutes(10)).len(), 1);
        assert_eq!(manager.active_escalations()[0].current_level, 3);
    }

    #[test]
    fn test_timeout_completes_chain() {
        let (manager, _) = manager(EscalationConfig::default());
        let t0 = Utc::now();
        manager.trigger_at(request(EmergencyLevel::High), t0).unwrap();
        manager.process_escalations_at(t0 + TimeDelta::minutes(5));
        manager.process_escalations_at(t0 + TimeDelta::minutes(15));

        manager.process_escalations_at(t0 + TimeDelta::minutes(16));
        assert!(manager.active_escalations().is_empty());

        let stats = manager.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.total_escalations, 1);
        // 16 minutes without acknowledgment at level 3.
        assert!((stats.average_effectiveness - 0.6 * 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_critical_adds_top_contact() {
        let (manager, _) = manager(EscalationConfig::default());
        let t0 = Utc::now();
        manager.trigger_at(request(EmergencyLevel::Critical), t0).unwrap();
        let active = manager.active_escalations();
        let chain = &active[0];
        assert_eq!(chain.max_level, 4);
        assert_eq!(chain.contacts.last().unwrap().name, "VP Engineering");
    }

    #[test]
    fn test_missing_contact_stalls() {
        let mut config = EscalationConfig::default();
        config.contacts.truncate(1);
        let (manager, _) = manager(config);
        let t0 = Utc::now();
        manager.trigger_at(request(EmergencyLevel::High), t0).unwrap();

        assert!(manager.process_escalations_at(t0 + TimeDelta::minutes(5)).is_empty());
        let active = manager.active_escalations();
        let chain = &active[0];
        assert_eq!(chain.current_level, 1);
        assert!(chain.stalled);

        manager.process_escalations_at(t0 + TimeDelta::minutes(16));
        assert!(manager.active_escalations().is_empty());
    }

    #[test]
    fn test_duplicate_incident_and_cancel() {
        let (manager, _) = manager(EscalationConfig::default());
        let t0 = Utc::now();
        let (id, _) = manager.trigger_at(request(EmergencyLevel::High), t0).unwrap().unwrap();
        assert!(manager.trigger_at(request(EmergencyLevel::High), t0).unwrap().is_none());

        let record = manager.cancel_at(&id, "resolved", t0 + TimeDelta::minutes(1)).unwrap();
        assert_eq!(record.status, EscalationStatus::Cancelled);
        assert!((record.effectiveness - 0.2).abs() < 1e-9);
        assert_eq!(manager.history(0).len(), 1);
    }

    #[test]
    fn test_concurrent_triggers_start_one_chain() {
        let (manager, _) = manager(EscalationConfig::default());
        let t0 = Utc::now();

        let started: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        manager
                            .trigger_at(request(EmergencyLevel::High), t0)
                            .unwrap()
                            .is_some()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap() as usize)
                .sum()
        });
        assert_eq!(started, 1);
        assert_eq!(manager.active_escalations().len(), 1);

        let id = manager.active_for_incident("inc_1").unwrap();
        manager.cancel_at(&id, "resolved", t0).unwrap();
        assert!(manager.active_for_incident("inc_1").is_none());
        assert!(manager.trigger_at(request(EmergencyLevel::High), t0).unwrap().is_some());
    }

    #[test]
    fn test_disabled_does_nothing() {
        let (manager, _) = manager(EscalationConfig {
            enabled: false,
            ..Default::default()
        });
        assert!(manager.trigger_at(request(EmergencyLevel::Critical), Utc::now()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_trigger_sends_first_level() {
        let (manager, recorder) = manager(EscalationConfig::default());
        let id = manager.trigger(request(EmergencyLevel::High)).await.unwrap();
        assert!(id.is_some());
        assert_eq!(recorder.0.lock().len(), 1);
    }

    #[test]
    fn test_effectiveness_penalties() {
        let e = escalation_effectiveness(EscalationStatus::Paused, 1, TimeDelta::minutes(2));
        assert_eq!(e, 1.0);
        let e = escalation_effectiveness(EscalationStatus::Paused, 3, TimeDelta::minutes(40));
        assert!((e - 0.3 * 0.7).abs() < 1e-9);
    }
}

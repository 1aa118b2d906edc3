//! Context-aware notification decisions.
//!
//! This module provides:
//! - The system state snapshot and learned preferences
//! - Emergency detection
//! - Priority, channel and delivery-time optimization
//! - Host sampling
//! - The [`IntelligenceEngine`] that applies all of the above before
//!   handing notifications to the smart manager

pub mod channel;
pub mod delivery;
pub mod emergency;
pub mod engine;
pub mod learning;
pub mod priority;
pub mod probe;
pub mod state;

pub use channel::{ChannelIntelligence, ChannelProfile, ChannelScore};
pub use delivery::{DeliveryOptimizer, DeliveryPlan};
pub use emergency::{EmergencyDetector, EmergencyThresholds};
pub use engine::{Anomaly, IntelligenceConfig, IntelligenceEngine, IntelligenceMetrics, ProcessOutcome};
pub use learning::LearningData;
pub use priority::{PriorityDecision, PriorityOptimizer};
pub use probe::{SysinfoProbe, SystemProbe};
pub use state::{
    ActiveIncident, FailureRecord, NetworkHealth, SystemHealth, SystemState, UserPresence,
};

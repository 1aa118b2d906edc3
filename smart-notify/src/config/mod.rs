//! Daemon configuration.
//!
//! Resolution order (highest priority first):
//! 1. Environment variables (`SMART_NOTIFY_*`)
//! 2. The JSON config file, when given and present
//! 3. Compiled defaults

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::intelligence::IntelligenceConfig;
use crate::logging::LogFormat;
use crate::notification::transport::CircuitBreakerConfig;
use crate::notification::{ChannelConfig, EscalationConfig, SmartManagerConfig};
use crate::{Error, Result};

pub const ENV_LOG_DIR: &str = "SMART_NOTIFY_LOG_DIR";
/// `true`/`false` to toggle, or `HH:MM-HH:MM` to enable with a window.
pub const ENV_QUIET_HOURS: &str = "SMART_NOTIFY_QUIET_HOURS";
pub const ENV_TIMEZONE: &str = "SMART_NOTIFY_TIMEZONE";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub manager: SmartManagerConfig,
    pub intelligence: IntelligenceConfig,
    pub escalation: EscalationConfig,
    pub channels: Vec<ChannelConfig>,
    pub circuit_breaker: CircuitBreakerConfig,
    pub log_dir: String,
    pub log_format: LogFormat,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            manager: SmartManagerConfig::default(),
            intelligence: IntelligenceConfig::default(),
            escalation: EscalationConfig::default(),
            channels: Vec::new(),
            circuit_breaker: CircuitBreakerConfig::default(),
            log_dir: "logs".to_string(),
            log_format: LogFormat::default(),
        }
    }
}

impl AppConfig {
    /// Load, apply environment overrides and validate.
    ///
    /// A missing file yields the defaults; an unreadable or malformed one is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)?;
                let config = Self::from_json(&raw)?;
                info!(path = %path.display(), "Configuration loaded");
                config
            }
            Some(path) => {
                debug!(path = %path.display(), "Config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::config(format!("Invalid config: {}", e)))
    }

    /// Apply `SMART_NOTIFY_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_LOG_DIR).filter(|d| !d.trim().is_empty()) {
            self.log_dir = dir;
        }

        if let Some(value) = lookup(ENV_QUIET_HOURS) {
            let value = value.trim();
            match value.to_ascii_lowercase().as_str() {
                "true" | "1" | "on" => self.manager.quiet_hours = true,
                "false" | "0" | "off" => self.manager.quiet_hours = false,
                _ => {
                    let (start, end) = value.split_once('-').ok_or_else(|| {
                        Error::config(format!(
                            "{} must be a boolean or HH:MM-HH:MM, got '{}'",
                            ENV_QUIET_HOURS, value
                        ))
                    })?;
                    self.manager.quiet_hours = true;
                    self.manager.quiet_hours_start = start.trim().to_string();
                    self.manager.quiet_hours_end = end.trim().to_string();
                }
            }
        }

        if let Some(tz) = lookup(ENV_TIMEZONE).filter(|t| !t.trim().is_empty()) {
            let tz = tz.trim().to_string();
            self.manager.timezone = tz.clone();
            self.intelligence.timezone = tz;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.manager.validate()?;
        self.intelligence.validate()?;
        if self.escalation.first_delay_secs == 0 {
            return Err(Error::config("escalation.first_delay_secs must be positive"));
        }
        if self.log_dir.trim().is_empty() {
            return Err(Error::config("log_dir must not be empty"));
        }
        Ok(())
    }

    /// Escalation settings with the intelligence-level switches applied.
    pub fn effective_escalation(&self) -> EscalationConfig {
        EscalationConfig {
            enabled: self.escalation.enabled && self.intelligence.escalation_enabled,
            max_level: self.intelligence.max_escalation_level,
            cooldown_secs: self.intelligence.escalation_cooldown_secs,
            ..self.escalation.clone()
        }
    }
}

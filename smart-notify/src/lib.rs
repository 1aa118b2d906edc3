//! smart-notify library crate.
//!
//! Notification dispatch with deduplication, adaptive rate limiting,
//! suppression and escalation, plus an intelligence layer that adapts
//! priority, channels and timing to the current system state.

pub mod config;
pub mod error;
pub mod intelligence;
pub mod logging;
pub mod notification;

pub use error::{Error, Result};

//! Huddle Core - Shared types, configuration, and call-id utilities
//!
//! This crate contains the foundational types used by the Huddle signaling
//! relay. It has no dependencies on networking or storage code.

pub mod callid;
pub mod config;
pub mod error;

pub use callid::{generate_call_id, normalize_call_id, validate_call_id};
pub use config::{Config, ConfigError, SignalConfig};
pub use error::RelayError;

/// Default signaling port
pub const DEFAULT_PORT: u16 = 4070;

/// Default sliding TTL for an inactive call record (24 hours)
pub const DEFAULT_CALL_TTL_SECS: u64 = 24 * 3600;

/// Default interval between expiry sweeps
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Default depth of a connection's outbound message queue
pub const DEFAULT_SEND_QUEUE_DEPTH: usize = 64;

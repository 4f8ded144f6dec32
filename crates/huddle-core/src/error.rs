//! Error types for the Huddle relay
//!
//! Every variant here maps to an `error{message}` reply on the requesting
//! connection; none of them is fatal to the relay process. Broadcast
//! delivery failures are deliberately not represented: they are logged at
//! the fan-out site and the dead member is detached through the normal
//! disconnect path, never reported to the sender.

use thiserror::Error;

/// Relay-level errors, reported to the offending connection as `error` replies
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Operation referenced a call id with no live record (or an expired one)
    #[error("call {call_id} not found")]
    NotFound { call_id: String },

    /// Attempted to create a call id that already exists
    #[error("call {call_id} already exists")]
    Conflict { call_id: String },

    /// Undecodable envelope or missing required fields
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Storage backend failure
    #[error("storage error: {0}")]
    Storage(String),
}

impl RelayError {
    pub fn not_found(call_id: impl Into<String>) -> Self {
        Self::NotFound {
            call_id: call_id.into(),
        }
    }

    pub fn conflict(call_id: impl Into<String>) -> Self {
        Self::Conflict {
            call_id: call_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = RelayError::not_found("AB12CD");
        assert_eq!(e.to_string(), "call AB12CD not found");

        let e = RelayError::conflict("AB12CD");
        assert_eq!(e.to_string(), "call AB12CD already exists");

        let e = RelayError::Malformed("missing field `callId`".into());
        assert!(e.to_string().contains("malformed"));
    }
}

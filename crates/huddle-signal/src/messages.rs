//! Signaling protocol messages
//!
//! Wire envelopes are UTF-8 JSON with a discriminating `type` field in
//! kebab-case and camelCase payload fields. Session descriptions and
//! connectivity candidates are opaque to the relay and carried as raw JSON
//! values, never inspected for semantics.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which side of the negotiation a connection speaks for
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The caller, producing the offer
    Offer,
    /// The callee, producing the answer
    Answer,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Offer => "offer",
            Role::Answer => "answer",
        }
    }
}

/// Persisted negotiation state for one call, as replayed to a joining peer
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallState {
    pub call_id: String,
    pub offer: Option<Value>,
    pub answer: Option<Value>,
    pub offer_candidates: Vec<Value>,
    pub answer_candidates: Vec<Value>,
    /// Unix timestamp of the last mutation
    pub updated_at: i64,
    /// Unix timestamp past which the record is garbage-collected
    pub expires_at: i64,
}

impl CallState {
    /// Candidate sequence for the given role
    pub fn candidates(&self, role: Role) -> &[Value] {
        match role {
            Role::Offer => &self.offer_candidates,
            Role::Answer => &self.answer_candidates,
        }
    }
}

/// Messages sent over the signaling WebSocket
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum WireMessage {
    /// Caller requests a fresh call
    CreateCall,

    /// Call created successfully
    CallCreated { call_id: String },

    /// Callee joins an existing call; role defaults to `answer`
    #[serde(alias = "join")]
    JoinCall {
        call_id: String,
        #[serde(default)]
        role: Option<Role>,
    },

    /// Successfully joined, with the full negotiation state so far
    Joined { call_id: String, state: CallState },

    /// Session description from the caller
    Offer { call_id: String, offer: Value },

    /// Session description from the callee
    Answer { call_id: String, answer: Value },

    /// Connectivity candidate for one role's sequence
    IceCandidate {
        call_id: String,
        role: Role,
        candidate: Value,
    },

    /// Terminate the call permanently
    Hangup { call_id: String },

    /// Another peer joined the room
    PeerJoined { role: Role },

    /// Another peer disconnected without hanging up
    PeerLeft,

    /// Error response
    Error { message: String },
}

impl WireMessage {
    /// Create an error message
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

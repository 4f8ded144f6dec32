//! Huddle Signal Relay
//!
//! WebSocket signaling relay for two browser peers negotiating a direct
//! media session. Clients exchange session descriptions and connectivity
//! candidates through the relay; negotiation state is persisted so a peer
//! that connects late (or reconnects after a brief drop) can catch up from
//! a single snapshot instead of replaying live traffic.
//!
//! # Protocol
//!
//! 1. Caller sends `create-call`, receives `call-created` with a short id
//! 2. Caller publishes its `offer` and `ice-candidate`s
//! 3. Callee sends `join-call` with the id, receives `joined` with the
//!    accumulated call state, then publishes its `answer` and candidates
//! 4. Either side ends the call with `hangup`, which deletes the record
//!
//! Abandoned calls are garbage-collected by a sliding TTL.

pub mod messages;
pub mod room;
pub mod server;
pub mod store;

pub use messages::{CallState, Role, WireMessage};
pub use room::{Room, RoomMember, RoomRegistry};
pub use server::SignalServer;
pub use store::CallStore;

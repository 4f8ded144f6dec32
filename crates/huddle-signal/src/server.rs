//! WebSocket relay server implementation
//!
//! One task per connection reads inbound messages sequentially; a paired
//! writer task drains that connection's bounded outbound queue, so
//! broadcasts triggered by other connections interleave freely with the
//! connection's own replies. The room registry and call store are shared
//! by every connection task; mutations to one call are serialized through
//! a per-call lock, never a global one, so a slow call cannot delay
//! another call's traffic.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use huddle_core::{generate_call_id, normalize_call_id, RelayError, SignalConfig};

use crate::messages::{Role, WireMessage};
use crate::room::{ConnId, RoomMember, RoomRegistry};
use crate::store::CallStore;

/// Per-connection lifecycle state
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConnState {
    /// Connected, not yet associated with a call
    Unbound,
    /// Associated with a call; tags are re-assigned only by a fresh join
    Bound { call_id: String, role: Role },
    /// Hung up; the read loop exits after the pending reply is queued
    Closed,
}

/// Shared relay state
struct ServerState {
    store: CallStore,
    rooms: RoomRegistry,
    /// Per-call mutation locks; entries live as long as the call record
    locks: DashMap<String, Arc<Mutex<()>>>,
    config: SignalConfig,
    next_conn_id: AtomicU64,
}

impl ServerState {
    fn call_lock(&self, call_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(call_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// The signaling relay
pub struct SignalServer {
    state: Arc<ServerState>,
}

impl SignalServer {
    pub fn new(store: CallStore, config: SignalConfig) -> Self {
        Self {
            state: Arc::new(ServerState {
                store,
                rooms: RoomRegistry::new(),
                locks: DashMap::new(),
                config,
                next_conn_id: AtomicU64::new(1),
            }),
        }
    }

    /// Start the relay
    pub async fn serve(&self, addr: SocketAddr) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("Signal relay listening on {}", addr);

        // Expiry sweep for abandoned calls that are never hung up
        let state = self.state.clone();
        tokio::spawn(async move {
            let interval = Duration::from_secs(state.config.sweep_interval_secs.max(1));
            loop {
                tokio::time::sleep(interval).await;
                sweep_expired(&state).await;
            }
        });

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let state = self.state.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(state, stream, peer_addr).await {
                    debug!("Connection error from {}: {:?}", peer_addr, e);
                }
            });
        }
    }

    /// Number of live call records (for monitoring)
    pub fn call_count(&self) -> usize {
        self.state.store.call_count().unwrap_or(0)
    }

    /// Number of live rooms (for monitoring)
    pub fn room_count(&self) -> usize {
        self.state.rooms.room_count()
    }
}

/// Handle a single connection (HTTP health check or WebSocket)
async fn handle_connection(
    state: Arc<ServerState>,
    mut stream: TcpStream,
    peer_addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Peek at the first bytes to detect HTTP vs WebSocket
    let mut peek_buf = [0u8; 4];
    stream.peek(&mut peek_buf).await?;

    if &peek_buf == b"GET " {
        return handle_http_request(&state, &mut stream).await;
    }

    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let conn_id = state.next_conn_id.fetch_add(1, Ordering::Relaxed);
    debug!("New connection {} from {}", conn_id, peer_addr);

    // Outbound queue: replies and broadcasts share it, so everything a
    // peer sees is in the order the relay produced it
    let (tx, mut rx) = mpsc::channel::<String>(state.config.send_queue_depth.max(1));
    let writer = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            if ws_sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let conn = ConnHandle { conn_id, tx };
    let mut conn_state = ConnState::Unbound;

    while let Some(msg) = ws_receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("WebSocket error on connection {}: {:?}", conn_id, e);
                break;
            }
        };

        let request = match WireMessage::from_json(&text) {
            Ok(r) => r,
            Err(e) => {
                let error = RelayError::Malformed(e.to_string());
                if !conn.send(&WireMessage::error(error.to_string())).await {
                    break;
                }
                continue;
            }
        };

        let reply = handle_message(&state, &conn, &mut conn_state, request).await;

        if let Some(reply) = reply {
            if !conn.send(&reply).await {
                break;
            }
        }

        if conn_state == ConnState::Closed {
            break;
        }
    }

    // A vanished peer leaves its call record intact until the TTL expires,
    // so it can rejoin and catch up; only hangup is final
    detach(&state, conn_id, &conn_state);

    drop(conn);
    let _ = writer.await;

    debug!("Connection {} closed", conn_id);
    Ok(())
}

/// A connection's identity and outbound queue
struct ConnHandle {
    conn_id: ConnId,
    tx: mpsc::Sender<String>,
}

impl ConnHandle {
    /// Queue a message for this connection; false when it is gone
    async fn send(&self, msg: &WireMessage) -> bool {
        match msg.to_json() {
            Ok(json) => self.tx.send(json).await.is_ok(),
            Err(e) => {
                warn!("Failed to serialize reply: {}", e);
                true
            }
        }
    }

    fn member(&self, role: Role) -> RoomMember {
        RoomMember::new(self.conn_id, role, self.tx.clone())
    }
}

/// Dispatch one inbound message; returns the direct reply, if any
async fn handle_message(
    state: &ServerState,
    conn: &ConnHandle,
    conn_state: &mut ConnState,
    msg: WireMessage,
) -> Option<WireMessage> {
    match msg {
        WireMessage::CreateCall => {
            if *conn_state != ConnState::Unbound {
                return Some(WireMessage::error("already associated with a call"));
            }

            let call_id = generate_call_id();
            if let Err(e) = state.store.create(&call_id) {
                return Some(WireMessage::error(e.to_string()));
            }

            state.rooms.join(&call_id, conn.member(Role::Offer));
            *conn_state = ConnState::Bound {
                call_id: call_id.clone(),
                role: Role::Offer,
            };

            info!("Call {} created by connection {}", call_id, conn.conn_id);
            Some(WireMessage::CallCreated { call_id })
        }

        WireMessage::JoinCall { call_id, role } => {
            if *conn_state != ConnState::Unbound {
                return Some(WireMessage::error("already associated with a call"));
            }

            let call_id = normalize_call_id(&call_id);

            // Snapshot read and room join must happen under the call's
            // lock as one step: a mutation landing between them would be
            // absent from the snapshot yet broadcast before the joiner
            // was a member
            let lock = state.call_lock(&call_id);
            let _guard = lock.lock().await;

            let snapshot = match state.store.get(&call_id) {
                Ok(Some(s)) => s,
                Ok(None) => {
                    state.locks.remove(&call_id);
                    return Some(WireMessage::error(
                        RelayError::not_found(call_id.as_str()).to_string(),
                    ));
                }
                Err(e) => return Some(WireMessage::error(e.to_string())),
            };

            let role = role.unwrap_or(Role::Answer);
            state.rooms.join(&call_id, conn.member(role));
            *conn_state = ConnState::Bound {
                call_id: call_id.clone(),
                role,
            };

            let dead = state.rooms.broadcast(
                &call_id,
                &WireMessage::PeerJoined { role },
                Some(conn.conn_id),
            );
            reap(state, &call_id, dead);

            info!(
                "Connection {} joined call {} as {}",
                conn.conn_id,
                call_id,
                role.as_str()
            );
            Some(WireMessage::Joined {
                call_id,
                state: snapshot,
            })
        }

        WireMessage::Offer { call_id, offer } => {
            relay_description(state, conn, call_id, Role::Offer, offer).await
        }

        WireMessage::Answer { call_id, answer } => {
            relay_description(state, conn, call_id, Role::Answer, answer).await
        }

        WireMessage::IceCandidate {
            call_id,
            role,
            candidate,
        } => {
            let call_id = normalize_call_id(&call_id);
            let lock = state.call_lock(&call_id);
            let _guard = lock.lock().await;

            if let Err(e) = state.store.append_candidate(&call_id, role, &candidate) {
                if matches!(e, RelayError::NotFound { .. }) {
                    state.locks.remove(&call_id);
                }
                return Some(WireMessage::error(e.to_string()));
            }

            let dead = state.rooms.broadcast(
                &call_id,
                &WireMessage::IceCandidate {
                    call_id: call_id.clone(),
                    role,
                    candidate,
                },
                Some(conn.conn_id),
            );
            reap(state, &call_id, dead);
            None
        }

        WireMessage::Hangup { call_id } => {
            let ConnState::Bound {
                call_id: bound_id, ..
            } = conn_state
            else {
                return Some(WireMessage::error("not associated with a call"));
            };
            if normalize_call_id(&call_id) != *bound_id {
                return Some(WireMessage::error("hangup for a different call"));
            }
            let call_id = bound_id.clone();

            let lock = state.call_lock(&call_id);
            let _guard = lock.lock().await;

            let dead = state.rooms.broadcast(
                &call_id,
                &WireMessage::Hangup {
                    call_id: call_id.clone(),
                },
                Some(conn.conn_id),
            );
            reap(state, &call_id, dead);

            if let Err(e) = state.store.delete(&call_id) {
                warn!("Failed to delete call {} on hangup: {}", call_id, e);
            }
            state.rooms.leave(&call_id, conn.conn_id);
            state.locks.remove(&call_id);
            *conn_state = ConnState::Closed;

            info!("Call {} hung up by connection {}", call_id, conn.conn_id);
            None
        }

        // Server-to-client types are never valid inbound
        WireMessage::CallCreated { .. }
        | WireMessage::Joined { .. }
        | WireMessage::PeerJoined { .. }
        | WireMessage::PeerLeft
        | WireMessage::Error { .. } => Some(WireMessage::error("unexpected message type")),
    }
}

/// Store a session description and fan it out to the rest of the room
async fn relay_description(
    state: &ServerState,
    conn: &ConnHandle,
    call_id: String,
    role: Role,
    description: serde_json::Value,
) -> Option<WireMessage> {
    let call_id = normalize_call_id(&call_id);
    let lock = state.call_lock(&call_id);
    let _guard = lock.lock().await;

    if let Err(e) = state.store.set_description(&call_id, role, &description) {
        // A lock entry for an id the store does not know must not linger
        if matches!(e, RelayError::NotFound { .. }) {
            state.locks.remove(&call_id);
        }
        return Some(WireMessage::error(e.to_string()));
    }

    let message = match role {
        Role::Offer => WireMessage::Offer {
            call_id: call_id.clone(),
            offer: description,
        },
        Role::Answer => WireMessage::Answer {
            call_id: call_id.clone(),
            answer: description,
        },
    };

    let dead = state.rooms.broadcast(&call_id, &message, Some(conn.conn_id));
    reap(state, &call_id, dead);
    None
}

/// Remove a disconnecting connection from its room and notify survivors
fn detach(state: &ServerState, conn_id: ConnId, conn_state: &ConnState) {
    if let ConnState::Bound { call_id, .. } = conn_state {
        if state.rooms.leave(call_id, conn_id) {
            let dead = state.rooms.broadcast(call_id, &WireMessage::PeerLeft, None);
            reap(state, call_id, dead);
        }
    }
}

/// Detach members whose outbound queue was found closed during a
/// broadcast; they get the same treatment as a detected disconnect.
fn reap(state: &ServerState, call_id: &str, dead: Vec<ConnId>) {
    for conn_id in dead {
        if state.rooms.leave(call_id, conn_id) {
            debug!("Reaped dead connection {} from room {}", conn_id, call_id);
            state.rooms.broadcast(call_id, &WireMessage::PeerLeft, None);
        }
    }
}

/// Delete call records past their expiry, one per-call lock at a time
async fn sweep_expired(state: &ServerState) {
    let expired = match state.store.list_expired() {
        Ok(ids) => ids,
        Err(e) => {
            warn!("Expiry sweep failed to list calls: {}", e);
            return;
        }
    };

    for call_id in expired {
        let lock = state.call_lock(&call_id);
        let _guard = lock.lock().await;

        // The call may have been refreshed or hung up since listing
        match state.store.delete_if_expired(&call_id) {
            Ok(true) => {
                state.locks.remove(&call_id);
                info!("Call {} expired", call_id);
            }
            Ok(false) => {}
            Err(e) => warn!("Expiry sweep failed for call {}: {}", call_id, e),
        }
    }
}

/// Handle an HTTP request (for health checks)
async fn handle_http_request(
    state: &ServerState,
    stream: &mut TcpStream,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut buf = vec![0u8; 1024];
    let n = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);

    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    let calls = state.store.call_count().unwrap_or(0);
    let rooms = state.rooms.room_count();
    let peers = state.rooms.member_count();

    let (status, body) = match path {
        "/health" => (
            "200 OK",
            format!(
                r#"{{"status":"ok","calls":{},"rooms":{},"peers":{}}}"#,
                calls, rooms, peers
            ),
        ),
        "/stats" => (
            "200 OK",
            format!(
                r#"{{"calls":{},"rooms":{},"peers":{}}}"#,
                calls, rooms, peers
            ),
        ),
        _ => ("404 Not Found", r#"{"error":"not found"}"#.to_string()),
    };

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );

    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_state(ttl_secs: u64) -> Arc<ServerState> {
        Arc::new(ServerState {
            store: CallStore::in_memory(ttl_secs).unwrap(),
            rooms: RoomRegistry::new(),
            locks: DashMap::new(),
            config: SignalConfig::default(),
            next_conn_id: AtomicU64::new(1),
        })
    }

    /// A fake connection: a handle for the handlers plus the receiving end
    /// of its outbound queue, standing in for the writer task.
    fn connect(state: &ServerState) -> (ConnHandle, mpsc::Receiver<String>, ConnState) {
        let conn_id = state.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(64);
        (ConnHandle { conn_id, tx }, rx, ConnState::Unbound)
    }

    fn recv(rx: &mut mpsc::Receiver<String>) -> WireMessage {
        let json = rx.try_recv().expect("expected a queued message");
        WireMessage::from_json(&json).expect("queued message must parse")
    }

    async fn create_call(
        state: &ServerState,
        conn: &ConnHandle,
        conn_state: &mut ConnState,
    ) -> String {
        let reply = handle_message(state, conn, conn_state, WireMessage::CreateCall)
            .await
            .expect("create-call must reply");
        match reply {
            WireMessage::CallCreated { call_id } => call_id,
            other => panic!("expected call-created, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_call_binds_and_persists() {
        let state = test_state(3600);
        let (conn, _rx, mut cs) = connect(&state);

        let call_id = create_call(&state, &conn, &mut cs).await;

        assert_eq!(
            cs,
            ConnState::Bound {
                call_id: call_id.clone(),
                role: Role::Offer
            }
        );
        assert!(state.store.get(&call_id).unwrap().is_some());
        assert_eq!(state.rooms.room_count(), 1);
    }

    #[tokio::test]
    async fn test_second_bind_rejected() {
        let state = test_state(3600);
        let (conn, _rx, mut cs) = connect(&state);

        let call_id = create_call(&state, &conn, &mut cs).await;

        let reply = handle_message(&state, &conn, &mut cs, WireMessage::CreateCall).await;
        assert!(matches!(reply, Some(WireMessage::Error { .. })));

        let reply = handle_message(
            &state,
            &conn,
            &mut cs,
            WireMessage::JoinCall {
                call_id: call_id.clone(),
                role: None,
            },
        )
        .await;
        assert!(matches!(reply, Some(WireMessage::Error { .. })));

        // Still bound to the original call
        assert_eq!(cs, ConnState::Bound { call_id, role: Role::Offer });
    }

    #[tokio::test]
    async fn test_join_unknown_call_mutates_nothing() {
        let state = test_state(3600);
        let (conn, _rx, mut cs) = connect(&state);

        let reply = handle_message(
            &state,
            &conn,
            &mut cs,
            WireMessage::JoinCall {
                call_id: "ZZZZZZ".into(),
                role: None,
            },
        )
        .await;

        match reply {
            Some(WireMessage::Error { message }) => assert!(message.contains("not found")),
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(cs, ConnState::Unbound);
        assert_eq!(state.rooms.room_count(), 0);
    }

    #[tokio::test]
    async fn test_operations_on_unknown_call_rejected() {
        let state = test_state(3600);
        let (conn, _rx, mut cs) = connect(&state);

        for msg in [
            WireMessage::Offer {
                call_id: "ZZZZZZ".into(),
                offer: json!({}),
            },
            WireMessage::Answer {
                call_id: "ZZZZZZ".into(),
                answer: json!({}),
            },
            WireMessage::IceCandidate {
                call_id: "ZZZZZZ".into(),
                role: Role::Offer,
                candidate: json!({}),
            },
        ] {
            let reply = handle_message(&state, &conn, &mut cs, msg).await;
            match reply {
                Some(WireMessage::Error { message }) => assert!(message.contains("not found")),
                other => panic!("expected error, got {:?}", other),
            }
        }
        assert_eq!(state.rooms.room_count(), 0);
    }

    #[tokio::test]
    async fn test_late_joiner_receives_snapshot() {
        let state = test_state(3600);
        let (p1, mut rx1, mut cs1) = connect(&state);
        let (p2, mut rx2, mut cs2) = connect(&state);

        let call_id = create_call(&state, &p1, &mut cs1).await;

        // P1 publishes its offer before P2 is even connected
        let offer = json!({"sdp": "v=0..."});
        let reply = handle_message(
            &state,
            &p1,
            &mut cs1,
            WireMessage::Offer {
                call_id: call_id.clone(),
                offer: offer.clone(),
            },
        )
        .await;
        assert!(reply.is_none());

        // P2 joins late and catches up from the snapshot
        let reply = handle_message(
            &state,
            &p2,
            &mut cs2,
            WireMessage::JoinCall {
                call_id: call_id.clone(),
                role: None,
            },
        )
        .await
        .expect("join-call must reply");

        match reply {
            WireMessage::Joined { call_id: id, state: snapshot } => {
                assert_eq!(id, call_id);
                assert_eq!(snapshot.offer, Some(offer));
                assert!(snapshot.answer.is_none());
                assert!(snapshot.offer_candidates.is_empty());
                assert!(snapshot.answer_candidates.is_empty());
            }
            other => panic!("expected joined, got {:?}", other),
        }

        // P1 is told about the new peer; P2 gets nothing broadcast
        assert_eq!(recv(&mut rx1), WireMessage::PeerJoined { role: Role::Answer });
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_candidates_relay_in_order() {
        let state = test_state(3600);
        let (p1, mut rx1, mut cs1) = connect(&state);
        let (p2, mut rx2, mut cs2) = connect(&state);

        let call_id = create_call(&state, &p1, &mut cs1).await;
        handle_message(
            &state,
            &p2,
            &mut cs2,
            WireMessage::JoinCall {
                call_id: call_id.clone(),
                role: None,
            },
        )
        .await;
        let _ = recv(&mut rx1); // peer-joined

        for i in 0..3 {
            let reply = handle_message(
                &state,
                &p2,
                &mut cs2,
                WireMessage::IceCandidate {
                    call_id: call_id.clone(),
                    role: Role::Answer,
                    candidate: json!({"seq": i}),
                },
            )
            .await;
            assert!(reply.is_none());
        }

        // P1 sees all three, in the order sent; P2 never hears its own
        for i in 0..3 {
            match recv(&mut rx1) {
                WireMessage::IceCandidate { candidate, role, .. } => {
                    assert_eq!(role, Role::Answer);
                    assert_eq!(candidate, json!({"seq": i}));
                }
                other => panic!("expected ice-candidate, got {:?}", other),
            }
        }
        assert!(rx2.try_recv().is_err());

        // And the store accumulated them in the same order
        let snapshot = state.store.get(&call_id).unwrap().unwrap();
        assert_eq!(snapshot.answer_candidates.len(), 3);
        assert_eq!(snapshot.answer_candidates[2], json!({"seq": 2}));
    }

    #[tokio::test]
    async fn test_answer_overwrite_is_last_write_wins() {
        let state = test_state(3600);
        let (p1, _rx1, mut cs1) = connect(&state);
        let call_id = create_call(&state, &p1, &mut cs1).await;

        for sdp in ["X", "Y"] {
            handle_message(
                &state,
                &p1,
                &mut cs1,
                WireMessage::Answer {
                    call_id: call_id.clone(),
                    answer: json!({"sdp": sdp}),
                },
            )
            .await;
        }

        let snapshot = state.store.get(&call_id).unwrap().unwrap();
        assert_eq!(snapshot.answer, Some(json!({"sdp": "Y"})));
        assert!(snapshot.offer.is_none());
    }

    #[tokio::test]
    async fn test_hangup_is_final() {
        let state = test_state(3600);
        let (p1, mut rx1, mut cs1) = connect(&state);
        let (p2, _rx2, mut cs2) = connect(&state);

        let call_id = create_call(&state, &p1, &mut cs1).await;
        handle_message(
            &state,
            &p2,
            &mut cs2,
            WireMessage::JoinCall {
                call_id: call_id.clone(),
                role: None,
            },
        )
        .await;
        let _ = recv(&mut rx1); // peer-joined

        let reply = handle_message(
            &state,
            &p2,
            &mut cs2,
            WireMessage::Hangup {
                call_id: call_id.clone(),
            },
        )
        .await;
        assert!(reply.is_none());
        assert_eq!(cs2, ConnState::Closed);

        // The other peer is notified
        assert_eq!(
            recv(&mut rx1),
            WireMessage::Hangup {
                call_id: call_id.clone()
            }
        );

        // The call is permanently over: record gone, rejoin rejected
        assert!(state.store.get(&call_id).unwrap().is_none());

        let (p3, _rx3, mut cs3) = connect(&state);
        let reply = handle_message(
            &state,
            &p3,
            &mut cs3,
            WireMessage::JoinCall {
                call_id: call_id.clone(),
                role: None,
            },
        )
        .await;
        match reply {
            Some(WireMessage::Error { message }) => assert!(message.contains("not found")),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hangup_requires_matching_call() {
        let state = test_state(3600);
        let (p1, _rx1, mut cs1) = connect(&state);
        let (p2, _rx2, mut cs2) = connect(&state);

        let call_id = create_call(&state, &p1, &mut cs1).await;

        // Unbound connection cannot hang up
        let reply = handle_message(
            &state,
            &p2,
            &mut cs2,
            WireMessage::Hangup {
                call_id: call_id.clone(),
            },
        )
        .await;
        assert!(matches!(reply, Some(WireMessage::Error { .. })));

        // Bound connection cannot hang up someone else's call
        let reply = handle_message(
            &state,
            &p1,
            &mut cs1,
            WireMessage::Hangup {
                call_id: "ZZZZZZ".into(),
            },
        )
        .await;
        assert!(matches!(reply, Some(WireMessage::Error { .. })));
        assert!(state.store.get(&call_id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_disconnect_keeps_call_until_ttl() {
        let state = test_state(3600);
        let (p1, _rx1, mut cs1) = connect(&state);

        let call_id = create_call(&state, &p1, &mut cs1).await;
        assert_eq!(state.rooms.room_count(), 1);

        // Transport drop without hangup: room entry goes, record stays
        detach(&state, p1.conn_id, &cs1);
        assert_eq!(state.rooms.room_count(), 0);
        assert!(state.store.get(&call_id).unwrap().is_some());

        // A reconnect within the TTL window still finds the call
        let (p2, _rx2, mut cs2) = connect(&state);
        let reply = handle_message(
            &state,
            &p2,
            &mut cs2,
            WireMessage::JoinCall {
                call_id: call_id.clone(),
                role: None,
            },
        )
        .await;
        assert!(matches!(reply, Some(WireMessage::Joined { .. })));
    }

    #[tokio::test]
    async fn test_disconnect_notifies_survivors() {
        let state = test_state(3600);
        let (p1, mut rx1, mut cs1) = connect(&state);
        let (p2, _rx2, mut cs2) = connect(&state);

        let call_id = create_call(&state, &p1, &mut cs1).await;
        handle_message(
            &state,
            &p2,
            &mut cs2,
            WireMessage::JoinCall {
                call_id,
                role: None,
            },
        )
        .await;
        let _ = recv(&mut rx1); // peer-joined

        detach(&state, p2.conn_id, &cs2);
        assert_eq!(recv(&mut rx1), WireMessage::PeerLeft);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_join_snapshot_and_broadcasts_cover_every_candidate() {
        let state = test_state(3600);
        let (p1, _rx1, mut cs1) = connect(&state);
        let call_id = create_call(&state, &p1, &mut cs1).await;

        // A third connection floods candidates while the second joins
        let publisher = {
            let state = state.clone();
            let call_id = call_id.clone();
            tokio::spawn(async move {
                let (pub_conn, _pub_rx, mut pub_cs) = connect(&state);
                for i in 0..50i64 {
                    let reply = handle_message(
                        &state,
                        &pub_conn,
                        &mut pub_cs,
                        WireMessage::IceCandidate {
                            call_id: call_id.clone(),
                            role: Role::Answer,
                            candidate: json!({"seq": i}),
                        },
                    )
                    .await;
                    assert!(reply.is_none());
                    tokio::task::yield_now().await;
                }
            })
        };

        let (p2, mut rx2, mut cs2) = connect(&state);
        let reply = handle_message(
            &state,
            &p2,
            &mut cs2,
            WireMessage::JoinCall {
                call_id: call_id.clone(),
                role: None,
            },
        )
        .await
        .expect("join-call must reply");
        let snapshot = match reply {
            WireMessage::Joined { state: snapshot, .. } => snapshot,
            other => panic!("expected joined, got {:?}", other),
        };

        publisher.await.unwrap();

        // Every candidate reaches the joiner exactly once: those that
        // landed before the join through the snapshot, the rest as
        // broadcasts. A candidate stored after the snapshot but broadcast
        // before the join would be lost entirely.
        let mut seqs: Vec<i64> = snapshot
            .answer_candidates
            .iter()
            .map(|c| c["seq"].as_i64().unwrap())
            .collect();
        while let Ok(json) = rx2.try_recv() {
            let msg = WireMessage::from_json(&json).unwrap();
            if let WireMessage::IceCandidate { candidate, .. } = msg {
                seqs.push(candidate["seq"].as_i64().unwrap());
            }
        }
        assert_eq!(seqs, (0..50).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_no_lock_entries_linger_for_unknown_calls() {
        let state = test_state(3600);
        let (conn, _rx, mut cs) = connect(&state);

        for i in 0..100 {
            let call_id = format!("BOGUS{}", i);
            for msg in [
                WireMessage::IceCandidate {
                    call_id: call_id.clone(),
                    role: Role::Offer,
                    candidate: json!({}),
                },
                WireMessage::Offer {
                    call_id: call_id.clone(),
                    offer: json!({}),
                },
                WireMessage::JoinCall {
                    call_id: call_id.clone(),
                    role: None,
                },
            ] {
                let reply = handle_message(&state, &conn, &mut cs, msg).await;
                assert!(matches!(reply, Some(WireMessage::Error { .. })));
            }
        }

        assert!(state.locks.is_empty());
    }

    #[tokio::test]
    async fn test_call_ids_are_case_insensitive() {
        let state = test_state(3600);
        let (p1, mut rx1, mut cs1) = connect(&state);
        let (p2, _rx2, mut cs2) = connect(&state);

        let call_id = create_call(&state, &p1, &mut cs1).await;
        let lowered = call_id.to_ascii_lowercase();

        let reply = handle_message(
            &state,
            &p2,
            &mut cs2,
            WireMessage::JoinCall {
                call_id: lowered.clone(),
                role: None,
            },
        )
        .await
        .expect("join-call must reply");
        match reply {
            WireMessage::Joined { call_id: id, .. } => assert_eq!(id, call_id),
            other => panic!("expected joined, got {:?}", other),
        }
        let _ = recv(&mut rx1); // peer-joined

        // Later messages keep working with the client's own spelling
        let reply = handle_message(
            &state,
            &p2,
            &mut cs2,
            WireMessage::Answer {
                call_id: lowered.clone(),
                answer: json!({"sdp": "v=0"}),
            },
        )
        .await;
        assert!(reply.is_none());
        match recv(&mut rx1) {
            WireMessage::Answer { call_id: id, .. } => assert_eq!(id, call_id),
            other => panic!("expected answer, got {:?}", other),
        }

        let reply = handle_message(
            &state,
            &p2,
            &mut cs2,
            WireMessage::IceCandidate {
                call_id: lowered,
                role: Role::Answer,
                candidate: json!({"seq": 0}),
            },
        )
        .await;
        assert!(reply.is_none());

        let snapshot = state.store.get(&call_id).unwrap().unwrap();
        assert_eq!(snapshot.answer, Some(json!({"sdp": "v=0"})));
        assert_eq!(snapshot.answer_candidates.len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_calls() {
        // TTL of zero makes every record expire immediately
        let state = test_state(0);
        let (p1, _rx1, mut cs1) = connect(&state);
        let expired_id = create_call(&state, &p1, &mut cs1).await;

        sweep_expired(&state).await;
        assert!(state.store.get(&expired_id).unwrap().is_none());
        assert!(state.store.list_expired().unwrap().is_empty());
        assert!(state.locks.get(&expired_id).is_none());
    }

    #[tokio::test]
    async fn test_server_counters() {
        let store = CallStore::in_memory(3600).unwrap();
        let server = SignalServer::new(store, SignalConfig::default());
        assert_eq!(server.call_count(), 0);
        assert_eq!(server.room_count(), 0);
    }
}

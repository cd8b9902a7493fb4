//! Connection gateway: lifecycle, handshake authentication, and outbound
//! queues.
//!
//! Every transport connection moves through `Connecting -> Authenticated ->
//! Closed`, or straight from `Connecting` to `Closed` on handshake failure.
//! `Closed` is terminal. No protocol frame is processed before authentication
//! succeeds; identity comes exclusively from the verified access token's
//! claims.
//!
//! Each connection owns a bounded outbound queue. Delivery is a non-blocking
//! enqueue, so a slow or stalled recipient never blocks delivery to other
//! recipients. Consecutive delivery failures are counted per connection; a
//! connection that exceeds the configured bound is force-disconnected by the
//! relay.
//!
//! On close from any state the gateway removes the connection from every room
//! it had joined before discarding connection state, so no stale membership
//! survives a disconnect. Dropping the connection entry drops the queue
//! sender, which discards any queued-but-undelivered frames.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::registry::RoomRegistry;
use crate::token::{Claims, TokenError, TokenService};
use crate::types::{ConnectionId, ServerFrame};

/// Errors produced by gateway operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Handshake token verification failed. A missing token is reported the
    /// same way as an invalid one.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// The operation requires an authenticated connection.
    #[error("connection is not authenticated")]
    NotAuthenticated,

    /// The connection id is not registered (never connected, or already
    /// closed).
    #[error("unknown connection")]
    UnknownConnection,

    /// Authentication did not complete within the handshake deadline.
    #[error("handshake timed out")]
    HandshakeTimeout,
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, handshake not yet complete.
    Connecting,

    /// Handshake complete; identity claims are attached.
    Authenticated,

    /// Terminal. Closed connections are removed from the table, so any id
    /// that is no longer registered reports this state.
    Closed,
}

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Frame enqueued onto the recipient's outbound queue.
    Sent,

    /// Queue full or closed; the frame was dropped for this recipient.
    Failed,

    /// The failure pushed the recipient past the consecutive-failure bound;
    /// the caller should force-disconnect it.
    FailureBoundExceeded,
}

struct ConnectionEntry {
    state: ConnectionState,
    claims: Option<Claims>,
    outbound: mpsc::Sender<ServerFrame>,
    delivery_failures: AtomicU32,
}

/// Owns the live connection table.
///
/// All connection state is created, mutated, and destroyed here; other
/// components hold connection ids only.
pub struct ConnectionGateway {
    tokens: Arc<TokenService>,
    connections: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
    outbound_buffer: usize,
    max_delivery_failures: u32,
}

impl ConnectionGateway {
    /// Creates a gateway verifying handshakes against the given token
    /// service.
    ///
    /// `outbound_buffer` is the per-connection queue capacity;
    /// `max_delivery_failures` is the consecutive-failure bound before a
    /// recipient is force-disconnected.
    pub fn new(
        tokens: Arc<TokenService>,
        outbound_buffer: usize,
        max_delivery_failures: u32,
    ) -> Self {
        Self {
            tokens,
            connections: RwLock::new(HashMap::new()),
            outbound_buffer,
            max_delivery_failures,
        }
    }

    /// Registers a new connection in `Connecting` state.
    ///
    /// Returns the connection id and the receiving end of its outbound
    /// queue; the transport task drains the receiver into the socket.
    pub fn connect(&self) -> (ConnectionId, mpsc::Receiver<ServerFrame>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.outbound_buffer);

        self.connections.write().unwrap().insert(
            id,
            ConnectionEntry {
                state: ConnectionState::Connecting,
                claims: None,
                outbound: tx,
                delivery_failures: AtomicU32::new(0),
            },
        );

        info!(connection = %id, "connection opened");
        (id, rx)
    }

    /// Runs the handshake for a connection: verifies the bearer access token
    /// and transitions `Connecting -> Authenticated`.
    ///
    /// A missing token is treated identically to an invalid one. On failure
    /// the caller sends one `auth-error` frame and closes the transport; the
    /// gateway itself makes no transition, so the connection is torn down
    /// through [`disconnect`](Self::disconnect) as usual.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::Token`] if the token is missing, invalid, or expired
    /// - [`GatewayError::UnknownConnection`] if the id is not registered
    pub fn authenticate(
        &self,
        id: ConnectionId,
        bearer: Option<&str>,
    ) -> Result<Claims, GatewayError> {
        let token = bearer.ok_or(GatewayError::Token(TokenError::Invalid))?;

        // Verification is CPU-only; do it before taking the table lock.
        let claims = self.tokens.verify_access(token)?;

        let mut connections = self.connections.write().unwrap();
        let entry = connections
            .get_mut(&id)
            .ok_or(GatewayError::UnknownConnection)?;

        if entry.state == ConnectionState::Authenticated {
            // Handshake already completed; the original identity stands.
            return Ok(entry.claims.clone().unwrap_or(claims));
        }

        entry.state = ConnectionState::Authenticated;
        entry.claims = Some(claims.clone());

        info!(
            connection = %id,
            identity = %claims.sub,
            username = %claims.username,
            "connection authenticated"
        );
        Ok(claims)
    }

    /// Closes a connection from any state.
    ///
    /// Room membership is removed synchronously before the connection entry
    /// is discarded. Dropping the entry drops the outbound sender, which
    /// discards queued-but-undelivered frames.
    pub fn disconnect(&self, id: ConnectionId, registry: &RoomRegistry) {
        let rooms_left = registry.remove_connection(id);
        let removed = self.connections.write().unwrap().remove(&id);

        if removed.is_some() {
            info!(connection = %id, rooms_left, "connection closed");
        } else {
            trace!(connection = %id, "disconnect for unknown connection");
        }
    }

    /// Lifecycle state of a connection. Ids that were never registered or
    /// have been closed report [`ConnectionState::Closed`].
    pub fn state(&self, id: ConnectionId) -> ConnectionState {
        self.connections
            .read()
            .unwrap()
            .get(&id)
            .map(|entry| entry.state)
            .unwrap_or(ConnectionState::Closed)
    }

    /// Returns `true` if the connection has completed the handshake.
    pub fn is_authenticated(&self, id: ConnectionId) -> bool {
        self.state(id) == ConnectionState::Authenticated
    }

    /// The identity claims attached at handshake, if authenticated.
    pub fn claims(&self, id: ConnectionId) -> Option<Claims> {
        self.connections
            .read()
            .unwrap()
            .get(&id)
            .and_then(|entry| entry.claims.clone())
    }

    /// Number of live connections in any state.
    pub fn connection_count(&self) -> usize {
        self.connections.read().unwrap().len()
    }

    /// Number of authenticated connections.
    pub fn authenticated_count(&self) -> usize {
        self.connections
            .read()
            .unwrap()
            .values()
            .filter(|entry| entry.state == ConnectionState::Authenticated)
            .count()
    }

    /// Ids of every authenticated connection, excluding `except` if given.
    /// Broadcast recipient set.
    pub(crate) fn authenticated_ids(&self, except: Option<ConnectionId>) -> Vec<ConnectionId> {
        self.connections
            .read()
            .unwrap()
            .iter()
            .filter(|(id, entry)| {
                entry.state == ConnectionState::Authenticated && Some(**id) != except
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Enqueues a frame onto the recipient's outbound queue without blocking.
    ///
    /// A full or closed queue counts as one delivery failure; a successful
    /// enqueue resets the consecutive-failure counter. The failure counter is
    /// an atomic so fan-out runs under the table's read lock.
    pub(crate) fn deliver(&self, id: ConnectionId, frame: ServerFrame) -> DeliveryOutcome {
        let connections = self.connections.read().unwrap();
        let Some(entry) = connections.get(&id) else {
            trace!(connection = %id, "delivery to closed connection dropped");
            return DeliveryOutcome::Failed;
        };

        match entry.outbound.try_send(frame) {
            Ok(()) => {
                entry.delivery_failures.store(0, Ordering::Relaxed);
                DeliveryOutcome::Sent
            }
            Err(err) => {
                let reason = match err {
                    TrySendError::Full(_) => "queue full",
                    TrySendError::Closed(_) => "queue closed",
                };
                let failures = entry.delivery_failures.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(
                    connection = %id,
                    failures,
                    reason,
                    "outbound delivery failed"
                );
                if failures >= self.max_delivery_failures {
                    warn!(
                        connection = %id,
                        failures,
                        "consecutive delivery failures exceeded bound"
                    );
                    DeliveryOutcome::FailureBoundExceeded
                } else {
                    DeliveryOutcome::Failed
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    const ACCESS_SECRET: &str = "test-access-secret-0123456789abcdef!";
    const REFRESH_SECRET: &str = "test-refresh-secret-0123456789abcdef";

    fn token_service() -> Arc<TokenService> {
        Arc::new(TokenService::new(
            ACCESS_SECRET,
            Duration::from_secs(900),
            REFRESH_SECRET,
            Duration::from_secs(864_000),
        ))
    }

    fn gateway() -> ConnectionGateway {
        ConnectionGateway::new(token_service(), 8, 3)
    }

    fn claims(sub: &str) -> Claims {
        Claims {
            sub: sub.to_string(),
            username: format!("user-{sub}"),
            display_name: format!("User {sub}"),
            is_admin: false,
        }
    }

    fn access_token(tokens: &TokenService, sub: &str) -> String {
        tokens.issue_access(&claims(sub)).unwrap()
    }

    #[tokio::test]
    async fn connect_starts_in_connecting_state() {
        let gateway = gateway();
        let (id, _rx) = gateway.connect();

        assert_eq!(gateway.state(id), ConnectionState::Connecting);
        assert!(!gateway.is_authenticated(id));
        assert_eq!(gateway.connection_count(), 1);
        assert_eq!(gateway.authenticated_count(), 0);
    }

    #[tokio::test]
    async fn authenticate_transitions_to_authenticated() {
        let tokens = token_service();
        let gateway = ConnectionGateway::new(tokens.clone(), 8, 3);
        let (id, _rx) = gateway.connect();

        let token = access_token(&tokens, "u1");
        let authed = gateway.authenticate(id, Some(&token)).unwrap();

        assert_eq!(authed.sub, "u1");
        assert_eq!(gateway.state(id), ConnectionState::Authenticated);
        assert_eq!(gateway.claims(id).unwrap().username, "user-u1");
        assert_eq!(gateway.authenticated_count(), 1);
    }

    #[tokio::test]
    async fn missing_token_is_treated_as_invalid() {
        let gateway = gateway();
        let (id, _rx) = gateway.connect();

        assert_eq!(
            gateway.authenticate(id, None),
            Err(GatewayError::Token(TokenError::Invalid))
        );
        // Failed handshake leaves the state machine untouched; the transport
        // layer closes via disconnect.
        assert_eq!(gateway.state(id), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn invalid_token_fails_handshake() {
        let gateway = gateway();
        let (id, _rx) = gateway.connect();

        assert_eq!(
            gateway.authenticate(id, Some("garbage")),
            Err(GatewayError::Token(TokenError::Invalid))
        );
    }

    #[tokio::test]
    async fn authenticate_unknown_connection_fails() {
        let tokens = token_service();
        let gateway = ConnectionGateway::new(tokens.clone(), 8, 3);

        let token = access_token(&tokens, "u1");
        assert_eq!(
            gateway.authenticate(Uuid::new_v4(), Some(&token)),
            Err(GatewayError::UnknownConnection)
        );
    }

    #[tokio::test]
    async fn repeated_handshake_keeps_original_identity() {
        let tokens = token_service();
        let gateway = ConnectionGateway::new(tokens.clone(), 8, 3);
        let (id, _rx) = gateway.connect();

        let first = access_token(&tokens, "u1");
        gateway.authenticate(id, Some(&first)).unwrap();

        let second = access_token(&tokens, "u2");
        let authed = gateway.authenticate(id, Some(&second)).unwrap();
        assert_eq!(authed.sub, "u1");
    }

    #[tokio::test]
    async fn disconnect_is_terminal_and_cleans_rooms() {
        let tokens = token_service();
        let gateway = ConnectionGateway::new(tokens.clone(), 8, 3);
        let registry = RoomRegistry::new();
        let (id, _rx) = gateway.connect();

        let token = access_token(&tokens, "u1");
        gateway.authenticate(id, Some(&token)).unwrap();
        registry.join(id, "r1");
        registry.join(id, "r2");

        gateway.disconnect(id, &registry);

        assert_eq!(gateway.state(id), ConnectionState::Closed);
        assert_eq!(gateway.connection_count(), 0);
        assert!(!registry.members("r1").contains(&id));
        assert!(!registry.members("r2").contains(&id));
    }

    #[tokio::test]
    async fn disconnect_from_connecting_state_is_allowed() {
        let gateway = gateway();
        let registry = RoomRegistry::new();
        let (id, _rx) = gateway.connect();

        gateway.disconnect(id, &registry);
        assert_eq!(gateway.state(id), ConnectionState::Closed);

        // A second disconnect is harmless.
        gateway.disconnect(id, &registry);
    }

    #[tokio::test]
    async fn disconnect_discards_queued_frames() {
        let gateway = gateway();
        let registry = RoomRegistry::new();
        let (id, mut rx) = gateway.connect();

        gateway.deliver(id, ServerFrame::message(json!(1)));
        gateway.disconnect(id, &registry);

        // The queued frame is still readable, but the channel terminates;
        // nothing new can arrive.
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn deliver_enqueues_frames_in_order() {
        let gateway = gateway();
        let (id, mut rx) = gateway.connect();

        for i in 0..3 {
            assert_eq!(
                gateway.deliver(id, ServerFrame::message(json!(i))),
                DeliveryOutcome::Sent
            );
        }

        for i in 0..3 {
            assert_eq!(rx.recv().await.unwrap(), ServerFrame::message(json!(i)));
        }
    }

    #[tokio::test]
    async fn full_queue_counts_failures_until_bound() {
        let tokens = token_service();
        // Buffer of 1, bound of 2.
        let gateway = ConnectionGateway::new(tokens, 1, 2);
        let (id, _rx) = gateway.connect();

        assert_eq!(
            gateway.deliver(id, ServerFrame::message(json!(0))),
            DeliveryOutcome::Sent
        );
        assert_eq!(
            gateway.deliver(id, ServerFrame::message(json!(1))),
            DeliveryOutcome::Failed
        );
        assert_eq!(
            gateway.deliver(id, ServerFrame::message(json!(2))),
            DeliveryOutcome::FailureBoundExceeded
        );
    }

    #[tokio::test]
    async fn successful_delivery_resets_failure_count() {
        let tokens = token_service();
        let gateway = ConnectionGateway::new(tokens, 1, 2);
        let (id, mut rx) = gateway.connect();

        gateway.deliver(id, ServerFrame::message(json!(0)));
        assert_eq!(
            gateway.deliver(id, ServerFrame::message(json!(1))),
            DeliveryOutcome::Failed
        );

        // Drain the queue; the next delivery succeeds and resets the count.
        rx.recv().await.unwrap();
        assert_eq!(
            gateway.deliver(id, ServerFrame::message(json!(2))),
            DeliveryOutcome::Sent
        );

        rx.recv().await.unwrap();
        assert_eq!(
            gateway.deliver(id, ServerFrame::message(json!(3))),
            DeliveryOutcome::Sent
        );
    }

    #[tokio::test]
    async fn authenticated_ids_excludes_sender_and_unauthenticated() {
        let tokens = token_service();
        let gateway = ConnectionGateway::new(tokens.clone(), 8, 3);

        let (a, _rx_a) = gateway.connect();
        let (b, _rx_b) = gateway.connect();
        let (c, _rx_c) = gateway.connect();

        gateway
            .authenticate(a, Some(&access_token(&tokens, "a")))
            .unwrap();
        gateway
            .authenticate(b, Some(&access_token(&tokens, "b")))
            .unwrap();
        // c stays in Connecting.
        let _ = c;

        let ids = gateway.authenticated_ids(Some(a));
        assert_eq!(ids, vec![b]);

        let all = gateway.authenticated_ids(None);
        assert_eq!(all.len(), 2);
    }
}

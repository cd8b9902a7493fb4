//! The relay server object.
//!
//! [`RelayServer`] bundles the token service, session store, connection
//! gateway, room registry, and relay engine into one explicit, instantiable
//! value. It is constructed once at process start and passed by reference to
//! every handler; tests construct as many independent instances as they
//! need.
//!
//! Room and message operations are gated here: lifecycle state is owned by
//! the gateway, so this is the layer that can reject a `Connecting` or
//! `Closed` caller with [`GatewayError::NotAuthenticated`] before touching
//! the registry or the relay.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::Config;
use crate::gateway::{ConnectionGateway, GatewayError};
use crate::registry::RoomRegistry;
use crate::relay::RelayEngine;
use crate::session::{IdentityStore, SessionError, SessionStore, TokenPair};
use crate::token::{Claims, TokenService};
use crate::types::{ConnectionId, ServerFrame, Target};

/// The authenticated real-time relay, as one shareable value.
pub struct RelayServer {
    config: Config,
    tokens: Arc<TokenService>,
    sessions: SessionStore,
    gateway: Arc<ConnectionGateway>,
    registry: Arc<RoomRegistry>,
    relay: RelayEngine,
}

impl RelayServer {
    /// Builds a relay server from configuration and an identity backend.
    pub fn new(config: Config, identities: Arc<dyn IdentityStore>) -> Self {
        let tokens = Arc::new(TokenService::new(
            &config.access_token_secret,
            config.access_token_ttl,
            &config.refresh_token_secret,
            config.refresh_token_ttl,
        ));
        let sessions = SessionStore::new(tokens.clone(), identities);
        let gateway = Arc::new(ConnectionGateway::new(
            tokens.clone(),
            config.outbound_buffer,
            config.max_delivery_failures,
        ));
        let registry = Arc::new(RoomRegistry::new());
        let relay = RelayEngine::new(gateway.clone(), registry.clone());

        Self {
            config,
            tokens,
            sessions,
            gateway,
            registry,
            relay,
        }
    }

    /// The server configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The token service shared by the gateway and the session store.
    pub fn tokens(&self) -> &Arc<TokenService> {
        &self.tokens
    }

    /// The session store backing the refresh-rotation path.
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Registers a new transport connection in `Connecting` state.
    ///
    /// Returns the connection id and the receiver the transport task drains
    /// into the socket.
    pub fn connect(&self) -> (ConnectionId, mpsc::Receiver<ServerFrame>) {
        self.gateway.connect()
    }

    /// Runs the handshake for a connection against the token service.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Token`] for a missing, malformed, or expired
    /// bearer token, or [`GatewayError::UnknownConnection`] for an
    /// unregistered id.
    pub fn authenticate(
        &self,
        id: ConnectionId,
        bearer: Option<&str>,
    ) -> Result<Claims, GatewayError> {
        self.gateway.authenticate(id, bearer)
    }

    /// Closes a connection from any state, removing its room memberships
    /// before its state is discarded.
    pub fn disconnect(&self, id: ConnectionId) {
        self.gateway.disconnect(id, &self.registry);
    }

    /// Adds an authenticated connection to a room. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotAuthenticated`] if the connection has not
    /// completed the handshake; the connection state is left untouched.
    pub fn join_room(&self, id: ConnectionId, room: &str) -> Result<(), GatewayError> {
        if !self.gateway.is_authenticated(id) {
            debug!(connection = %id, room, "join rejected, not authenticated");
            return Err(GatewayError::NotAuthenticated);
        }
        self.registry.join(id, room);
        Ok(())
    }

    /// Removes an authenticated connection from a room. Leaving a room never
    /// joined is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotAuthenticated`] if the connection has not
    /// completed the handshake.
    pub fn leave_room(&self, id: ConnectionId, room: &str) -> Result<(), GatewayError> {
        if !self.gateway.is_authenticated(id) {
            debug!(connection = %id, room, "leave rejected, not authenticated");
            return Err(GatewayError::NotAuthenticated);
        }
        self.registry.leave(id, room);
        Ok(())
    }

    /// Relays a payload from the sender to the target's recipients.
    ///
    /// Returns the number of recipients the frame was enqueued for.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotAuthenticated`] if the sender has not
    /// completed the handshake.
    pub fn send(
        &self,
        sender: ConnectionId,
        target: &Target,
        payload: Value,
    ) -> Result<usize, GatewayError> {
        self.relay.send(sender, target, payload)
    }

    /// Rotates a refresh token, returning a fresh access/refresh pair.
    ///
    /// # Errors
    ///
    /// See [`SessionStore::rotate`].
    pub async fn rotate(&self, presented: &str) -> Result<TokenPair, SessionError> {
        self.sessions.rotate(presented).await
    }

    /// Sends a frame directly to one connection, outside the relay path.
    /// Used for protocol-level rejection frames.
    pub(crate) fn notify(&self, id: ConnectionId, frame: ServerFrame) {
        self.gateway.deliver(id, frame);
    }

    /// Number of live connections in any state.
    pub fn connection_count(&self) -> usize {
        self.gateway.connection_count()
    }

    /// Number of connections that have completed the handshake.
    pub fn authenticated_count(&self) -> usize {
        self.gateway.authenticated_count()
    }

    /// Number of rooms with at least one member.
    pub fn room_count(&self) -> usize {
        self.registry.room_count()
    }

    /// Member set of a room; empty for unknown rooms.
    pub fn room_members(&self, room: &str) -> std::collections::HashSet<ConnectionId> {
        self.registry.members(room)
    }
}

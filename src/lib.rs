//! Pulse Server - Authenticated real-time relay.
//!
//! This crate provides the real-time core of the Pulse social platform,
//! responsible for:
//! - Issuing, verifying, and rotating signed access and refresh tokens
//! - Authenticating WebSocket connections at handshake time
//! - Tracking room membership and fanning messages out to broadcast or
//!   room-scoped recipients
//!
//! # Architecture
//!
//! Every handler works against one [`server::RelayServer`] instance, an
//! explicit object bundling the token service, session store, connection
//! gateway, room registry, and relay engine. Messages are transient; the
//! relay is best-effort and never persists a payload.

pub mod config;
pub mod error;
pub mod gateway;
pub mod registry;
pub mod relay;
pub mod routes;
pub mod server;
pub mod session;
pub mod token;
pub mod types;

//! Wire types shared across the relay.
//!
//! This module defines the JSON event frames exchanged with clients and the
//! identifiers used to address connections. Frames are `type`-tagged JSON
//! objects; message payloads are opaque JSON values that the relay never
//! inspects.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifier assigned to every transport connection on accept.
pub type ConnectionId = Uuid;

/// The literal target string that addresses every authenticated connection.
///
/// A room can never be named `"broadcast"`; that spelling always resolves to
/// [`Target::Broadcast`].
pub const BROADCAST_TARGET: &str = "broadcast";

/// Delivery target of a message frame.
///
/// Serializes as a plain string: `"broadcast"` for [`Target::Broadcast`],
/// anything else is a room name.
///
/// # Example
///
/// ```rust
/// use pulse_server::types::Target;
///
/// let target: Target = serde_json::from_str("\"broadcast\"").unwrap();
/// assert_eq!(target, Target::Broadcast);
///
/// let target: Target = serde_json::from_str("\"lobby\"").unwrap();
/// assert_eq!(target, Target::Room("lobby".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Target {
    /// Every currently authenticated connection except the sender.
    Broadcast,

    /// Members of the named room.
    Room(String),
}

impl From<String> for Target {
    fn from(value: String) -> Self {
        if value == BROADCAST_TARGET {
            Self::Broadcast
        } else {
            Self::Room(value)
        }
    }
}

impl From<Target> for String {
    fn from(target: Target) -> Self {
        match target {
            Target::Broadcast => BROADCAST_TARGET.to_string(),
            Target::Room(room) => room,
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Broadcast => f.write_str(BROADCAST_TARGET),
            Self::Room(room) => f.write_str(room),
        }
    }
}

/// Frames received from clients over an established connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    /// Join a named room. Creates the room implicitly on first join.
    JoinRoom {
        /// Name of the room to join.
        room: String,
    },

    /// Leave a named room. Leaving a room never joined is a no-op.
    LeaveRoom {
        /// Name of the room to leave.
        room: String,
    },

    /// Relay a payload to the given target.
    Message {
        /// `"broadcast"` or a room name.
        target: Target,
        /// Opaque JSON payload, forwarded verbatim.
        payload: Value,
    },
}

/// Frames sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    /// A relayed payload that arrived via broadcast or a joined room.
    Message {
        /// Opaque JSON payload, forwarded verbatim.
        payload: Value,
    },

    /// Handshake failure. The connection is closed after this frame.
    AuthError {
        /// Machine-readable reason code.
        reason: String,
    },

    /// Non-fatal rejection of a client frame. The connection stays open.
    Error {
        /// Machine-readable reason code.
        reason: String,
    },
}

impl ServerFrame {
    /// Creates a relayed message frame.
    pub fn message(payload: Value) -> Self {
        Self::Message { payload }
    }

    /// Creates a terminal handshake-failure frame.
    pub fn auth_error(reason: impl Into<String>) -> Self {
        Self::AuthError {
            reason: reason.into(),
        }
    }

    /// Creates a non-fatal rejection frame.
    pub fn error(reason: impl Into<String>) -> Self {
        Self::Error {
            reason: reason.into(),
        }
    }
}

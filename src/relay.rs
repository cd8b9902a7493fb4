//! Relay engine: fans inbound message events out to their recipients.
//!
//! A message event names a target, either `"broadcast"` or a room. Broadcast
//! reaches every currently authenticated connection except the sender;
//! room-scoped delivery reaches the room's members per the registry, again
//! excluding the sender so both targets follow the same policy. An unknown
//! room resolves to the empty member set and the send is a silent no-op,
//! which keeps implicit room creation off the send path entirely.
//!
//! Delivery is best-effort, at most once. A recipient whose queue is full or
//! closed loses the frame without disturbing the rest of the fan-out; a
//! recipient past its consecutive-failure bound is force-disconnected after
//! the fan-out completes.
//!
//! Ordering: each connection task calls [`RelayEngine::send`] sequentially
//! and the fan-out enqueues synchronously, so per-sender FIFO is preserved
//! for any single target. Nothing is guaranteed across senders or targets.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::gateway::{ConnectionGateway, DeliveryOutcome, GatewayError};
use crate::registry::RoomRegistry;
use crate::types::{ConnectionId, ServerFrame, Target};

/// Routes message events from senders to recipient connections.
pub struct RelayEngine {
    gateway: Arc<ConnectionGateway>,
    registry: Arc<RoomRegistry>,
}

impl RelayEngine {
    /// Creates a relay over the given connection table and room registry.
    pub fn new(gateway: Arc<ConnectionGateway>, registry: Arc<RoomRegistry>) -> Self {
        Self { gateway, registry }
    }

    /// Relays `payload` from `sender` to every recipient of `target`.
    ///
    /// Returns the number of recipients the frame was enqueued for.
    /// Individual delivery failures are absorbed; they are logged by the
    /// gateway and never abort the remaining fan-out. Recipients that exceed
    /// their consecutive-failure bound are force-disconnected (with full room
    /// cleanup) once the fan-out completes.
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
        if !self.gateway.is_authenticated(sender) {
            return Err(GatewayError::NotAuthenticated);
        }

        let recipients: Vec<ConnectionId> = match target {
            Target::Broadcast => self.gateway.authenticated_ids(Some(sender)),
            Target::Room(room) => self
                .registry
                .members(room)
                .into_iter()
                .filter(|id| *id != sender)
                .collect(),
        };

        if recipients.is_empty() {
            trace!(sender = %sender, %target, "no recipients for target");
            return Ok(0);
        }

        let frame = ServerFrame::message(payload);
        let mut delivered = 0;
        let mut stalled = Vec::new();

        for recipient in recipients {
            match self.gateway.deliver(recipient, frame.clone()) {
                DeliveryOutcome::Sent => delivered += 1,
                DeliveryOutcome::Failed => {}
                DeliveryOutcome::FailureBoundExceeded => stalled.push(recipient),
            }
        }

        for recipient in stalled {
            warn!(
                connection = %recipient,
                "force-disconnecting stalled recipient"
            );
            self.gateway.disconnect(recipient, &self.registry);
        }

        debug!(sender = %sender, %target, delivered, "message relayed");
        Ok(delivered)
    }
}

//! Direct (peer-to-peer) chat messages.

use crate::manager::{ConnectionManager, NodeError, NodeEvent};
use lanrelay_core::protocol::{envelope_kind, Envelope, MessagePayload};
use lanrelay_core::types::{DeviceId, MessageText};
use tracing::{info, warn};

impl ConnectionManager {
    /// Sends `text` to `peer_id`, appending it to the local history log
    /// first. A message addressed to this node's own device id is recorded
    /// once and never put on the wire: there is no outbound connection to
    /// self, so the on-receipt append below would never fire for it anyway.
    pub async fn send_direct(&self, peer_id: &DeviceId, text: &str) -> Result<(), NodeError> {
        let validated =
            MessageText::new(text).map_err(|e| NodeError::InvalidInput(e.to_string()))?;
        let envelope = self.envelope(
            envelope_kind::MESSAGE,
            MessagePayload {
                text: validated.as_str().to_string(),
            },
        )?;

        self.history.append_direct(peer_id, &envelope)?;

        if *peer_id == self.identity().device_id {
            return Ok(());
        }

        let writer = self
            .writer_for(peer_id)
            .await
            .ok_or_else(|| NodeError::NotConnected(peer_id.clone()))?;
        writer.send_json(&envelope).await?;
        info!(peer = %peer_id, "direct message sent");
        Ok(())
    }

    pub(crate) async fn on_message(&self, from: &DeviceId, envelope: Envelope) {
        let payload: MessagePayload = match envelope.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(peer = %from, error = %e, "malformed message payload, dropping");
                return;
            }
        };

        if let Err(e) = self.history.append_direct(from, &envelope) {
            warn!(peer = %from, error = %e, "failed to persist incoming message");
        }

        info!(peer = %from, "direct message received");
        self.emit(NodeEvent::DirectMessage {
            from: from.clone(),
            text: payload.text,
        });
    }

    /// Returns every envelope ever exchanged with `peer_id`, oldest first.
    pub fn direct_history(&self, peer_id: &DeviceId) -> Result<Vec<Envelope>, NodeError> {
        Ok(self.history.read_direct(peer_id)?)
    }
}

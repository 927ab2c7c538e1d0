//! Master-relay group chat: deterministic master election, epoch-based
//! convergence between disagreeing peers, and invite/join handshaking.

use crate::manager::{ConnectionManager, NodeError, NodeEvent};
use lanrelay_core::protocol::{
    envelope_kind, Envelope, GroupInvitePayload, GroupJoinAckPayload, GroupJoinPayload,
    GroupJoinRejectPayload, GroupMasterPayload, GroupMessagePayload,
};
use lanrelay_core::types::{DeviceId, GroupId, GroupRecord, MessageId, MessageText, Timestamp};
use std::collections::BTreeSet;
use tracing::{info, warn};

/// A `group_invite` the user hasn't responded to yet. Nothing about the
/// group index changes until [`ConnectionManager::accept_invite`] is
/// called explicitly.
#[derive(Debug, Clone)]
pub struct PendingInvite {
    pub name: String,
    pub master_id: DeviceId,
    pub inviter_id: DeviceId,
}

impl ConnectionManager {
    /// Creates a new group with this node as the sole member and master,
    /// persists it, and sends `group_invite` to each of `invitees`.
    pub async fn create_group(
        &self,
        name: &str,
        invitees: &[DeviceId],
    ) -> Result<GroupId, NodeError> {
        let self_id = self.identity().device_id.clone();
        let group_id = GroupId::generate();
        let record = GroupRecord::new(group_id.clone(), name, self_id, Timestamp::now().as_secs());

        self.history.save_group(&record)?;
        self.groups.lock().await.insert(group_id.clone(), record);

        for peer_id in invitees {
            if let Err(e) = self.invite(&group_id, peer_id).await {
                warn!(peer = %peer_id, group = %group_id, error = %e, "failed to send group invite");
            }
        }

        Ok(group_id)
    }

    /// Sends a `group_invite` for `group_id` to `peer_id`. The caller is
    /// expected to be the group's master; this does not itself update the
    /// membership set — that happens once `group_join`/`group_join_ack`
    /// complete the handshake.
    pub async fn invite(&self, group_id: &GroupId, peer_id: &DeviceId) -> Result<(), NodeError> {
        let name = {
            let groups = self.groups.lock().await;
            let record = groups
                .get(group_id)
                .ok_or_else(|| NodeError::InvalidInput(format!("unknown group {group_id}")))?;
            record.name.clone()
        };

        let envelope = self.envelope(
            envelope_kind::GROUP_INVITE,
            GroupInvitePayload {
                group_id: group_id.as_str().to_string(),
                name,
                master_id: self.identity().device_id.as_str().to_string(),
                inviter_id: self.identity().device_id.as_str().to_string(),
            },
        )?;

        let writer = self
            .writer_for(peer_id)
            .await
            .ok_or_else(|| NodeError::NotConnected(peer_id.clone()))?;
        writer.send_json(&envelope).await?;
        Ok(())
    }

    /// Accepts a previously recorded invite, registers a minimal local
    /// record for the group, and sends `group_join` to the master. The
    /// master's `group_join_ack` fills in the authoritative membership set.
    pub async fn accept_invite(&self, group_id: &GroupId) -> Result<(), NodeError> {
        let invite = self
            .pending_invites
            .lock()
            .await
            .remove(group_id)
            .ok_or_else(|| NodeError::InvalidInput(format!("no pending invite for {group_id}")))?;

        let self_id = self.identity().device_id.clone();
        let mut members = BTreeSet::new();
        members.insert(invite.master_id.clone());
        members.insert(self_id);
        let record = GroupRecord {
            group_id: group_id.clone(),
            name: invite.name,
            members,
            master_id: invite.master_id.clone(),
            epoch: 0,
        };
        self.history.save_group(&record)?;
        self.groups.lock().await.insert(group_id.clone(), record);

        let envelope = self.envelope(
            envelope_kind::GROUP_JOIN,
            GroupJoinPayload {
                group_id: group_id.as_str().to_string(),
            },
        )?;
        let writer = self
            .writer_for(&invite.master_id)
            .await
            .ok_or(NodeError::NotConnected(invite.master_id))?;
        writer.send_json(&envelope).await?;
        Ok(())
    }

    pub(crate) async fn on_group_invite(&self, from: &DeviceId, envelope: Envelope) {
        let payload: GroupInvitePayload = match envelope.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(peer = %from, error = %e, "malformed group_invite payload, dropping");
                return;
            }
        };
        let group_id = GroupId::new(payload.group_id.clone());
        let name = payload.name.clone();
        let inviter = DeviceId::new(payload.inviter_id.clone());

        self.pending_invites.lock().await.insert(
            group_id.clone(),
            PendingInvite {
                name: name.clone(),
                master_id: DeviceId::new(payload.master_id),
                inviter_id: inviter.clone(),
            },
        );

        self.emit(NodeEvent::GroupInvite {
            group_id,
            name,
            inviter,
        });
    }

    pub(crate) async fn on_group_join(&self, from: &DeviceId, envelope: Envelope) {
        let payload: GroupJoinPayload = match envelope.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(peer = %from, error = %e, "malformed group_join payload, dropping");
                return;
            }
        };
        let group_id = GroupId::new(payload.group_id);
        let self_id = self.identity().device_id.clone();

        let accepted_snapshot = {
            let mut groups = self.groups.lock().await;
            match groups.get_mut(&group_id) {
                Some(record) if record.master_id == self_id => {
                    record.members.insert(from.clone());
                    record.epoch += 1;
                    Some(record.clone())
                }
                _ => None,
            }
        };

        let Some(record) = accepted_snapshot else {
            self.reject_join(from, &group_id, "not the master for this group")
                .await;
            return;
        };

        if let Err(e) = self.history.save_group(&record) {
            warn!(group = %group_id, error = %e, "failed to persist updated group membership");
        }

        let ack = match self.envelope(
            envelope_kind::GROUP_JOIN_ACK,
            GroupJoinAckPayload {
                group_id: group_id.as_str().to_string(),
                members: record.members.iter().map(|m| m.as_str().to_string()).collect(),
                master_id: record.master_id.as_str().to_string(),
                epoch: record.epoch,
            },
        ) {
            Ok(e) => e,
            Err(e) => {
                warn!(group = %group_id, error = %e, "failed to build group_join_ack");
                return;
            }
        };
        if let Some(writer) = self.writer_for(from).await {
            let _ = writer.send_json(&ack).await;
        }

        self.announce_master(&record, Some(from)).await;
    }

    async fn reject_join(&self, to: &DeviceId, group_id: &GroupId, reason: &str) {
        let Ok(envelope) = self.envelope(
            envelope_kind::GROUP_JOIN_REJECT,
            GroupJoinRejectPayload {
                group_id: group_id.as_str().to_string(),
                reason: reason.to_string(),
            },
        ) else {
            return;
        };
        if let Some(writer) = self.writer_for(to).await {
            let _ = writer.send_json(&envelope).await;
        }
    }

    pub(crate) async fn on_group_join_ack(&self, from: &DeviceId, envelope: Envelope) {
        let payload: GroupJoinAckPayload = match envelope.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(peer = %from, error = %e, "malformed group_join_ack payload, dropping");
                return;
            }
        };
        let group_id = GroupId::new(payload.group_id);
        let members: BTreeSet<DeviceId> = payload.members.into_iter().map(DeviceId::new).collect();
        let master_id = DeviceId::new(payload.master_id);

        let mut groups = self.groups.lock().await;
        let record = groups.entry(group_id.clone()).or_insert_with(|| GroupRecord {
            group_id: group_id.clone(),
            name: String::new(),
            members: members.clone(),
            master_id: master_id.clone(),
            epoch: payload.epoch,
        });
        record.members = members;
        record.master_id = master_id;
        record.epoch = payload.epoch;
        let snapshot = record.clone();
        drop(groups);

        if let Err(e) = self.history.save_group(&snapshot) {
            warn!(group = %group_id, error = %e, "failed to persist group_join_ack");
        }
        info!(group = %group_id, "joined group");
    }

    pub(crate) async fn on_group_join_reject(&self, from: &DeviceId, envelope: Envelope) {
        let payload: GroupJoinRejectPayload = match envelope.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(peer = %from, error = %e, "malformed group_join_reject payload, dropping");
                return;
            }
        };
        let group_id = GroupId::new(payload.group_id);
        warn!(peer = %from, group = %group_id, reason = %payload.reason, "group join rejected");
        self.emit(NodeEvent::GroupJoinRejected {
            group_id,
            reason: payload.reason,
        });
    }

    pub(crate) async fn on_group_master(&self, from: &DeviceId, envelope: Envelope) {
        let payload: GroupMasterPayload = match envelope.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(peer = %from, error = %e, "malformed group_master payload, dropping");
                return;
            }
        };
        let group_id = GroupId::new(payload.group_id);
        let members: BTreeSet<DeviceId> = payload.members.into_iter().map(DeviceId::new).collect();
        let master_id = DeviceId::new(payload.master_id);

        let mut groups = self.groups.lock().await;
        let (accepted, snapshot) = match groups.get_mut(&group_id) {
            Some(record) => {
                let accepted = record.merge_announcement(members, master_id, payload.epoch);
                (accepted, record.clone())
            }
            None => {
                let record = GroupRecord {
                    group_id: group_id.clone(),
                    name: payload.name,
                    members,
                    master_id,
                    epoch: payload.epoch,
                };
                groups.insert(group_id.clone(), record.clone());
                (true, record)
            }
        };
        drop(groups);

        if accepted {
            if let Err(e) = self.history.save_group(&snapshot) {
                warn!(group = %group_id, error = %e, "failed to persist group_master announcement");
            }
        }
    }

    /// Computes the effective master for `record`: its recorded master if
    /// currently connected, otherwise the result of local election over
    /// connected members plus self. Mutates `record` in place when election
    /// changes the master, per the epoch-advance rule.
    async fn effective_master(&self, record: &mut GroupRecord) -> DeviceId {
        let self_id = self.identity().device_id.clone();
        if record.master_id == self_id {
            return self_id;
        }
        if self.writer_for(&record.master_id).await.is_some() {
            return record.master_id.clone();
        }

        let connected: BTreeSet<DeviceId> =
            self.peers().await.into_iter().map(|p| p.device_id).collect();
        let candidates: Vec<DeviceId> = record
            .members
            .iter()
            .filter(|m| **m == self_id || connected.contains(*m))
            .cloned()
            .collect();
        let new_master = if candidates.is_empty() {
            self_id.clone()
        } else {
            GroupRecord::elect_master(candidates.iter())
        };

        let now = Timestamp::now().as_secs();
        record.epoch = if now > record.epoch { now } else { record.epoch + 1 };
        record.master_id = new_master.clone();
        new_master
    }

    async fn announce_master(&self, record: &GroupRecord, exclude: Option<&DeviceId>) {
        let self_id = self.identity().device_id.clone();
        let Ok(envelope) = self.envelope(
            envelope_kind::GROUP_MASTER,
            GroupMasterPayload {
                group_id: record.group_id.as_str().to_string(),
                name: record.name.clone(),
                members: record.members.iter().map(|m| m.as_str().to_string()).collect(),
                master_id: record.master_id.as_str().to_string(),
                epoch: record.epoch,
            },
        ) else {
            return;
        };
        for member in &record.members {
            if *member == self_id || Some(member) == exclude {
                continue;
            }
            if let Some(writer) = self.writer_for(member).await {
                let _ = writer.send_json(&envelope).await;
            }
        }
    }

    /// Sends `text` to every member of `group_id`, relaying through the
    /// effective master per the master-relay design.
    pub async fn send_group(&self, group_id: &GroupId, text: &str) -> Result<(), NodeError> {
        let validated =
            MessageText::new(text).map_err(|e| NodeError::InvalidInput(e.to_string()))?;
        let self_id = self.identity().device_id.clone();

        let (master, snapshot) = {
            let mut groups = self.groups.lock().await;
            let record = groups
                .get_mut(group_id)
                .ok_or_else(|| NodeError::InvalidInput(format!("unknown group {group_id}")))?;
            let master = self.effective_master(record).await;
            (master, record.clone())
        };
        self.history.save_group(&snapshot)?;

        let message_id = MessageId::generate();
        let envelope = self.envelope(
            envelope_kind::GROUP_MESSAGE,
            GroupMessagePayload {
                group_id: group_id.as_str().to_string(),
                message_id: message_id.as_str().to_string(),
                from_id: self_id.as_str().to_string(),
                text: validated.as_str().to_string(),
            },
        )?;
        self.seen_group_messages
            .lock()
            .await
            .insert(message_id.as_str().to_string());

        if master == self_id {
            self.history.append_group(group_id, &envelope)?;
            for member in &snapshot.members {
                if *member == self_id {
                    continue;
                }
                if let Some(writer) = self.writer_for(member).await {
                    let _ = writer.send_json(&envelope).await;
                }
            }
        } else {
            let writer = self
                .writer_for(&master)
                .await
                .ok_or(NodeError::NotConnected(master))?;
            writer.send_json(&envelope).await?;
        }

        Ok(())
    }

    pub(crate) async fn on_group_message(&self, from: &DeviceId, envelope: Envelope) {
        let payload: GroupMessagePayload = match envelope.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(peer = %from, error = %e, "malformed group_message payload, dropping");
                return;
            }
        };

        {
            let mut seen = self.seen_group_messages.lock().await;
            if !seen.insert(payload.message_id.clone()) {
                return;
            }
        }

        let group_id = GroupId::new(payload.group_id.clone());
        let self_id = self.identity().device_id.clone();

        let snapshot = {
            let groups = self.groups.lock().await;
            match groups.get(&group_id) {
                Some(record) => record.clone(),
                None => {
                    warn!(peer = %from, group = %group_id, "group_message for unknown group, dropping");
                    return;
                }
            }
        };

        if let Err(e) = self.history.append_group(&group_id, &envelope) {
            warn!(group = %group_id, error = %e, "failed to persist incoming group message");
        }

        if snapshot.master_id == self_id {
            for member in &snapshot.members {
                if *member == self_id || *member == *from {
                    continue;
                }
                if let Some(writer) = self.writer_for(member).await {
                    let _ = writer.send_json(&envelope).await;
                }
            }
        }

        self.emit(NodeEvent::GroupMessage {
            group_id,
            from: DeviceId::new(payload.from_id),
            text: payload.text,
        });
    }

    /// Returns every envelope ever appended to `group_id`'s local history.
    pub fn group_history(&self, group_id: &GroupId) -> Result<Vec<Envelope>, NodeError> {
        Ok(self.history.read_group(group_id)?)
    }

    /// Returns a snapshot of every group this node currently knows about.
    pub async fn groups(&self) -> Vec<GroupRecord> {
        self.groups.lock().await.values().cloned().collect()
    }
}

//! Central coordinator: accepts inbound sockets, dials outbound ones, tracks
//! peers by device id, and dispatches parsed frames to the messaging, group,
//! and file-transfer handlers.
//!
//! Mirrors the role the daemon's main event loop plays in the codebase this
//! was grounded on, but without a separate IPC layer — this struct is driven
//! directly by the peer accept loop and the interactive shell, in the same
//! process.

use crate::group::PendingInvite;
use crate::peer::{spawn_peer, PeerEvent, PeerWriter};
use crate::transfer::ReceiveSession;
use lanrelay_core::history::{HistoryError, HistoryStore};
use lanrelay_core::protocol::{envelope_kind, Envelope, ProtocolError};
use lanrelay_core::types::{DeviceId, DiscoveredPeer, FileId, GroupId, GroupRecord, Platform};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("history error: {0}")]
    History(#[from] HistoryError),

    #[error("not connected to peer {0}")]
    NotConnected(DeviceId),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// This node's own identity, loaded from config at startup.
#[derive(Debug, Clone)]
pub struct Identity {
    pub device_id: DeviceId,
    pub device_name: String,
    pub platform: Platform,
}

/// A connected, handshook peer.
pub struct PeerRecord {
    pub device_id: DeviceId,
    pub device_name: String,
    pub platform: Platform,
    pub addr: SocketAddr,
    pub writer: Arc<PeerWriter>,
}

/// A lightweight snapshot of a peer record for callers that just need to
/// list who's connected (the shell's `peers` command).
#[derive(Debug, Clone)]
pub struct PeerSummary {
    pub device_id: DeviceId,
    pub device_name: String,
    pub addr: SocketAddr,
}

/// Observable events the shell subscribes to.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    PeerConnected {
        device_id: DeviceId,
        device_name: String,
        addr: SocketAddr,
    },
    PeerDisconnected {
        device_id: DeviceId,
    },
    DirectMessage {
        from: DeviceId,
        text: String,
    },
    GroupMessage {
        group_id: GroupId,
        from: DeviceId,
        text: String,
    },
    GroupInvite {
        group_id: GroupId,
        name: String,
        inviter: DeviceId,
    },
    GroupJoinRejected {
        group_id: GroupId,
        reason: String,
    },
    FileProgress {
        file_id: FileId,
        bytes: u64,
        total: u64,
    },
    FileReceived {
        filename: String,
        path: PathBuf,
    },
    TransferFailed {
        file_id: FileId,
        reason: String,
    },
}

/// Owns every peer record, group record, and in-flight receive session.
/// Always used behind an `Arc` so accept/connect/reader tasks can share it.
pub struct ConnectionManager {
    pub(crate) identity: Identity,
    pub(crate) peers: Mutex<HashMap<DeviceId, PeerRecord>>,
    pub(crate) groups: Mutex<HashMap<GroupId, GroupRecord>>,
    pub(crate) transfers: Mutex<HashMap<(DeviceId, FileId), ReceiveSession>>,
    pub(crate) pending_invites: Mutex<HashMap<GroupId, PendingInvite>>,
    pub(crate) seen_group_messages: Mutex<HashSet<String>>,
    pub(crate) discovered: Mutex<HashMap<DeviceId, DiscoveredPeer>>,
    pub(crate) history: HistoryStore,
    pub(crate) received_dir: PathBuf,
    pub(crate) events: broadcast::Sender<NodeEvent>,
}

impl ConnectionManager {
    pub fn new(
        identity: Identity,
        history: HistoryStore,
        received_dir: PathBuf,
    ) -> (Arc<Self>, broadcast::Receiver<NodeEvent>) {
        let (events, rx) = broadcast::channel(256);
        let groups = history.load_groups().unwrap_or_else(|e| {
            warn!(error = %e, "failed to load persisted group state, starting empty");
            HashMap::new()
        });
        let manager = Arc::new(Self {
            identity,
            peers: Mutex::new(HashMap::new()),
            groups: Mutex::new(groups),
            transfers: Mutex::new(HashMap::new()),
            pending_invites: Mutex::new(HashMap::new()),
            seen_group_messages: Mutex::new(HashSet::new()),
            discovered: Mutex::new(HashMap::new()),
            history,
            received_dir,
            events,
        });
        (manager, rx)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    /// Spawns the accept loop over an already-bound listener, plus a task
    /// that drains `discovery_in` — recording every discovered peer and
    /// auto-dialing any whose `device_id` isn't already connected. Returns
    /// the listener's bound port. The listener is bound by the caller
    /// (rather than from a `SocketAddr` here) so the caller can learn the
    /// real port — needed when binding to port 0 — before starting
    /// discovery, which announces it to the LAN.
    pub async fn start(
        self: &Arc<Self>,
        listener: TcpListener,
        discovery_in: mpsc::Receiver<DiscoveredPeer>,
    ) -> Result<u16, NodeError> {
        let port = listener.local_addr()?.port();
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.accept_loop(listener).await;
        });

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.discovery_loop(discovery_in).await;
        });

        Ok(port)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let manager = Arc::clone(&self);
                    tokio::spawn(async move {
                        manager.handle_connection(stream, addr).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "failed to accept inbound connection");
                }
            }
        }
    }

    /// Records every peer surfaced by discovery and dials any whose device
    /// id isn't already a connected peer. Connect attempts are spawned so a
    /// slow/unreachable peer never stalls discovery of the next one.
    async fn discovery_loop(self: Arc<Self>, mut discovery_in: mpsc::Receiver<DiscoveredPeer>) {
        while let Some(peer) = discovery_in.recv().await {
            self.discovered.lock().await.insert(peer.device_id.clone(), peer.clone());

            if peer.device_id == self.identity.device_id {
                continue;
            }
            if self.peers.lock().await.contains_key(&peer.device_id) {
                continue;
            }

            let manager = Arc::clone(&self);
            let addr = SocketAddr::new(peer.ip, peer.tcp_port);
            tokio::spawn(async move {
                if let Err(e) = manager.connect(addr).await {
                    debug!(peer = %peer.device_id, %addr, error = %e, "auto-dial of discovered peer failed");
                }
            });
        }
    }

    /// Returns a snapshot of every peer seen via UDP discovery.
    pub async fn discovered_peers(&self) -> Vec<DiscoveredPeer> {
        self.discovered.lock().await.values().cloned().collect()
    }

    /// Dials `addr`, performs the handshake, and returns the remote peer's
    /// device id once registered.
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<DeviceId, NodeError> {
        let stream = TcpStream::connect(addr).await?;
        let manager = Arc::clone(self);
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let device_id = manager.handle_connection(stream, addr).await;
            let _ = tx.send(device_id);
        });
        rx.await
            .map_err(|_| NodeError::Io(std::io::Error::other("connection task dropped")))?
            .ok_or_else(|| NodeError::Io(std::io::Error::other("handshake failed")))
    }

    fn handshake_envelope(&self) -> Envelope {
        Envelope::new(
            envelope_kind::HANDSHAKE,
            self.identity.device_id.clone(),
            self.identity.device_name.clone(),
            self.identity.platform,
            serde_json::json!({}),
        )
        .expect("handshake payload always serializes")
    }

    /// Drives one peer connection end to end: sends our handshake, waits for
    /// theirs, registers the peer, then dispatches every subsequent frame
    /// until the connection closes. Returns the remote device id if the
    /// handshake completed.
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Option<DeviceId> {
        let (writer, addr, mut rx) = spawn_peer(stream, addr);

        if let Err(e) = writer.send_json(&self.handshake_envelope()).await {
            warn!(error = %e, %addr, "failed to send handshake");
            return None;
        }

        let (device_id, device_name, platform) = match rx.recv().await {
            Some(PeerEvent::Json(envelope)) if envelope.kind == envelope_kind::HANDSHAKE => {
                (envelope.device_id, envelope.device_name, envelope.platform)
            }
            Some(_) => {
                warn!(%addr, "first message was not a handshake, closing connection");
                writer.shutdown().await;
                return None;
            }
            None => {
                debug!(%addr, "connection closed before handshake completed");
                return None;
            }
        };

        info!(peer = %device_id, name = %device_name, %addr, "peer handshake complete");

        {
            let mut peers = self.peers.lock().await;
            if let Some(old) = peers.insert(
                device_id.clone(),
                PeerRecord {
                    device_id: device_id.clone(),
                    device_name: device_name.clone(),
                    platform,
                    addr,
                    writer: Arc::clone(&writer),
                },
            ) {
                warn!(peer = %device_id, "replacing existing connection to this device id");
                old.writer.shutdown().await;
            }
        }
        self.emit(NodeEvent::PeerConnected {
            device_id: device_id.clone(),
            device_name,
            addr,
        });

        while let Some(event) = rx.recv().await {
            match event {
                PeerEvent::Json(envelope) => self.dispatch_json(&device_id, envelope).await,
                PeerEvent::Binary(frame) => self.dispatch_binary(&device_id, frame).await,
                PeerEvent::Closed(reason) => {
                    debug!(peer = %device_id, ?reason, "peer connection closed");
                    break;
                }
            }
        }

        let mut peers = self.peers.lock().await;
        if let Some(record) = peers.get(&device_id) {
            if Arc::ptr_eq(&record.writer, &writer) {
                peers.remove(&device_id);
                drop(peers);
                self.emit(NodeEvent::PeerDisconnected {
                    device_id: device_id.clone(),
                });
            }
        }

        Some(device_id)
    }

    async fn dispatch_json(&self, from: &DeviceId, envelope: Envelope) {
        match envelope.kind.as_str() {
            envelope_kind::MESSAGE => self.on_message(from, envelope).await,
            envelope_kind::GROUP_MASTER => self.on_group_master(from, envelope).await,
            envelope_kind::GROUP_INVITE => self.on_group_invite(from, envelope).await,
            envelope_kind::GROUP_JOIN => self.on_group_join(from, envelope).await,
            envelope_kind::GROUP_JOIN_ACK => self.on_group_join_ack(from, envelope).await,
            envelope_kind::GROUP_JOIN_REJECT => self.on_group_join_reject(from, envelope).await,
            envelope_kind::GROUP_MESSAGE => self.on_group_message(from, envelope).await,
            envelope_kind::HANDSHAKE => {
                debug!(peer = %from, "ignoring unexpected handshake after registration");
            }
            other => {
                debug!(peer = %from, kind = other, "ignoring unknown envelope type");
            }
        }
    }

    async fn dispatch_binary(&self, from: &DeviceId, frame: lanrelay_core::protocol::BinaryFrame) {
        use lanrelay_core::protocol::BinaryFrame;
        match frame {
            BinaryFrame::Meta(meta) => self.on_file_meta(from, meta).await,
            BinaryFrame::Chunk(chunk) => self.on_file_chunk(from, chunk).await,
        }
    }

    /// Returns a snapshot of every currently connected peer.
    pub async fn peers(&self) -> Vec<PeerSummary> {
        self.peers
            .lock()
            .await
            .values()
            .map(|p| PeerSummary {
                device_id: p.device_id.clone(),
                device_name: p.device_name.clone(),
                addr: p.addr,
            })
            .collect()
    }

    pub(crate) async fn writer_for(&self, device_id: &DeviceId) -> Option<Arc<PeerWriter>> {
        self.peers.lock().await.get(device_id).map(|p| Arc::clone(&p.writer))
    }

    pub(crate) fn envelope(
        &self,
        kind: &str,
        payload: impl serde::Serialize,
    ) -> Result<Envelope, NodeError> {
        Ok(Envelope::new(
            kind,
            self.identity.device_id.clone(),
            self.identity.device_name.clone(),
            self.identity.platform,
            payload,
        )?)
    }
}

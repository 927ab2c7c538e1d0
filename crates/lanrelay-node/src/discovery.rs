//! LAN peer discovery over UDP broadcast: no central server, no mDNS
//! dependency. One task sends a periodic announcement, another listens for
//! announcements and request/response traffic and forwards what it learns
//! into a channel the connection manager drains.

use lanrelay_core::types::{DeviceId, DiscoveredPeer, Platform};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const DISCOVERY_INTERVAL: Duration = Duration::from_secs(3);
const MAX_DATAGRAM: usize = 2048;
const BROADCAST_ADDR: &str = "255.255.255.255";

const KIND_REQUEST: &str = "discovery_request";
const KIND_RESPONSE: &str = "discovery_response";

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// This node's own identity as broadcast to the LAN.
#[derive(Debug, Clone)]
pub struct DiscoveryIdentity {
    pub device_id: DeviceId,
    pub device_name: String,
    pub platform: Platform,
    pub tcp_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DiscoveryMessage {
    #[serde(rename = "type")]
    kind: String,
    device_id: String,
    device_name: String,
    platform: Platform,
    ip: IpAddr,
    tcp_port: u16,
    timestamp: i64,
}

impl DiscoveryMessage {
    fn new(kind: &str, identity: &DiscoveryIdentity, ip: IpAddr) -> Self {
        Self {
            kind: kind.to_string(),
            device_id: identity.device_id.as_str().to_string(),
            device_name: identity.device_name.clone(),
            platform: identity.platform,
            ip,
            tcp_port: identity.tcp_port,
            timestamp: lanrelay_core::types::Timestamp::now().as_secs(),
        }
    }
}

/// Binds the discovery socket and spawns the broadcast and listen tasks.
/// Returns a channel of `DiscoveredPeer` records observed from either a
/// request or a response, deduplicated by the caller as it sees fit.
pub async fn start(
    identity: DiscoveryIdentity,
    udp_port: u16,
) -> Result<mpsc::Receiver<DiscoveredPeer>, DiscoveryError> {
    let socket = UdpSocket::bind(("0.0.0.0", udp_port)).await?;
    socket.set_broadcast(true)?;
    let socket = std::sync::Arc::new(socket);

    let (tx, rx) = mpsc::channel(64);

    let broadcast_socket = std::sync::Arc::clone(&socket);
    let broadcast_identity = identity.clone();
    tokio::spawn(async move {
        broadcast_loop(broadcast_socket, broadcast_identity, udp_port).await;
    });

    tokio::spawn(async move {
        listen_loop(socket, identity, tx).await;
    });

    Ok(rx)
}

async fn broadcast_loop(socket: std::sync::Arc<UdpSocket>, identity: DiscoveryIdentity, udp_port: u16) {
    let target: SocketAddr = match format!("{BROADCAST_ADDR}:{udp_port}").parse() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(error = %e, "failed to parse broadcast address, discovery disabled");
            return;
        }
    };
    let local_ip = local_outbound_ip().unwrap_or(IpAddr::from([0, 0, 0, 0]));

    loop {
        let message = DiscoveryMessage::new(KIND_REQUEST, &identity, local_ip);
        match serde_json::to_vec(&message) {
            Ok(bytes) => {
                if let Err(e) = socket.send_to(&bytes, target).await {
                    warn!(error = %e, "failed to send discovery broadcast");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode discovery broadcast"),
        }
        tokio::time::sleep(DISCOVERY_INTERVAL).await;
    }
}

async fn listen_loop(
    socket: std::sync::Arc<UdpSocket>,
    identity: DiscoveryIdentity,
    tx: mpsc::Sender<DiscoveredPeer>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from_addr) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "discovery socket read failed");
                continue;
            }
        };

        let message: DiscoveryMessage = match serde_json::from_slice(&buf[..len]) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, %from_addr, "ignoring malformed discovery datagram");
                continue;
            }
        };

        if message.device_id == identity.device_id.as_str() {
            continue;
        }

        let peer = DiscoveredPeer {
            device_id: DeviceId::new(message.device_id.clone()),
            device_name: message.device_name.clone(),
            platform: message.platform,
            ip: message.ip,
            tcp_port: message.tcp_port,
            last_seen: lanrelay_core::types::Timestamp::now(),
        };
        if tx.send(peer).await.is_err() {
            break;
        }

        if message.kind == KIND_REQUEST {
            let reply = DiscoveryMessage::new(KIND_RESPONSE, &identity, message.ip);
            if let Ok(bytes) = serde_json::to_vec(&reply) {
                let reply_addr = SocketAddr::new(from_addr.ip(), from_addr.port());
                if let Err(e) = socket.send_to(&bytes, reply_addr).await {
                    warn!(error = %e, %from_addr, "failed to send discovery response");
                }
            }
        } else if message.kind != KIND_RESPONSE {
            debug!(kind = %message.kind, "ignoring unknown discovery message kind");
        }
    }
}

/// Best-effort local outbound IP: connecting a UDP socket doesn't send any
/// packets, it only asks the kernel to pick a route, so this works without
/// real network access and without an extra dependency on an interface-
/// enumeration crate.
fn local_outbound_ip() -> std::io::Result<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80")?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_message_roundtrips_through_json() {
        let identity = DiscoveryIdentity {
            device_id: DeviceId::new("abc"),
            device_name: "kitchen-pc".to_string(),
            platform: Platform::Pc,
            tcp_port: 60000,
        };
        let message = DiscoveryMessage::new(KIND_REQUEST, &identity, IpAddr::from([127, 0, 0, 1]));
        let bytes = serde_json::to_vec(&message).unwrap();
        let decoded: DiscoveryMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.kind, KIND_REQUEST);
        assert_eq!(decoded.device_id, "abc");
        assert_eq!(decoded.tcp_port, 60000);
    }

    #[test]
    fn discovery_message_uses_wire_type_field_name() {
        let identity = DiscoveryIdentity {
            device_id: DeviceId::new("abc"),
            device_name: "kitchen-pc".to_string(),
            platform: Platform::Pc,
            tcp_port: 60000,
        };
        let message = DiscoveryMessage::new(KIND_RESPONSE, &identity, IpAddr::from([127, 0, 0, 1]));
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "discovery_response");
        assert!(value.get("kind").is_none());
    }
}

//! Interactive line-oriented command shell. Runs on stdin/stdout alongside
//! the TCP accept loop and UDP discovery task in the same process — there is
//! no separate daemon/IPC split to drive this from.

use crate::discovery::DiscoveryIdentity;
use crate::manager::{ConnectionManager, NodeEvent};
use lanrelay_core::types::{DeviceId, GroupId};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

/// Drives the shell: reads commands from stdin until `quit` or EOF, while
/// concurrently printing node events (incoming messages, peer connects, file
/// progress) as they arrive. Discovered peers are auto-dialed by the
/// connection manager; the `discoveries`/`connect_discovered` commands here
/// just read its snapshot.
pub async fn run(manager: Arc<ConnectionManager>, mut events: broadcast::Receiver<NodeEvent>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    print_prompt();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => print_event(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        println!("(missed {n} events)");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if handle_line(&manager, &line).await {
                            break;
                        }
                        print_prompt();
                    }
                    Ok(None) => break,
                    Err(e) => {
                        eprintln!("stdin error: {e}");
                        break;
                    }
                }
            }
        }
    }
}

fn print_prompt() {
    use std::io::Write;
    print!("> ");
    let _ = std::io::stdout().flush();
}

fn print_event(event: NodeEvent) {
    match event {
        NodeEvent::PeerConnected { device_id, device_name, addr } => {
            println!("[peer connected] {device_name} ({device_id}) at {addr}");
        }
        NodeEvent::PeerDisconnected { device_id } => {
            println!("[peer disconnected] {device_id}");
        }
        NodeEvent::DirectMessage { from, text } => {
            println!("[{from}] {text}");
        }
        NodeEvent::GroupMessage { group_id, from, text } => {
            println!("[group {group_id}] [{from}] {text}");
        }
        NodeEvent::GroupInvite { group_id, name, inviter } => {
            println!(
                "[group invite] {inviter} invited you to \"{name}\" ({group_id}) — use accept_invite {group_id}"
            );
        }
        NodeEvent::GroupJoinRejected { group_id, reason } => {
            println!("[group {group_id}] join rejected: {reason}");
        }
        NodeEvent::FileProgress { file_id, bytes, total } => {
            println!("[transfer {file_id}] {bytes}/{total} bytes");
        }
        NodeEvent::FileReceived { filename, path } => {
            println!("[file received] {filename} -> {}", path.display());
        }
        NodeEvent::TransferFailed { file_id, reason } => {
            println!("[transfer {file_id}] failed: {reason}");
        }
    }
}

/// Handles one command line. Returns true if the shell should stop.
async fn handle_line(manager: &Arc<ConnectionManager>, line: &str) -> bool {
    let parts: Vec<&str> = line.trim().split_whitespace().collect();
    let Some(&command) = parts.first() else {
        return false;
    };

    match command {
        "quit" | "exit" => return true,

        "peers" => {
            for peer in manager.peers().await {
                println!("{} {} {}", peer.device_id, peer.device_name, peer.addr);
            }
        }

        "discoveries" => {
            for peer in manager.discovered_peers().await {
                println!(
                    "{} {} {} {}:{}",
                    peer.device_id, peer.device_name, peer.platform, peer.ip, peer.tcp_port
                );
            }
        }

        "connect" => {
            let (Some(ip), Some(port)) = (parts.get(1), parts.get(2)) else {
                println!("usage: connect <ip> <port>");
                return false;
            };
            match format!("{ip}:{port}").parse() {
                Ok(addr) => match manager.connect(addr).await {
                    Ok(device_id) => println!("connected to {device_id}"),
                    Err(e) => println!("connect failed: {e}"),
                },
                Err(e) => println!("invalid address: {e}"),
            }
        }

        "connect_discovered" => {
            let Some(device_id) = parts.get(1) else {
                println!("usage: connect_discovered <device_id>");
                return false;
            };
            let target = DeviceId::new(*device_id);
            let found = manager.discovered_peers().await.into_iter().find(|p| p.device_id == target);
            match found {
                Some(peer) => match manager.connect(std::net::SocketAddr::new(peer.ip, peer.tcp_port)).await {
                    Ok(device_id) => println!("connected to {device_id}"),
                    Err(e) => println!("connect failed: {e}"),
                },
                None => println!("no discovered peer with that device id"),
            }
        }

        "msg" => {
            let Some(peer_id) = parts.get(1) else {
                println!("usage: msg <peer_id> <text>");
                return false;
            };
            let text = line.splitn(3, char::is_whitespace).nth(2).unwrap_or("");
            match manager.send_direct(&DeviceId::new(*peer_id), text).await {
                Ok(()) => {}
                Err(e) => println!("send failed: {e}"),
            }
        }

        "history" => {
            let Some(peer_id) = parts.get(1) else {
                println!("usage: history <peer_id>");
                return false;
            };
            match manager.direct_history(&DeviceId::new(*peer_id)) {
                Ok(entries) => print_history(&entries),
                Err(e) => println!("history lookup failed: {e}"),
            }
        }

        "groups" => {
            for group in manager.groups().await {
                println!("{} {} master={} epoch={}", group.group_id, group.name, group.master_id, group.epoch);
            }
        }

        "group_create" => {
            let (Some(name), Some(members)) = (parts.get(1), parts.get(2)) else {
                println!("usage: group_create <name> <peer_id,...>");
                return false;
            };
            let invitees: Vec<DeviceId> = members.split(',').filter(|s| !s.is_empty()).map(DeviceId::new).collect();
            match manager.create_group(name, &invitees).await {
                Ok(group_id) => println!("created group {group_id}"),
                Err(e) => println!("group creation failed: {e}"),
            }
        }

        "accept_invite" => {
            let Some(group_id) = parts.get(1) else {
                println!("usage: accept_invite <group_id>");
                return false;
            };
            match manager.accept_invite(&GroupId::new(*group_id)).await {
                Ok(()) => println!("joined group {group_id}"),
                Err(e) => println!("accept failed: {e}"),
            }
        }

        "group_send" => {
            let Some(group_id) = parts.get(1) else {
                println!("usage: group_send <group_id> <text>");
                return false;
            };
            let text = line.splitn(3, char::is_whitespace).nth(2).unwrap_or("");
            match manager.send_group(&GroupId::new(*group_id), text).await {
                Ok(()) => {}
                Err(e) => println!("group send failed: {e}"),
            }
        }

        "group_history" => {
            let Some(group_id) = parts.get(1) else {
                println!("usage: group_history <group_id>");
                return false;
            };
            match manager.group_history(&GroupId::new(*group_id)) {
                Ok(entries) => print_history(&entries),
                Err(e) => println!("group history lookup failed: {e}"),
            }
        }

        "sendfile" => {
            let (Some(peer_id), Some(path)) = (parts.get(1), parts.get(2)) else {
                println!("usage: sendfile <peer_id> <path>");
                return false;
            };
            match manager.send_file(&DeviceId::new(*peer_id), &PathBuf::from(path)).await {
                Ok(()) => println!("transfer complete"),
                Err(e) => println!("transfer failed: {e}"),
            }
        }

        other => println!("unknown command: {other}"),
    }

    false
}

fn print_history(entries: &[lanrelay_core::protocol::Envelope]) {
    for envelope in entries {
        let text = envelope
            .payload
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        println!("[{}] {}: {}", envelope.timestamp, envelope.device_name, text);
    }
}

/// Builds the identity the discovery service broadcasts, from the node's
/// own `Identity` and configured TCP port.
pub fn discovery_identity(manager: &ConnectionManager, tcp_port: u16) -> DiscoveryIdentity {
    let identity = manager.identity();
    DiscoveryIdentity {
        device_id: identity.device_id.clone(),
        device_name: identity.device_name.clone(),
        platform: identity.platform,
        tcp_port,
    }
}

//! Owns one TCP socket to a peer: a reader task that demultiplexes JSON and
//! binary frames, and a write half serialized behind a mutex so concurrent
//! senders (chat, group relay, file transfer) never interleave partial
//! frames on the wire.

use lanrelay_core::protocol::{self, BinaryFrame, Envelope, Frame, ProtocolError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::WriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

/// One event surfaced from a peer's reader task.
#[derive(Debug)]
pub enum PeerEvent {
    Json(Envelope),
    Binary(BinaryFrame),
    Closed(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Io,
    Protocol,
    Eof,
}

/// The write half of a peer connection, guarded by a mutex held for exactly
/// one frame at a time. Different peers' writers are independent; this
/// mutex only serializes writes to the same socket.
pub struct PeerWriter {
    inner: Mutex<WriteHalf<TcpStream>>,
}

impl PeerWriter {
    pub async fn send_json(&self, envelope: &Envelope) -> Result<(), ProtocolError> {
        let mut w = self.inner.lock().await;
        protocol::write_json_frame(&mut *w, envelope).await
    }

    pub async fn send_binary(&self, frame: &BinaryFrame) -> Result<(), ProtocolError> {
        let mut w = self.inner.lock().await;
        protocol::write_binary_frame(&mut *w, frame).await
    }

    /// Closes the underlying socket. Safe to call repeatedly; subsequent
    /// writes on this handle will fail.
    pub async fn shutdown(&self) {
        use tokio::io::AsyncWriteExt;
        let mut w = self.inner.lock().await;
        let _ = w.shutdown().await;
    }
}

/// Splits `stream` into a shared writer and a background reader task. The
/// reader task forwards every parsed frame to the returned channel and
/// terminates after emitting exactly one `Closed` event.
pub fn spawn_peer(
    stream: TcpStream,
    addr: SocketAddr,
) -> (Arc<PeerWriter>, SocketAddr, mpsc::Receiver<PeerEvent>) {
    let (read_half, write_half) = tokio::io::split(stream);
    let writer = Arc::new(PeerWriter {
        inner: Mutex::new(write_half),
    });
    let (tx, rx) = mpsc::channel(64);

    tokio::spawn(async move {
        let mut reader = read_half;
        loop {
            match protocol::read_frame(&mut reader).await {
                Ok(Frame::Json(envelope)) => {
                    if tx.send(PeerEvent::Json(envelope)).await.is_err() {
                        break;
                    }
                }
                Ok(Frame::Binary(frame)) => {
                    if tx.send(PeerEvent::Binary(frame)).await.is_err() {
                        break;
                    }
                }
                Err(ProtocolError::ConnectionClosed) => {
                    let _ = tx.send(PeerEvent::Closed(CloseReason::Eof)).await;
                    break;
                }
                Err(ProtocolError::Io(e)) => {
                    tracing::warn!(error = %e, %addr, "peer socket io error");
                    let _ = tx.send(PeerEvent::Closed(CloseReason::Io)).await;
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, %addr, "protocol violation, closing peer");
                    let _ = tx.send(PeerEvent::Closed(CloseReason::Protocol)).await;
                    break;
                }
            }
        }
    });

    (writer, addr, rx)
}

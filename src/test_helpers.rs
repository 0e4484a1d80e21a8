//! Shared fixtures for session tests.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use frames::{Frame, FrameBuffer, encode_frame};

use crate::config::SessionConfig;
use crate::conn::{Conn, ConnInit};
use crate::events::Namespaces;
use crate::transport::memory::{self, MemoryTransport};
use crate::transport::Transport;

/// Upper bound for any single wait in a test.
pub const WAIT: Duration = Duration::from_secs(2);

/// Start a `Conn` on one end of a memory pair without running a handshake.
#[must_use]
pub fn start_conn(id: &str, transport: MemoryTransport, declared: Namespaces, config: SessionConfig) -> Conn {
    Conn::start(
        Box::new(transport),
        FrameBuffer::new(),
        ConnInit { id: id.to_owned(), identity: None, declared, config, server: None },
    )
}

/// Two connections wired to each other.
#[must_use]
pub fn conn_pair(left: Namespaces, right: Namespaces, config: SessionConfig) -> (Conn, Conn) {
    let (a, b) = memory::pair(64);
    (start_conn("left", a, left, config), start_conn("right", b, right, config))
}

/// A connection whose peer is driven frame by frame by the test.
#[must_use]
pub fn conn_with_raw_peer(declared: Namespaces, config: SessionConfig) -> (Conn, RawPeer) {
    let (a, b) = memory::pair(64);
    (start_conn("conn", a, declared, config), RawPeer::new(b))
}

/// Hand-driven protocol peer.
pub struct RawPeer {
    pub transport: MemoryTransport,
    buffer: FrameBuffer,
}

impl RawPeer {
    #[must_use]
    pub fn new(transport: MemoryTransport) -> Self {
        Self { transport, buffer: FrameBuffer::new() }
    }

    pub async fn send(&mut self, frame: &Frame) {
        self.transport.send(encode_frame(frame)).await.expect("raw peer send");
    }

    pub async fn send_bytes(&mut self, bytes: Vec<u8>) {
        self.transport.send(bytes).await.expect("raw peer send");
    }

    /// Next decoded frame, or `None` once the stream ended.
    pub async fn recv(&mut self) -> Option<Frame> {
        tokio::time::timeout(WAIT, async {
            loop {
                if let Some(next) = self.buffer.next_frame() {
                    return Some(next.expect("raw peer decode"));
                }
                match self.transport.recv().await {
                    Ok(chunk) => self.buffer.push(&chunk),
                    Err(_) => return None,
                }
            }
        })
        .await
        .expect("raw peer recv timed out")
    }

    /// Answer the next `Join` with a `JoinAck` and return its namespace.
    pub async fn ack_join(&mut self) -> String {
        let join = self.recv().await.expect("join frame");
        assert_eq!(join.kind, frames::FrameKind::Join);
        self.send(&Frame::join_ack(join.namespace.as_str())).await;
        join.namespace
    }
}

/// Thread-safe log of strings recorded by handlers.
#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(entry.into());
    }

    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Poll until `len` entries were recorded.
    pub async fn wait_for_len(&self, len: usize) -> Vec<String> {
        tokio::time::timeout(WAIT, async {
            loop {
                let entries = self.entries();
                if entries.len() >= len {
                    return entries;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("recorder wait timed out")
    }
}

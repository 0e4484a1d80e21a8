//! Duplex transports carrying encoded frames.
//!
//! A transport moves opaque byte chunks in order, both ways. It knows
//! nothing about frames: chunk boundaries may split or merge frames, and
//! the connection reassembles them with a `FrameBuffer`.
//!
//! The handshake drives a whole [`Transport`]. Once a connection starts,
//! the transport is split: the dispatch loop owns the [`TransportReader`]
//! and a writer task owns the [`TransportWriter`], so a write blocked on a
//! full peer never stops this end from reading.

pub mod memory;
pub mod ws;

use async_trait::async_trait;

use crate::error::TransportError;

pub use memory::MemoryTransport;
pub use ws::WsTransport;

/// Full-duplex ordered byte channel owned by one connection.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Write one chunk.
    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Read the next chunk.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] once the stream ended, with the close reason.
    async fn recv(&mut self) -> Result<Vec<u8>, TransportError>;

    /// Close the stream. Idempotent.
    async fn close(&mut self);

    /// Separate the read and write halves.
    fn split(self: Box<Self>) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>);
}

/// Read half of a split [`Transport`].
#[async_trait]
pub trait TransportReader: Send + 'static {
    /// Must be cancel-safe: the dispatch loop polls it inside `tokio::select!`.
    async fn recv(&mut self) -> Result<Vec<u8>, TransportError>;
}

/// Write half of a split [`Transport`].
#[async_trait]
pub trait TransportWriter: Send + 'static {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Close the write direction; the peer's reads end.
    async fn close(&mut self);
}

#[async_trait]
impl Transport for Box<dyn Transport> {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError> {
        (**self).send(bytes).await
    }

    async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        (**self).recv().await
    }

    async fn close(&mut self) {
        (**self).close().await;
    }

    fn split(self: Box<Self>) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>) {
        <dyn Transport as Transport>::split(*self)
    }
}

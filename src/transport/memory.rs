//! In-process transport pair backed by bounded tokio channels.
//!
//! Used for protocol tests and for embedding both peers in one process.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Transport, TransportReader, TransportWriter};
use crate::error::TransportError;

pub struct MemoryTransport {
    reader: MemoryReader,
    writer: MemoryWriter,
}

pub struct MemoryReader {
    rx: mpsc::Receiver<Vec<u8>>,
}

pub struct MemoryWriter {
    tx: Option<mpsc::Sender<Vec<u8>>>,
    chunk_size: Option<usize>,
}

/// Two connected ends. Each holds at most `capacity` unread chunks.
#[must_use]
pub fn pair(capacity: usize) -> (MemoryTransport, MemoryTransport) {
    let (a_tx, b_rx) = mpsc::channel(capacity.max(1));
    let (b_tx, a_rx) = mpsc::channel(capacity.max(1));
    (MemoryTransport::new(a_tx, a_rx), MemoryTransport::new(b_tx, b_rx))
}

impl MemoryTransport {
    fn new(tx: mpsc::Sender<Vec<u8>>, rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            reader: MemoryReader { rx },
            writer: MemoryWriter { tx: Some(tx), chunk_size: None },
        }
    }

    /// Split every outgoing write into chunks of at most `size` bytes.
    #[must_use]
    pub fn chunked(mut self, size: usize) -> Self {
        self.writer.chunk_size = Some(size.max(1));
        self
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.writer.send(bytes).await
    }

    async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        self.reader.recv().await
    }

    async fn close(&mut self) {
        self.writer.close().await;
        self.reader.rx.close();
    }

    fn split(self: Box<Self>) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>) {
        let Self { reader, writer } = *self;
        (Box::new(reader), Box::new(writer))
    }
}

#[async_trait]
impl TransportReader for MemoryReader {
    async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| TransportError::Closed("peer closed".into()))
    }
}

#[async_trait]
impl TransportWriter for MemoryWriter {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError> {
        let Some(tx) = &self.tx else {
            return Err(TransportError::Closed("closed locally".into()));
        };
        let chunks: Vec<Vec<u8>> = match self.chunk_size {
            Some(size) => bytes.chunks(size).map(<[u8]>::to_vec).collect(),
            None => vec![bytes],
        };
        for chunk in chunks {
            tx.send(chunk)
                .await
                .map_err(|_| TransportError::Closed("peer gone".into()))?;
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;

//! NSConn: one joined namespace on one connection.
//!
//! An `NSConn` only exists after a successful join handshake. It holds a
//! non-owning reference back to its connection: dropping every `Conn`
//! handle does not keep a dead connection alive through its namespaces.
//!
//! Emitting never blocks. Frames go to the connection's bounded write queue,
//! which the dispatch loop drains onto the transport in queue order.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use frames::{Frame, FrameKind};

use crate::conn::{Conn, ConnShared};
use crate::error::{ConnectError, HandlerError, SendError};
use crate::events::{Events, Handler, Lifecycle};

#[derive(Clone)]
pub struct NSConn {
    inner: Arc<NsInner>,
}

struct NsInner {
    namespace: String,
    conn_id: String,
    conn: Weak<ConnShared>,
    events: RwLock<Events>,
    rooms: RwLock<BTreeSet<String>>,
    connected: AtomicBool,
}

impl NSConn {
    pub(crate) fn new(namespace: String, conn: &Arc<ConnShared>, events: Events) -> Self {
        Self {
            inner: Arc::new(NsInner {
                namespace,
                conn_id: conn.id.clone(),
                conn: Arc::downgrade(conn),
                events: RwLock::new(events),
                rooms: RwLock::new(BTreeSet::new()),
                connected: AtomicBool::new(true),
            }),
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// Id of the owning connection.
    #[must_use]
    pub fn conn_id(&self) -> &str {
        &self.inner.conn_id
    }

    /// The owning connection, while it is alive.
    #[must_use]
    pub fn conn(&self) -> Option<Conn> {
        self.inner.conn.upgrade().map(Conn::from_shared)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    // =========================================================================
    // OUTBOUND
    // =========================================================================

    /// Queue an application event for the peer.
    ///
    /// # Errors
    ///
    /// [`SendError::NotConnected`] after the namespace was left or the
    /// connection closed, [`SendError::Backpressure`] when the write queue is
    /// full.
    pub fn emit(&self, event: &str, body: impl Into<Vec<u8>>) -> Result<(), SendError> {
        self.emit_frame(Frame::data(self.namespace(), event, body))
    }

    /// Queue an event addressed to one room of this namespace.
    ///
    /// # Errors
    ///
    /// Same as [`NSConn::emit`].
    pub fn emit_to_room(&self, room: &str, event: &str, body: impl Into<Vec<u8>>) -> Result<(), SendError> {
        self.emit_frame(Frame::data(self.namespace(), event, body).with_room(room))
    }

    /// Queue a prepared data frame. Namespace and kind are forced to this
    /// namespace's data frame.
    ///
    /// # Errors
    ///
    /// Same as [`NSConn::emit`].
    pub fn emit_frame(&self, mut frame: Frame) -> Result<(), SendError> {
        if !self.is_connected() {
            return Err(SendError::NotConnected);
        }
        let Some(conn) = self.conn() else {
            return Err(SendError::NotConnected);
        };
        frame.kind = FrameKind::Data;
        frame.namespace.clone_from(&self.inner.namespace);
        conn.try_write(frame)
    }

    /// Leave the namespace.
    ///
    /// # Errors
    ///
    /// [`ConnectError::Closed`] if the connection closed meanwhile.
    pub async fn disconnect(&self) -> Result<(), ConnectError> {
        match self.conn() {
            Some(conn) => conn.disconnect(self.namespace()).await,
            None => Ok(()),
        }
    }

    // =========================================================================
    // HANDLERS
    // =========================================================================

    /// Register or replace the handler for `event` on this namespace only.
    pub fn on<F>(&self, event: &str, handler: F)
    where
        F: Fn(&NSConn, &Frame) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.inner
            .events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event, handler);
    }

    pub(crate) fn handler_for(&self, event: &str) -> Option<Arc<dyn Handler>> {
        self.inner
            .events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .handler_for(event)
    }

    pub(crate) fn hook(&self, hook: Lifecycle) -> Option<Arc<dyn Handler>> {
        self.inner
            .events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .hook(hook)
    }

    pub(crate) fn mark_disconnected(&self) {
        self.inner.connected.store(false, Ordering::Release);
    }

    // =========================================================================
    // ROOMS
    // =========================================================================

    /// Add this namespace connection to `room`. Returns false if already a member.
    pub fn join_room(&self, room: &str) -> bool {
        self.inner
            .rooms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(room.to_owned())
    }

    /// Returns false if not a member.
    pub fn leave_room(&self, room: &str) -> bool {
        self.inner
            .rooms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(room)
    }

    #[must_use]
    pub fn in_room(&self, room: &str) -> bool {
        self.inner
            .rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(room)
    }

    /// Joined rooms, sorted.
    #[must_use]
    pub fn rooms(&self) -> Vec<String> {
        self.inner
            .rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

impl fmt::Display for NSConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.conn_id())
    }
}

impl fmt::Debug for NSConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NSConn")
            .field("conn_id", &self.inner.conn_id)
            .field("namespace", &self.inner.namespace)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "nsconn_test.rs"]
mod tests;

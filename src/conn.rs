//! Conn: one authenticated transport session and its dispatch loop.
//!
//! DESIGN
//! ======
//! Each connection runs two tasks over a split transport. The dispatch task
//! is the only reader and the only mutator of the joined-namespace map; the
//! writer task is the only writer. Neither waits on the other, so a peer
//! that stops reading can stall our writes but never our reads.
//!
//! - `NSConn::emit` takes a write credit and pushes onto the outgoing queue
//!   (never blocks; no credit means `Backpressure`)
//! - control frames from the dispatch task use the same queue without credits
//! - `connect` / `disconnect` / `close` send a `Command` with a oneshot reply
//!
//! One queue feeds the writer, so frames reach the wire in queue order:
//! emits from one namespace are delivered in emit order, and a `Leave`
//! follows everything emitted before it.
//!
//! LIFECYCLE
//! =========
//! 1. Handshake (client or server side) yields the transport and leftovers
//! 2. `Conn::start` splits the transport and spawns the dispatch and writer tasks
//! 3. Namespaces are joined and left through `Join` / `Leave` frames
//! 4. Transport error, persistent corruption, or `close()` ends the loop:
//!    every joined namespace gets `_OnNamespaceDisconnectReason` exactly once,
//!    pending joins fail with `Closed`, the writer flushes what is queued and
//!    closes the transport, then `closed()` resolves.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use frames::{CODE_NAMESPACE_NOT_FOUND, DecodeError, Frame, FrameBuffer, FrameKind, encode_frame};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{ConnectError, SendError};
use crate::events::{Events, Lifecycle, Namespaces};
use crate::nsconn::NSConn;
use crate::server::auth::Identity;
use crate::server::{Server, ServerShared};
use crate::transport::{Transport, TransportReader, TransportWriter};

/// Close reason reported when the application closes the connection.
pub const CLOSED_LOCALLY: &str = "closed locally";

/// Close reason reported after too many undecodable frames in a row.
pub const PERSISTENT_CORRUPTION: &str = "persistent frame corruption";

const COMMAND_QUEUE_CAPACITY: usize = 32;

/// How long shutdown waits for the writer to flush and close.
const WRITER_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Authentication progress of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Handshake not finished.
    Pending,
    /// Credential accepted; frames may flow.
    Authenticated,
    /// Credential refused; the transport is closed.
    Rejected,
}

// =============================================================================
// HANDLE
// =============================================================================

/// Cloneable handle to a live or closed connection.
#[derive(Clone)]
pub struct Conn {
    shared: Arc<ConnShared>,
}

pub(crate) struct ConnShared {
    pub(crate) id: String,
    identity: Option<Identity>,
    auth: AuthState,
    declared: Namespaces,
    joined: RwLock<HashMap<String, NSConn>>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    /// One permit per application frame allowed in flight.
    credits: Arc<Semaphore>,
    commands: mpsc::Sender<Command>,
    closed: watch::Sender<bool>,
    server: Option<Weak<ServerShared>>,
    config: SessionConfig,
}

/// Everything a finished handshake hands to [`Conn::start`].
pub(crate) struct ConnInit {
    pub id: String,
    pub identity: Option<Identity>,
    pub declared: Namespaces,
    pub config: SessionConfig,
    pub server: Option<Weak<ServerShared>>,
}

enum Command {
    Join { namespace: String, reply: oneshot::Sender<Result<NSConn, ConnectError>> },
    Leave { namespace: String, reply: oneshot::Sender<Result<(), ConnectError>> },
    Close { reason: String },
}

enum Outgoing {
    Frame { frame: Frame, credit: Option<OwnedSemaphorePermit> },
    Close,
}

impl Conn {
    /// Spawn the dispatch loop over an authenticated transport.
    ///
    /// `buffer` holds bytes that arrived after the handshake frame.
    pub(crate) fn start(transport: Box<dyn Transport>, buffer: FrameBuffer, init: ConnInit) -> Self {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (closed_tx, _) = watch::channel(false);
        let (write_failed_tx, write_failed_rx) = oneshot::channel();
        let (reader, writer) = transport.split();

        let conn = Self {
            shared: Arc::new(ConnShared {
                id: init.id,
                identity: init.identity,
                auth: AuthState::Authenticated,
                declared: init.declared,
                joined: RwLock::new(HashMap::new()),
                outgoing: outgoing_tx,
                credits: Arc::new(Semaphore::new(init.config.write_queue_capacity.max(1))),
                commands: commands_tx,
                closed: closed_tx,
                server: init.server,
                config: init.config,
            }),
        };

        let writer = tokio::spawn(run_writer(conn.id().to_owned(), writer, outgoing_rx, write_failed_tx));
        let dispatcher = Dispatcher {
            conn: conn.clone(),
            reader,
            buffer,
            commands_rx,
            writer,
            write_failed: write_failed_rx,
            pending: HashMap::new(),
            decode_errors: 0,
        };
        tokio::spawn(dispatcher.run());
        conn
    }

    pub(crate) fn from_shared(shared: Arc<ConnShared>) -> Self {
        Self { shared }
    }

    /// Connection id assigned by the server.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// A `Conn` only exists once its handshake succeeded.
    #[must_use]
    pub fn auth_state(&self) -> AuthState {
        self.shared.auth
    }

    /// Identity established by the server's auth policy. `None` on the dialing side.
    #[must_use]
    pub fn identity(&self) -> Option<&Identity> {
        self.shared.identity.as_ref()
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// The accepting server, on server-side connections.
    #[must_use]
    pub fn server(&self) -> Option<Server> {
        self.shared
            .server
            .as_ref()
            .and_then(Weak::upgrade)
            .map(Server::from_shared)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Resolves once the connection reached its terminal state.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Joined namespace by name.
    #[must_use]
    pub fn namespace(&self, name: &str) -> Option<NSConn> {
        self.shared
            .joined
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Names of the joined namespaces, sorted.
    #[must_use]
    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .shared
            .joined
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort_unstable();
        names
    }

    // =========================================================================
    // NAMESPACE JOIN / LEAVE
    // =========================================================================

    /// Join `namespace`. Returns the existing `NSConn` if already joined.
    ///
    /// # Errors
    ///
    /// - [`ConnectError::NamespaceNotFound`] if either end does not declare it
    /// - [`ConnectError::Timeout`] if the peer does not answer within `join_timeout`
    /// - [`ConnectError::Closed`] if the connection closes meanwhile
    pub async fn connect(&self, namespace: &str) -> Result<NSConn, ConnectError> {
        if let Some(ns) = self.namespace(namespace) {
            return Ok(ns);
        }
        if !self.shared.declared.contains(namespace) {
            return Err(ConnectError::NamespaceNotFound(namespace.to_owned()));
        }

        let (reply, rx) = oneshot::channel();
        self.command(Command::Join { namespace: namespace.to_owned(), reply }).await?;

        match tokio::time::timeout(self.shared.config.join_timeout, rx).await {
            Err(_) => {
                warn!(conn_id = %self.id(), %namespace, "conn: join timed out");
                Err(ConnectError::Timeout)
            }
            Ok(Err(_)) => Err(ConnectError::Closed),
            Ok(Ok(result)) => result,
        }
    }

    /// Leave `namespace`. Leaving a namespace that is not joined is a no-op.
    ///
    /// # Errors
    ///
    /// [`ConnectError::Closed`] if the connection is already closed.
    pub async fn disconnect(&self, namespace: &str) -> Result<(), ConnectError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Leave { namespace: namespace.to_owned(), reply }).await?;
        rx.await.unwrap_or(Err(ConnectError::Closed))
    }

    /// Close the connection and wait for the dispatch loop to finish.
    ///
    /// Joined namespaces observe the reason `"closed locally"`.
    pub async fn close(&self) {
        let _ = self
            .shared
            .commands
            .send(Command::Close { reason: CLOSED_LOCALLY.to_owned() })
            .await;
        self.closed().await;
    }

    async fn command(&self, command: Command) -> Result<(), ConnectError> {
        if self.is_closed() {
            return Err(ConnectError::Closed);
        }
        self.shared
            .commands
            .send(command)
            .await
            .map_err(|_| ConnectError::Closed)
    }

    /// Queue an application frame for the writer. Never blocks.
    pub(crate) fn try_write(&self, frame: Frame) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::NotConnected);
        }
        let credit = Arc::clone(&self.shared.credits)
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::NoPermits => SendError::Backpressure,
                TryAcquireError::Closed => SendError::NotConnected,
            })?;
        self.shared
            .outgoing
            .send(Outgoing::Frame { frame, credit: Some(credit) })
            .map_err(|_| SendError::NotConnected)
    }

    pub(crate) fn is_same(&self, other: &Conn) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl fmt::Display for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.shared.id)
            .field("auth", &self.auth_state())
            .field("namespaces", &self.namespaces())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// HANDSHAKE HELPERS
// =============================================================================

/// Read the next complete frame, pulling chunks from the transport as needed.
///
/// Any decode error fails the read: during a handshake there is nothing to
/// resynchronize to.
pub(crate) async fn read_frame<T: Transport + ?Sized>(
    transport: &mut T,
    buffer: &mut FrameBuffer,
) -> Result<Frame, ConnectError> {
    loop {
        if let Some(next) = buffer.next_frame() {
            return next.map_err(|e| ConnectError::Unreachable(e.to_string()));
        }
        let chunk = transport
            .recv()
            .await
            .map_err(|e| ConnectError::Unreachable(e.to_string()))?;
        buffer.push(&chunk);
    }
}

// =============================================================================
// DISPATCH LOOP
// =============================================================================

type JoinReply = oneshot::Sender<Result<NSConn, ConnectError>>;

struct Dispatcher {
    conn: Conn,
    reader: Box<dyn TransportReader>,
    buffer: FrameBuffer,
    commands_rx: mpsc::Receiver<Command>,
    writer: JoinHandle<()>,
    /// Fires with the error once the writer task could not write.
    write_failed: oneshot::Receiver<String>,
    /// Local joins awaiting the peer's answer.
    pending: HashMap<String, Vec<JoinReply>>,
    decode_errors: u32,
}

impl Dispatcher {
    async fn run(mut self) {
        debug!(conn_id = %self.conn.id(), "conn: dispatch loop started");

        // Frames that arrived together with the handshake reply.
        let mut reason = self.drain_inbound().err();

        while reason.is_none() {
            reason = tokio::select! {
                Some(command) = self.commands_rx.recv() => self.handle_command(command),
                failed = &mut self.write_failed => {
                    Some(failed.unwrap_or_else(|_| "writer stopped".to_owned()))
                }
                chunk = self.reader.recv() => match chunk {
                    Ok(chunk) => {
                        self.buffer.push(&chunk);
                        self.drain_inbound().err()
                    }
                    Err(e) => Some(e.to_string()),
                },
            };
        }

        self.shutdown(reason.unwrap_or_default()).await;
    }

    /// Dispatch every complete frame in the buffer. `Err` carries a close reason.
    fn drain_inbound(&mut self) -> Result<(), String> {
        while let Some(next) = self.buffer.next_frame() {
            match next {
                Ok(frame) => {
                    self.decode_errors = 0;
                    self.dispatch(frame);
                }
                Err(e) => self.decode_failed(&e)?,
            }
        }
        Ok(())
    }

    fn decode_failed(&mut self, err: &DecodeError) -> Result<(), String> {
        self.decode_errors += 1;
        warn!(
            conn_id = %self.conn.id(),
            error = %err,
            consecutive = self.decode_errors,
            "conn: dropped undecodable frame"
        );
        if self.decode_errors >= self.conn.shared.config.max_decode_errors {
            return Err(PERSISTENT_CORRUPTION.to_owned());
        }
        Ok(())
    }

    /// Queue a control frame behind everything already queued.
    fn queue(&self, frame: Frame) {
        let queued = self.conn.shared.outgoing.send(Outgoing::Frame { frame, credit: None });
        if queued.is_err() {
            debug!(conn_id = %self.conn.id(), "conn: writer gone, control frame dropped");
        }
    }

    // =========================================================================
    // COMMANDS
    // =========================================================================

    /// Returns the close reason when the command ends the connection.
    fn handle_command(&mut self, command: Command) -> Option<String> {
        match command {
            Command::Join { namespace, reply } => {
                self.start_join(namespace, reply);
                None
            }
            Command::Leave { namespace, reply } => {
                self.leave(&namespace);
                let _ = reply.send(Ok(()));
                None
            }
            Command::Close { reason } => Some(reason),
        }
    }

    fn start_join(&mut self, namespace: String, reply: JoinReply) {
        if let Some(ns) = self.conn.namespace(&namespace) {
            let _ = reply.send(Ok(ns));
            return;
        }

        let waiters = self.pending.entry(namespace.clone()).or_default();
        waiters.retain(|waiter| !waiter.is_closed());
        let first = waiters.is_empty();
        waiters.push(reply);

        if first {
            info!(conn_id = %self.conn.id(), %namespace, "conn: joining namespace");
            self.queue(Frame::join(namespace));
        }
    }

    fn leave(&mut self, namespace: &str) {
        let Some(ns) = self.unregister(namespace) else {
            return;
        };
        self.queue(Frame::leave(namespace));
        info!(conn_id = %self.conn.id(), %namespace, "conn: left namespace");
        fire(&ns, Lifecycle::NamespaceDisconnect, Vec::new());
    }

    // =========================================================================
    // INBOUND FRAMES
    // =========================================================================

    fn dispatch(&mut self, frame: Frame) {
        match frame.kind {
            FrameKind::Data => self.dispatch_data(&frame),
            FrameKind::Join => self.accept_join(frame.namespace),
            FrameKind::JoinAck => self.join_acknowledged(frame.namespace),
            FrameKind::JoinRejected => self.join_rejected(&frame),
            FrameKind::Leave => self.peer_left(&frame.namespace),
            FrameKind::Connect | FrameKind::ConnectAck | FrameKind::ConnectRejected => {
                warn!(
                    conn_id = %self.conn.id(),
                    kind = ?frame.kind,
                    "conn: handshake frame after handshake, dropped"
                );
            }
        }
    }

    fn dispatch_data(&self, frame: &Frame) {
        if frame.is_noop {
            return;
        }
        let conn_id = self.conn.id();
        let Some(ns) = self.conn.namespace(&frame.namespace) else {
            warn!(
                %conn_id,
                namespace = %frame.namespace,
                event = %frame.event,
                "conn: frame for unjoined namespace, dropped"
            );
            return;
        };
        if Lifecycle::is_reserved(&frame.event) {
            warn!(%conn_id, event = %frame.event, "conn: reserved event from peer, dropped");
            return;
        }
        let Some(handler) = ns.handler_for(&frame.event) else {
            debug!(%conn_id, event = %frame.event, "conn: no handler");
            return;
        };

        if let Err(e) = handler.handle(&ns, frame) {
            warn!(
                %conn_id,
                namespace = %frame.namespace,
                event = %frame.event,
                error = %e,
                "conn: handler failed"
            );
            // Error frames are never answered, so two peers cannot loop.
            if !frame.is_error {
                if let Err(send) = self.conn.try_write(frame.error_reply(e.0)) {
                    warn!(%conn_id, error = %send, "conn: error reply dropped");
                }
            }
        }
    }

    /// The peer asked to join one of our namespaces.
    fn accept_join(&mut self, namespace: String) {
        if self.conn.namespace(&namespace).is_some() {
            self.queue(Frame::join_ack(namespace));
            return;
        }
        let Some(events) = self.conn.shared.declared.get(&namespace).cloned() else {
            warn!(conn_id = %self.conn.id(), %namespace, "conn: join for undeclared namespace rejected");
            let reason = format!("namespace {namespace} not found");
            self.queue(Frame::join_rejected(namespace, CODE_NAMESPACE_NOT_FOUND, reason));
            return;
        };

        let ns = self.register(&namespace, events);
        self.queue(Frame::join_ack(namespace.as_str()));
        info!(conn_id = %self.conn.id(), %namespace, "conn: peer joined namespace");
        fire(&ns, Lifecycle::NamespaceConnected, Vec::new());

        // Both ends joined concurrently; the peer's join settles ours too.
        if let Some(waiters) = self.pending.remove(&namespace) {
            for waiter in waiters {
                let _ = waiter.send(Ok(ns.clone()));
            }
        }
    }

    fn join_acknowledged(&mut self, namespace: String) {
        let Some(waiters) = self.pending.remove(&namespace) else {
            debug!(conn_id = %self.conn.id(), %namespace, "conn: unsolicited join ack ignored");
            return;
        };
        if let Some(ns) = self.conn.namespace(&namespace) {
            for waiter in waiters {
                let _ = waiter.send(Ok(ns.clone()));
            }
            return;
        }

        let waiters: Vec<JoinReply> = waiters.into_iter().filter(|w| !w.is_closed()).collect();
        if waiters.is_empty() {
            // Every caller gave up; do not leave a half-joined namespace behind.
            warn!(conn_id = %self.conn.id(), %namespace, "conn: join acknowledged after timeout, leaving");
            self.queue(Frame::leave(namespace));
            return;
        }

        let events = self.conn.shared.declared.get(&namespace).cloned().unwrap_or_default();
        let ns = self.register(&namespace, events);
        info!(conn_id = %self.conn.id(), %namespace, "conn: joined namespace");
        fire(&ns, Lifecycle::NamespaceConnected, Vec::new());
        for waiter in waiters {
            let _ = waiter.send(Ok(ns.clone()));
        }
    }

    fn join_rejected(&mut self, frame: &Frame) {
        let namespace = frame.namespace.as_str();
        let reason = frame.body_text().into_owned();
        warn!(
            conn_id = %self.conn.id(),
            %namespace,
            code = %frame.event,
            %reason,
            "conn: join rejected"
        );

        let Some(waiters) = self.pending.remove(namespace) else {
            return;
        };
        if let Some(events) = self.conn.shared.declared.get(namespace).cloned() {
            let transient = NSConn::new(namespace.to_owned(), &self.conn.shared, events);
            transient.mark_disconnected();
            fire(&transient, Lifecycle::NamespaceConnectedFailed, reason.clone().into_bytes());
        }

        let err = ConnectError::from_rejection(&frame.event, namespace, reason);
        for waiter in waiters {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    fn peer_left(&mut self, namespace: &str) {
        let Some(ns) = self.unregister(namespace) else {
            debug!(conn_id = %self.conn.id(), %namespace, "conn: leave for unjoined namespace ignored");
            return;
        };
        info!(conn_id = %self.conn.id(), %namespace, "conn: peer left namespace");
        fire(&ns, Lifecycle::NamespaceDisconnect, Vec::new());
    }

    // =========================================================================
    // REGISTRY
    // =========================================================================

    fn register(&self, namespace: &str, events: Events) -> NSConn {
        let ns = NSConn::new(namespace.to_owned(), &self.conn.shared, events);
        self.conn
            .shared
            .joined
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(namespace.to_owned(), ns.clone());
        ns
    }

    fn unregister(&self, namespace: &str) -> Option<NSConn> {
        let ns = self
            .conn
            .shared
            .joined
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(namespace)?;
        ns.mark_disconnected();
        Some(ns)
    }

    // =========================================================================
    // SHUTDOWN
    // =========================================================================

    async fn shutdown(mut self, reason: String) {
        let conn_id = self.conn.id().to_owned();
        let shared = Arc::clone(&self.conn.shared);
        shared.credits.close();
        self.commands_rx.close();

        let joined: Vec<NSConn> = shared
            .joined
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, ns)| ns)
            .collect();
        for ns in &joined {
            ns.mark_disconnected();
            fire(ns, Lifecycle::NamespaceDisconnectReason, reason.clone().into_bytes());
        }

        for waiter in self.pending.drain().flat_map(|(_, waiters)| waiters) {
            let _ = waiter.send(Err(ConnectError::Closed));
        }
        while let Ok(command) = self.commands_rx.try_recv() {
            match command {
                Command::Join { reply, .. } => {
                    let _ = reply.send(Err(ConnectError::Closed));
                }
                Command::Leave { reply, .. } => {
                    let _ = reply.send(Err(ConnectError::Closed));
                }
                Command::Close { .. } => {}
            }
        }

        // Stop reading first: a peer blocked writing to us gets unstuck.
        drop(self.reader);
        let _ = shared.outgoing.send(Outgoing::Close);
        if tokio::time::timeout(WRITER_CLOSE_TIMEOUT, &mut self.writer).await.is_err() {
            warn!(%conn_id, "conn: writer did not finish, aborting");
            self.writer.abort();
        }

        shared.closed.send_replace(true);
        info!(%conn_id, %reason, namespaces = joined.len(), "conn: closed");
    }
}

/// Drain the outgoing queue onto the transport until `Close`.
async fn run_writer(
    conn_id: String,
    mut writer: Box<dyn TransportWriter>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    failed: oneshot::Sender<String>,
) {
    while let Some(item) = outgoing.recv().await {
        let (frame, credit) = match item {
            Outgoing::Frame { frame, credit } => (frame, credit),
            Outgoing::Close => break,
        };
        debug!(
            %conn_id,
            kind = ?frame.kind,
            namespace = %frame.namespace,
            event = %frame.event,
            "conn: send frame"
        );
        if let Err(e) = writer.send(encode_frame(&frame)).await {
            warn!(%conn_id, error = %e, "conn: write failed");
            let _ = failed.send(e.to_string());
            return;
        }
        drop(credit);
    }
    writer.close().await;
}

/// Run a lifecycle hook. Hook errors are logged, never sent.
fn fire(ns: &NSConn, hook: Lifecycle, body: Vec<u8>) {
    let Some(handler) = ns.hook(hook) else {
        return;
    };
    let msg = hook.frame(ns.namespace(), body);
    if let Err(e) = handler.handle(ns, &msg) {
        warn!(
            conn_id = %ns.conn_id(),
            namespace = %ns.namespace(),
            %hook,
            error = %e,
            "conn: lifecycle hook failed"
        );
    }
}

#[cfg(test)]
#[path = "conn_test.rs"]
mod tests;

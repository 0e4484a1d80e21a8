//! Session manager: accepts, authenticates and tracks connections.
//!
//! DESIGN
//! ======
//! `Server` is a cheap cloneable handle over shared state: the declared
//! namespaces, the auth policy, hooks, and the registry of live connections.
//! The registry is only touched briefly (reserve an id during the handshake,
//! fill it once the `Conn` starts, remove it after the dispatch loop ends,
//! read during broadcast), so a plain `RwLock` suffices and handlers can
//! broadcast synchronously. Ids are reserved under the write lock, so two
//! concurrent handshakes never end up with the same id.
//!
//! LIFECYCLE
//! =========
//! 1. Transport accepted → wait for the `Connect` frame (bounded by the
//!    handshake timeout); any other first frame is rejected
//! 2. Auth policy → `Identity`, or `ConnectRejected` + close
//! 3. `on_connect` hook → may still reject
//! 4. `ConnectAck` with the assigned id → `Conn` registered
//! 5. Dispatch loop ends → `Conn` removed → `on_disconnect` hook

pub mod auth;
pub mod route;

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use frames::{CODE_UNAUTHORIZED, Frame, FrameBuffer, FrameKind, encode_frame};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::conn::{AuthState, Conn, ConnInit, read_frame};
use crate::error::{ConnectError, HandlerError};
use crate::events::Namespaces;
use crate::transport::Transport;

pub use auth::{AllowAll, AuthError, AuthPolicy, Identity, JwtPolicy, StaticToken};
pub use route::{AxumTransport, TOKEN_PARAM, handle_ws, router};

type ConnectHook = dyn Fn(&Handshake) -> Result<(), HandlerError> + Send + Sync;
type DisconnectHook = dyn Fn(&Conn) + Send + Sync;
type IdGenerator = dyn Fn(&Handshake) -> String + Send + Sync;

/// Authenticated handshake, before the connection id is assigned.
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Raw credential the policy accepted. Empty for anonymous peers.
    pub credentials: String,
    pub identity: Identity,
}

// =============================================================================
// SERVER
// =============================================================================

#[derive(Clone)]
pub struct Server {
    shared: Arc<ServerShared>,
}

pub(crate) struct ServerShared {
    namespaces: Namespaces,
    policy: Arc<dyn AuthPolicy>,
    config: SessionConfig,
    conns: RwLock<HashMap<String, Slot>>,
    on_connect: Option<Arc<ConnectHook>>,
    on_disconnect: Option<Arc<DisconnectHook>>,
    id_generator: Option<Arc<IdGenerator>>,
}

/// Registry entry. An id is `Reserved` from the moment it is assigned until
/// its `Conn` is running.
enum Slot {
    Reserved,
    Live(Conn),
}

impl Server {
    /// Server for `namespaces`, accepting every peer with default config.
    #[must_use]
    pub fn new(namespaces: Namespaces) -> Self {
        ServerBuilder::new(namespaces).build()
    }

    #[must_use]
    pub fn builder(namespaces: Namespaces) -> ServerBuilder {
        ServerBuilder::new(namespaces)
    }

    pub(crate) fn from_shared(shared: Arc<ServerShared>) -> Self {
        Self { shared }
    }

    #[must_use]
    pub fn namespaces(&self) -> &Namespaces {
        &self.shared.namespaces
    }

    #[must_use]
    pub fn policy(&self) -> &dyn AuthPolicy {
        self.shared.policy.as_ref()
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    // =========================================================================
    // ACCEPT
    // =========================================================================

    /// Run the server side of the handshake and start the connection.
    ///
    /// `upgrade_token` is the credential the transport carried out of band
    /// (the websocket `token` query parameter). It is used when the
    /// `Connect` frame carries none.
    ///
    /// # Errors
    ///
    /// - [`ConnectError::Unauthorized`] when the policy or `on_connect` refuses
    /// - [`ConnectError::Timeout`] when no `Connect` frame arrives in time
    /// - [`ConnectError::Unreachable`] when the transport fails
    pub async fn accept<T: Transport>(&self, transport: T, upgrade_token: Option<String>) -> Result<Conn, ConnectError> {
        let config = self.shared.config;
        let mut transport: Box<dyn Transport> = Box::new(transport);
        let mut buffer = FrameBuffer::with_max_len(config.max_frame_len);
        let mut state = AuthState::Pending;

        let first = match tokio::time::timeout(config.handshake_timeout, read_frame(&mut transport, &mut buffer)).await
        {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                warn!(error = %e, "server: handshake failed");
                transport.close().await;
                return Err(e);
            }
            Err(_) => {
                warn!("server: handshake timed out");
                transport.close().await;
                return Err(ConnectError::Timeout);
            }
        };

        // Nothing but the handshake is accepted before authentication.
        if first.kind != FrameKind::Connect {
            return reject(transport, &mut state, format!("expected connect frame, got {:?}", first.kind)).await;
        }

        let credentials = if first.body.is_empty() {
            upgrade_token.unwrap_or_default()
        } else {
            first.body_text().into_owned()
        };
        let identity = match self.shared.policy.authenticate(&credentials) {
            Ok(identity) => identity,
            Err(e) => return reject(transport, &mut state, e.to_string()).await,
        };

        let handshake = Handshake { credentials, identity };
        if let Some(on_connect) = &self.shared.on_connect {
            if let Err(e) = on_connect(&handshake) {
                return reject(transport, &mut state, e.0).await;
            }
        }

        let id = self.reserve_id(&handshake);
        if let Err(e) = transport.send(encode_frame(&Frame::connect_ack(&id))).await {
            warn!(conn_id = %id, error = %e, "server: connect ack failed");
            self.release(&id);
            transport.close().await;
            return Err(ConnectError::Unreachable(e.to_string()));
        }
        state = AuthState::Authenticated;

        let conn = Conn::start(
            transport,
            buffer,
            ConnInit {
                id: id.clone(),
                identity: Some(handshake.identity),
                declared: self.shared.namespaces.clone(),
                config,
                server: Some(Arc::downgrade(&self.shared)),
            },
        );
        self.register(&conn);
        info!(
            conn_id = %id,
            auth = ?state,
            subject = ?conn.identity().and_then(|i| i.subject.as_deref()),
            "server: client connected"
        );

        let server = self.clone();
        let watched = conn.clone();
        tokio::spawn(async move {
            watched.closed().await;
            server.unregister(&watched);
        });
        Ok(conn)
    }

    /// [`Server::accept`], then wait until the connection closes.
    ///
    /// # Errors
    ///
    /// Same as [`Server::accept`].
    pub async fn serve<T: Transport>(&self, transport: T, upgrade_token: Option<String>) -> Result<(), ConnectError> {
        let conn = self.accept(transport, upgrade_token).await?;
        conn.closed().await;
        Ok(())
    }

    /// Pick the connection id and reserve it in the registry.
    fn reserve_id(&self, handshake: &Handshake) -> String {
        let requested = self.shared.id_generator.as_ref().map(|generate| generate(handshake));
        let mut conns = self.lock_write();
        if let Some(id) = requested {
            if !id.is_empty() {
                if let Entry::Vacant(slot) = conns.entry(id.clone()) {
                    slot.insert(Slot::Reserved);
                    return id;
                }
            }
            warn!(requested = %id, "server: generated id unusable, using uuid");
        }
        let id = Uuid::new_v4().to_string();
        conns.insert(id.clone(), Slot::Reserved);
        id
    }

    // =========================================================================
    // REGISTRY
    // =========================================================================

    fn register(&self, conn: &Conn) {
        self.lock_write().insert(conn.id().to_owned(), Slot::Live(conn.clone()));
    }

    /// Drop a reservation whose handshake failed.
    fn release(&self, id: &str) {
        let mut conns = self.lock_write();
        if matches!(conns.get(id), Some(Slot::Reserved)) {
            conns.remove(id);
        }
    }

    fn unregister(&self, conn: &Conn) {
        {
            let mut conns = self.lock_write();
            if matches!(conns.get(conn.id()), Some(Slot::Live(live)) if live.is_same(conn)) {
                conns.remove(conn.id());
            }
        }
        info!(conn_id = %conn.id(), "server: client disconnected");
        if let Some(on_disconnect) = &self.shared.on_disconnect {
            on_disconnect(conn);
        }
    }

    fn lock_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Slot>> {
        self.shared.conns.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Slot>> {
        self.shared.conns.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn live(&self) -> Vec<Conn> {
        self.lock_read()
            .values()
            .filter_map(|slot| match slot {
                Slot::Live(conn) => Some(conn.clone()),
                Slot::Reserved => None,
            })
            .collect()
    }

    /// Live connection by id.
    #[must_use]
    pub fn connection(&self, id: &str) -> Option<Conn> {
        match self.lock_read().get(id) {
            Some(Slot::Live(conn)) => Some(conn.clone()),
            _ => None,
        }
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.lock_read()
            .values()
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count()
    }

    /// Ids of live connections, sorted.
    #[must_use]
    pub fn connection_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.live().iter().map(|conn| conn.id().to_owned()).collect();
        ids.sort_unstable();
        ids
    }

    /// Close every live connection and wait for their loops to finish.
    pub async fn close_all(&self) {
        let conns = self.live();
        for conn in &conns {
            conn.close().await;
        }
        info!(count = conns.len(), "server: closed all connections");
    }

    // =========================================================================
    // BROADCAST
    // =========================================================================

    /// Deliver `frame` to every connection joined to `frame.namespace` (and to
    /// `frame.room`, when set), except the connection `except`.
    ///
    /// Best-effort: a peer with a full write queue is skipped. Returns the
    /// number of connections the frame was queued for.
    pub fn broadcast(&self, except: Option<&str>, frame: &Frame) -> usize {
        let mut delivered = 0;
        for conn in self.live() {
            let id = conn.id();
            if except == Some(id) {
                continue;
            }
            let Some(ns) = conn.namespace(&frame.namespace) else {
                continue;
            };
            if !frame.room.is_empty() && !ns.in_room(&frame.room) {
                continue;
            }
            match ns.emit_frame(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    conn_id = %id,
                    namespace = %frame.namespace,
                    error = %e,
                    "server: broadcast skipped peer"
                ),
            }
        }
        delivered
    }
}

async fn reject(
    mut transport: Box<dyn Transport>,
    state: &mut AuthState,
    reason: String,
) -> Result<Conn, ConnectError> {
    *state = AuthState::Rejected;
    warn!(auth = ?state, %reason, "server: handshake rejected");
    let _ = transport
        .send(encode_frame(&Frame::connect_rejected(CODE_UNAUTHORIZED, reason.as_str())))
        .await;
    transport.close().await;
    Err(ConnectError::Unauthorized(reason))
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("namespaces", &self.shared.namespaces.names())
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// BUILDER
// =============================================================================

pub struct ServerBuilder {
    namespaces: Namespaces,
    policy: Arc<dyn AuthPolicy>,
    config: SessionConfig,
    on_connect: Option<Arc<ConnectHook>>,
    on_disconnect: Option<Arc<DisconnectHook>>,
    id_generator: Option<Arc<IdGenerator>>,
}

impl ServerBuilder {
    #[must_use]
    pub fn new(namespaces: Namespaces) -> Self {
        Self {
            namespaces,
            policy: Arc::new(AllowAll),
            config: SessionConfig::default(),
            on_connect: None,
            on_disconnect: None,
            id_generator: None,
        }
    }

    #[must_use]
    pub fn policy(mut self, policy: impl AuthPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs after authentication, before the ack. `Err` rejects the peer.
    #[must_use]
    pub fn on_connect(mut self, hook: impl Fn(&Handshake) -> Result<(), HandlerError> + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(hook));
        self
    }

    /// Runs once the connection's dispatch loop has ended.
    #[must_use]
    pub fn on_disconnect(mut self, hook: impl Fn(&Conn) + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(hook));
        self
    }

    /// Replace the default UUID v4 connection ids. Empty or duplicate ids
    /// fall back to a UUID.
    #[must_use]
    pub fn id_generator(mut self, generate: impl Fn(&Handshake) -> String + Send + Sync + 'static) -> Self {
        self.id_generator = Some(Arc::new(generate));
        self
    }

    #[must_use]
    pub fn build(self) -> Server {
        Server {
            shared: Arc::new(ServerShared {
                namespaces: self.namespaces,
                policy: self.policy,
                config: self.config,
                conns: RwLock::new(HashMap::new()),
                on_connect: self.on_connect,
                on_disconnect: self.on_disconnect,
                id_generator: self.id_generator,
            }),
        }
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;

//! neffos: namespaced real-time messaging over one duplex connection.
//!
//! ARCHITECTURE
//! ============
//! ```text
//! transport bytes → FrameBuffer → Conn dispatch loop → NSConn handlers
//! NSConn::emit → write queue → Conn dispatch loop → encode → transport
//! ```
//!
//! - [`conn::Conn`] owns one transport and runs one dispatch task.
//! - [`nsconn::NSConn`] is one joined namespace on a connection.
//! - [`client::dial`] opens a websocket and runs the client handshake.
//! - [`server::Server`] authenticates peers, tracks live connections and
//!   broadcasts. [`server::router`] mounts it on an axum router.
//!
//! Both ends are symmetric once connected: either side may join a namespace
//! the other declares, and both dispatch frames through the same loop.

pub mod client;
pub mod config;
pub mod conn;
pub mod error;
pub mod events;
pub mod nsconn;
pub mod server;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use client::{dial, dial_transport};
pub use config::{DEFAULT_NAMESPACE, SessionConfig};
pub use conn::{AuthState, Conn};
pub use error::{ConnectError, ErrorCode, HandlerError, SendError, TransportError};
pub use events::{Events, Handler, Lifecycle, Namespaces};
pub use frames::{DecodeError, Frame, FrameKind};
pub use nsconn::NSConn;
pub use server::{AllowAll, AuthPolicy, Identity, JwtPolicy, Server, StaticToken};

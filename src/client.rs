//! Dialing side of a session.
//!
//! `dial` parses the dial URI, opens a websocket and runs the client half
//! of the handshake. `dial_transport` runs the same handshake over any
//! [`Transport`], which is how in-process peers and tests connect.

use frames::{Frame, FrameBuffer, FrameKind, encode_frame};
use tracing::{info, warn};
use url::Url;

use crate::config::SessionConfig;
use crate::conn::{Conn, ConnInit, read_frame};
use crate::error::ConnectError;
use crate::events::Namespaces;
use crate::server::TOKEN_PARAM;
use crate::transport::{Transport, WsTransport};

/// Dial `url` (`ws://host[:port]/path[?token=<credential>]`).
///
/// The `token` query parameter is forwarded verbatim as the handshake
/// credential. `namespaces` declares what this end may join or serve.
///
/// # Errors
///
/// - [`ConnectError::Unreachable`] for a bad URI or a transport failure
/// - [`ConnectError::Unauthorized`] when the server refuses the credential
/// - [`ConnectError::Timeout`] when the handshake does not finish in time
pub async fn dial(url: &str, namespaces: Namespaces, config: SessionConfig) -> Result<Conn, ConnectError> {
    let parsed = Url::parse(url).map_err(|e| ConnectError::Unreachable(format!("invalid url {url}: {e}")))?;
    match parsed.scheme() {
        "ws" | "wss" => {}
        other => return Err(ConnectError::Unreachable(format!("unsupported scheme: {other}"))),
    }
    let credentials = token_from_url(&parsed).unwrap_or_default();

    let transport = tokio::time::timeout(config.handshake_timeout, WsTransport::connect(url))
        .await
        .map_err(|_| ConnectError::Timeout)??;
    dial_transport(transport, &credentials, namespaces, config).await
}

/// Credential carried by the dial URI, if any.
#[must_use]
pub fn token_from_url(url: &Url) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == TOKEN_PARAM)
        .map(|(_, value)| value.into_owned())
}

/// Run the client handshake over an open transport.
///
/// # Errors
///
/// Same as [`dial`], minus URI parsing.
pub async fn dial_transport<T: Transport>(
    transport: T,
    credentials: &str,
    namespaces: Namespaces,
    config: SessionConfig,
) -> Result<Conn, ConnectError> {
    let mut transport: Box<dyn Transport> = Box::new(transport);
    let mut buffer = FrameBuffer::with_max_len(config.max_frame_len);

    if let Err(e) = transport.send(encode_frame(&Frame::connect(credentials))).await {
        transport.close().await;
        return Err(ConnectError::Unreachable(e.to_string()));
    }

    let reply = match tokio::time::timeout(config.handshake_timeout, read_frame(&mut transport, &mut buffer)).await {
        Ok(Ok(frame)) => frame,
        Ok(Err(e)) => {
            transport.close().await;
            return Err(e);
        }
        Err(_) => {
            warn!("client: handshake timed out");
            transport.close().await;
            return Err(ConnectError::Timeout);
        }
    };

    match reply.kind {
        FrameKind::ConnectAck => {
            let id = reply.body_text().into_owned();
            info!(conn_id = %id, "client: connected");
            Ok(Conn::start(
                transport,
                buffer,
                ConnInit { id, identity: None, declared: namespaces, config, server: None },
            ))
        }
        FrameKind::ConnectRejected => {
            let reason = reply.body_text().into_owned();
            warn!(code = %reply.event, %reason, "client: handshake rejected");
            transport.close().await;
            Err(ConnectError::from_rejection(&reply.event, "", reason))
        }
        other => {
            transport.close().await;
            Err(ConnectError::Unreachable(format!("unexpected handshake reply: {other:?}")))
        }
    }
}

#[cfg(test)]
#[path = "client_test.rs"]
mod tests;

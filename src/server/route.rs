//! Axum websocket route: HTTP upgrade in front of [`Server::serve`].
//!
//! A `token` query parameter, when present, is checked against the auth
//! policy before upgrading: a refused token never gets a websocket and
//! the dialer sees HTTP 401. Without a token the frame-level handshake
//! decides.

use std::collections::HashMap;

use async_trait::async_trait;
use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use super::Server;
use crate::error::TransportError;
use crate::transport::{Transport, TransportReader, TransportWriter};

/// Query parameter carrying the credential on the dial URI.
pub const TOKEN_PARAM: &str = "token";

/// Router serving the session endpoint at `path`.
pub fn router(server: Server, path: &str) -> Router {
    Router::new()
        .route(path, get(handle_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}

pub async fn handle_ws(
    State(server): State<Server>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = params.get(TOKEN_PARAM).cloned();
    if let Some(token) = &token {
        if let Err(e) = server.policy().authenticate(token) {
            warn!(error = %e, "ws: upgrade rejected");
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    }

    ws.on_upgrade(move |socket| async move {
        if let Err(e) = server.serve(AxumTransport::new(socket), token).await {
            warn!(error = %e, "ws: session not established");
        }
    })
}

// =============================================================================
// TRANSPORT
// =============================================================================

/// Server-side websocket as a [`Transport`]. One binary message per chunk.
pub struct AxumTransport {
    socket: WebSocket,
    closed: bool,
}

pub struct AxumReader {
    stream: SplitStream<WebSocket>,
}

pub struct AxumWriter {
    sink: SplitSink<WebSocket, Message>,
    closed: bool,
}

impl AxumTransport {
    #[must_use]
    pub fn new(socket: WebSocket) -> Self {
        Self { socket, closed: false }
    }
}

#[async_trait]
impl Transport for AxumTransport {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed("closed locally".into()));
        }
        send_chunk(&mut self.socket, bytes).await
    }

    async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        next_chunk(&mut self.socket).await
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.socket.send(Message::Close(None)).await;
    }

    fn split(self: Box<Self>) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>) {
        let Self { socket, closed } = *self;
        let (sink, stream) = socket.split();
        (Box::new(AxumReader { stream }), Box::new(AxumWriter { sink, closed }))
    }
}

#[async_trait]
impl TransportReader for AxumReader {
    async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        next_chunk(&mut self.stream).await
    }
}

#[async_trait]
impl TransportWriter for AxumWriter {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed("closed locally".into()));
        }
        send_chunk(&mut self.sink, bytes).await
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.sink.send(Message::Close(None)).await;
    }
}

async fn send_chunk<S>(sink: &mut S, bytes: Vec<u8>) -> Result<(), TransportError>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    sink.send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| TransportError::Io(e.to_string()))
}

async fn next_chunk<S>(stream: &mut S) -> Result<Vec<u8>, TransportError>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        let Some(msg) = stream.next().await else {
            return Err(TransportError::Closed("stream ended".into()));
        };
        match msg.map_err(|e| TransportError::Io(e.to_string()))? {
            Message::Binary(bytes) => return Ok(bytes.to_vec()),
            Message::Close(frame) => {
                let reason = frame.map_or_else(|| "closed by peer".to_owned(), |f| f.reason.as_str().to_owned());
                return Err(TransportError::Closed(reason));
            }
            Message::Text(_) => debug!("ws: skipping text message"),
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

#[cfg(test)]
#[path = "route_test.rs"]
mod tests;

//! Websocket client transport over `tokio-tungstenite`.
//!
//! Each frame chunk travels as one binary websocket message. Text messages
//! are not part of the protocol and are skipped.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

use super::{Transport, TransportReader, TransportWriter};
use crate::error::{ConnectError, TransportError};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsTransport {
    stream: Socket,
}

pub struct WsReader {
    stream: SplitStream<Socket>,
}

pub struct WsWriter {
    sink: SplitSink<Socket, Message>,
}

impl WsTransport {
    /// Open a websocket to `url`.
    ///
    /// # Errors
    ///
    /// [`ConnectError::Unauthorized`] when the server answers the upgrade with
    /// HTTP 401, [`ConnectError::Unreachable`] for every other failure.
    pub async fn connect(url: &str) -> Result<Self, ConnectError> {
        match connect_async(url).await {
            Ok((stream, _response)) => Ok(Self { stream }),
            Err(tungstenite::Error::Http(response)) if response.status() == StatusCode::UNAUTHORIZED => {
                let reason = response
                    .body()
                    .as_deref()
                    .map_or_else(|| "rejected at upgrade".to_owned(), |b| String::from_utf8_lossy(b).into_owned());
                Err(ConnectError::Unauthorized(reason))
            }
            Err(e) => Err(ConnectError::Unreachable(e.to_string())),
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError> {
        send_chunk(&mut self.stream, bytes).await
    }

    async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        next_chunk(&mut self.stream).await
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }

    fn split(self: Box<Self>) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>) {
        let (sink, stream) = self.stream.split();
        (Box::new(WsReader { stream }), Box::new(WsWriter { sink }))
    }
}

#[async_trait]
impl TransportReader for WsReader {
    async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        next_chunk(&mut self.stream).await
    }
}

#[async_trait]
impl TransportWriter for WsWriter {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError> {
        send_chunk(&mut self.sink, bytes).await
    }

    async fn close(&mut self) {
        let _ = SinkExt::close(&mut self.sink).await;
    }
}

async fn send_chunk<S>(sink: &mut S, bytes: Vec<u8>) -> Result<(), TransportError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    sink.send(Message::Binary(bytes.into())).await.map_err(map_ws_error)
}

async fn next_chunk<S>(stream: &mut S) -> Result<Vec<u8>, TransportError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let Some(msg) = stream.next().await else {
            return Err(TransportError::Closed("stream ended".into()));
        };
        match msg.map_err(map_ws_error)? {
            Message::Binary(bytes) => return Ok(bytes.to_vec()),
            Message::Close(frame) => {
                let reason = frame.map_or_else(|| "closed by peer".to_owned(), |f| f.reason.as_str().to_owned());
                return Err(TransportError::Closed(reason));
            }
            Message::Text(_) => debug!("ws: skipping text message"),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }
}

fn map_ws_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::Closed("connection closed".into())
        }
        other => TransportError::Io(other.to_string()),
    }
}

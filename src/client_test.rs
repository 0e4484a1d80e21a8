use std::time::Duration;

use frames::CODE_UNAUTHORIZED;

use super::*;
use crate::events::Events;
use crate::test_helpers::RawPeer;
use crate::transport::memory;

fn declared() -> Namespaces {
    Namespaces::new().namespace("default", Events::new())
}

#[test]
fn token_is_read_from_query() {
    let url = Url::parse("ws://localhost:8080/echo?token=abc.def&x=1").expect("url");
    assert_eq!(token_from_url(&url).as_deref(), Some("abc.def"));

    let url = Url::parse("ws://localhost:8080/echo").expect("url");
    assert_eq!(token_from_url(&url), None);
}

#[tokio::test]
async fn dial_rejects_bad_urls() {
    let err = dial("not a url", declared(), SessionConfig::default()).await.expect_err("bad url");
    assert!(matches!(err, ConnectError::Unreachable(_)));

    let err = dial("http://localhost/echo", declared(), SessionConfig::default())
        .await
        .expect_err("bad scheme");
    assert_eq!(err, ConnectError::Unreachable("unsupported scheme: http".into()));
}

#[tokio::test]
async fn dial_unreachable_host() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let err = dial(&format!("ws://{addr}/echo"), declared(), SessionConfig::default())
        .await
        .expect_err("nothing listening");
    assert!(matches!(err, ConnectError::Unreachable(_)));
}

#[tokio::test]
async fn handshake_sends_credentials_and_adopts_id() {
    let (a, b) = memory::pair(8);
    let mut peer = RawPeer::new(b);

    let dialing = tokio::spawn(dial_transport(a, "abc", declared(), SessionConfig::default()));
    let connect = peer.recv().await.expect("connect frame");
    assert_eq!(connect, Frame::connect("abc"));
    peer.send(&Frame::connect_ack("conn-7")).await;

    let conn = dialing.await.expect("task").expect("dial");
    assert_eq!(conn.id(), "conn-7");
    assert_eq!(conn.auth_state(), crate::conn::AuthState::Authenticated);
    assert!(conn.identity().is_none());
}

#[tokio::test]
async fn frames_after_ack_in_same_chunk_are_kept() {
    let (a, b) = memory::pair(8);
    let mut peer = RawPeer::new(b);

    let dialing = tokio::spawn(dial_transport(a, "", declared(), SessionConfig::default()));
    peer.recv().await.expect("connect frame");
    let mut chunk = encode_frame(&Frame::connect_ack("conn-1"));
    chunk.extend(encode_frame(&Frame::join("default")));
    peer.send_bytes(chunk).await;

    let conn = dialing.await.expect("task").expect("dial");
    assert_eq!(peer.recv().await.expect("ack").kind, FrameKind::JoinAck);
    assert_eq!(conn.namespaces(), vec!["default"]);
}

#[tokio::test]
async fn rejection_is_unauthorized() {
    let (a, b) = memory::pair(8);
    let mut peer = RawPeer::new(b);

    let dialing = tokio::spawn(dial_transport(a, "Xabc", declared(), SessionConfig::default()));
    peer.recv().await.expect("connect frame");
    peer.send(&Frame::connect_rejected(CODE_UNAUTHORIZED, "invalid credentials")).await;

    let err = dialing.await.expect("task").expect_err("rejected");
    assert_eq!(err, ConnectError::Unauthorized("invalid credentials".into()));
    assert!(peer.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn silent_server_times_out() {
    let (a, _b) = memory::pair(8);
    let config = SessionConfig::default().with_handshake_timeout(Duration::from_millis(100));

    let err = dial_transport(a, "", declared(), config).await.expect_err("no reply");
    assert_eq!(err, ConnectError::Timeout);
}

#[tokio::test]
async fn unexpected_reply_is_unreachable() {
    let (a, b) = memory::pair(8);
    let mut peer = RawPeer::new(b);

    let dialing = tokio::spawn(dial_transport(a, "", declared(), SessionConfig::default()));
    peer.recv().await.expect("connect frame");
    peer.send(&Frame::data("default", "chat", "too early")).await;

    let err = dialing.await.expect("task").expect_err("not an ack");
    assert!(matches!(err, ConnectError::Unreachable(_)));
}

#[tokio::test]
async fn peer_hangup_during_handshake_is_unreachable() {
    let (a, b) = memory::pair(8);
    drop(b);

    let err = dial_transport(a, "", declared(), SessionConfig::default()).await.expect_err("peer gone");
    assert!(matches!(err, ConnectError::Unreachable(_)));
}

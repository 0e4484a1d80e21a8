use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use frames::{CODE_NAMESPACE_NOT_FOUND, Frame, FrameKind};

use super::*;
use crate::error::HandlerError;
use crate::events::{Events, Lifecycle, Namespaces};
use crate::test_helpers::{RawPeer, Recorder, WAIT, conn_pair, conn_with_raw_peer, start_conn};
use crate::transport::memory;

/// Valid length prefix, undecodable body.
const GARBAGE: [u8; 4] = [3, 0xff, 0xff, 0xff];

fn recording(seen: &Recorder) -> Events {
    let mut events = Events::new();
    for hook in Lifecycle::ALL {
        let sink = seen.clone();
        events = events.on_lifecycle(hook, move |ns, msg| {
            sink.push(format!("{}:{}:{}", ns.namespace(), hook, msg.body_text()));
            Ok(())
        });
    }
    events
}

fn chat_counter(seen: &Recorder) -> Events {
    let sink = seen.clone();
    Events::new().on("chat", move |_, msg| {
        sink.push(msg.body_text());
        Ok(())
    })
}

async fn joined(conn: &Conn, peer: &mut RawPeer, namespace: &str) -> NSConn {
    let joining = tokio::spawn({
        let conn = conn.clone();
        let namespace = namespace.to_owned();
        async move { conn.connect(&namespace).await }
    });
    assert_eq!(peer.ack_join().await, namespace);
    joining.await.expect("task").expect("join")
}

// =============================================================================
// JOIN
// =============================================================================

#[tokio::test]
async fn connect_joins_both_sides_and_runs_hooks() {
    let seen = Recorder::default();
    let declared = Namespaces::new().namespace("default", recording(&seen));
    let (client, server) = conn_pair(declared.clone(), declared, SessionConfig::default());

    let ns = client.connect("default").await.expect("join");

    assert_eq!(ns.namespace(), "default");
    assert_eq!(client.namespaces(), vec!["default"]);
    assert_eq!(server.namespaces(), vec!["default"]);
    let mut entries = seen.wait_for_len(2).await;
    entries.sort();
    assert_eq!(
        entries,
        vec!["default:_OnNamespaceConnected:", "default:_OnNamespaceConnected:"]
    );
}

#[tokio::test]
async fn connect_twice_returns_existing_namespace() {
    let declared = Namespaces::new().namespace("default", Events::new());
    let (conn, mut peer) = conn_with_raw_peer(declared, SessionConfig::default());
    let first = joined(&conn, &mut peer, "default").await;

    let second = conn.connect("default").await.expect("already joined");
    first.emit("ping", "").expect("emit");

    assert_eq!(second.namespace(), first.namespace());
    // The next frame on the wire is the ping, not a second join.
    assert_eq!(peer.recv().await.expect("frame").event, "ping");
}

#[tokio::test]
async fn connect_undeclared_locally_fails_without_hooks() {
    let seen = Recorder::default();
    let declared = Namespaces::new().namespace("default", recording(&seen));
    let (client, _server) = conn_pair(declared.clone(), declared, SessionConfig::default());

    let err = client.connect("missing").await.expect_err("undeclared");

    assert_eq!(err, ConnectError::NamespaceNotFound("missing".into()));
    assert!(client.namespace("missing").is_none());
    assert!(seen.entries().is_empty());
}

#[tokio::test]
async fn connect_rejected_by_peer_runs_failed_hook_only() {
    let seen = Recorder::default();
    let left = Namespaces::new().namespace("chat", recording(&seen));
    let right = Namespaces::new().namespace("default", Events::new());
    let (client, server) = conn_pair(left, right, SessionConfig::default());

    let err = client.connect("chat").await.expect_err("peer lacks namespace");

    assert_eq!(err, ConnectError::NamespaceNotFound("chat".into()));
    assert!(client.namespace("chat").is_none());
    assert!(server.namespaces().is_empty());
    assert_eq!(
        seen.entries(),
        vec!["chat:_OnNamespaceConnectedFailed:namespace chat not found"]
    );
}

#[tokio::test]
async fn peer_join_for_undeclared_namespace_is_rejected() {
    let declared = Namespaces::new().namespace("default", Events::new());
    let (_conn, mut peer) = conn_with_raw_peer(declared, SessionConfig::default());

    peer.send(&Frame::join("nope")).await;
    let reply = peer.recv().await.expect("reply");

    assert_eq!(reply.kind, FrameKind::JoinRejected);
    assert_eq!(reply.namespace, "nope");
    assert_eq!(reply.event, CODE_NAMESPACE_NOT_FOUND);
    assert!(reply.is_error);
}

#[tokio::test(start_paused = true)]
async fn join_times_out_and_late_ack_is_left() {
    let config = SessionConfig::default().with_join_timeout(Duration::from_millis(50));
    let declared = Namespaces::new().namespace("default", Events::new());
    let (conn, mut peer) = conn_with_raw_peer(declared, config);

    let err = conn.connect("default").await.expect_err("no ack");
    assert_eq!(err, ConnectError::Timeout);

    let join = peer.recv().await.expect("join");
    assert_eq!(join.kind, FrameKind::Join);
    peer.send(&Frame::join_ack("default")).await;

    let leave = peer.recv().await.expect("leave");
    assert_eq!(leave.kind, FrameKind::Leave);
    assert_eq!(leave.namespace, "default");
    assert!(conn.namespace("default").is_none());
}

#[tokio::test]
async fn pending_join_fails_closed_when_peer_goes_away() {
    let declared = Namespaces::new().namespace("default", Events::new());
    let (conn, mut peer) = conn_with_raw_peer(declared, SessionConfig::default());

    let joining = tokio::spawn({
        let conn = conn.clone();
        async move { conn.connect("default").await }
    });
    assert_eq!(peer.recv().await.expect("join").kind, FrameKind::Join);
    peer.transport.close().await;

    assert!(matches!(joining.await.expect("task"), Err(ConnectError::Closed)));
    assert_eq!(conn.connect("default").await.expect_err("closed"), ConnectError::Closed);
}

#[tokio::test]
async fn simultaneous_joins_settle_on_one_namespace() {
    let declared = Namespaces::new().namespace("default", Events::new());
    let (left, right) = conn_pair(declared.clone(), declared, SessionConfig::default());

    let (a, b) = tokio::join!(left.connect("default"), right.connect("default"));

    a.expect("left joined");
    b.expect("right joined");
    assert_eq!(left.namespaces(), vec!["default"]);
    assert_eq!(right.namespaces(), vec!["default"]);
}

// =============================================================================
// DATA
// =============================================================================

#[tokio::test]
async fn emits_arrive_in_order() {
    let seen = Recorder::default();
    let sink = seen.clone();
    let server_events = Events::new().on("chat", move |_, msg| {
        sink.push(msg.body_text());
        Ok(())
    });
    let (client, _server) = conn_pair(
        Namespaces::new().namespace("default", Events::new()),
        Namespaces::new().namespace("default", server_events),
        SessionConfig::default(),
    );
    let ns = client.connect("default").await.expect("join");

    for i in 0..100 {
        ns.emit("chat", i.to_string()).expect("emit");
    }

    let expected: Vec<String> = (0..100).map(|i| i.to_string()).collect();
    assert_eq!(seen.wait_for_len(100).await, expected);
}

#[tokio::test]
async fn handler_error_is_sent_back_as_error_frame() {
    let events = Events::new()
        .on("chat", |_, _| Err(HandlerError::from("nope")))
        .on("echo", |ns, msg| Ok(ns.emit("echo", msg.body.clone())?));
    let declared = Namespaces::new().namespace("default", events);
    let (_conn, mut peer) = conn_with_raw_peer(declared, SessionConfig::default());
    peer.send(&Frame::join("default")).await;
    assert_eq!(peer.recv().await.expect("ack").kind, FrameKind::JoinAck);

    peer.send(&Frame::data("default", "chat", "hi")).await;
    let reply = peer.recv().await.expect("error reply");
    assert!(reply.is_error);
    assert_eq!(reply.event, "chat");
    assert_eq!(reply.body_text(), "nope");

    // Error frames are never answered.
    peer.send(&Frame::data("default", "chat", "hi").error_reply("upstream")).await;
    peer.send(&Frame::data("default", "echo", "after")).await;
    let next = peer.recv().await.expect("echo");
    assert_eq!(next.event, "echo");
    assert!(!next.is_error);
}

#[tokio::test]
async fn reserved_and_stray_frames_are_not_dispatched() {
    let seen = Recorder::default();
    let declared = Namespaces::new().namespace("default", recording(&seen).on_any({
        let sink = seen.clone();
        move |_: &NSConn, msg: &Frame| {
            sink.push(format!("any:{}", msg.event));
            Ok(())
        }
    }));
    let (conn, mut peer) = conn_with_raw_peer(declared, SessionConfig::default());
    joined(&conn, &mut peer, "default").await;

    peer.send(&Frame::data("default", "_OnNamespaceConnected", "spoof")).await;
    peer.send(&Frame::data("default", "_OnNamespaceDisconnectReason", "spoof")).await;
    peer.send(&Frame::data("unjoined", "chat", "stray")).await;
    peer.send(&Frame::noop()).await;
    peer.send(&Frame::data("default", "chat", "real")).await;

    assert_eq!(
        seen.wait_for_len(2).await,
        vec!["default:_OnNamespaceConnected:", "any:chat"]
    );
    assert!(!conn.is_closed());
}

#[tokio::test]
async fn backpressure_when_write_queue_is_full() {
    let config = SessionConfig::default().with_write_queue_capacity(1);
    let (a, b) = memory::pair(1);
    let conn = start_conn("conn", a, Namespaces::new().namespace("default", Events::new()), config);
    let mut peer = RawPeer::new(b);
    let ns = joined(&conn, &mut peer, "default").await;

    // Nothing has been written yet: the single write credit is taken by the
    // first emit, every later one is refused.
    let results: Vec<_> = (0..16).map(|i| ns.emit("chat", i.to_string())).collect();

    assert_eq!(results[0], Ok(()));
    assert!(results.contains(&Err(SendError::Backpressure)));
    assert!(results.iter().all(|r| *r != Err(SendError::NotConnected)));
}

#[tokio::test]
async fn credits_return_once_frames_are_written() {
    let config = SessionConfig::default().with_write_queue_capacity(1);
    let (a, b) = memory::pair(64);
    let conn = start_conn("conn", a, Namespaces::new().namespace("default", Events::new()), config);
    let mut peer = RawPeer::new(b);
    let ns = joined(&conn, &mut peer, "default").await;

    for i in 0..5 {
        ns.emit("chat", i.to_string()).expect("credit available again");
        assert_eq!(peer.recv().await.expect("frame").body_text(), i.to_string());
    }
}

#[tokio::test]
async fn bursts_in_both_directions_do_not_stall() {
    let left_seen = Recorder::default();
    let right_seen = Recorder::default();
    let (a, b) = memory::pair(4);
    let left = start_conn(
        "left",
        a,
        Namespaces::new().namespace("default", chat_counter(&left_seen)),
        SessionConfig::default(),
    );
    let right = start_conn(
        "right",
        b,
        Namespaces::new().namespace("default", chat_counter(&right_seen)),
        SessionConfig::default(),
    );
    let left_ns = left.connect("default").await.expect("join");
    let right_ns = tokio::time::timeout(WAIT, async {
        loop {
            if let Some(ns) = right.namespace("default") {
                return ns;
            }
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("right joined");

    for i in 0..100 {
        left_ns.emit("chat", i.to_string()).expect("left emit");
        right_ns.emit("chat", i.to_string()).expect("right emit");
    }

    assert_eq!(right_seen.wait_for_len(100).await.len(), 100);
    assert_eq!(left_seen.wait_for_len(100).await.len(), 100);
    tokio::time::timeout(WAIT, left.close()).await.expect("close returns");
    tokio::time::timeout(WAIT, right.closed()).await.expect("peer sees close");
}

#[tokio::test]
async fn leave_flushes_queued_frames_first() {
    let declared = Namespaces::new().namespace("default", Events::new());
    let (conn, mut peer) = conn_with_raw_peer(declared, SessionConfig::default());
    let ns = joined(&conn, &mut peer, "default").await;

    ns.emit("chat", "one").expect("emit");
    ns.emit("chat", "two").expect("emit");
    ns.disconnect().await.expect("leave");

    assert_eq!(peer.recv().await.expect("frame").body_text(), "one");
    assert_eq!(peer.recv().await.expect("frame").body_text(), "two");
    assert_eq!(peer.recv().await.expect("frame").kind, FrameKind::Leave);
    assert_eq!(ns.emit("chat", "three"), Err(SendError::NotConnected));
}

#[tokio::test]
async fn peer_leave_runs_disconnect_hook() {
    let seen = Recorder::default();
    let declared = Namespaces::new().namespace("default", recording(&seen));
    let (conn, mut peer) = conn_with_raw_peer(declared, SessionConfig::default());
    let ns = joined(&conn, &mut peer, "default").await;

    peer.send(&Frame::leave("default")).await;

    assert_eq!(
        seen.wait_for_len(2).await,
        vec!["default:_OnNamespaceConnected:", "default:_OnNamespaceDisconnect:"]
    );
    assert!(!ns.is_connected());
    assert!(conn.namespace("default").is_none());
}

// =============================================================================
// CLOSE
// =============================================================================

#[tokio::test]
async fn disconnect_reason_fires_once_per_namespace() {
    let seen = Recorder::default();
    let declared = Namespaces::new()
        .namespace("a", recording(&seen))
        .namespace("b", recording(&seen));
    let (conn, mut peer) = conn_with_raw_peer(declared, SessionConfig::default());
    joined(&conn, &mut peer, "a").await;
    joined(&conn, &mut peer, "b").await;

    peer.transport.close().await;
    conn.closed().await;
    conn.close().await;

    let mut reasons: Vec<String> = seen
        .entries()
        .into_iter()
        .filter(|e| e.contains("DisconnectReason"))
        .collect();
    reasons.sort();
    assert_eq!(
        reasons,
        vec![
            "a:_OnNamespaceDisconnectReason:transport closed: peer closed",
            "b:_OnNamespaceDisconnectReason:transport closed: peer closed",
        ]
    );
    assert!(conn.namespaces().is_empty());
}

#[tokio::test]
async fn local_close_reports_reason_and_ends_stream() {
    let seen = Recorder::default();
    let declared = Namespaces::new().namespace("default", recording(&seen));
    let (conn, mut peer) = conn_with_raw_peer(declared, SessionConfig::default());
    joined(&conn, &mut peer, "default").await;

    conn.close().await;

    assert!(conn.is_closed());
    assert!(peer.recv().await.is_none());
    assert_eq!(
        seen.entries(),
        vec![
            "default:_OnNamespaceConnected:",
            "default:_OnNamespaceDisconnectReason:closed locally",
        ]
    );
    assert_eq!(conn.disconnect("default").await, Err(ConnectError::Closed));
}

#[tokio::test]
async fn persistent_corruption_closes_connection() {
    let seen = Recorder::default();
    let config = SessionConfig::default().with_max_decode_errors(3);
    let declared = Namespaces::new().namespace("default", recording(&seen));
    let (conn, mut peer) = conn_with_raw_peer(declared, config);
    joined(&conn, &mut peer, "default").await;

    for _ in 0..3 {
        peer.send_bytes(GARBAGE.to_vec()).await;
    }
    conn.closed().await;

    assert!(seen.entries().contains(&format!(
        "default:_OnNamespaceDisconnectReason:{PERSISTENT_CORRUPTION}"
    )));
    assert!(peer.recv().await.is_none());
}

#[tokio::test]
async fn good_frames_reset_the_corruption_count() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let events = Events::new().on("chat", move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let config = SessionConfig::default().with_max_decode_errors(3);
    let (conn, mut peer) = conn_with_raw_peer(Namespaces::new().namespace("default", events), config);
    joined(&conn, &mut peer, "default").await;

    for _ in 0..3 {
        peer.send_bytes(GARBAGE.to_vec()).await;
        peer.send_bytes(GARBAGE.to_vec()).await;
        peer.send(&Frame::data("default", "chat", "ok")).await;
    }

    tokio::time::timeout(WAIT, async {
        while hits.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("frames dispatched");
    assert!(!conn.is_closed());
}

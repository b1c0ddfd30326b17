//! Terminal session engine behavior: policy races, filtering, fan-out and
//! idempotent teardown, driven through the public broker API against an
//! in-memory echo target.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{asset, echo_harness, fast_config, request};
use warden_broker::filter::CommandRule;
use warden_broker::policy::AccessAuth;
use warden_broker::session::SessionStatus;
use warden_core::error::Error;
use warden_test_utils::mock_transport_pair;

#[tokio::test]
async fn echo_round_trip_reaches_client_and_recorder() {
    let harness = echo_harness(fast_config(), asset()).await;
    let (transport, peer) = mock_transport_pair();
    let session = harness
        .broker
        .connect(request(Arc::new(transport), "ssh"))
        .await
        .unwrap();

    peer.send(b"1ls -la\r").await.unwrap();
    let seen = peer
        .wait_for(b"ls -la\r", Duration::from_secs(2))
        .await
        .expect("echo output reaches client");
    assert!(seen.windows(7).any(|w| w == b"ls -la\r"));

    harness.broker.close_session(session.id(), "test").await.unwrap();
    session.wait().await;

    // The recorder saved a cast containing the echoed output.
    let day = chrono::Utc::now().format("%Y-%m-%d").to_string();
    let cast_path = harness
        .tempdir
        .path()
        .join("replay")
        .join(day)
        .join(format!("{}.cast", session.id()));
    let cast = std::fs::read_to_string(cast_path).unwrap();
    assert!(cast.contains("ls -la"));
}

#[tokio::test]
async fn idle_timeout_takes_the_session_offline() {
    let mut config = fast_config();
    config.idle_timeout = Duration::from_secs(1);
    let harness = echo_harness(config, asset()).await;

    let (transport, peer) = mock_transport_pair();
    let started = Instant::now();
    let session = harness
        .broker
        .connect(request(Arc::new(transport), "ssh"))
        .await
        .unwrap();

    let cause = tokio::time::timeout(Duration::from_secs(3), session.wait())
        .await
        .expect("session terminates on its own")
        .expect("terminal cause");
    assert!(matches!(*cause, Error::IdleTimeout { seconds: 1 }));

    // Fires at the timeout, with modest scheduling slack.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(900), "fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1600), "fired late: {elapsed:?}");

    // The client was told before the transport closed.
    let frames = peer.drain().await;
    let all: Vec<u8> = frames.iter().flat_map(|f| f.iter().copied()).collect();
    assert!(
        String::from_utf8_lossy(&all).contains("idle"),
        "client saw no idle notice"
    );

    // Exactly one Offline row was persisted and the registry is empty.
    let offline: Vec<_> = harness
        .store
        .rows()
        .await
        .into_iter()
        .filter(|r| r.status == SessionStatus::Offline)
        .collect();
    assert_eq!(offline.len(), 1);
    assert!(offline[0].closed_at.is_some());
    assert_eq!(harness.broker.registry().count().await, 0);
}

#[tokio::test]
async fn activity_defers_the_idle_timeout() {
    let mut config = fast_config();
    config.idle_timeout = Duration::from_millis(500);
    let harness = echo_harness(config, asset()).await;

    let (transport, peer) = mock_transport_pair();
    let session = harness
        .broker
        .connect(request(Arc::new(transport), "ssh"))
        .await
        .unwrap();

    // Keep typing for a full second; heartbeats alone would not count.
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        peer.send(b"1x").await.unwrap();
    }
    assert!(
        harness.broker.registry().get(session.id()).await.is_some(),
        "session died despite activity"
    );

    let cause = tokio::time::timeout(Duration::from_secs(2), session.wait())
        .await
        .expect("session times out once input stops")
        .expect("terminal cause");
    assert!(matches!(*cause, Error::IdleTimeout { .. }));
}

#[tokio::test]
async fn forbidden_command_is_blocked_and_cleared() {
    let mut locked_down = asset();
    locked_down.commands = vec![CommandRule {
        pattern: "rm -rf".into(),
        is_regex: true,
    }];
    let harness = echo_harness(fast_config(), locked_down).await;

    let (transport, peer) = mock_transport_pair();
    let session = harness
        .broker
        .connect(request(Arc::new(transport), "ssh"))
        .await
        .unwrap();

    peer.send(b"1rm -rf /\r").await.unwrap();
    let seen = peer
        .wait_for(b"is forbidden", Duration::from_secs(2))
        .await
        .expect("client is told the command is forbidden");
    let text = String::from_utf8_lossy(&seen).into_owned();
    assert!(text.contains("rm -rf is forbidden"));
    // The dropped command never reached the echo target.
    assert!(!text.contains("rm -rf /\r"));

    // The kill-line sequence did reach the target (and echoed back).
    peer.wait_for(b"\x15\r", Duration::from_secs(2))
        .await
        .expect("clear-line forwarded to target");

    // The session keeps working for allowed input.
    peer.send(b"1uptime\r").await.unwrap();
    peer.wait_for(b"uptime\r", Duration::from_secs(2))
        .await
        .expect("allowed command still echoes");

    harness.broker.close_session(session.id(), "test").await.unwrap();
    session.wait().await;
}

#[tokio::test]
async fn monitors_receive_fanout_and_survive_a_dead_peer() {
    let harness = echo_harness(fast_config(), asset()).await;
    let (transport, peer) = mock_transport_pair();
    let session = harness
        .broker
        .connect(request(Arc::new(transport), "ssh"))
        .await
        .unwrap();

    let mut viewers = Vec::new();
    for _ in 0..3 {
        let (viewer, viewer_peer) = mock_transport_pair();
        harness
            .broker
            .attach_monitor(
                session.id(),
                Arc::new(viewer),
                warden_core::transport::WindowSize {
                    width: 80,
                    height: 24,
                },
                96,
            )
            .await
            .unwrap();
        viewers.push(viewer_peer);
    }

    peer.send(b"1first\r").await.unwrap();
    for viewer_peer in &viewers {
        viewer_peer
            .wait_for(b"first\r", Duration::from_secs(2))
            .await
            .expect("every monitor sees the flushed output");
    }

    // Kill one viewer; the rest and the primary stay unaffected.
    let dead = viewers.remove(0);
    dead.disconnect();
    tokio::time::sleep(Duration::from_millis(50)).await;

    peer.send(b"1second\r").await.unwrap();
    peer.wait_for(b"second\r", Duration::from_secs(2))
        .await
        .expect("primary client unaffected");
    for viewer_peer in &viewers {
        viewer_peer
            .wait_for(b"second\r", Duration::from_secs(2))
            .await
            .expect("remaining monitors still receive output");
    }

    // Teardown notifies and closes the remaining viewers.
    harness.broker.close_session(session.id(), "test").await.unwrap();
    session.wait().await;
    for viewer_peer in &viewers {
        viewer_peer
            .wait_for(b"ended", Duration::from_secs(2))
            .await
            .expect("monitors get the session-ended notice");
    }
}

#[tokio::test]
async fn concurrent_admin_close_and_disconnect_tear_down_once() {
    let harness = echo_harness(fast_config(), asset()).await;
    let (transport, peer) = mock_transport_pair();
    let session = harness
        .broker
        .connect(request(Arc::new(transport), "ssh"))
        .await
        .unwrap();

    let broker = harness.broker.clone();
    let id = session.id().to_string();
    let closer = tokio::spawn(async move { broker.close_session(&id, "admin-a").await });
    peer.disconnect();

    let _ = closer.await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), session.wait())
        .await
        .expect("session tears down");

    let offline: Vec<_> = harness
        .store
        .rows()
        .await
        .into_iter()
        .filter(|r| r.status == SessionStatus::Offline)
        .collect();
    assert_eq!(offline.len(), 1, "teardown persisted more than once");
    assert_eq!(harness.broker.registry().count().await, 0);
}

#[tokio::test]
async fn admin_close_names_the_closer() {
    let harness = echo_harness(fast_config(), asset()).await;
    let (transport, peer) = mock_transport_pair();
    let session = harness
        .broker
        .connect(request(Arc::new(transport), "ssh"))
        .await
        .unwrap();

    harness
        .broker
        .close_session(session.id(), "admin-bob")
        .await
        .unwrap();

    let cause = tokio::time::timeout(Duration::from_secs(2), session.wait())
        .await
        .unwrap()
        .expect("terminal cause");
    assert!(matches!(
        &*cause,
        Error::AdminClose { closer } if closer == "admin-bob"
    ));

    let frames = peer.drain().await;
    let all: Vec<u8> = frames.iter().flat_map(|f| f.iter().copied()).collect();
    assert!(String::from_utf8_lossy(&all).contains("admin-bob"));
}

#[tokio::test]
async fn revoked_access_window_ends_the_session_on_recheck() {
    let harness = echo_harness(fast_config(), asset()).await;
    let (transport, _peer) = mock_transport_pair();
    let session = harness
        .broker
        .connect(request(Arc::new(transport), "ssh"))
        .await
        .unwrap();

    // Flip the asset's window to one that expired an hour ago.
    let mut revoked = asset();
    revoked.access = AccessAuth {
        end: Some(chrono::Utc::now() - chrono::Duration::hours(1)),
        ..AccessAuth::default()
    };
    harness.directory.put_asset(revoked).await;

    let cause = tokio::time::timeout(Duration::from_secs(2), session.wait())
        .await
        .expect("recheck tick terminates the session")
        .expect("terminal cause");
    assert!(matches!(*cause, Error::AccessWindow));
}

#[tokio::test]
async fn denied_window_aborts_before_registration() {
    let mut denied = asset();
    denied.access = AccessAuth {
        end: Some(chrono::Utc::now() - chrono::Duration::hours(1)),
        ..AccessAuth::default()
    };
    let harness = echo_harness(fast_config(), denied).await;

    let (transport, _peer) = mock_transport_pair();
    let err = harness
        .broker
        .connect(request(Arc::new(transport), "ssh"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AccessWindow));

    // Never registered, never persisted: no teardown race possible.
    assert_eq!(harness.broker.registry().count().await, 0);
    assert!(harness.store.rows().await.is_empty());
}

#[tokio::test]
async fn client_disconnect_is_a_terminal_cause() {
    let harness = echo_harness(fast_config(), asset()).await;
    let (transport, peer) = mock_transport_pair();
    let session = harness
        .broker
        .connect(request(Arc::new(transport), "ssh"))
        .await
        .unwrap();

    peer.disconnect();
    let cause = tokio::time::timeout(Duration::from_secs(2), session.wait())
        .await
        .unwrap()
        .expect("terminal cause");
    assert!(matches!(*cause, Error::ConnectionClosed));
}

#[tokio::test]
async fn keepalives_flow_to_web_clients() {
    let harness = echo_harness(fast_config(), asset()).await;
    let (transport, peer) = mock_transport_pair();
    let session = harness
        .broker
        .connect(request(Arc::new(transport), "ssh"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    let frames = peer.drain().await;
    assert!(
        frames.iter().any(|f| f.is_empty()),
        "no keep-alive frame within two intervals"
    );

    harness.broker.close_session(session.id(), "test").await.unwrap();
    session.wait().await;
}

#[tokio::test]
async fn resize_frames_reach_the_window_channel() {
    let harness = echo_harness(fast_config(), asset()).await;
    let (transport, peer) = mock_transport_pair();
    let session = harness
        .broker
        .connect(request(Arc::new(transport), "ssh"))
        .await
        .unwrap();

    // The echo connector drains window events; a resize frame must not be
    // forwarded to the target as data.
    peer.send(b"w120,40").await.unwrap();
    peer.send(b"1marker\r").await.unwrap();
    let seen = peer
        .wait_for(b"marker\r", Duration::from_secs(2))
        .await
        .unwrap();
    assert!(!String::from_utf8_lossy(&seen).contains("120,40"));

    harness.broker.close_session(session.id(), "test").await.unwrap();
    session.wait().await;
}

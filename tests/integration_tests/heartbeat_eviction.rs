// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::{Duration, Instant};

use bolt_rpc_rs::protocol::status::ResponseStatus;
use tokio::net::TcpListener;

use crate::integration_tests::common::{fast_config, register_echo, start_server, started_client};

/// A peer that accepts connections and then never answers anything,
/// without closing its end either.
async fn silent_peer() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    addr
}

#[tokio::test]
async fn missed_heartbeats_evict_the_connection_and_fail_pendings() {
    let addr = silent_peer().await;

    let mut cfg = fast_config();
    cfg.heartbeat.interval = Duration::from_millis(200);
    cfg.heartbeat.max_miss = 2;
    let client = started_client(cfg);

    let url: bolt_rpc_rs::pool::url::Url = addr.parse().expect("url");
    let conn = client.connect(&url).await.expect("conn");

    // An in-flight request with a long timeout; eviction must beat it.
    let pending = client
        .invoke_with_future(&conn, "Ping", &"never".to_string(), 30_000)
        .await
        .expect("send");

    let started = Instant::now();
    let err = pending.await_response().await.expect_err("evicted");
    let elapsed = started.elapsed();

    assert_eq!(err.status(), ResponseStatus::ConnectionClosed);
    assert!(
        elapsed < Duration::from_secs(8),
        "eviction took too long: {elapsed:?}"
    );
    assert!(!conn.is_active());
    assert_eq!(conn.pending_count(), 0, "close drained the table");

    client.shutdown();
}

#[tokio::test]
async fn heartbeats_keep_a_quiet_connection_alive() {
    let (server, addr) = start_server(fast_config(), register_echo).await;

    let mut cfg = fast_config();
    cfg.heartbeat.interval = Duration::from_millis(150);
    cfg.heartbeat.max_miss = 2;
    let client = started_client(cfg);

    let url: bolt_rpc_rs::pool::url::Url = addr.parse().expect("url");
    let conn = client.connect(&url).await.expect("conn");

    // Several heartbeat windows pass with no user traffic; the pings answer
    // and the missed counter stays at zero.
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert!(conn.is_active());

    let got: String = client
        .invoke_sync(&conn, "Ping", &"still-here".to_string(), 1000)
        .await
        .expect("invoke after idle");
    assert_eq!(got, "ok:still-here");

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn peer_shutdown_fails_pendings_with_connection_closed() {
    let (server, addr) = start_server(fast_config(), |s| {
        s.register_processor(bolt_rpc_rs::api::processor::async_processor(
            "Gone",
            |_ctx, _req: String| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, bolt_rpc_rs::error::RemotingError>("too late".to_string())
            },
        ))
        .expect("register");
    })
    .await;
    let client = started_client(fast_config());

    let url: bolt_rpc_rs::pool::url::Url = addr.parse().expect("url");
    let conn = client.connect(&url).await.expect("conn");

    let pending = client
        .invoke_with_future(&conn, "Gone", &"x".to_string(), 30_000)
        .await
        .expect("send");
    // Let the request reach the processor before tearing the server down.
    tokio::time::sleep(Duration::from_millis(100)).await;

    server.shutdown();

    let err = pending.await_response().await.expect_err("closed");
    assert_eq!(err.status(), ResponseStatus::ConnectionClosed);

    client.shutdown();
}

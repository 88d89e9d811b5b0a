// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bolt_rpc_rs::{
    api::{client::RpcClient, server::RpcServer},
    error::RemotingError,
    transport::events::{
        ConnectionEvent, ConnectionEventKind, ConnectionEventProcessor,
    },
};

use crate::integration_tests::common::{fast_config, register_echo, start_server};

#[tokio::test]
async fn double_startup_is_a_lifecycle_error() {
    let client = RpcClient::new(fast_config());
    client.startup().expect("first");
    let err = client.startup().expect_err("second");
    assert!(matches!(err, RemotingError::Lifecycle(_)));
    client.shutdown();
}

#[tokio::test]
async fn startup_after_shutdown_is_rejected() {
    let client = RpcClient::new(fast_config());
    client.startup().expect("first");
    client.shutdown();
    // Repeated shutdown stays safe, the instance stays unusable.
    client.shutdown();
    let err = client.startup().expect_err("restart");
    assert!(matches!(err, RemotingError::Lifecycle(_)));
}

#[tokio::test]
async fn server_double_startup_is_a_lifecycle_error() {
    let server = RpcServer::new(fast_config(), "127.0.0.1:0");
    server.startup().await.expect("first");
    let err = server.startup().await.expect_err("second");
    assert!(matches!(err, RemotingError::Lifecycle(_)));
    server.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn invoking_before_startup_is_rejected() {
    let client = RpcClient::new(fast_config());
    let err = client
        .invoke_sync::<String, String>("127.0.0.1:1", "Ping", &"x".to_string(), 100)
        .await
        .expect_err("not running");
    assert!(matches!(err, RemotingError::Lifecycle(_)));
}

struct CountingListener {
    connects: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl ConnectionEventProcessor for CountingListener {
    fn on_event(&self, event: &ConnectionEvent) {
        match event.kind {
            ConnectionEventKind::Connect => {
                self.connects.fetch_add(1, Ordering::Relaxed);
            },
            ConnectionEventKind::Close => {
                self.closes.fetch_add(1, Ordering::Relaxed);
            },
            _ => {},
        }
    }
}

#[tokio::test]
async fn connect_and_close_events_reach_subscribers() {
    let (server, addr) = start_server(fast_config(), register_echo).await;

    let connects = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));
    let client = RpcClient::new(fast_config());
    client.subscribe_event(
        ConnectionEventKind::Connect,
        Arc::new(CountingListener {
            connects: Arc::clone(&connects),
            closes: Arc::clone(&closes),
        }),
    );
    client.subscribe_event(
        ConnectionEventKind::Close,
        Arc::new(CountingListener {
            connects: Arc::clone(&connects),
            closes: Arc::clone(&closes),
        }),
    );
    client.startup().expect("startup");

    let got: String = client
        .invoke_sync(addr.as_str(), "Ping", &"ev".to_string(), 1000)
        .await
        .expect("invoke");
    assert_eq!(got, "ok:ev");

    client.close_connection(addr.as_str()).expect("close");

    let mut waited = Duration::ZERO;
    while (connects.load(Ordering::Relaxed) < 1 || closes.load(Ordering::Relaxed) < 1)
        && waited < Duration::from_secs(2)
    {
        tokio::time::sleep(Duration::from_millis(25)).await;
        waited += Duration::from_millis(25);
    }
    assert!(connects.load(Ordering::Relaxed) >= 1, "connect event seen");
    assert!(closes.load(Ordering::Relaxed) >= 1, "close event seen");

    client.shutdown();
    server.shutdown();
}

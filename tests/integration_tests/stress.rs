// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bolt_rpc_rs::{
    api::processor::{sync_processor, with_concurrency},
    error::RemotingError,
};
use tokio::task::JoinSet;

use crate::integration_tests::common::{fast_config, start_server, started_client};

const TASKS: usize = 16;
const CALLS_PER_TASK: usize = 250;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_sync_calls_stay_correlated_and_leak_nothing() {
    let echo = sync_processor("Ping", |_ctx, req: String| {
        Ok::<_, RemotingError>(format!("ok:{req}"))
    });
    let (server, addr) = start_server(fast_config(), |s| {
        s.register_processor(with_concurrency(echo, 4)).expect("register");
    })
    .await;
    let client = Arc::new(started_client(fast_config()));

    let url: bolt_rpc_rs::pool::url::Url = addr.parse().expect("url");
    let conn = client.connect(&url).await.expect("conn");

    let mut tasks = JoinSet::new();
    for t in 0..TASKS {
        let client = Arc::clone(&client);
        let conn = Arc::clone(&conn);
        tasks.spawn(async move {
            for i in 0..CALLS_PER_TASK {
                let payload = format!("t{t}-i{i}");
                let got: String = client
                    .invoke_sync(&conn, "Ping", &payload, 10_000)
                    .await
                    .expect("invoke");
                assert_eq!(got, format!("ok:{payload}"), "response crossed streams");
            }
        });
    }
    while let Some(res) = tasks.join_next().await {
        res.expect("task panicked");
    }

    // Every id correlated exactly once: nothing pending, nothing dropped.
    let deadline = Instant::now() + Duration::from_secs(2);
    while conn.pending_count() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(conn.pending_count(), 0, "pending table drained");
    assert_eq!(conn.dropped_responses(), 0, "no uncorrelated responses");

    client.shutdown();
    server.shutdown();
}

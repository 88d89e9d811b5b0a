// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::{Duration, Instant};

use bolt_rpc_rs::{
    error::RemotingError,
    protocol::{command::ResponseCommand, status::ResponseStatus},
    transport::invoke::PendingTable,
};
use bytes::Bytes;

fn ok_response(id: u32) -> ResponseCommand {
    ResponseCommand::success(id, 1, "Pong", Bytes::from_static(b"\"ok\""))
}

#[tokio::test]
async fn response_completes_future() {
    let table = PendingTable::new();
    let future = table.register(1, Duration::from_secs(5), None);
    assert_eq!(table.len(), 1);

    assert!(table.complete_response(ok_response(1)));
    assert!(table.is_empty());

    let resp = future.await_response().await.expect("completed");
    assert_eq!(resp.status, ResponseStatus::Success);
}

#[tokio::test]
async fn late_response_after_timeout_is_ignored_silently() {
    let table = PendingTable::new();
    let future = table.register(7, Duration::from_millis(50), None);

    table.fail(
        7,
        RemotingError::Timeout {
            id: 7,
            timeout_ms: 50,
        },
    );
    // The response arrives after the timeout already won: dropped beyond a
    // counter, no error, no completion.
    assert!(!table.complete_response(ok_response(7)));
    assert_eq!(table.dropped(), 1);

    let err = future.await_response().await.expect_err("timed out");
    assert_eq!(err.status(), ResponseStatus::Timeout);
}

#[tokio::test]
async fn unknown_response_id_is_dropped() {
    let table = PendingTable::new();
    assert!(!table.complete_response(ok_response(1234)));
    assert_eq!(table.dropped(), 1);
}

#[tokio::test]
async fn drain_fails_every_pending_with_connection_closed() {
    let table = PendingTable::new();
    let futures: Vec<_> = (1..=3u32)
        .map(|id| table.register(id, Duration::from_secs(5), None))
        .collect();

    table.drain("shutting down");
    assert!(table.is_empty());

    for future in futures {
        let err = future.await_response().await.expect_err("drained");
        assert_eq!(err.status(), ResponseStatus::ConnectionClosed);
    }
}

#[tokio::test]
async fn scan_reaps_expired_entries() {
    let table = PendingTable::new();
    let expired = table.register(1, Duration::from_millis(1), None);
    let fresh = table.register(2, Duration::from_secs(60), None);

    tokio::time::sleep(Duration::from_millis(20)).await;
    table.scan(Instant::now());

    let err = expired.await_response().await.expect_err("reaped");
    assert_eq!(err.status(), ResponseStatus::Timeout);
    assert_eq!(table.len(), 1);

    table.complete_response(ok_response(2));
    assert!(fresh.await_response().await.is_ok());
}

#[tokio::test]
async fn completion_is_exactly_once() {
    let table = PendingTable::new();
    let future = table.register(5, Duration::from_secs(5), None);

    // Local cancel wins the race; the entry is still in the table, so the
    // response path exercises the completed-flag guard rather than the map.
    future.cancel();
    assert!(table.complete_response(ok_response(5)));

    let err = future.await_response().await.expect_err("cancelled first");
    assert_eq!(err.status(), ResponseStatus::Timeout);
}

#[tokio::test]
async fn callback_is_dispatched_off_the_completion_site() {
    let table = PendingTable::new();
    let (tx, mut rx) = tokio::sync::mpsc::channel(1);
    let _future = table.register(
        9,
        Duration::from_secs(5),
        Some(Box::new(move |result| {
            let _ = tx.try_send(result.map(|r| r.status));
        })),
    );

    table.complete_response(ok_response(9));
    let delivered = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("callback ran")
        .expect("channel open");
    assert_eq!(delivered.expect("success"), ResponseStatus::Success);
}

#[tokio::test]
async fn discard_rolls_back_registration() {
    let table = PendingTable::new();
    let future = table.register(11, Duration::from_secs(5), None);
    table.discard(11);
    assert!(table.is_empty());
    assert!(!future.is_done());
    // The send path that discarded the entry reports the failure to the
    // caller directly; the rolled-back future is simply dropped.
    drop(future);
    assert!(!table.complete_response(ok_response(11)));
}

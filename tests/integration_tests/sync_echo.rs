// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::integration_tests::common::{fast_config, register_echo, start_server, started_client};

#[tokio::test]
async fn sync_echo_round_trip() {
    let (server, addr) = start_server(fast_config(), register_echo).await;
    let client = started_client(fast_config());

    let got: String = client
        .invoke_sync(addr.as_str(), "Ping", &"hi".to_string(), 1000)
        .await
        .expect("invoke");
    assert_eq!(got, "ok:hi");

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn sequential_invokes_reuse_the_pooled_connection() {
    let (server, addr) = start_server(fast_config(), register_echo).await;
    let client = started_client(fast_config());

    for i in 0..10 {
        let got: String = client
            .invoke_sync(addr.as_str(), "Ping", &format!("m{i}"), 1000)
            .await
            .expect("invoke");
        assert_eq!(got, format!("ok:m{i}"));
    }
    assert_eq!(
        client.connection_count(addr.as_str()).expect("count"),
        1,
        "one pooled connection serves sequential calls"
    );

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn url_target_and_connection_target_work() {
    let (server, addr) = start_server(fast_config(), register_echo).await;
    let client = started_client(fast_config());

    let url: bolt_rpc_rs::pool::url::Url = addr.parse().expect("url");
    let got: String = client
        .invoke_sync(&url, "Ping", &"via-url".to_string(), 1000)
        .await
        .expect("invoke via url");
    assert_eq!(got, "ok:via-url");

    let conn = client.connect(&url).await.expect("conn");
    let got: String = client
        .invoke_sync(&conn, "Ping", &"via-conn".to_string(), 1000)
        .await
        .expect("invoke via connection");
    assert_eq!(got, "ok:via-conn");

    client.shutdown();
    server.shutdown();
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use bolt_rpc_rs::{pool::url::Url, protocol::ProtocolCode};

#[test]
fn aliases_share_the_unique_key() {
    let plain: Url = "192.168.1.5:12200".parse().expect("parse");
    let tuned: Url = "192.168.1.5:12200?_CONNECTIONNUM=8&_IDLETIMEOUT=5000"
        .parse()
        .expect("parse");
    assert_eq!(plain.unique_key(), tuned.unique_key());
    assert_eq!(tuned.conn_num, Some(8));
    assert_eq!(tuned.idle_timeout, Some(Duration::from_millis(5000)));
}

#[test]
fn version_and_protocol_options() {
    let url: Url = "10.1.1.1:80?_PROTOCOL=2&_VERSION=2".parse().expect("parse");
    assert_eq!(url.protocol, ProtocolCode::V2);
    assert_eq!(url.version, 2);
    // Defaults when the options are absent.
    let url: Url = "10.1.1.1:80".parse().expect("parse");
    assert_eq!(url.protocol, ProtocolCode::V1);
    assert_eq!(url.version, 1);
    assert_eq!(url.conn_num, None);
    assert_eq!(url.connect_timeout, None);
}

#[test]
fn display_is_the_dial_form() {
    let url: Url = "127.0.0.1:9999?_CONNECTIONWARMUP=true".parse().expect("parse");
    assert_eq!(url.to_string(), "127.0.0.1:9999");
    assert!(url.warmup);
    assert_eq!(url.socket_addr(), "127.0.0.1:9999");
}

#[test]
fn empty_option_pairs_are_tolerated() {
    let url: Url = "127.0.0.1:80?".parse().expect("parse");
    assert_eq!(url.port, 80);
    let url: Url = "127.0.0.1:80?_CONNECTTIMEOUT=250&".parse().expect("parse");
    assert_eq!(url.connect_timeout, Some(Duration::from_millis(250)));
}

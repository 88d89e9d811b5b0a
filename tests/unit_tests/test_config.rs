// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use bolt_rpc_rs::cfg::{cli::resolve_config_path, config::Config};
use serial_test::serial;

#[test]
fn defaults_are_sane() {
    let mut cfg = Config::default();
    cfg.validate_and_normalize().expect("valid");
    assert_eq!(cfg.heartbeat.interval, Duration::from_secs(15));
    assert_eq!(cfg.heartbeat.server_idle, Duration::from_secs(90));
    assert_eq!(cfg.heartbeat.max_miss, 3);
    assert!(cfg.heartbeat.enabled);
    assert!(cfg.buffer.low_watermark <= cfg.buffer.high_watermark);
    assert_eq!(cfg.wire.protocol, 1);
    assert!(!cfg.switches.crc_check);
    assert!(!cfg.switches.reconnect);
}

#[test]
#[serial]
fn yaml_file_round_trip() {
    let path = resolve_config_path("tests/config.yaml").expect("resolve");
    let cfg = Config::load_from_file(path).expect("load");
    assert_eq!(cfg.heartbeat.interval, Duration::from_millis(200));
    assert_eq!(cfg.heartbeat.max_miss, 2);
    assert_eq!(cfg.connections.conn_num, 2);
    assert!(cfg.switches.crc_check);
}

#[test]
fn zero_max_miss_is_rejected() {
    let mut cfg = Config::default();
    cfg.heartbeat.max_miss = 0;
    assert!(cfg.validate_and_normalize().is_err());
}

#[test]
fn low_watermark_is_clamped_to_high() {
    let mut cfg = Config::default();
    cfg.buffer.low_watermark = 9999;
    cfg.buffer.high_watermark = 16;
    cfg.validate_and_normalize().expect("valid");
    assert_eq!(cfg.buffer.low_watermark, 16);
}

#[test]
#[serial]
fn env_keys_override_fields() {
    unsafe {
        std::env::set_var("bolt.tcp.heartbeat.interval", "2500");
        std::env::set_var("bolt.tcp.heartbeat.max_miss", "5");
        std::env::set_var("bolt.buffer.high_watermark", "64");
        std::env::set_var("bolt.crc.check", "true");
        std::env::set_var("bolt.conn.reconnect.switch", "on");
    }
    let cfg = Config::from_env().expect("from env");
    unsafe {
        std::env::remove_var("bolt.tcp.heartbeat.interval");
        std::env::remove_var("bolt.tcp.heartbeat.max_miss");
        std::env::remove_var("bolt.buffer.high_watermark");
        std::env::remove_var("bolt.crc.check");
        std::env::remove_var("bolt.conn.reconnect.switch");
    }
    assert_eq!(cfg.heartbeat.interval, Duration::from_millis(2500));
    assert_eq!(cfg.heartbeat.max_miss, 5);
    assert_eq!(cfg.buffer.high_watermark, 64);
    assert!(cfg.switches.crc_check);
    assert!(cfg.switches.reconnect);
}

#[test]
#[serial]
fn logger_initializes_from_yaml() {
    let path = resolve_config_path("tests/logger.yaml").expect("resolve");
    let guard = bolt_rpc_rs::cfg::logger::init_logger(
        path.to_str().expect("utf-8 path"),
    )
    .expect("logger init");
    tracing::info!(check = "logger-smoke", "logger initialized");
    drop(guard);
}

#[test]
#[serial]
fn unparsable_env_values_are_ignored() {
    unsafe {
        std::env::set_var("bolt.tcp.heartbeat.interval", "soon");
        std::env::set_var("bolt.crc.check", "maybe");
    }
    let cfg = Config::from_env().expect("from env");
    unsafe {
        std::env::remove_var("bolt.tcp.heartbeat.interval");
        std::env::remove_var("bolt.crc.check");
    }
    assert_eq!(cfg.heartbeat.interval, Duration::from_secs(15));
    assert!(!cfg.switches.crc_check);
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::protocol::{ProtocolCode, ProtocolManager};

/// Runtime configuration for clients and servers, grouped by concern.
/// Loadable from YAML; the `bolt.*` process keys override individual
/// fields from the environment at startup.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub wire: WireConfig,
    #[serde(default)]
    pub connections: ConnectionsConfig,
    #[serde(default)]
    pub switches: Switches,
}

/// Keep-alive and idle-detection knobs.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct HeartbeatConfig {
    /// Client-side idle interval before a ping is emitted.
    #[serde(rename = "IntervalMs", with = "serde_millis", default = "default_interval")]
    pub interval: Duration,
    /// Server-side read-idle window before the connection is closed.
    #[serde(
        rename = "ServerIdleMs",
        with = "serde_millis",
        default = "default_server_idle"
    )]
    pub server_idle: Duration,
    /// Consecutive failed pings tolerated before eviction.
    #[serde(rename = "MaxMiss", default = "default_max_miss")]
    pub max_miss: u32,
    /// Master switch for client-side pings.
    #[serde(rename = "Enabled", default = "default_true")]
    pub enabled: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            server_idle: default_server_idle(),
            max_miss: default_max_miss(),
            enabled: true,
        }
    }
}

/// Send-queue watermarks, counted in frames per connection.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct BufferConfig {
    #[serde(rename = "LowWatermark", default = "default_low_watermark")]
    pub low_watermark: usize,
    /// Bound of the per-connection send queue; a full queue refuses sends.
    #[serde(rename = "HighWatermark", default = "default_high_watermark")]
    pub high_watermark: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            low_watermark: default_low_watermark(),
            high_watermark: default_high_watermark(),
        }
    }
}

/// Framing defaults applied when an address does not override them.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct WireConfig {
    /// Protocol code byte, 1 or 2.
    #[serde(rename = "Protocol", default = "default_protocol")]
    pub protocol: u8,
    #[serde(rename = "MaxFrameLen", default = "default_max_frame")]
    pub max_frame_len: usize,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            max_frame_len: default_max_frame(),
        }
    }
}

/// Pooling and connect-path limits.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ConnectionsConfig {
    #[serde(
        rename = "ConnectTimeoutMs",
        with = "serde_millis",
        default = "default_connect_timeout"
    )]
    pub connect_timeout: Duration,
    /// Pool size target per address unless the URL overrides it.
    #[serde(rename = "ConnNum", default = "default_conn_num")]
    pub conn_num: usize,
    /// Period of the pool scanner and the pending-table reaper.
    #[serde(
        rename = "ScanIntervalMs",
        with = "serde_millis",
        default = "default_scan_interval"
    )]
    pub scan_interval: Duration,
}

impl Default for ConnectionsConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            conn_num: default_conn_num(),
            scan_interval: default_scan_interval(),
        }
    }
}

/// Feature switches mirroring the `bolt.*` process keys.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Switches {
    /// Enables the v2 CRC trailer on outbound frames.
    #[serde(rename = "CrcCheck", default)]
    pub crc_check: bool,
    /// Enables background reconnection of dropped addresses.
    #[serde(rename = "Reconnect", default)]
    pub reconnect: bool,
    /// Enables server-side connection management (address-target invokes).
    #[serde(rename = "ServerManageConnections", default)]
    pub server_manage: bool,
}

impl Config {
    /// Loads the configuration from YAML, applies `bolt.*` environment
    /// overrides, validates and returns the ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.apply_env_overrides();
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Defaults plus `bolt.*` environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Config::default();
        cfg.apply_env_overrides();
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_u64("bolt.tcp.heartbeat.interval") {
            self.heartbeat.interval = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("bolt.tcp.heartbeat.max_miss") {
            self.heartbeat.max_miss = v as u32;
        }
        if let Some(v) = env_u64("bolt.buffer.low_watermark") {
            self.buffer.low_watermark = v as usize;
        }
        if let Some(v) = env_u64("bolt.buffer.high_watermark") {
            self.buffer.high_watermark = v as usize;
        }
        if let Some(v) = env_bool("bolt.crc.check") {
            self.switches.crc_check = v;
        }
        if let Some(v) = env_bool("bolt.conn.reconnect.switch") {
            self.switches.reconnect = v;
        }
        if let Some(v) = env_bool("bolt.conn.manage.switch") {
            self.switches.server_manage = v;
        }
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(self.heartbeat.max_miss >= 1, "MaxMiss must be >= 1");
        ensure!(
            !self.heartbeat.interval.is_zero(),
            "heartbeat interval must be > 0"
        );
        ensure!(
            self.buffer.high_watermark >= 1,
            "HighWatermark must be >= 1"
        );
        if self.buffer.low_watermark > self.buffer.high_watermark {
            self.buffer.low_watermark = self.buffer.high_watermark;
        }
        ensure!(
            ProtocolManager::global().is_known(ProtocolCode(self.wire.protocol)),
            "Protocol must be a registered protocol code"
        );
        ensure!(self.connections.conn_num >= 1, "ConnNum must be >= 1");
        Ok(())
    }

    #[inline]
    pub fn protocol_code(&self) -> ProtocolCode {
        ProtocolCode(self.wire.protocol)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring unparsable {key}={raw}");
            None
        },
    }
}

fn env_bool(key: &str) -> Option<bool> {
    let raw = std::env::var(key).ok()?;
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!("ignoring unparsable {key}={raw}");
            None
        },
    }
}

fn default_interval() -> Duration {
    Duration::from_secs(15)
}
fn default_server_idle() -> Duration {
    Duration::from_secs(90)
}
fn default_max_miss() -> u32 {
    3
}
fn default_true() -> bool {
    true
}
fn default_low_watermark() -> usize {
    512
}
fn default_high_watermark() -> usize {
    1024
}
fn default_protocol() -> u8 {
    1
}
fn default_max_frame() -> usize {
    16 * 1024 * 1024
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(3)
}
fn default_conn_num() -> usize {
    1
}
fn default_scan_interval() -> Duration {
    Duration::from_secs(10)
}

/// Serde helpers for representing `Duration` as a number of milliseconds.
mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

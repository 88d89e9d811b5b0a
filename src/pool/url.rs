// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fmt, str::FromStr, time::Duration};

use tracing::debug;

use crate::{
    error::RemotingError,
    protocol::{ProtocolCode, ProtocolManager},
};

/// A parsed remote address: `ip:port[?key=value&…]`.
///
/// Options override process defaults for the connections built to this
/// address; everything left `None` falls back to [`crate::cfg::config::Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    pub ip: String,
    pub port: u16,
    pub connect_timeout: Option<Duration>,
    pub protocol: ProtocolCode,
    pub version: u8,
    pub conn_num: Option<usize>,
    /// Create the full pool synchronously on first use.
    pub warmup: bool,
    pub idle_timeout: Option<Duration>,
}

impl Url {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            connect_timeout: None,
            protocol: ProtocolCode::V1,
            version: 1,
            conn_num: None,
            warmup: false,
            idle_timeout: None,
        }
    }

    /// `ip:port` form used for dialing.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Connection-pool key; identical for every alias of the same endpoint.
    pub fn unique_key(&self) -> String {
        self.socket_addr()
    }
}

impl FromStr for Url {
    type Err = RemotingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |detail: &str| RemotingError::InvalidAddress {
            addr: s.to_owned(),
            detail: detail.to_owned(),
        };

        let (endpoint, query) = match s.split_once('?') {
            Some((e, q)) => (e, Some(q)),
            None => (s, None),
        };

        let (ip, port) = endpoint
            .rsplit_once(':')
            .ok_or_else(|| bad("expected ip:port"))?;
        if ip.is_empty() {
            return Err(bad("empty host"));
        }
        let port: u16 = port.parse().map_err(|_| bad("invalid port"))?;

        let mut url = Url::new(ip, port);

        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| bad("option without value"))?;
                match key {
                    "_CONNECTTIMEOUT" => {
                        let ms: u64 =
                            value.parse().map_err(|_| bad("invalid _CONNECTTIMEOUT"))?;
                        url.connect_timeout = Some(Duration::from_millis(ms));
                    },
                    "_PROTOCOL" => {
                        let code: u8 = value.parse().map_err(|_| bad("invalid _PROTOCOL"))?;
                        if !ProtocolManager::global().is_known(ProtocolCode(code)) {
                            return Err(bad("unsupported _PROTOCOL"));
                        }
                        url.protocol = ProtocolCode(code);
                    },
                    "_VERSION" => {
                        url.version = value.parse().map_err(|_| bad("invalid _VERSION"))?;
                    },
                    "_CONNECTIONNUM" => {
                        let n: usize =
                            value.parse().map_err(|_| bad("invalid _CONNECTIONNUM"))?;
                        if n == 0 {
                            return Err(bad("_CONNECTIONNUM must be >= 1"));
                        }
                        url.conn_num = Some(n);
                    },
                    "_CONNECTIONWARMUP" => {
                        url.warmup = match value {
                            "true" | "TRUE" => true,
                            "false" | "FALSE" => false,
                            _ => return Err(bad("invalid _CONNECTIONWARMUP")),
                        };
                    },
                    "_IDLETIMEOUT" => {
                        let ms: u64 =
                            value.parse().map_err(|_| bad("invalid _IDLETIMEOUT"))?;
                        url.idle_timeout = Some(Duration::from_millis(ms));
                    },
                    other => {
                        debug!("ignoring unknown address option `{other}`");
                    },
                }
            }
        }

        Ok(url)
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

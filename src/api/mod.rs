// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod client;
pub mod processor;
pub mod server;

use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};

use crate::{
    error::RemotingError,
    pool::url::Url,
    protocol::command::{RequestCommand, ResponseCommand},
    serialize::{SerializerRegistry, decode_payload, encode_payload},
    transport::connection::Connection,
};

/// Where an invoke goes: a raw address, a parsed [`Url`] or a connection
/// already in hand. Only the connection form is available on a server
/// without connection management.
pub enum InvokeTarget<'a> {
    Addr(&'a str),
    Url(&'a Url),
    Connection(&'a Arc<Connection>),
}

impl<'a> From<&'a str> for InvokeTarget<'a> {
    fn from(addr: &'a str) -> Self {
        InvokeTarget::Addr(addr)
    }
}

impl<'a> From<&'a Url> for InvokeTarget<'a> {
    fn from(url: &'a Url) -> Self {
        InvokeTarget::Url(url)
    }
}

impl<'a> From<&'a Arc<Connection>> for InvokeTarget<'a> {
    fn from(conn: &'a Arc<Connection>) -> Self {
        InvokeTarget::Connection(conn)
    }
}

/// Facade lifecycle: startup exactly once, shutdown is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Fresh,
    Running,
    Stopped,
}

pub(crate) fn build_request<T: Serialize>(
    serializers: &SerializerRegistry,
    codec: u8,
    class_name: &str,
    payload: &T,
    timeout_ms: u64,
    oneway: bool,
) -> Result<RequestCommand, RemotingError> {
    let content = encode_payload(serializers, codec, class_name, payload)?;
    let req = if oneway {
        RequestCommand::oneway(class_name, codec)
    } else {
        RequestCommand::new(class_name, codec, timeout_ms.min(u64::from(u32::MAX)) as u32)
    };
    Ok(req.with_content(content))
}

pub(crate) fn decode_typed<Resp: DeserializeOwned>(
    serializers: &SerializerRegistry,
    resp: &ResponseCommand,
) -> Result<Resp, RemotingError> {
    if !resp.status.is_success() {
        return Err(RemotingError::from_response(resp.status, resp.cause_text()));
    }
    decode_payload(serializers, resp.codec, &resp.class_name, &resp.content)
}

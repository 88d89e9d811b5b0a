// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Instant;

use bytes::Bytes;
use enum_dispatch::enum_dispatch;

use crate::protocol::status::ResponseStatus;

/// Default timeout armed on heartbeat pings.
pub const HEARTBEAT_TIMEOUT_MS: u32 = 1_000;

/// `type` byte on the wire.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Response = 0,
    Request = 1,
    Oneway = 2,
}

impl CommandKind {
    pub fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(CommandKind::Response),
            1 => Some(CommandKind::Request),
            2 => Some(CommandKind::Oneway),
            _ => None,
        }
    }

    #[inline]
    pub fn to_wire(self) -> u8 {
        self as u8
    }

    #[inline]
    pub fn expects_response(self) -> bool {
        matches!(self, CommandKind::Request)
    }
}

/// `cmdcode` field on the wire.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandCode {
    Heartbeat = 0,
    RpcRequest = 1,
    RpcResponse = 2,
}

impl CommandCode {
    pub fn from_wire(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(CommandCode::Heartbeat),
            1 => Some(CommandCode::RpcRequest),
            2 => Some(CommandCode::RpcResponse),
            _ => None,
        }
    }

    #[inline]
    pub fn to_wire(self) -> u16 {
        self as u16
    }
}

/// Common accessors over decoded commands.
#[enum_dispatch]
pub trait RemotingCommand {
    fn id(&self) -> u32;
    fn code(&self) -> CommandCode;
    fn kind(&self) -> CommandKind;
    fn codec(&self) -> u8;
}

/// A framed request or one-way message. Immutable once queued for send;
/// the connection stamps `id` right before encoding.
#[derive(Debug, Clone)]
pub struct RequestCommand {
    pub id: u32,
    pub code: CommandCode,
    pub kind: CommandKind,
    pub ver2: u8,
    pub codec: u8,
    pub timeout_ms: u32,
    pub class_name: String,
    pub header: Bytes,
    pub content: Bytes,
    /// Stamped by the receiver when the frame is decoded.
    pub arrive_at: Option<Instant>,
}

impl RequestCommand {
    pub fn new(class_name: impl Into<String>, codec: u8, timeout_ms: u32) -> Self {
        Self {
            id: 0,
            code: CommandCode::RpcRequest,
            kind: CommandKind::Request,
            ver2: 1,
            codec,
            timeout_ms,
            class_name: class_name.into(),
            header: Bytes::new(),
            content: Bytes::new(),
            arrive_at: None,
        }
    }

    /// One-way variant: no response expected, timeout is zero on the wire.
    pub fn oneway(class_name: impl Into<String>, codec: u8) -> Self {
        let mut req = Self::new(class_name, codec, 0);
        req.kind = CommandKind::Oneway;
        req
    }

    /// A heartbeat ping: empty envelope, short timeout.
    pub fn heartbeat() -> Self {
        let mut req = Self::new(String::new(), 0, HEARTBEAT_TIMEOUT_MS);
        req.code = CommandCode::Heartbeat;
        req
    }

    pub fn with_header(mut self, header: Bytes) -> Self {
        self.header = header;
        self
    }

    pub fn with_content(mut self, content: Bytes) -> Self {
        self.content = content;
        self
    }

    #[inline]
    pub fn is_heartbeat(&self) -> bool {
        self.code == CommandCode::Heartbeat
    }
}

impl RemotingCommand for RequestCommand {
    fn id(&self) -> u32 {
        self.id
    }

    fn code(&self) -> CommandCode {
        self.code
    }

    fn kind(&self) -> CommandKind {
        self.kind
    }

    fn codec(&self) -> u8 {
        self.codec
    }
}

/// A framed response. `cause` never travels on the wire; it carries the
/// local reason when a response is synthesized on error paths.
#[derive(Debug, Clone)]
pub struct ResponseCommand {
    pub id: u32,
    pub code: CommandCode,
    pub ver2: u8,
    pub codec: u8,
    pub status: ResponseStatus,
    pub class_name: String,
    pub header: Bytes,
    pub content: Bytes,
    pub cause: Option<String>,
}

impl ResponseCommand {
    pub fn success(id: u32, codec: u8, class_name: impl Into<String>, content: Bytes) -> Self {
        Self {
            id,
            code: CommandCode::RpcResponse,
            ver2: 1,
            codec,
            status: ResponseStatus::Success,
            class_name: class_name.into(),
            header: Bytes::new(),
            content,
            cause: None,
        }
    }

    /// A failure response; the cause message is carried as UTF-8 content so
    /// the caller side can surface it.
    pub fn failure(id: u32, codec: u8, status: ResponseStatus, cause: impl Into<String>) -> Self {
        let cause = cause.into();
        Self {
            id,
            code: CommandCode::RpcResponse,
            ver2: 1,
            codec,
            status,
            class_name: String::new(),
            header: Bytes::new(),
            content: Bytes::from(cause.clone().into_bytes()),
            cause: Some(cause),
        }
    }

    /// Inline answer to a heartbeat ping.
    pub fn heartbeat_ack(id: u32) -> Self {
        Self {
            id,
            code: CommandCode::Heartbeat,
            ver2: 1,
            codec: 0,
            status: ResponseStatus::Success,
            class_name: String::new(),
            header: Bytes::new(),
            content: Bytes::new(),
            cause: None,
        }
    }

    #[inline]
    pub fn is_heartbeat(&self) -> bool {
        self.code == CommandCode::Heartbeat
    }

    /// Cause text for failure statuses, decoded from the content envelope.
    pub fn cause_text(&self) -> String {
        if let Some(c) = &self.cause {
            return c.clone();
        }
        String::from_utf8_lossy(&self.content).into_owned()
    }
}

impl RemotingCommand for ResponseCommand {
    fn id(&self) -> u32 {
        self.id
    }

    fn code(&self) -> CommandCode {
        self.code
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Response
    }

    fn codec(&self) -> u8 {
        self.codec
    }
}

/// Any decoded frame at the RPC layer.
#[enum_dispatch(RemotingCommand)]
#[derive(Debug, Clone)]
pub enum Command {
    Request(RequestCommand),
    Response(ResponseCommand),
}

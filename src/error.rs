// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

use crate::protocol::status::ResponseStatus;

/// Unified error for every invoke-path failure.
///
/// Each variant maps onto a wire status via [`RemotingError::status`], so
/// callers can branch on the status while the variant keeps the local detail.
#[derive(Debug, Error)]
pub enum RemotingError {
    #[error("invoke {id} timed out after {timeout_ms} ms")]
    Timeout { id: u32, timeout_ms: u64 },

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The per-connection send queue is over the high watermark.
    #[error("send queue full ({capacity} frames)")]
    Overload { capacity: usize },

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("codec failure: {0}")]
    Codec(String),

    #[error("crc32 mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcCheck { expected: u32, actual: u32 },

    #[error("serialization failed for `{class_name}`: {detail}")]
    Serialization { class_name: String, detail: String },

    #[error("deserialization failed for `{class_name}`: {detail}")]
    Deserialization { class_name: String, detail: String },

    #[error("unknown serializer code {0}")]
    UnknownCodec(u8),

    #[error("no user processor registered for `{0}`")]
    NoProcessor(String),

    #[error("processor concurrency limit reached")]
    ThreadpoolBusy,

    /// The peer answered with a non-success status.
    #[error("remote error ({status:?}): {detail}")]
    Remote {
        status: ResponseStatus,
        detail: String,
    },

    #[error("invalid address `{addr}`: {detail}")]
    InvalidAddress { addr: String, detail: String },

    #[error("connect to {addr} failed: {detail}")]
    ConnectFailed { addr: String, detail: String },

    #[error("lifecycle violation: {0}")]
    Lifecycle(String),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

impl RemotingError {
    /// Wire status this error maps onto.
    pub fn status(&self) -> ResponseStatus {
        match self {
            RemotingError::Timeout { .. } => ResponseStatus::Timeout,
            RemotingError::ConnectionClosed(_) => ResponseStatus::ConnectionClosed,
            RemotingError::Overload { .. } | RemotingError::SendFailed(_) => {
                ResponseStatus::ClientSendError
            },
            RemotingError::Codec(_) | RemotingError::CrcCheck { .. } => {
                ResponseStatus::CodecException
            },
            RemotingError::Serialization { .. } => ResponseStatus::ServerSerialException,
            RemotingError::Deserialization { .. } | RemotingError::UnknownCodec(_) => {
                ResponseStatus::ServerDeserialException
            },
            RemotingError::NoProcessor(_) => ResponseStatus::NoProcessor,
            RemotingError::ThreadpoolBusy => ResponseStatus::ServerThreadpoolBusy,
            RemotingError::Remote { status, .. } => *status,
            RemotingError::InvalidAddress { .. }
            | RemotingError::ConnectFailed { .. }
            | RemotingError::Lifecycle(_) => ResponseStatus::Error,
            RemotingError::Io(_) => ResponseStatus::Error,
        }
    }

    /// Builds the error a caller sees for a non-success response frame.
    pub fn from_response(status: ResponseStatus, detail: String) -> Self {
        match status {
            ResponseStatus::Timeout => RemotingError::Timeout { id: 0, timeout_ms: 0 },
            ResponseStatus::ConnectionClosed => RemotingError::ConnectionClosed(detail),
            _ => RemotingError::Remote { status, detail },
        }
    }
}

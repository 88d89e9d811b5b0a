// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Wire status carried by response frames (u16, big-endian).
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseStatus {
    Success = 0,
    Error = 1,
    /// A user processor returned an error.
    ServerException = 2,
    Unknown = 3,
    ServerThreadpoolBusy = 4,
    ErrorComm = 5,
    NoProcessor = 6,
    Timeout = 7,
    ClientSendError = 8,
    CodecException = 9,
    ConnectionClosed = 10,
    ServerSerialException = 11,
    ServerDeserialException = 12,
}

impl ResponseStatus {
    /// Decodes a wire value. Values the receiver cannot classify collapse
    /// into [`ResponseStatus::Unknown`] instead of failing the frame.
    pub fn from_wire(raw: u16) -> Self {
        match raw {
            0 => ResponseStatus::Success,
            1 => ResponseStatus::Error,
            2 => ResponseStatus::ServerException,
            3 => ResponseStatus::Unknown,
            4 => ResponseStatus::ServerThreadpoolBusy,
            5 => ResponseStatus::ErrorComm,
            6 => ResponseStatus::NoProcessor,
            7 => ResponseStatus::Timeout,
            8 => ResponseStatus::ClientSendError,
            9 => ResponseStatus::CodecException,
            10 => ResponseStatus::ConnectionClosed,
            11 => ResponseStatus::ServerSerialException,
            12 => ResponseStatus::ServerDeserialException,
            _ => ResponseStatus::Unknown,
        }
    }

    #[inline]
    pub fn to_wire(self) -> u16 {
        self as u16
    }

    #[inline]
    pub fn is_success(self) -> bool {
        matches!(self, ResponseStatus::Success)
    }
}

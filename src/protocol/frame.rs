// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bitflags::bitflags;
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U16, U32,
};

/// Protocol byte of the original framing.
pub const PROTO_V1: u8 = 0x01;
/// Protocol byte of the extended framing (switch byte + optional CRC trailer).
pub const PROTO_V2: u8 = 0x02;

/// CRC trailer length when the switch enables it.
pub const CRC_LEN: usize = 4;

bitflags! {
    /// The v2 switch byte that follows `proto`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ProtocolSwitch: u8 {
        /// Trailing CRC32 over the frame is present.
        const CRC = 0b0000_0001;
    }
}

/// Fixed prefix of a request/oneway frame, everything after the proto
/// (and, for v2, switch) byte. All fields are big-endian and the struct
/// has alignment 1, so it maps straight onto the wire.
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RequestPrefix {
    pub kind: u8,                    // 0
    pub cmd_code: U16<BigEndian>,    // 1..3
    pub ver2: u8,                    // 3
    pub request_id: U32<BigEndian>,  // 4..8
    pub codec: u8,                   // 8
    pub timeout_ms: U32<BigEndian>,  // 9..13
    pub class_len: U16<BigEndian>,   // 13..15
    pub header_len: U16<BigEndian>,  // 15..17
    pub content_len: U32<BigEndian>, // 17..21
}

/// Fixed prefix of a response frame. Identical to [`RequestPrefix`] except
/// the 4-byte timeout is a 2-byte status.
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ResponsePrefix {
    pub kind: u8,                    // 0
    pub cmd_code: U16<BigEndian>,    // 1..3
    pub ver2: u8,                    // 3
    pub request_id: U32<BigEndian>,  // 4..8
    pub codec: u8,                   // 8
    pub status: U16<BigEndian>,      // 9..11
    pub class_len: U16<BigEndian>,   // 11..13
    pub header_len: U16<BigEndian>,  // 13..15
    pub content_len: U32<BigEndian>, // 15..19
}

pub const REQUEST_PREFIX_LEN: usize = size_of::<RequestPrefix>();
pub const RESPONSE_PREFIX_LEN: usize = size_of::<ResponsePrefix>();

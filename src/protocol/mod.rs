// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod codec;
pub mod command;
pub mod frame;
pub mod status;

use std::collections::HashMap;

use once_cell::sync::OnceCell;

use crate::protocol::frame::{PROTO_V1, PROTO_V2};

/// Protocol code byte identifying a framing on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolCode(pub u8);

impl ProtocolCode {
    pub const V1: Self = Self(PROTO_V1);
    pub const V2: Self = Self(PROTO_V2);
}

/// Static description of one supported framing. The codec sizes and
/// capability-checks frames through this, never through literal protocol
/// comparisons.
#[derive(Debug)]
pub struct Protocol {
    pub code: ProtocolCode,
    pub name: &'static str,
    /// A switch byte follows `proto` on the wire.
    pub switch_byte: bool,
    pub supports_crc: bool,
}

impl Protocol {
    /// Bytes preceding the fixed prefix: the proto byte plus the optional
    /// switch byte.
    #[inline]
    pub fn prefix_offset(&self) -> usize {
        1 + usize::from(self.switch_byte)
    }
}

static PROTOCOLS_TABLE: [Protocol; 2] = [
    Protocol {
        code: ProtocolCode::V1,
        name: "bolt-v1",
        switch_byte: false,
        supports_crc: false,
    },
    Protocol {
        code: ProtocolCode::V2,
        name: "bolt-v2",
        switch_byte: true,
        supports_crc: true,
    },
];

/// Fallback framing for unregistered codes on the outbound path; inbound
/// frames with an unregistered code are rejected instead.
static DEFAULT_PROTOCOL: &Protocol = &PROTOCOLS_TABLE[0];

/// Process-wide protocol table, populated once from the static list and
/// immutable afterwards. Inbound routing and the frame codec resolve every
/// protocol capability here.
#[derive(Debug)]
pub struct ProtocolManager {
    table: HashMap<u8, &'static Protocol>,
}

static PROTOCOLS: OnceCell<ProtocolManager> = OnceCell::new();

impl ProtocolManager {
    /// The global table; initialized on first use.
    pub fn global() -> &'static ProtocolManager {
        PROTOCOLS.get_or_init(|| {
            let mut table = HashMap::new();
            for proto in &PROTOCOLS_TABLE {
                table.insert(proto.code.0, proto);
            }
            ProtocolManager { table }
        })
    }

    pub fn get(&self, code: ProtocolCode) -> Option<&'static Protocol> {
        self.table.get(&code.0).copied()
    }

    /// Descriptor for `code`, or the default framing when unregistered;
    /// used where a total answer is needed (encode side).
    pub fn get_or_default(&self, code: ProtocolCode) -> &'static Protocol {
        self.get(code).unwrap_or(DEFAULT_PROTOCOL)
    }

    pub fn is_known(&self, code: ProtocolCode) -> bool {
        self.table.contains_key(&code.0)
    }
}

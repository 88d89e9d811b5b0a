// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use crc::{CRC_32_ISO_HDLC, Crc};
use zerocopy::{FromBytes as ZFromBytes, IntoBytes, U16, U32};

use crate::{
    error::RemotingError,
    protocol::{
        Protocol, ProtocolCode, ProtocolManager,
        command::{Command, CommandCode, CommandKind, RequestCommand, ResponseCommand},
        frame::{
            CRC_LEN, ProtocolSwitch, REQUEST_PREFIX_LEN, RESPONSE_PREFIX_LEN,
            RequestPrefix, ResponsePrefix,
        },
        status::ResponseStatus,
    },
};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Upper bound on a single frame; anything larger tears the stream.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// One frame rejected at its boundary; the stream stays usable.
#[derive(Debug)]
pub struct FrameError {
    pub id: u32,
    pub kind: CommandKind,
    pub cause: RemotingError,
}

/// Outcome of one decoder pull.
#[derive(Debug)]
pub enum Decoded {
    /// Not enough buffered bytes for a complete frame.
    Incomplete,
    Frame(Command),
    /// A complete frame was consumed but is unusable (CRC, bad sections).
    Rejected(FrameError),
}

/// Streaming frame codec. Decoding is self-describing via the proto byte;
/// encoding follows the configured protocol and CRC switch. Capabilities
/// (switch byte, CRC support, prefix offset) are resolved through the
/// global [`ProtocolManager`], never hardcoded here.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    protocol: &'static Protocol,
    crc_enabled: bool,
    max_frame_len: usize,
}

impl FrameCodec {
    pub fn new(proto: ProtocolCode, crc_enabled: bool) -> Self {
        let protocol = ProtocolManager::global().get_or_default(proto);
        Self {
            protocol,
            crc_enabled: crc_enabled && protocol.supports_crc,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn with_max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }

    #[inline]
    pub fn proto(&self) -> ProtocolCode {
        self.protocol.code
    }

    pub fn encode(&self, cmd: &Command, dst: &mut BytesMut) -> Result<(), RemotingError> {
        match cmd {
            Command::Request(req) => self.encode_request(req, dst),
            Command::Response(resp) => self.encode_response(resp, dst),
        }
    }

    fn encode_request(
        &self,
        req: &RequestCommand,
        dst: &mut BytesMut,
    ) -> Result<(), RemotingError> {
        let class = check_class_name(&req.class_name)?;
        let header_len = section_u16(req.header.len(), "header")?;
        let content_len = section_u32(req.content.len(), "content")?;

        let start = dst.len();
        self.put_proto(dst);
        let prefix = RequestPrefix {
            kind: req.kind.to_wire(),
            cmd_code: U16::new(req.code.to_wire()),
            ver2: req.ver2,
            request_id: U32::new(req.id),
            codec: req.codec,
            timeout_ms: U32::new(req.timeout_ms),
            class_len: U16::new(class.len() as u16),
            header_len: U16::new(header_len),
            content_len: U32::new(content_len),
        };
        dst.put_slice(prefix.as_bytes());
        dst.put_slice(class);
        dst.put_slice(&req.header);
        dst.put_slice(&req.content);
        self.put_crc(start, dst);
        Ok(())
    }

    fn encode_response(
        &self,
        resp: &ResponseCommand,
        dst: &mut BytesMut,
    ) -> Result<(), RemotingError> {
        let class = check_class_name(&resp.class_name)?;
        let header_len = section_u16(resp.header.len(), "header")?;
        let content_len = section_u32(resp.content.len(), "content")?;

        let start = dst.len();
        self.put_proto(dst);
        let prefix = ResponsePrefix {
            kind: CommandKind::Response.to_wire(),
            cmd_code: U16::new(resp.code.to_wire()),
            ver2: resp.ver2,
            request_id: U32::new(resp.id),
            codec: resp.codec,
            status: U16::new(resp.status.to_wire()),
            class_len: U16::new(class.len() as u16),
            header_len: U16::new(header_len),
            content_len: U32::new(content_len),
        };
        dst.put_slice(prefix.as_bytes());
        dst.put_slice(class);
        dst.put_slice(&resp.header);
        dst.put_slice(&resp.content);
        self.put_crc(start, dst);
        Ok(())
    }

    fn put_proto(&self, dst: &mut BytesMut) {
        dst.put_u8(self.protocol.code.0);
        if self.protocol.switch_byte {
            let switch = if self.crc_enabled {
                ProtocolSwitch::CRC
            } else {
                ProtocolSwitch::empty()
            };
            dst.put_u8(switch.bits());
        }
    }

    fn put_crc(&self, start: usize, dst: &mut BytesMut) {
        if self.crc_enabled {
            let sum = CRC32.checksum(&dst[start..]);
            dst.put_u32(sum);
        }
    }

    /// Pulls at most one complete frame out of `src`, retaining the tail.
    ///
    /// `Err` means the stream can no longer be framed and the connection
    /// must go down; `Decoded::Rejected` consumes exactly one bad frame.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Decoded, RemotingError> {
        if src.is_empty() {
            return Ok(Decoded::Incomplete);
        }

        let protocol = ProtocolManager::global()
            .get(ProtocolCode(src[0]))
            .ok_or_else(|| {
                RemotingError::Codec(format!("unknown protocol byte {:#04x}", src[0]))
            })?;
        let prefix_off = protocol.prefix_offset();
        // switch byte (when the framing has one) + kind byte must be
        // buffered before sizing
        if src.len() < prefix_off + 1 {
            return Ok(Decoded::Incomplete);
        }
        let switch = if protocol.switch_byte {
            ProtocolSwitch::from_bits_truncate(src[1])
        } else {
            ProtocolSwitch::empty()
        };

        let kind = CommandKind::from_wire(src[prefix_off]).ok_or_else(|| {
            RemotingError::Codec(format!("unknown command type {:#04x}", src[prefix_off]))
        })?;

        let prefix_len = match kind {
            CommandKind::Response => RESPONSE_PREFIX_LEN,
            _ => REQUEST_PREFIX_LEN,
        };
        if src.len() < prefix_off + prefix_len {
            return Ok(Decoded::Incomplete);
        }

        let prefix_bytes = &src[prefix_off..prefix_off + prefix_len];
        let (id, sections) = match kind {
            CommandKind::Response => {
                let p = ResponsePrefix::ref_from_bytes(prefix_bytes)
                    .map_err(|e| RemotingError::Codec(format!("bad prefix: {e}")))?;
                (p.request_id.get(), SectionLens::of_response(p))
            },
            _ => {
                let p = RequestPrefix::ref_from_bytes(prefix_bytes)
                    .map_err(|e| RemotingError::Codec(format!("bad prefix: {e}")))?;
                (p.request_id.get(), SectionLens::of_request(p))
            },
        };

        let crc_len = if switch.contains(ProtocolSwitch::CRC) {
            CRC_LEN
        } else {
            0
        };
        let total = prefix_off + prefix_len + sections.total() + crc_len;
        if total > self.max_frame_len {
            return Err(RemotingError::Codec(format!(
                "frame of {total} bytes exceeds limit of {}",
                self.max_frame_len
            )));
        }
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(Decoded::Incomplete);
        }

        let frame = src.split_to(total).freeze();

        if crc_len > 0 {
            let body = &frame[..total - CRC_LEN];
            let expected = u32::from_be_bytes(
                frame[total - CRC_LEN..]
                    .try_into()
                    .map_err(|_| RemotingError::Codec("truncated crc".into()))?,
            );
            let actual = CRC32.checksum(body);
            if expected != actual {
                return Ok(Decoded::Rejected(FrameError {
                    id,
                    kind,
                    cause: RemotingError::CrcCheck { expected, actual },
                }));
            }
        }

        match self.assemble(kind, &frame, prefix_off, prefix_len, &sections) {
            Ok(cmd) => Ok(Decoded::Frame(cmd)),
            Err(cause) => Ok(Decoded::Rejected(FrameError { id, kind, cause })),
        }
    }

    fn assemble(
        &self,
        kind: CommandKind,
        frame: &Bytes,
        prefix_off: usize,
        prefix_len: usize,
        sections: &SectionLens,
    ) -> Result<Command, RemotingError> {
        let class_at = prefix_off + prefix_len;
        let header_at = class_at + sections.class;
        let content_at = header_at + sections.header;

        let class_name = std::str::from_utf8(&frame[class_at..header_at])
            .map_err(|_| RemotingError::Codec("class name is not valid utf-8".into()))?
            .to_owned();
        let header = frame.slice(header_at..content_at);
        let content = frame.slice(content_at..content_at + sections.content);

        match kind {
            CommandKind::Response => {
                let p = ResponsePrefix::ref_from_bytes(
                    &frame[prefix_off..prefix_off + prefix_len],
                )
                .map_err(|e| RemotingError::Codec(format!("bad prefix: {e}")))?;
                let code = CommandCode::from_wire(p.cmd_code.get()).ok_or_else(|| {
                    RemotingError::Codec(format!("unknown cmdcode {}", p.cmd_code.get()))
                })?;
                Ok(Command::Response(ResponseCommand {
                    id: p.request_id.get(),
                    code,
                    ver2: p.ver2,
                    codec: p.codec,
                    status: ResponseStatus::from_wire(p.status.get()),
                    class_name,
                    header,
                    content,
                    cause: None,
                }))
            },
            _ => {
                let p = RequestPrefix::ref_from_bytes(
                    &frame[prefix_off..prefix_off + prefix_len],
                )
                .map_err(|e| RemotingError::Codec(format!("bad prefix: {e}")))?;
                let code = CommandCode::from_wire(p.cmd_code.get()).ok_or_else(|| {
                    RemotingError::Codec(format!("unknown cmdcode {}", p.cmd_code.get()))
                })?;
                Ok(Command::Request(RequestCommand {
                    id: p.request_id.get(),
                    code,
                    kind,
                    ver2: p.ver2,
                    codec: p.codec,
                    timeout_ms: p.timeout_ms.get(),
                    class_name,
                    header,
                    content,
                    arrive_at: Some(Instant::now()),
                }))
            },
        }
    }
}

#[derive(Debug)]
struct SectionLens {
    class: usize,
    header: usize,
    content: usize,
}

impl SectionLens {
    fn of_request(p: &RequestPrefix) -> Self {
        Self {
            class: p.class_len.get() as usize,
            header: p.header_len.get() as usize,
            content: p.content_len.get() as usize,
        }
    }

    fn of_response(p: &ResponsePrefix) -> Self {
        Self {
            class: p.class_len.get() as usize,
            header: p.header_len.get() as usize,
            content: p.content_len.get() as usize,
        }
    }

    fn total(&self) -> usize {
        self.class + self.header + self.content
    }
}

fn check_class_name(name: &str) -> Result<&[u8], RemotingError> {
    if !name.is_ascii() {
        return Err(RemotingError::Codec(format!(
            "class name `{name}` is not ascii"
        )));
    }
    if name.len() > u16::MAX as usize {
        return Err(RemotingError::Codec("class name too long".into()));
    }
    Ok(name.as_bytes())
}

fn section_u16(len: usize, what: &str) -> Result<u16, RemotingError> {
    u16::try_from(len)
        .map_err(|_| RemotingError::Codec(format!("{what} section of {len} bytes too large")))
}

fn section_u32(len: usize, what: &str) -> Result<u32, RemotingError> {
    u32::try_from(len)
        .map_err(|_| RemotingError::Codec(format!("{what} section of {len} bytes too large")))
}

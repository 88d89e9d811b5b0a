// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bolt_rpc_rs::{
    error::RemotingError,
    protocol::{
        ProtocolCode,
        codec::{Decoded, FrameCodec},
        command::{Command, CommandCode, CommandKind, RequestCommand, ResponseCommand},
        status::ResponseStatus,
    },
};
use bytes::{Bytes, BytesMut};
use hex_literal::hex;

fn v1_codec() -> FrameCodec {
    FrameCodec::new(ProtocolCode::V1, false)
}

fn sample_request() -> RequestCommand {
    let mut req = RequestCommand::new("Ping", 1, 1000)
        .with_content(Bytes::from_static(b"\"hi\""));
    req.id = 42;
    req
}

fn decode_frame(codec: &FrameCodec, buf: &mut BytesMut) -> Command {
    match codec.decode(buf).expect("stream intact") {
        Decoded::Frame(cmd) => cmd,
        other => panic!("expected a frame, got {other:?}"),
    }
}

#[test]
fn request_encoding_matches_wire_layout() {
    let mut out = BytesMut::new();
    v1_codec()
        .encode(&Command::Request(sample_request()), &mut out)
        .expect("encode");

    let expected = hex!(
        "01"        // proto v1
        "01"        // type = request
        "0001"      // cmdcode = rpc request
        "01"        // ver2
        "0000002a"  // request id 42
        "01"        // codec
        "000003e8"  // timeout 1000 ms
        "0004"      // class len
        "0000"      // header len
        "00000004"  // content len
        "50696e67"  // "Ping"
        "22686922"  // "\"hi\""
    );
    assert_eq!(&out[..], &expected[..]);
}

#[test]
fn response_encoding_matches_wire_layout() {
    let resp = ResponseCommand::success(42, 1, "Pong", Bytes::from_static(b"\"ok\""));
    let mut out = BytesMut::new();
    v1_codec()
        .encode(&Command::Response(resp), &mut out)
        .expect("encode");

    let expected = hex!(
        "01"        // proto v1
        "00"        // type = response
        "0002"      // cmdcode = rpc response
        "01"        // ver2
        "0000002a"  // request id 42
        "01"        // codec
        "0000"      // status success
        "0004"      // class len
        "0000"      // header len
        "00000004"  // content len
        "506f6e67"  // "Pong"
        "226f6b22"  // "\"ok\""
    );
    assert_eq!(&out[..], &expected[..]);
}

#[test]
fn request_round_trip() {
    let codec = v1_codec();
    let mut buf = BytesMut::new();
    codec
        .encode(&Command::Request(sample_request()), &mut buf)
        .expect("encode");

    match decode_frame(&codec, &mut buf) {
        Command::Request(req) => {
            assert_eq!(req.id, 42);
            assert_eq!(req.code, CommandCode::RpcRequest);
            assert_eq!(req.kind, CommandKind::Request);
            assert_eq!(req.codec, 1);
            assert_eq!(req.timeout_ms, 1000);
            assert_eq!(req.class_name, "Ping");
            assert_eq!(&req.content[..], b"\"hi\"");
            assert!(req.header.is_empty());
            assert!(req.arrive_at.is_some());
        },
        other => panic!("expected request, got {other:?}"),
    }
    assert!(buf.is_empty());
}

#[test]
fn response_round_trip() {
    let codec = v1_codec();
    let resp = ResponseCommand::failure(7, 1, ResponseStatus::NoProcessor, "no processor");
    let mut buf = BytesMut::new();
    codec
        .encode(&Command::Response(resp), &mut buf)
        .expect("encode");

    match decode_frame(&codec, &mut buf) {
        Command::Response(resp) => {
            assert_eq!(resp.id, 7);
            assert_eq!(resp.status, ResponseStatus::NoProcessor);
            assert_eq!(resp.cause_text(), "no processor");
        },
        other => panic!("expected response, got {other:?}"),
    }
}

#[test]
fn oneway_type_byte_on_wire() {
    let codec = v1_codec();
    let mut req = RequestCommand::oneway("Fire", 1);
    req.id = 3;
    let mut buf = BytesMut::new();
    codec.encode(&Command::Request(req), &mut buf).expect("encode");
    assert_eq!(buf[1], 2, "oneway type byte");

    match decode_frame(&codec, &mut buf) {
        Command::Request(req) => {
            assert_eq!(req.kind, CommandKind::Oneway);
            assert_eq!(req.timeout_ms, 0);
        },
        other => panic!("expected request, got {other:?}"),
    }
}

#[test]
fn heartbeat_round_trip_has_empty_envelope() {
    let codec = v1_codec();
    let mut ping = RequestCommand::heartbeat();
    ping.id = 9;
    let mut buf = BytesMut::new();
    codec.encode(&Command::Request(ping), &mut buf).expect("encode");

    match decode_frame(&codec, &mut buf) {
        Command::Request(req) => {
            assert!(req.is_heartbeat());
            assert!(req.class_name.is_empty());
            assert!(req.content.is_empty());
        },
        other => panic!("expected request, got {other:?}"),
    }

    let mut buf = BytesMut::new();
    codec
        .encode(&Command::Response(ResponseCommand::heartbeat_ack(9)), &mut buf)
        .expect("encode");
    match decode_frame(&codec, &mut buf) {
        Command::Response(resp) => {
            assert!(resp.is_heartbeat());
            assert_eq!(resp.status, ResponseStatus::Success);
        },
        other => panic!("expected response, got {other:?}"),
    }
}

#[test]
fn streaming_decoder_waits_for_full_frame() {
    let codec = v1_codec();
    let mut full = BytesMut::new();
    codec
        .encode(&Command::Request(sample_request()), &mut full)
        .expect("encode");

    let mut buf = BytesMut::new();
    for (i, byte) in full.iter().enumerate() {
        buf.extend_from_slice(&[*byte]);
        if i + 1 < full.len() {
            assert!(
                matches!(codec.decode(&mut buf).expect("stream intact"), Decoded::Incomplete),
                "decoder must wait at byte {i}"
            );
        }
    }
    assert!(matches!(
        codec.decode(&mut buf).expect("stream intact"),
        Decoded::Frame(_)
    ));
    assert!(buf.is_empty());
}

#[test]
fn two_frames_in_one_buffer() {
    let codec = v1_codec();
    let mut buf = BytesMut::new();
    codec
        .encode(&Command::Request(sample_request()), &mut buf)
        .expect("encode");
    let mut second = RequestCommand::new("Pong", 1, 500);
    second.id = 43;
    codec
        .encode(&Command::Request(second), &mut buf)
        .expect("encode");

    let first = decode_frame(&codec, &mut buf);
    let second = decode_frame(&codec, &mut buf);
    match (first, second) {
        (Command::Request(a), Command::Request(b)) => {
            assert_eq!(a.id, 42);
            assert_eq!(b.id, 43);
        },
        other => panic!("expected two requests, got {other:?}"),
    }
    assert!(buf.is_empty());
}

#[test]
fn v2_crc_round_trip() {
    let codec = FrameCodec::new(ProtocolCode::V2, true);
    let mut buf = BytesMut::new();
    codec
        .encode(&Command::Request(sample_request()), &mut buf)
        .expect("encode");
    assert_eq!(buf[0], 0x02);
    assert_eq!(buf[1] & 0x01, 0x01, "crc switch bit");

    match decode_frame(&codec, &mut buf) {
        Command::Request(req) => assert_eq!(req.class_name, "Ping"),
        other => panic!("expected request, got {other:?}"),
    }
}

#[test]
fn v2_crc_mismatch_rejects_single_frame_without_tearing_stream() {
    let codec = FrameCodec::new(ProtocolCode::V2, true);
    let mut buf = BytesMut::new();
    codec
        .encode(&Command::Request(sample_request()), &mut buf)
        .expect("encode");
    let corrupt_at = buf.len() - 6; // inside the content section
    buf[corrupt_at] ^= 0xff;

    let mut good = RequestCommand::new("After", 1, 100);
    good.id = 99;
    codec
        .encode(&Command::Request(good), &mut buf)
        .expect("encode");

    match codec.decode(&mut buf).expect("stream intact") {
        Decoded::Rejected(fe) => {
            assert_eq!(fe.id, 42);
            assert_eq!(fe.kind, CommandKind::Request);
            assert!(matches!(fe.cause, RemotingError::CrcCheck { .. }));
        },
        other => panic!("expected rejection, got {other:?}"),
    }

    // The stream keeps framing: the next frame decodes normally.
    match decode_frame(&codec, &mut buf) {
        Command::Request(req) => assert_eq!(req.id, 99),
        other => panic!("expected request, got {other:?}"),
    }
}

#[test]
fn v1_never_writes_a_crc_trailer() {
    let with_crc = FrameCodec::new(ProtocolCode::V1, true);
    let plain = v1_codec();
    let mut a = BytesMut::new();
    let mut b = BytesMut::new();
    with_crc
        .encode(&Command::Request(sample_request()), &mut a)
        .expect("encode");
    plain
        .encode(&Command::Request(sample_request()), &mut b)
        .expect("encode");
    assert_eq!(&a[..], &b[..]);
}

#[test]
fn unknown_protocol_byte_tears_the_stream() {
    let codec = v1_codec();
    let mut buf = BytesMut::from(&hex!("7f0102030405060708")[..]);
    assert!(codec.decode(&mut buf).is_err());
}

#[test]
fn unknown_cmdcode_rejects_frame() {
    let codec = v1_codec();
    let mut buf = BytesMut::new();
    codec
        .encode(&Command::Request(sample_request()), &mut buf)
        .expect("encode");
    // cmdcode lives right after proto + type
    buf[2] = 0x00;
    buf[3] = 0x09;

    match codec.decode(&mut buf).expect("stream intact") {
        Decoded::Rejected(fe) => {
            assert_eq!(fe.id, 42);
            assert!(matches!(fe.cause, RemotingError::Codec(_)));
        },
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(buf.is_empty());
}

#[test]
fn oversized_frame_is_fatal() {
    let codec = v1_codec().with_max_frame_len(64);
    let big = RequestCommand::new("Big", 1, 100)
        .with_content(Bytes::from(vec![0u8; 1024]));
    let mut encoded = BytesMut::new();
    v1_codec()
        .encode(&Command::Request(big), &mut encoded)
        .expect("encode");
    assert!(codec.decode(&mut encoded).is_err());
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use bolt_rpc_rs::{
    error::RemotingError,
    protocol::status::ResponseStatus,
    serialize::{
        JSON_CODEC, Serializer, SerializerRegistry, decode_payload, encode_payload,
    },
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Ping {
    msg: String,
    seq: u32,
}

#[test]
fn typed_round_trip_through_json() {
    let registry = SerializerRegistry::new();
    let ping = Ping {
        msg: "hello".into(),
        seq: 7,
    };
    let bytes = encode_payload(&registry, JSON_CODEC, "Ping", &ping).expect("encode");
    let back: Ping = decode_payload(&registry, JSON_CODEC, "Ping", &bytes).expect("decode");
    assert_eq!(back, ping);
}

#[test]
fn unknown_codec_on_receive_is_a_deserial_error() {
    let registry = SerializerRegistry::new();
    let err = decode_payload::<Ping>(&registry, 42, "Ping", b"{}").expect_err("unknown");
    assert!(matches!(err, RemotingError::UnknownCodec(42)));
    assert_eq!(err.status(), ResponseStatus::ServerDeserialException);
}

#[test]
fn unknown_codec_on_send_fails_the_caller() {
    let registry = SerializerRegistry::new();
    let ping = Ping {
        msg: "x".into(),
        seq: 1,
    };
    let err = encode_payload(&registry, 42, "Ping", &ping).expect_err("unknown");
    assert_eq!(err.status(), ResponseStatus::ClientSendError);
}

#[test]
fn malformed_content_is_a_deserialization_error() {
    let registry = SerializerRegistry::new();
    let err =
        decode_payload::<Ping>(&registry, JSON_CODEC, "Ping", b"not-json").expect_err("bad");
    assert_eq!(err.status(), ResponseStatus::ServerDeserialException);
}

struct UpperJson;

impl Serializer for UpperJson {
    fn code(&self) -> u8 {
        9
    }

    fn name(&self) -> &'static str {
        "upper-json"
    }

    fn encode(&self, value: &Value) -> Result<Bytes, RemotingError> {
        let raw = serde_json::to_vec(value).map_err(|e| RemotingError::Serialization {
            class_name: String::new(),
            detail: e.to_string(),
        })?;
        Ok(Bytes::from(raw.to_ascii_uppercase()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, RemotingError> {
        serde_json::from_slice(&bytes.to_ascii_lowercase()).map_err(|e| {
            RemotingError::Deserialization {
                class_name: String::new(),
                detail: e.to_string(),
            }
        })
    }
}

#[test]
fn custom_serializer_registers_under_its_code() {
    let registry = SerializerRegistry::new();
    registry.register(Arc::new(UpperJson)).expect("register");
    let got = registry.get(9).expect("present");
    assert_eq!(got.name(), "upper-json");
}

#[test]
fn duplicate_codec_registration_is_rejected() {
    let registry = SerializerRegistry::new();
    registry.register(Arc::new(UpperJson)).expect("first");
    let err = registry.register(Arc::new(UpperJson)).expect_err("second");
    assert!(matches!(err, RemotingError::Lifecycle(_)));
}

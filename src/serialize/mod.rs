// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::error::RemotingError;

/// Codec byte of the built-in JSON serializer, the per-client default.
pub const JSON_CODEC: u8 = 1;

/// Payload serializer plugged in per codec byte.
///
/// Payloads cross this boundary as [`serde_json::Value`]; the typed layer on
/// top ([`encode_payload`]/[`decode_payload`]) never consults the native type
/// graph, only this registry and the class-name keyed processor table.
pub trait Serializer: Send + Sync {
    fn code(&self) -> u8;
    fn name(&self) -> &'static str;
    fn encode(&self, value: &Value) -> Result<Bytes, RemotingError>;
    fn decode(&self, bytes: &[u8]) -> Result<Value, RemotingError>;
}

/// JSON payload serializer (codec byte 1).
#[derive(Debug, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn code(&self) -> u8 {
        JSON_CODEC
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &Value) -> Result<Bytes, RemotingError> {
        let raw = serde_json::to_vec(value).map_err(|e| RemotingError::Serialization {
            class_name: String::new(),
            detail: e.to_string(),
        })?;
        Ok(Bytes::from(raw))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, RemotingError> {
        serde_json::from_slice(bytes).map_err(|e| RemotingError::Deserialization {
            class_name: String::new(),
            detail: e.to_string(),
        })
    }
}

/// Registry keyed by codec byte, populated at startup.
pub struct SerializerRegistry {
    table: DashMap<u8, Arc<dyn Serializer>>,
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SerializerRegistry {
    /// Fresh registry with the JSON serializer pre-registered.
    pub fn new() -> Self {
        let reg = Self {
            table: DashMap::new(),
        };
        reg.table.insert(JSON_CODEC, Arc::new(JsonSerializer));
        reg
    }

    /// Registers a serializer; a second registration for the same codec byte
    /// is a startup error.
    pub fn register(&self, serializer: Arc<dyn Serializer>) -> Result<(), RemotingError> {
        let code = serializer.code();
        if self.table.contains_key(&code) {
            return Err(RemotingError::Lifecycle(format!(
                "serializer code {code} already registered"
            )));
        }
        self.table.insert(code, serializer);
        Ok(())
    }

    pub fn get(&self, code: u8) -> Result<Arc<dyn Serializer>, RemotingError> {
        self.table
            .get(&code)
            .map(|e| e.value().clone())
            .ok_or(RemotingError::UnknownCodec(code))
    }
}

/// Serializes a typed payload into content bytes for `class_name`. This is
/// the send path: every failure surfaces synchronously to the caller as a
/// send error.
pub fn encode_payload<T: Serialize>(
    registry: &SerializerRegistry,
    codec: u8,
    class_name: &str,
    value: &T,
) -> Result<Bytes, RemotingError> {
    let serializer = registry
        .get(codec)
        .map_err(|_| RemotingError::SendFailed(format!("unknown serializer code {codec}")))?;
    let value = serde_json::to_value(value).map_err(|e| {
        RemotingError::SendFailed(format!("serializing `{class_name}` failed: {e}"))
    })?;
    serializer
        .encode(&value)
        .map_err(|e| RemotingError::SendFailed(format!("serializing `{class_name}` failed: {e}")))
}

/// Deserializes content bytes of `class_name` into a typed payload.
pub fn decode_payload<T: DeserializeOwned>(
    registry: &SerializerRegistry,
    codec: u8,
    class_name: &str,
    bytes: &[u8],
) -> Result<T, RemotingError> {
    let serializer = registry.get(codec)?;
    let value = serializer.decode(bytes)?;
    serde_json::from_value(value).map_err(|e| RemotingError::Deserialization {
        class_name: class_name.to_owned(),
        detail: e.to_string(),
    })
}

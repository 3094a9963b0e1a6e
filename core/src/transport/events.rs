//! Gateway events, decoded at the boundary into a closed enum.
//!
//! Platform code emits `{ "type": ..., "data": { ... } }` maps. Anything with
//! an unknown `type` or missing required fields is rejected here so the
//! orchestrator only ever sees well-formed events.

use super::abstraction::TransportKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

const KNOWN_TYPES: &[&str] = &[
    "discoveryUpdate",
    "connectionReady",
    "connectionEstablished",
    "connectionLost",
    "chunk_sent",
    "chunk_received",
];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EventDecodeError {
    #[error("event has no type discriminator")]
    MissingType,
    #[error("unknown event type: {0}")]
    UnknownType(String),
    #[error("malformed {kind} event: {reason}")]
    Malformed { kind: String, reason: String },
    #[error("{kind} event missing required field {field}")]
    MissingField { kind: &'static str, field: &'static str },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryUpdate {
    pub device_id: String,
    pub device_name: String,
    #[serde(default)]
    pub connection_method: Option<TransportKind>,
    #[serde(default)]
    pub peer_id: Option<String>,
    #[serde(default)]
    pub device_address: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub connection_token: Option<String>,
    #[serde(default)]
    pub rssi: Option<i32>,
    /// Transport-specific fields the core does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionReady {
    pub device_id: String,
    #[serde(default)]
    pub connection_method: Option<TransportKind>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub connection_token: Option<String>,
    #[serde(default)]
    pub peer_id: Option<String>,
    #[serde(default)]
    pub device_address: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEstablished {
    pub device_id: String,
    #[serde(default)]
    pub connection_method: Option<TransportKind>,
    #[serde(default)]
    pub connection_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionLost {
    pub device_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkSent {
    pub transfer_id: String,
    pub index: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReceived {
    /// Connection token the frame arrived on; keys the invalid-frame limiter
    pub connection_id: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    #[serde(rename = "discoveryUpdate")]
    DiscoveryUpdate(DiscoveryUpdate),
    #[serde(rename = "connectionReady")]
    ConnectionReady(ConnectionReady),
    #[serde(rename = "connectionEstablished")]
    ConnectionEstablished(ConnectionEstablished),
    #[serde(rename = "connectionLost")]
    ConnectionLost(ConnectionLost),
    #[serde(rename = "chunk_sent")]
    ChunkSent(ChunkSent),
    #[serde(rename = "chunk_received")]
    ChunkReceived(ChunkReceived),
}

impl GatewayEvent {
    /// Decode and validate a raw tagged map from the platform side
    pub fn decode(raw: &Value) -> Result<Self, EventDecodeError> {
        let kind = raw
            .get("type")
            .and_then(Value::as_str)
            .ok_or(EventDecodeError::MissingType)?;
        if !KNOWN_TYPES.contains(&kind) {
            return Err(EventDecodeError::UnknownType(kind.to_string()));
        }

        let event: GatewayEvent =
            serde_json::from_value(raw.clone()).map_err(|e| EventDecodeError::Malformed {
                kind: kind.to_string(),
                reason: e.to_string(),
            })?;
        event.validate()?;
        Ok(event)
    }

    pub fn decode_str(raw: &str) -> Result<Self, EventDecodeError> {
        let value: Value = serde_json::from_str(raw).map_err(|e| EventDecodeError::Malformed {
            kind: "unknown".to_string(),
            reason: e.to_string(),
        })?;
        Self::decode(&value)
    }

    /// Device the event concerns, when it concerns one
    pub fn device_id(&self) -> Option<&str> {
        match self {
            GatewayEvent::DiscoveryUpdate(e) => Some(&e.device_id),
            GatewayEvent::ConnectionReady(e) => Some(&e.device_id),
            GatewayEvent::ConnectionEstablished(e) => Some(&e.device_id),
            GatewayEvent::ConnectionLost(e) => Some(&e.device_id),
            GatewayEvent::ChunkSent(_) | GatewayEvent::ChunkReceived(_) => None,
        }
    }

    /// Required-field checks; `decode` runs this, typed producers should too
    pub fn validate(&self) -> Result<(), EventDecodeError> {
        fn required(value: &str, kind: &'static str, field: &'static str) -> Result<(), EventDecodeError> {
            if value.trim().is_empty() {
                Err(EventDecodeError::MissingField { kind, field })
            } else {
                Ok(())
            }
        }

        match self {
            GatewayEvent::DiscoveryUpdate(e) => {
                required(&e.device_id, "discoveryUpdate", "deviceId")?;
                required(&e.device_name, "discoveryUpdate", "deviceName")
            }
            GatewayEvent::ConnectionReady(e) => required(&e.device_id, "connectionReady", "deviceId"),
            GatewayEvent::ConnectionEstablished(e) => {
                required(&e.device_id, "connectionEstablished", "deviceId")
            }
            GatewayEvent::ConnectionLost(e) => required(&e.device_id, "connectionLost", "deviceId"),
            GatewayEvent::ChunkSent(e) => required(&e.transfer_id, "chunk_sent", "transferId"),
            GatewayEvent::ChunkReceived(e) => {
                required(&e.connection_id, "chunk_received", "connectionId")?;
                if e.bytes.is_empty() {
                    return Err(EventDecodeError::MissingField {
                        kind: "chunk_received",
                        field: "bytes",
                    });
                }
                Ok(())
            }
        }
    }
}

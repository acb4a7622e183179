//! JSON bodies of protocol frames

use crate::crdt::ops::SignedOperation;
use crate::crdt::reducer::CrdtValue;
use crate::types::{CrdtType, Key, OpHash};
use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Body of `HEAD`, `MSGS` and `NEED`.
///
/// For `HEAD`/`NEED` the entries are operation hashes; for `MSGS` they are
/// hex-encoded signed operations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgsDto {
    pub key: Key,
    #[serde(default)]
    pub messages: Vec<String>,
}

impl MsgsDto {
    pub fn hashes<'a>(key: Key, hashes: impl IntoIterator<Item = &'a OpHash>) -> Self {
        Self {
            key,
            messages: hashes.into_iter().map(OpHash::to_hex).collect(),
        }
    }

    pub fn operations<'a>(key: Key, ops: impl IntoIterator<Item = &'a SignedOperation>) -> Self {
        Self {
            key,
            messages: ops.into_iter().map(SignedOperation::to_hex).collect(),
        }
    }

    /// Entries as hashes; any malformed entry fails the whole body
    pub fn parse_hashes(&self) -> Result<Vec<OpHash>> {
        self.messages.iter().map(|h| OpHash::from_hex(h)).collect()
    }
}

/// `/new` request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewRequest {
    #[serde(rename = "type")]
    pub crdt_type: CrdtType,
}

/// `/new` reply, and `/get` request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDto {
    pub key: Key,
}

/// `/get` reply
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetReply {
    pub key: Key,
    pub value: Value,
    #[serde(rename = "type")]
    pub crdt_type: CrdtType,
}

impl GetReply {
    pub fn new(key: Key, value: &CrdtValue, crdt_type: CrdtType) -> Self {
        Self {
            key,
            value: value.to_json(),
            crdt_type,
        }
    }
}

/// `/inc /dec /add /rmv` request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub key: Key,
    pub value: Value,
}

/// `CONN` and `CON?` body
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectDto {
    pub address: String,
    #[serde(serialize_with = "port_as_string", deserialize_with = "port_from_any")]
    pub port: u16,
}

impl ConnectDto {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() || self.port == 0 {
            return Err(Error::MalformedPayload(
                "address and port are required".to_string(),
            ));
        }
        Ok(())
    }
}

/// `CONN` reply
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectReply {
    pub peer: String,
}

fn port_as_string<S: Serializer>(port: &u16, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&port.to_string())
}

/// Ports arrive either as JSON numbers or as strings
fn port_from_any<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u16, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(n) => Ok(n),
        Port::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

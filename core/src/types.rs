//! Core types and identifiers used throughout the system

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Content hash of a signed operation (SHA-256)
///
/// Operations are content-addressed: the hash of the signed bytes is both the
/// operation's identity and, for a `new` operation, the key of the object it
/// creates. On the wire it travels as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpHash(pub [u8; 32]);

/// Object key: the hash of the genesis (`new`) operation
pub type Key = OpHash;

impl OpHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a 64-character hex string
    pub fn from_hex(s: &str) -> Result<Self, crate::Error> {
        let bytes = hex::decode(s)
            .map_err(|e| crate::Error::MalformedPayload(format!("invalid hash hex: {}", e)))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            crate::Error::MalformedPayload(format!("hash must be 32 bytes, got {}", v.len()))
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for OpHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpHash({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for OpHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for OpHash {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for OpHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for OpHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// CRDT type tag carried by every operation
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug)]
pub enum CrdtType {
    /// Integer counter with `inc`/`dec`
    #[serde(rename = "counter")]
    Counter,
    /// Grow-only set with `add`
    #[serde(rename = "gset")]
    GSet,
    /// Two-phase set with `add`/`rmv`, remove wins
    #[serde(rename = "2pset")]
    TwoPhaseSet,
}

impl CrdtType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrdtType::Counter => "counter",
            CrdtType::GSet => "gset",
            CrdtType::TwoPhaseSet => "2pset",
        }
    }

    /// Whether an operation kind is meaningful for this type
    pub fn supports(&self, kind: OpKind) -> bool {
        match (self, kind) {
            (_, OpKind::New) | (_, OpKind::Modify) => true,
            (CrdtType::Counter, OpKind::Inc | OpKind::Dec) => true,
            (CrdtType::GSet, OpKind::Add) => true,
            (CrdtType::TwoPhaseSet, OpKind::Add | OpKind::Rmv) => true,
            _ => false,
        }
    }
}

impl fmt::Display for CrdtType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CrdtType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counter" => Ok(CrdtType::Counter),
            "gset" => Ok(CrdtType::GSet),
            "2pset" => Ok(CrdtType::TwoPhaseSet),
            other => Err(crate::Error::MalformedPayload(format!(
                "there is no crdt of type {}",
                other
            ))),
        }
    }
}

/// Operation kind tag
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Debug)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    /// Create a fresh object; its hash becomes the key
    New,
    /// Counter increment
    Inc,
    /// Counter decrement
    Dec,
    /// Set insertion
    Add,
    /// Two-phase set removal
    Rmv,
    /// Recognised on the wire, ignored by every reducer
    Modify,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            OpKind::New => "new",
            OpKind::Inc => "inc",
            OpKind::Dec => "dec",
            OpKind::Add => "add",
            OpKind::Rmv => "rmv",
            OpKind::Modify => "modify",
        };
        f.write_str(tag)
    }
}

//! CRDT operation types and the signed wire envelope
//!
//! An operation is serialized to JSON, signed, and prefixed with the author's
//! public key and the signature. The resulting bytes are the unit of
//! replication; their SHA-256 hash is the operation's identity.

use crate::crypto::signing::{hash_content, verify_payload, Keypair, SIGNED_HEADER_LEN};
use crate::types::{CrdtType, OpHash, OpKind};
use crate::{Error, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Size of the random nonce carried by `new` operations, in bytes
const NONCE_LEN: usize = 8;

/// A set element, compared by its canonical JSON encoding
///
/// Arbitrary JSON values are allowed as set members. Two elements are equal
/// when their canonical encodings are equal (object keys sorted).
#[derive(Clone, Debug)]
pub struct SetElement {
    canonical: String,
    value: Value,
}

impl SetElement {
    pub fn new(value: Value) -> Self {
        // serde_json's default map is ordered, so this encoding is canonical
        let canonical = value.to_string();
        Self { canonical, value }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }
}

impl PartialEq for SetElement {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for SetElement {}

impl Hash for SetElement {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl PartialOrd for SetElement {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SetElement {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

/// Operation payload, shaped by CRDT type and op kind at decode time
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum OpPayload {
    /// `new` carries no payload
    Genesis,
    /// Counter delta (`inc`/`dec`)
    Amount(i64),
    /// Set member (`add`/`rmv`)
    Element(SetElement),
    /// `modify` payload, carried but never reduced
    Opaque(Option<Value>),
}

/// JSON shape of an operation as it is signed and transmitted
#[derive(Serialize, Deserialize, Debug)]
struct WireOperation {
    op: OpKind,
    #[serde(default)]
    preds: Vec<OpHash>,
    #[serde(default)]
    crdt: Option<Value>,
    #[serde(rename = "type")]
    crdt_type: CrdtType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nonce: Option<String>,
}

/// Decoded, shape-checked operation
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Operation {
    /// Operation kind
    pub kind: OpKind,

    /// Hashes of causally prior operations on the same object
    pub preds: Vec<OpHash>,

    /// Type-specific payload
    pub payload: OpPayload,

    /// CRDT type of the object this operation belongs to
    pub crdt_type: CrdtType,

    /// Random token making every `new` unique
    pub nonce: Option<String>,
}

impl Operation {
    /// Genesis operation for a fresh object
    pub fn genesis(crdt_type: CrdtType) -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self {
            kind: OpKind::New,
            preds: Vec::new(),
            payload: OpPayload::Genesis,
            crdt_type,
            nonce: Some(hex::encode(bytes)),
        }
    }

    /// Operation whose predecessors are the given heads
    pub fn successor(
        kind: OpKind,
        crdt_type: CrdtType,
        payload: OpPayload,
        heads: &[SignedOperation],
    ) -> Self {
        Self {
            kind,
            preds: heads.iter().map(SignedOperation::hash).collect(),
            payload,
            crdt_type,
            nonce: None,
        }
    }

    /// Counter element value for `inc`/`dec`
    pub fn amount(&self) -> Option<i64> {
        match &self.payload {
            OpPayload::Amount(n) => Some(*n),
            _ => None,
        }
    }

    /// Set element for `add`/`rmv`
    pub fn element(&self) -> Option<&SetElement> {
        match &self.payload {
            OpPayload::Element(e) => Some(e),
            _ => None,
        }
    }

    /// Serialize to the canonical JSON that gets signed
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let crdt = match &self.payload {
            OpPayload::Genesis => None,
            OpPayload::Amount(n) => Some(serde_json::json!({ "value": n })),
            OpPayload::Element(e) => Some(serde_json::json!({ "value": e.value() })),
            OpPayload::Opaque(v) => v.clone(),
        };
        let wire = WireOperation {
            op: self.kind,
            preds: self.preds.clone(),
            crdt,
            crdt_type: self.crdt_type,
            nonce: self.nonce.clone(),
        };
        serde_json::to_vec(&wire).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode JSON content, rejecting payloads whose shape does not match
    /// the declared CRDT type and op kind
    pub fn from_json(content: &[u8]) -> Result<Self> {
        let wire: WireOperation = serde_json::from_slice(content)
            .map_err(|e| Error::MalformedPayload(format!("operation json: {}", e)))?;
        Self::try_from(wire)
    }

    /// Sign this operation with the node key
    pub fn sign(&self, keypair: &Keypair) -> Result<SignedOperation> {
        let content = self.to_json()?;
        Ok(SignedOperation(keypair.sign_payload(&content)))
    }
}

impl TryFrom<WireOperation> for Operation {
    type Error = Error;

    fn try_from(wire: WireOperation) -> Result<Self> {
        if !wire.crdt_type.supports(wire.op) {
            return Err(Error::MalformedPayload(format!(
                "no operation {} exists for the crdt {}",
                wire.op, wire.crdt_type
            )));
        }

        let payload = match wire.op {
            OpKind::New => {
                if !wire.preds.is_empty() {
                    return Err(Error::MalformedPayload(
                        "new operation cannot have predecessors".to_string(),
                    ));
                }
                match wire.crdt {
                    None | Some(Value::Null) => OpPayload::Genesis,
                    Some(_) => {
                        return Err(Error::MalformedPayload(
                            "new operation cannot carry a payload".to_string(),
                        ))
                    }
                }
            }
            OpKind::Inc | OpKind::Dec => {
                let value = wrapped_value(wire.crdt)?;
                OpPayload::Amount(integral(&value)?)
            }
            OpKind::Add | OpKind::Rmv => OpPayload::Element(SetElement::new(wrapped_value(wire.crdt)?)),
            OpKind::Modify => OpPayload::Opaque(wire.crdt),
        };

        Ok(Self {
            kind: wire.op,
            preds: wire.preds,
            payload,
            crdt_type: wire.crdt_type,
            nonce: wire.nonce,
        })
    }
}

/// Unwrap `{"value": x}`
fn wrapped_value(crdt: Option<Value>) -> Result<Value> {
    match crdt {
        Some(Value::Object(mut map)) => map
            .remove("value")
            .ok_or_else(|| Error::MalformedPayload("payload has no value field".to_string())),
        _ => Err(Error::MalformedPayload("payload must be an object".to_string())),
    }
}

/// Accept integers, and floats with no fractional part
fn integral(value: &Value) -> Result<i64> {
    if let Some(n) = value.as_i64() {
        return Ok(n);
    }
    match value.as_f64() {
        Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(f as i64),
        _ => Err(Error::MalformedPayload(format!(
            "counter payload must be an integer, got {}",
            value
        ))),
    }
}

/// Signed operation bytes: `public_key(32) || signature(64) || json(Operation)`
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SignedOperation(pub Vec<u8>);

impl SignedOperation {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Content address of these bytes
    pub fn hash(&self) -> OpHash {
        hash_content(&self.0)
    }

    /// Whether the embedded signature is valid for the content
    pub fn verify(&self) -> bool {
        verify_payload(&self.0)
    }

    /// Verify, then decode the operation
    pub fn read(&self) -> Result<Operation> {
        read_operation(&self.0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        hex::decode(s)
            .map(SignedOperation)
            .map_err(|e| Error::MalformedPayload(format!("operation hex: {}", e)))
    }
}

impl fmt::Debug for SignedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignedOperation({:?}, {} bytes)", self.hash(), self.0.len())
    }
}

impl From<Vec<u8>> for SignedOperation {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// Verify a signed payload and decode the operation inside it
pub fn read_operation(payload: &[u8]) -> Result<Operation> {
    if !verify_payload(payload) {
        return Err(Error::InvalidSignature);
    }
    Operation::from_json(&payload[SIGNED_HEADER_LEN..])
}

/// Create a fresh object of the given type.
///
/// Returns the signed genesis operation and the key it establishes.
pub fn new_crdt(keypair: &Keypair, crdt_type: CrdtType) -> Result<(SignedOperation, OpHash)> {
    let op = Operation::genesis(crdt_type).sign(keypair)?;
    let key = op.hash();
    Ok((op, key))
}

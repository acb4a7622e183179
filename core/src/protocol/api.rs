//! User-facing requests: `/new /get /inc /dec /add /rmv`

use crate::crdt::ops::{new_crdt, OpPayload, Operation, SetElement, SignedOperation};
use crate::crypto::signing::Keypair;
use crate::protocol::dto::{GetReply, KeyDto, NewRequest, UpdateRequest};
use crate::protocol::message::{Message, MessageHeader};
use crate::storage::Storage;
use crate::types::{Key, OpKind};
use crate::{Error, Result};
use tracing::{debug, info};

/// Reply to a user request, plus the operation to broadcast if one was created
#[derive(Debug)]
pub struct ApiOutcome {
    pub reply: Message,
    pub broadcast: Option<(Key, SignedOperation)>,
}

impl ApiOutcome {
    fn reply(reply: Message) -> Self {
        Self {
            reply,
            broadcast: None,
        }
    }
}

/// Whether `header` is served by [`handle_user_request`]
pub fn is_user_request(header: MessageHeader) -> bool {
    op_kind(header).is_some() || matches!(header, MessageHeader::New | MessageHeader::Get)
}

fn op_kind(header: MessageHeader) -> Option<OpKind> {
    match header {
        MessageHeader::Inc => Some(OpKind::Inc),
        MessageHeader::Dec => Some(OpKind::Dec),
        MessageHeader::Add => Some(OpKind::Add),
        MessageHeader::Rmv => Some(OpKind::Rmv),
        _ => None,
    }
}

/// Serve one user request against local storage.
///
/// Every failure becomes an `R_NO` reply carrying the reason.
pub fn handle_user_request(storage: &Storage, keypair: &Keypair, msg: &Message) -> ApiOutcome {
    let result = match msg.header {
        MessageHeader::New => create(storage, keypair, msg),
        MessageHeader::Get => read(storage, msg).map(ApiOutcome::reply),
        header => match op_kind(header) {
            Some(kind) => update(storage, keypair, kind, msg),
            None => Err(Error::MalformedPayload(format!("{} is not a user request", header))),
        },
    };

    result.unwrap_or_else(|e| {
        debug!(header = %msg.header, error = %e, "Request refused");
        ApiOutcome::reply(Message::no(&e.to_string()))
    })
}

fn create(storage: &Storage, keypair: &Keypair, msg: &Message) -> Result<ApiOutcome> {
    let request: NewRequest = msg.parse()?;
    let (genesis, key) = new_crdt(keypair, request.crdt_type)?;
    storage.assign(key, genesis.clone())?;
    info!(key = ?key, crdt = %request.crdt_type, "Created key");

    Ok(ApiOutcome {
        reply: Message::ok(&KeyDto { key }),
        broadcast: Some((key, genesis)),
    })
}

fn read(storage: &Storage, msg: &Message) -> Result<Message> {
    let request: KeyDto = msg.parse()?;
    let snapshot = storage.get(&request.key)?;
    Ok(Message::ok(&GetReply::new(
        request.key,
        &snapshot.value,
        snapshot.crdt_type,
    )))
}

fn update(storage: &Storage, keypair: &Keypair, kind: OpKind, msg: &Message) -> Result<ApiOutcome> {
    let request: UpdateRequest = msg.parse()?;
    let snapshot = storage.get(&request.key)?;
    if !snapshot.crdt_type.supports(kind) {
        return Err(Error::MalformedPayload(format!(
            "no operation {} exists for the crdt {}",
            kind, snapshot.crdt_type
        )));
    }

    let payload = match kind {
        OpKind::Inc | OpKind::Dec => OpPayload::Amount(rounded_amount(&request.value)?),
        _ => OpPayload::Element(SetElement::new(request.value)),
    };
    let op = Operation::successor(kind, snapshot.crdt_type, payload, &snapshot.heads).sign(keypair)?;
    storage.append(request.key, op.clone())?;
    debug!(key = ?request.key, op = ?op.hash(), kind = %kind, "Applied local operation");

    Ok(ApiOutcome {
        reply: Message::ok_empty(),
        broadcast: Some((request.key, op)),
    })
}

/// Counter amounts are rounded to the nearest integer
fn rounded_amount(value: &serde_json::Value) -> Result<i64> {
    if let Some(n) = value.as_i64() {
        return Ok(n);
    }
    match value.as_f64() {
        Some(f) if f.is_finite() => Ok(f.round() as i64),
        _ => Err(Error::MalformedPayload(
            "provided the wrong value type for the operation".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CrdtType;
    use serde_json::{json, Value};

    fn request(header: MessageHeader, body: Value) -> Message {
        Message::with_content(header, &body).unwrap()
    }

    fn new_key(storage: &Storage, keypair: &Keypair, crdt: &str) -> Key {
        let outcome = handle_user_request(storage, keypair, &request(MessageHeader::New, json!({"type": crdt})));
        assert_eq!(outcome.reply.header, MessageHeader::Ok);
        outcome.reply.parse::<KeyDto>().unwrap().key
    }

    #[test]
    fn test_new_then_get() {
        let storage = Storage::new();
        let keypair = Keypair::generate();
        let outcome = handle_user_request(&storage, &keypair, &request(MessageHeader::New, json!({"type": "counter"})));
        let key = outcome.reply.parse::<KeyDto>().unwrap().key;
        let (bkey, op) = outcome.broadcast.unwrap();
        assert_eq!(bkey, key);
        assert_eq!(op.hash(), key);

        let reply = handle_user_request(&storage, &keypair, &request(MessageHeader::Get, json!({"key": key}))).reply;
        let body: Value = reply.parse().unwrap();
        assert_eq!(body, json!({"key": key.to_hex(), "value": 0, "type": "counter"}));
    }

    #[test]
    fn test_counter_updates_round() {
        let storage = Storage::new();
        let keypair = Keypair::generate();
        let key = new_key(&storage, &keypair, "counter");

        for (header, value) in [
            (MessageHeader::Inc, json!(5)),
            (MessageHeader::Dec, json!(2.6)),
            (MessageHeader::Inc, json!(0.4)),
        ] {
            let outcome = handle_user_request(&storage, &keypair, &request(header, json!({"key": key, "value": value})));
            assert_eq!(outcome.reply.header, MessageHeader::Ok);
            assert!(outcome.broadcast.is_some());
        }
        assert_eq!(storage.get(&key).unwrap().value.as_counter(), Some(2));
    }

    #[test]
    fn test_set_updates() {
        let storage = Storage::new();
        let keypair = Keypair::generate();
        let key = new_key(&storage, &keypair, "2pset");

        let add = |v: Value| handle_user_request(&storage, &keypair, &request(MessageHeader::Add, json!({"key": key, "value": v})));
        assert_eq!(add(json!("a")).reply.header, MessageHeader::Ok);
        assert_eq!(add(json!({"n": 1})).reply.header, MessageHeader::Ok);
        let rmv = handle_user_request(&storage, &keypair, &request(MessageHeader::Rmv, json!({"key": key, "value": "a"})));
        assert_eq!(rmv.reply.header, MessageHeader::Ok);
        assert_eq!(add(json!("a")).reply.header, MessageHeader::Ok);

        let value = storage.get(&key).unwrap().value;
        assert_eq!(value.as_set().unwrap(), &[json!({"n": 1})]);
    }

    #[test]
    fn test_refusals() {
        let storage = Storage::new();
        let keypair = Keypair::generate();
        let counter = new_key(&storage, &keypair, "counter");
        let gset = new_key(&storage, &keypair, "gset");

        let refused = |header, body| {
            let outcome = handle_user_request(&storage, &keypair, &request(header, body));
            outcome.reply.header == MessageHeader::No && outcome.broadcast.is_none()
        };

        assert!(refused(MessageHeader::New, json!({"type": "lww"})));
        assert!(refused(MessageHeader::Get, json!({"key": "00"})));
        assert!(refused(MessageHeader::Get, json!({"key": Key::from_hex(&"ab".repeat(32)).unwrap()})));
        assert!(refused(MessageHeader::Inc, json!({"key": counter, "value": "five"})));
        assert!(refused(MessageHeader::Add, json!({"key": counter, "value": 1})));
        assert!(refused(MessageHeader::Rmv, json!({"key": gset, "value": 1})));
        assert!(refused(MessageHeader::Inc, json!({"key": gset, "value": 1})));
        assert_eq!(storage.get(&counter).unwrap().crdt_type, CrdtType::Counter);
    }

    #[test]
    fn test_user_request_headers() {
        assert!(is_user_request(MessageHeader::Rmv));
        assert!(is_user_request(MessageHeader::Get));
        assert!(!is_user_request(MessageHeader::Msgs));
        assert!(!is_user_request(MessageHeader::Ping));
    }
}

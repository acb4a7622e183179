//! Client API for bftkv
//!
//! Async request/reply client over the node's frame protocol. One client
//! holds one TCP connection and may issue any number of requests on it.

use crate::crdt::reducer::CrdtValue;
use crate::protocol::codec::FrameCodec;
use crate::protocol::dto::{ConnectDto, ConnectReply, GetReply, KeyDto, NewRequest, UpdateRequest};
use crate::protocol::message::{Message, MessageHeader};
use crate::types::{CrdtType, Key};
use crate::{Error, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::debug;

/// Upper bound on a single round trip; `CONN` includes dialing the target
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Value of a key as reported by `/get`
#[derive(Debug, Clone, PartialEq)]
pub struct KeyValue {
    pub key: Key,
    pub crdt_type: CrdtType,
    pub value: Value,
}

impl KeyValue {
    pub fn as_counter(&self) -> Option<i64> {
        self.value.as_i64()
    }

    pub fn as_set(&self) -> Option<&Vec<Value>> {
        self.value.as_array()
    }

    /// Whether this matches a locally reduced value
    pub fn matches(&self, value: &CrdtValue) -> bool {
        self.value == value.to_json()
    }
}

/// Connection to a node
pub struct Client {
    framed: Framed<TcpStream, FrameCodec>,
    peer: String,
}

impl Client {
    /// Connect to a node
    pub async fn connect<A: ToSocketAddrs + std::fmt::Display>(addr: A) -> Result<Self> {
        let peer = addr.to_string();
        let stream = timeout(REQUEST_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Network(format!("Timed out connecting to {}", peer)))?
            .map_err(|e| Error::Network(format!("Failed to connect to {}: {}", peer, e)))?;
        stream.set_nodelay(true)?;

        Ok(Self {
            framed: Framed::new(stream, FrameCodec::new()),
            peer,
        })
    }

    /// Address this client is connected to
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Send one frame and wait for the reply, whatever its header
    pub async fn request(&mut self, msg: Message) -> Result<Message> {
        debug!(peer = %self.peer, header = %msg.header, "Sending request");
        self.framed.send(msg).await?;

        let reply = timeout(REQUEST_TIMEOUT, self.framed.next())
            .await
            .map_err(|_| Error::Network(format!("{} did not reply", self.peer)))?
            .ok_or_else(|| Error::Network(format!("{} closed the connection", self.peer)))??;
        debug!(peer = %self.peer, header = %reply.header, "Received reply");
        Ok(reply)
    }

    /// Send a request and require `R_OK`
    async fn expect_ok(&mut self, msg: Message) -> Result<Message> {
        let reply = self.request(msg).await?;
        match reply.header {
            MessageHeader::Ok => Ok(reply),
            MessageHeader::No => Err(Error::Refused(reason(&reply, "reason"))),
            MessageHeader::Err => Err(Error::Network(format!(
                "{} rejected the request: {}",
                self.peer,
                reason(&reply, "error")
            ))),
            other => Err(Error::Network(format!(
                "{} answered with unexpected header {}",
                self.peer, other
            ))),
        }
    }

    pub async fn ping(&mut self) -> Result<()> {
        let reply = self.request(Message::new(MessageHeader::Ping)).await?;
        if reply.header != MessageHeader::Pong {
            return Err(Error::Network(format!(
                "expected PONG, got {}",
                reply.header
            )));
        }
        Ok(())
    }

    /// Create a key holding a fresh CRDT
    pub async fn new_key(&mut self, crdt_type: CrdtType) -> Result<Key> {
        let msg = Message::with_content(MessageHeader::New, &NewRequest { crdt_type })?;
        let reply: KeyDto = self.expect_ok(msg).await?.parse()?;
        Ok(reply.key)
    }

    pub async fn get(&mut self, key: Key) -> Result<KeyValue> {
        let msg = Message::with_content(MessageHeader::Get, &KeyDto { key })?;
        let reply: GetReply = self.expect_ok(msg).await?.parse()?;
        Ok(KeyValue {
            key: reply.key,
            crdt_type: reply.crdt_type,
            value: reply.value,
        })
    }

    pub async fn inc(&mut self, key: Key, amount: i64) -> Result<()> {
        self.update(MessageHeader::Inc, key, Value::from(amount)).await
    }

    pub async fn dec(&mut self, key: Key, amount: i64) -> Result<()> {
        self.update(MessageHeader::Dec, key, Value::from(amount)).await
    }

    pub async fn add(&mut self, key: Key, value: Value) -> Result<()> {
        self.update(MessageHeader::Add, key, value).await
    }

    pub async fn rmv(&mut self, key: Key, value: Value) -> Result<()> {
        self.update(MessageHeader::Rmv, key, value).await
    }

    async fn update(&mut self, header: MessageHeader, key: Key, value: Value) -> Result<()> {
        let msg = Message::with_content(header, &UpdateRequest { key, value })?;
        self.expect_ok(msg).await?;
        Ok(())
    }

    /// Ask the node to open an anti-entropy link to `address:port`
    pub async fn connect_peer(&mut self, address: &str, port: u16) -> Result<String> {
        let msg = Message::with_content(MessageHeader::Connect, &ConnectDto::new(address, port))?;
        let reply: ConnectReply = self.expect_ok(msg).await?.parse()?;
        Ok(reply.peer)
    }
}

/// Pull a string field out of an `R_NO`/`R_ER` body, falling back to the raw body
fn reason(reply: &Message, field: &str) -> String {
    reply
        .parse::<serde_json::Map<String, Value>>()
        .ok()
        .and_then(|map| map.get(field).and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| reply.body_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reason_extraction() {
        assert_eq!(reason(&Message::no("the key does not exist"), "reason"), "the key does not exist");
        assert_eq!(reason(&Message::error("bad frame"), "error"), "bad frame");
        let raw = Message::with_raw(MessageHeader::No, "plain text");
        assert_eq!(reason(&raw, "reason"), "plain text");
    }

    #[test]
    fn test_key_value_accessors() {
        let counter = KeyValue {
            key: Key::from_hex(&"11".repeat(32)).unwrap(),
            crdt_type: CrdtType::Counter,
            value: json!(7),
        };
        assert_eq!(counter.as_counter(), Some(7));
        assert!(counter.matches(&CrdtValue::Counter(7)));
        assert!(counter.as_set().is_none());
    }
}

//! Framed protocol messages
//!
//! Every frame is a 4-byte ASCII header tag followed by a JSON body (empty for
//! zero-payload tags). Unknown tags are kept so the receiver can answer them.

use crate::{Error, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;

/// Length of a header tag
pub const HEADER_LEN: usize = 4;

/// Frame header tag
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageHeader {
    Ping,
    Pong,
    /// Ask this node to dial a peer
    Connect,
    /// Peer join offer; the stream becomes an anti-entropy link on success
    ConnectOffer,
    Ok,
    No,
    Err,
    Heads,
    Msgs,
    Needs,
    New,
    Get,
    Inc,
    Dec,
    Add,
    Rmv,
    Unknown([u8; HEADER_LEN]),
}

impl MessageHeader {
    pub fn as_bytes(&self) -> [u8; HEADER_LEN] {
        let tag: &[u8; HEADER_LEN] = match self {
            MessageHeader::Ping => b"PING",
            MessageHeader::Pong => b"PONG",
            MessageHeader::Connect => b"CONN",
            MessageHeader::ConnectOffer => b"CON?",
            MessageHeader::Ok => b"R_OK",
            MessageHeader::No => b"R_NO",
            MessageHeader::Err => b"R_ER",
            MessageHeader::Heads => b"HEAD",
            MessageHeader::Msgs => b"MSGS",
            MessageHeader::Needs => b"NEED",
            MessageHeader::New => b"/new",
            MessageHeader::Get => b"/get",
            MessageHeader::Inc => b"/inc",
            MessageHeader::Dec => b"/dec",
            MessageHeader::Add => b"/add",
            MessageHeader::Rmv => b"/rmv",
            MessageHeader::Unknown(raw) => raw,
        };
        *tag
    }

    pub fn from_bytes(raw: [u8; HEADER_LEN]) -> Self {
        match &raw {
            b"PING" => MessageHeader::Ping,
            b"PONG" => MessageHeader::Pong,
            b"CONN" => MessageHeader::Connect,
            b"CON?" => MessageHeader::ConnectOffer,
            b"R_OK" => MessageHeader::Ok,
            b"R_NO" => MessageHeader::No,
            b"R_ER" => MessageHeader::Err,
            b"HEAD" => MessageHeader::Heads,
            b"MSGS" => MessageHeader::Msgs,
            b"NEED" => MessageHeader::Needs,
            b"/new" => MessageHeader::New,
            b"/get" => MessageHeader::Get,
            b"/inc" => MessageHeader::Inc,
            b"/dec" => MessageHeader::Dec,
            b"/add" => MessageHeader::Add,
            b"/rmv" => MessageHeader::Rmv,
            _ => MessageHeader::Unknown(raw),
        }
    }

    /// Parse a user-typed tag such as `/inc` or `PING`
    pub fn parse(tag: &str) -> Option<Self> {
        let raw: [u8; HEADER_LEN] = tag.as_bytes().try_into().ok()?;
        Some(Self::from_bytes(raw))
    }

    /// Anti-entropy traffic on a peer link
    pub fn is_anti_entropy(&self) -> bool {
        matches!(
            self,
            MessageHeader::Heads | MessageHeader::Msgs | MessageHeader::Needs
        )
    }
}

impl fmt::Display for MessageHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.as_bytes()))
    }
}

impl fmt::Debug for MessageHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageHeader({})", self)
    }
}

/// A single protocol frame
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Message {
    pub header: MessageHeader,
    pub body: Bytes,
}

impl Message {
    /// Frame with no body
    pub fn new(header: MessageHeader) -> Self {
        Self {
            header,
            body: Bytes::new(),
        }
    }

    /// Frame whose body is `content` as JSON
    pub fn with_content<T: Serialize>(header: MessageHeader, content: &T) -> Result<Self> {
        let body = serde_json::to_vec(content).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(Self {
            header,
            body: Bytes::from(body),
        })
    }

    /// Frame with a raw body, as typed into a shell
    pub fn with_raw(header: MessageHeader, body: impl Into<Bytes>) -> Self {
        Self {
            header,
            body: body.into(),
        }
    }

    /// Decode the JSON body
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            Error::MalformedPayload(format!("{} body: {}", self.header, e))
        })
    }

    /// `R_OK` carrying `content`, or `R_ER` if it cannot be encoded
    pub fn ok<T: Serialize>(content: &T) -> Self {
        Self::with_content(MessageHeader::Ok, content)
            .unwrap_or_else(|e| Self::error(&e.to_string()))
    }

    pub fn ok_empty() -> Self {
        Self::new(MessageHeader::Ok)
    }

    /// `R_NO` with a reason
    pub fn no(reason: &str) -> Self {
        Self::with_content(MessageHeader::No, &serde_json::json!({ "reason": reason }))
            .unwrap_or_else(|_| Self::new(MessageHeader::No))
    }

    /// `R_ER` with an error description
    pub fn error(error: &str) -> Self {
        Self::with_content(MessageHeader::Err, &serde_json::json!({ "error": error }))
            .unwrap_or_else(|_| Self::new(MessageHeader::Err))
    }

    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

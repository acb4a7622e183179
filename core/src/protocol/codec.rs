//! Length-prefixed frame codec for tokio.
//!
//! Layout: `header(4) || body_len(u32 big-endian) || body`.

use crate::protocol::message::{Message, MessageHeader, HEADER_LEN};
use crate::Error;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Bytes preceding the body
const PREFIX_LEN: usize = HEADER_LEN + 4;

/// Default upper bound on a frame body
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Frame codec; bodies above `max_len` are rejected
#[derive(Clone, Debug)]
pub struct FrameCodec {
    max_len: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self { max_len }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Error> {
        if src.len() < PREFIX_LEN {
            return Ok(None);
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[HEADER_LEN..PREFIX_LEN]);
        let body_len = u32::from_be_bytes(len_bytes) as usize;

        if body_len > self.max_len {
            return Err(Error::MalformedPayload(format!(
                "frame body of {} bytes exceeds limit of {}",
                body_len, self.max_len
            )));
        }

        if src.len() < PREFIX_LEN + body_len {
            src.reserve(PREFIX_LEN + body_len - src.len());
            return Ok(None);
        }

        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&src[..HEADER_LEN]);
        src.advance(PREFIX_LEN);
        let body = src.split_to(body_len).freeze();

        Ok(Some(Message {
            header: MessageHeader::from_bytes(raw),
            body,
        }))
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Error> {
        if msg.body.len() > self.max_len {
            return Err(Error::MalformedPayload(format!(
                "frame body of {} bytes exceeds limit of {}",
                msg.body.len(),
                self.max_len
            )));
        }
        let body_len = u32::try_from(msg.body.len())
            .map_err(|_| Error::MalformedPayload("frame body too large".to_string()))?;

        dst.reserve(PREFIX_LEN + msg.body.len());
        dst.put_slice(&msg.header.as_bytes());
        dst.put_u32(body_len);
        dst.put_slice(&msg.body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Message::with_raw(MessageHeader::Get, "{}"), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"/get\x00\x00\x00\x02{}");
    }

    #[test]
    fn test_decode_partial_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"MSGS\x00\x00\x00\x05{\"a\""[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"}PING\x00\x00\x00\x00");
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.header, MessageHeader::Msgs);
        assert_eq!(&first.body[..], b"{\"a\"}");

        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.header, MessageHeader::Ping);
        assert!(second.body.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_too_long() {
        let mut codec = FrameCodec::with_max_len(8);
        let mut buf = BytesMut::from(&b"MSGS\x00\x00\x01\x00"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(Error::MalformedPayload(_))));
    }

    #[test]
    fn test_encode_too_long() {
        let mut codec = FrameCodec::with_max_len(2);
        let mut buf = BytesMut::new();
        let result = codec.encode(Message::with_raw(MessageHeader::Msgs, "[1,2]"), &mut buf);
        assert!(result.is_err());
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_frames_split_across_reads() {
        use futures_util::StreamExt;
        use tokio_util::codec::FramedRead;

        let mock = tokio_test::io::Builder::new()
            .read(b"PI")
            .read(b"NG\x00\x00\x00\x00/ge")
            .read(b"t\x00\x00\x00\x02{}")
            .build();
        let mut frames = FramedRead::new(mock, FrameCodec::new());

        let first = frames.next().await.unwrap().unwrap();
        assert_eq!(first.header, MessageHeader::Ping);
        let second = frames.next().await.unwrap().unwrap();
        assert_eq!(second.header, MessageHeader::Get);
        assert_eq!(&second.body[..], b"{}");
        assert!(frames.next().await.is_none());
    }
}

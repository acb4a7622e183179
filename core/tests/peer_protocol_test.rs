//! A hand-driven peer speaking raw frames to a running node

use bftkv_core::crdt::{CrdtValue, OpPayload, Operation, SignedOperation};
use bftkv_core::crypto::signing::Keypair;
use bftkv_core::protocol::dto::{ConnectDto, MsgsDto};
use bftkv_core::protocol::{FrameCodec, Message, MessageHeader};
use bftkv_core::smoothtest::SmoothReplica;
use bftkv_core::{CrdtType, Key, OpKind};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

type Peer = Framed<TcpStream, FrameCodec>;

/// Open a link to `replica` the way another node would
async fn offer_link(replica: &SmoothReplica) -> anyhow::Result<Peer> {
    let stream = TcpStream::connect(replica.addr()).await?;
    let mut peer = Framed::new(stream, FrameCodec::new());
    peer.send(Message::with_content(
        MessageHeader::ConnectOffer,
        &ConnectDto::new("127.0.0.1", 1),
    )?)
    .await?;

    let reply = next_frame(&mut peer).await?;
    assert_eq!(reply.header, MessageHeader::Ok);
    Ok(peer)
}

async fn next_frame(peer: &mut Peer) -> anyhow::Result<Message> {
    let frame = tokio::time::timeout(Duration::from_secs(5), peer.next())
        .await?
        .ok_or_else(|| anyhow::anyhow!("link closed"))??;
    Ok(frame)
}

async fn send_ops(peer: &mut Peer, key: Key, ops: &[SignedOperation]) -> anyhow::Result<()> {
    peer.send(Message::with_content(MessageHeader::Msgs, &MsgsDto::operations(key, ops))?)
        .await?;
    Ok(())
}

async fn await_value(replica: &SmoothReplica, key: &Key, expected: CrdtValue) -> anyhow::Result<()> {
    for _ in 0..100 {
        if replica.value(key).as_ref() == Some(&expected) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    anyhow::bail!("expected {:?}, found {:?}", expected, replica.value(key))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_link_opens_with_heads() -> anyhow::Result<()> {
    let replica = SmoothReplica::new().await?;
    let key = replica.client().await?.new_key(CrdtType::Counter).await?;

    let mut peer = offer_link(&replica).await?;
    let heads = next_frame(&mut peer).await?;
    assert_eq!(heads.header, MessageHeader::Heads);
    let dto: MsgsDto = heads.parse()?;
    assert_eq!(dto.key, key);
    assert_eq!(dto.parse_hashes()?, vec![key]);

    // The genesis is served once, never again on this link
    let need = Message::with_content(MessageHeader::Needs, &MsgsDto::hashes(key, &[key]))?;
    peer.send(need.clone()).await?;
    let msgs = next_frame(&mut peer).await?;
    assert_eq!(msgs.header, MessageHeader::Msgs);
    let served: MsgsDto = msgs.parse()?;
    assert_eq!(SignedOperation::from_hex(&served.messages[0])?.hash(), key);

    peer.send(need).await?;
    let again = tokio::time::timeout(Duration::from_millis(300), peer.next()).await;
    assert!(again.is_err(), "operation was sent twice");

    replica.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_byzantine_operations_are_dropped() -> anyhow::Result<()> {
    let replica = SmoothReplica::new().await?;
    let key = replica.client().await?.new_key(CrdtType::Counter).await?;
    let heads = replica.storage().get(&key)?.heads;

    let mut peer = offer_link(&replica).await?;
    next_frame(&mut peer).await?;

    let mallory = Keypair::generate();
    let valid = Operation::successor(OpKind::Inc, CrdtType::Counter, OpPayload::Amount(7), &heads)
        .sign(&mallory)?;
    let mut forged = Operation::successor(OpKind::Inc, CrdtType::Counter, OpPayload::Amount(1000), &heads)
        .sign(&mallory)?;
    forged.0[40] ^= 0xff;

    let msgs = MsgsDto {
        key,
        messages: vec![
            "definitely-not-hex".to_string(),
            forged.to_hex(),
            valid.to_hex(),
        ],
    };
    peer.send(Message::with_content(MessageHeader::Msgs, &msgs)?).await?;
    peer.send(Message::with_raw(MessageHeader::Heads, "{not json")).await?;

    await_value(&replica, &key, CrdtValue::Counter(7)).await?;
    assert_eq!(replica.stats().totals().invalid_ops, 2);
    assert_eq!(replica.operations(&key).len(), 2);

    // The node still answers requests
    replica.client().await?.ping().await?;
    replica.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_peer_supplies_unknown_key() -> anyhow::Result<()> {
    let replica = SmoothReplica::new().await?;
    let mut peer = offer_link(&replica).await?;

    let author = Keypair::generate();
    let (genesis, key) = bftkv_core::crdt::new_crdt(&author, CrdtType::GSet)?;
    let add = Operation::successor(
        OpKind::Add,
        CrdtType::GSet,
        OpPayload::Element(bftkv_core::crdt::SetElement::new(serde_json::json!("hi"))),
        &[genesis.clone()],
    )
    .sign(&author)?;

    // Only the successor at first; the node asks for its predecessor
    send_ops(&mut peer, key, &[add]).await?;
    let need = next_frame(&mut peer).await?;
    assert_eq!(need.header, MessageHeader::Needs);
    assert_eq!(need.parse::<MsgsDto>()?.parse_hashes()?, vec![key]);
    assert!(replica.value(&key).is_none());

    send_ops(&mut peer, key, &[genesis]).await?;
    await_value(&replica, &key, CrdtValue::Set(vec![serde_json::json!("hi")])).await?;

    replica.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_header_gets_error() -> anyhow::Result<()> {
    let replica = SmoothReplica::new().await?;
    let stream = TcpStream::connect(replica.addr()).await?;
    let mut conn = Framed::new(stream, FrameCodec::new());

    conn.send(Message::new(MessageHeader::from_bytes(*b"WHAT"))).await?;
    assert_eq!(next_frame(&mut conn).await?.header, MessageHeader::Err);

    // Anti-entropy frames are only meaningful on a link
    let key = Key::from_hex(&"00".repeat(32))?;
    conn.send(Message::with_content(MessageHeader::Heads, &MsgsDto::hashes(key, std::iter::empty()))?)
        .await?;
    assert_eq!(next_frame(&mut conn).await?.header, MessageHeader::Err);

    conn.send(Message::new(MessageHeader::Ping)).await?;
    assert_eq!(next_frame(&mut conn).await?.header, MessageHeader::Pong);

    replica.shutdown().await?;
    Ok(())
}

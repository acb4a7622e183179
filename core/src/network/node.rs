//! TCP node runtime
//!
//! Provides the process side of a replica:
//! - An accept loop serving `PING`, `CONN` and the user API
//! - Peer links upgraded from `CON?` offers, each with a reader and a writer task
//! - A coordinating task that owns the anti-entropy engine and sweeps stale rounds

use crate::config::NodeConfig;
use crate::crdt::ops::SignedOperation;
use crate::crypto::signing::Keypair;
use crate::network::stats::ReplicationStats;
use crate::protocol::api;
use crate::protocol::codec::FrameCodec;
use crate::protocol::dto::{ConnectDto, ConnectReply};
use crate::protocol::engine::{AntiEntropyEngine, PeerId};
use crate::protocol::message::{Message, MessageHeader};
use crate::storage::Storage;
use crate::types::Key;
use crate::{Error, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

/// Time allowed for dialing a peer and for its answer to `CON?`
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

type FrameStream = Framed<TcpStream, FrameCodec>;

/// Events consumed by the coordinating task
#[derive(Debug)]
pub enum EngineEvent {
    /// A link is up; its reader starts only after this event is queued
    PeerConnected {
        peer: PeerId,
        addr: String,
        outbox: mpsc::UnboundedSender<Message>,
        reader: AbortHandle,
    },
    /// Inbound frame on a link
    Frame { peer: PeerId, msg: Message },
    /// Reader or writer saw the link break
    PeerClosed { peer: PeerId },
    /// Locally created operation
    Broadcast { key: Key, op: SignedOperation },
    /// Read engine state
    Inspect { response: oneshot::Sender<EngineSnapshot> },
    Shutdown,
}

/// Engine state visible from outside the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSnapshot {
    pub peers: Vec<(PeerId, String)>,
    pub pool_len: usize,
}

/// Cloneable entry point into the coordinating task
#[derive(Debug, Clone)]
pub struct EngineHandle {
    events: mpsc::UnboundedSender<EngineEvent>,
    next_peer: Arc<AtomicU64>,
}

impl EngineHandle {
    fn new(events: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self {
            events,
            next_peer: Arc::new(AtomicU64::new(1)),
        }
    }

    fn next_peer_id(&self) -> PeerId {
        PeerId(self.next_peer.fetch_add(1, Ordering::Relaxed))
    }

    fn send(&self, event: EngineEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Queue a local operation for every peer
    pub fn broadcast(&self, key: Key, op: SignedOperation) {
        if !self.send(EngineEvent::Broadcast { key, op }) {
            warn!(key = ?key, "Coordinator stopped, broadcast dropped");
        }
    }

    pub async fn snapshot(&self) -> Result<EngineSnapshot> {
        let (response, rx) = oneshot::channel();
        if !self.send(EngineEvent::Inspect { response }) {
            return Err(Error::Network("Coordinator stopped".to_string()));
        }
        rx.await
            .map_err(|_| Error::Network("Coordinator dropped the request".to_string()))
    }

    pub fn shutdown(&self) {
        let _ = self.send(EngineEvent::Shutdown);
    }
}

/// State shared by every connection task
struct Context {
    storage: Arc<Storage>,
    keypair: Keypair,
    engine: EngineHandle,
    advertise: ConnectDto,
    max_frame_len: usize,
}

impl Context {
    fn framed(&self, stream: TcpStream) -> FrameStream {
        Framed::new(stream, FrameCodec::with_max_len(self.max_frame_len))
    }
}

/// A bound, not yet running replica
pub struct Node {
    config: NodeConfig,
    keypair: Keypair,
    storage: Arc<Storage>,
    stats: ReplicationStats,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Node {
    /// Bind the listener
    pub async fn bind(config: NodeConfig, keypair: Keypair) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.listen)
            .await
            .map_err(|e| Error::Network(format!("Failed to bind {}: {}", config.listen, e)))?;
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            key = %hex::encode(keypair.public_key().to_bytes()),
            "Node listening"
        );

        Ok(Self {
            config,
            keypair,
            storage: Arc::new(Storage::new()),
            stats: ReplicationStats::new(),
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn storage(&self) -> Arc<Storage> {
        self.storage.clone()
    }

    pub fn stats(&self) -> ReplicationStats {
        self.stats.clone()
    }

    /// Serve until shutdown.
    ///
    /// Resolves with an error only if the engine hits an internal
    /// consistency failure.
    pub async fn run(self) -> Result<()> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.run_with(EngineHandle::new(events_tx), events_rx).await
    }

    /// Run on a background task
    pub fn spawn(self) -> NodeHandle {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let engine = EngineHandle::new(events_tx);
        let local_addr = self.local_addr;
        let storage = self.storage.clone();
        let stats = self.stats.clone();
        let task = tokio::spawn(self.run_with(engine.clone(), events_rx));

        NodeHandle {
            engine,
            task,
            local_addr,
            storage,
            stats,
        }
    }

    async fn run_with(
        self,
        engine: EngineHandle,
        events: mpsc::UnboundedReceiver<EngineEvent>,
    ) -> Result<()> {
        let Node {
            config,
            keypair,
            storage,
            stats,
            listener,
            local_addr,
        } = self;

        let ctx = Arc::new(Context {
            storage: storage.clone(),
            keypair,
            engine: engine.clone(),
            advertise: ConnectDto::new(config.advertise_host.clone(), local_addr.port()),
            max_frame_len: config.max_frame_len,
        });

        let accept = tokio::spawn(accept_loop(listener, ctx.clone()));

        for peer in &config.peers {
            let ctx = ctx.clone();
            let peer = peer.clone();
            tokio::spawn(async move {
                if let Err(e) = dial(&ctx, &peer).await {
                    warn!(peer = %peer, error = %e, "Initial peer unreachable");
                }
            });
        }

        let engine = AntiEntropyEngine::new(storage, config.anti_entropy.clone(), stats);
        let result = coordinate(engine, events, config.anti_entropy.sweep_interval()).await;
        accept.abort();
        result
    }
}

/// Handle to a node running on a background task
pub struct NodeHandle {
    engine: EngineHandle,
    task: JoinHandle<Result<()>>,
    local_addr: SocketAddr,
    storage: Arc<Storage>,
    stats: ReplicationStats,
}

impl NodeHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn stats(&self) -> &ReplicationStats {
        &self.stats
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    /// Stop the coordinator and wait for it
    pub async fn shutdown(self) -> Result<()> {
        self.engine.shutdown();
        self.task
            .await
            .map_err(|e| Error::Network(format!("Node task failed: {}", e)))?
    }
}

/// Single owner of the engine; processes events one at a time
async fn coordinate(
    mut engine: AntiEntropyEngine,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
    sweep_every: Duration,
) -> Result<()> {
    let mut readers: HashMap<PeerId, AbortHandle> = HashMap::new();
    let mut sweep = tokio::time::interval(sweep_every);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let result = loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break Ok(());
                };
                match event {
                    EngineEvent::PeerConnected { peer, addr, outbox, reader } => {
                        readers.insert(peer, reader);
                        engine.on_connect(peer, addr, outbox);
                    }
                    EngineEvent::Frame { peer, msg } => {
                        if let Err(e) = engine.handle(peer, msg) {
                            error!(peer = %peer, error = %e, "Anti-entropy engine failed");
                            break Err(e);
                        }
                    }
                    EngineEvent::PeerClosed { peer } => {
                        engine.on_disconnect(peer);
                        if let Some(reader) = readers.remove(&peer) {
                            reader.abort();
                        }
                    }
                    EngineEvent::Broadcast { key, op } => engine.broadcast(key, op),
                    EngineEvent::Inspect { response } => {
                        let _ = response.send(EngineSnapshot {
                            peers: engine.peers(),
                            pool_len: engine.pool().len(),
                        });
                    }
                    EngineEvent::Shutdown => {
                        info!("Coordinator shutting down");
                        break Ok(());
                    }
                }
            }
            _ = sweep.tick() => engine.expire_rounds(Instant::now()),
        }
    };

    for reader in readers.values() {
        reader.abort();
    }
    for line in engine.stats().summary() {
        debug!("{}", line);
    }
    result
}

async fn accept_loop(listener: TcpListener, ctx: Arc<Context>) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                debug!(remote = %remote, "Accepted connection");
                tokio::spawn(serve_connection(stream, remote, ctx.clone()));
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Serve requests until the client hangs up or offers a peer link
async fn serve_connection(stream: TcpStream, remote: SocketAddr, ctx: Arc<Context>) {
    let mut framed = ctx.framed(stream);

    while let Some(frame) = framed.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(e) => {
                debug!(remote = %remote, error = %e, "Bad frame, closing");
                let _ = framed.send(Message::error(&e.to_string())).await;
                return;
            }
        };
        debug!(remote = %remote, header = %msg.header, "Request");

        if msg.header == MessageHeader::ConnectOffer {
            match parse_endpoint(&msg) {
                Ok(offer) => {
                    if framed.send(Message::ok_empty()).await.is_err() {
                        return;
                    }
                    info!(remote = %remote, peer = %offer.endpoint(), "Accepted link offer");
                    attach_link(framed, offer.endpoint(), &ctx.engine);
                    return;
                }
                Err(e) => {
                    if framed.send(Message::no(&e.to_string())).await.is_err() {
                        return;
                    }
                    continue;
                }
            }
        }

        let reply = respond(&ctx, msg).await;
        if let Err(e) = framed.send(reply).await {
            debug!(remote = %remote, error = %e, "Reply failed");
            return;
        }
    }
}

async fn respond(ctx: &Context, msg: Message) -> Message {
    match msg.header {
        MessageHeader::Ping => Message::new(MessageHeader::Pong),
        MessageHeader::Connect => match parse_endpoint(&msg) {
            Ok(target) => {
                let endpoint = target.endpoint();
                match dial(ctx, &endpoint).await {
                    Ok(peer) => {
                        info!(peer = %peer, addr = %endpoint, "Connected to peer");
                        Message::ok(&ConnectReply { peer: endpoint })
                    }
                    Err(e) => {
                        warn!(addr = %endpoint, error = %e, "Failed to connect");
                        Message::no(&e.to_string())
                    }
                }
            }
            Err(e) => Message::no(&e.to_string()),
        },
        header if api::is_user_request(header) => {
            let outcome = api::handle_user_request(&ctx.storage, &ctx.keypair, &msg);
            if let Some((key, op)) = outcome.broadcast {
                ctx.engine.broadcast(key, op);
            }
            outcome.reply
        }
        other => Message::error(&format!("unknown header {}", other)),
    }
}

fn parse_endpoint(msg: &Message) -> Result<ConnectDto> {
    let dto: ConnectDto = msg.parse()?;
    dto.validate()?;
    Ok(dto)
}

/// Open a peer link to `endpoint` with a `CON?` offer
async fn dial(ctx: &Context, endpoint: &str) -> Result<PeerId> {
    let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(endpoint))
        .await
        .map_err(|_| Error::Network(format!("Timed out dialing {}", endpoint)))?
        .map_err(|e| Error::Network(format!("Failed to dial {}: {}", endpoint, e)))?;
    let mut framed = ctx.framed(stream);

    framed
        .send(Message::with_content(MessageHeader::ConnectOffer, &ctx.advertise)?)
        .await?;
    let reply = timeout(DIAL_TIMEOUT, framed.next())
        .await
        .map_err(|_| Error::Network(format!("{} did not answer the link offer", endpoint)))?
        .ok_or_else(|| Error::Network(format!("{} closed the connection", endpoint)))??;

    if reply.header != MessageHeader::Ok {
        return Err(Error::Network(format!(
            "{} refused the link: {} {}",
            endpoint,
            reply.header,
            reply.body_str()
        )));
    }
    Ok(attach_link(framed, endpoint.to_string(), &ctx.engine))
}

/// Hand a stream to the coordinator as a peer link
fn attach_link(framed: FrameStream, addr: String, engine: &EngineHandle) -> PeerId {
    let peer = engine.next_peer_id();
    let (sink, stream) = framed.split();
    let (outbox, outbox_rx) = mpsc::unbounded_channel();
    let (start_tx, start_rx) = oneshot::channel();

    tokio::spawn(write_loop(peer, sink, outbox_rx, engine.clone()));
    let reader = tokio::spawn(read_loop(peer, stream, start_rx, engine.clone()));

    engine.send(EngineEvent::PeerConnected {
        peer,
        addr,
        outbox,
        reader: reader.abort_handle(),
    });
    let _ = start_tx.send(());
    peer
}

async fn read_loop(
    peer: PeerId,
    mut stream: SplitStream<FrameStream>,
    start: oneshot::Receiver<()>,
    engine: EngineHandle,
) {
    if start.await.is_err() {
        return;
    }

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(msg) => {
                if !engine.send(EngineEvent::Frame { peer, msg }) {
                    return;
                }
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "Peer sent a bad frame");
                break;
            }
        }
    }
    engine.send(EngineEvent::PeerClosed { peer });
}

async fn write_loop(
    peer: PeerId,
    mut sink: SplitSink<FrameStream, Message>,
    mut outbox: mpsc::UnboundedReceiver<Message>,
    engine: EngineHandle,
) {
    while let Some(msg) = outbox.recv().await {
        if let Err(e) = sink.send(msg).await {
            warn!(peer = %peer, error = %e, "Write to peer failed");
            engine.send(EngineEvent::PeerClosed { peer });
            return;
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> NodeConfig {
        NodeConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let node = Node::bind(local_config(), Keypair::generate()).await.unwrap();
        assert_ne!(node.local_addr().port(), 0);
        assert!(node.storage().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_and_shutdown() {
        let node = Node::bind(local_config(), Keypair::generate()).await.unwrap();
        let handle = node.spawn();

        let snapshot = handle.engine().snapshot().await.unwrap();
        assert!(snapshot.peers.is_empty());
        assert_eq!(snapshot.pool_len, 0);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_pong_over_tcp() {
        let node = Node::bind(local_config(), Keypair::generate()).await.unwrap();
        let addr = node.local_addr();
        let handle = node.spawn();

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, FrameCodec::new());
        framed.send(Message::new(MessageHeader::Ping)).await.unwrap();
        let reply = framed.next().await.unwrap().unwrap();
        assert_eq!(reply.header, MessageHeader::Pong);

        framed.send(Message::new(MessageHeader::from_bytes(*b"ZZZZ"))).await.unwrap();
        let reply = framed.next().await.unwrap().unwrap();
        assert_eq!(reply.header, MessageHeader::Err);

        handle.shutdown().await.unwrap();
    }
}

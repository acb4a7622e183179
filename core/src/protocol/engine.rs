//! Anti-entropy engine
//!
//! Owns the global pool and the state of every peer link. Peers exchange
//! `HEAD` (their frontier for a key), `NEED` (hashes they are missing) and
//! `MSGS` (signed operations). Received operations are buffered per link and
//! per key until their whole causal history is known, then merged into the
//! pool and delivered to storage in topological order.
//!
//! The engine is synchronous and owned by a single coordinating task; frames
//! leave through each link's unbounded outbox so a slow peer never blocks it.

use crate::config::AntiEntropyConfig;
use crate::crdt::graph::topological_order;
use crate::crdt::ops::SignedOperation;
use crate::crypto::payload_author;
use crate::network::stats::ReplicationStats;
use crate::protocol::dto::MsgsDto;
use crate::protocol::message::{Message, MessageHeader};
use crate::protocol::pool::MessagePool;
use crate::storage::Storage;
use crate::types::{Key, OpHash, OpKind};
use crate::Result;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Identifier of a live peer link
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Operations buffered for one key while their history is incomplete
#[derive(Debug)]
struct PendingRound {
    recvd: BTreeMap<OpHash, SignedOperation>,
    missing: BTreeSet<OpHash>,
    opened_at: Instant,
    retries: u32,
}

impl PendingRound {
    fn new(now: Instant) -> Self {
        Self {
            recvd: BTreeMap::new(),
            missing: BTreeSet::new(),
            opened_at: now,
            retries: 0,
        }
    }
}

/// Per-link bookkeeping
#[derive(Debug, Default)]
pub struct ConnectionState {
    /// Hashes already forwarded on this link; never sent twice
    sent: HashSet<OpHash>,
    /// Operations known to be shared with this peer
    mconn: HashSet<OpHash>,
    rounds: HashMap<Key, PendingRound>,
}

impl ConnectionState {
    fn new(mconn: HashSet<OpHash>) -> Self {
        Self {
            mconn,
            ..Default::default()
        }
    }
}

struct PeerLink {
    addr: String,
    outbox: mpsc::UnboundedSender<Message>,
    state: ConnectionState,
}

impl PeerLink {
    fn send(&self, peer: PeerId, msg: Message, stats: &ReplicationStats) {
        let header = msg.header;
        if self.outbox.send(msg).is_err() {
            warn!(peer = %peer, addr = %self.addr, header = %header, "Peer writer is gone, frame dropped");
        } else {
            stats.record_frame_out();
        }
    }
}

/// Anti-entropy state machine for every link of this node
pub struct AntiEntropyEngine {
    storage: Arc<Storage>,
    pool: MessagePool,
    links: HashMap<PeerId, PeerLink>,
    config: AntiEntropyConfig,
    stats: ReplicationStats,
}

impl AntiEntropyEngine {
    pub fn new(storage: Arc<Storage>, config: AntiEntropyConfig, stats: ReplicationStats) -> Self {
        Self {
            storage,
            pool: MessagePool::new(),
            links: HashMap::new(),
            config,
            stats,
        }
    }

    pub fn stats(&self) -> &ReplicationStats {
        &self.stats
    }

    pub fn pool(&self) -> &MessagePool {
        &self.pool
    }

    pub fn peer_count(&self) -> usize {
        self.links.len()
    }

    pub fn peers(&self) -> Vec<(PeerId, String)> {
        let mut peers: Vec<(PeerId, String)> =
            self.links.iter().map(|(id, l)| (*id, l.addr.clone())).collect();
        peers.sort();
        peers
    }

    /// Keys with an unfinished round on `peer`
    pub fn pending_keys(&self, peer: PeerId) -> Vec<Key> {
        let mut keys: Vec<Key> = self
            .links
            .get(&peer)
            .map(|l| l.state.rounds.keys().copied().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Register a new link and open anti-entropy with our heads
    pub fn on_connect(&mut self, peer: PeerId, addr: String, outbox: mpsc::UnboundedSender<Message>) {
        let mconn: HashSet<OpHash> = self.pool.hashes().copied().collect();
        let link = PeerLink {
            addr,
            outbox,
            state: ConnectionState::new(mconn),
        };

        let heads = self.storage.heads();
        info!(peer = %peer, addr = %link.addr, keys = heads.len(), "Peer link established");
        for (key, hashes) in heads {
            match Message::with_content(MessageHeader::Heads, &MsgsDto::hashes(key, &hashes)) {
                Ok(msg) => link.send(peer, msg, &self.stats),
                Err(e) => warn!(key = ?key, error = %e, "Failed to encode heads"),
            }
        }

        self.stats.record_peer(true);
        self.links.insert(peer, link);
    }

    /// Drop a link along with any unfinished round
    pub fn on_disconnect(&mut self, peer: PeerId) {
        if let Some(link) = self.links.remove(&peer) {
            self.stats.record_peer(false);
            info!(
                peer = %peer,
                addr = %link.addr,
                pending_rounds = link.state.rounds.len(),
                "Peer link closed"
            );
        }
    }

    /// Process one inbound frame from `peer`.
    ///
    /// Bad peer input is logged and dropped; only an internal consistency
    /// failure is returned.
    pub fn handle(&mut self, peer: PeerId, msg: Message) -> Result<()> {
        if !self.links.contains_key(&peer) {
            debug!(peer = %peer, header = %msg.header, "Frame from unknown link ignored");
            return Ok(());
        }
        self.stats.record_frame_in();

        if !msg.header.is_anti_entropy() {
            debug!(peer = %peer, header = %msg.header, "Ignoring non anti-entropy frame on peer link");
            return Ok(());
        }

        let dto: MsgsDto = match msg.parse() {
            Ok(dto) => dto,
            Err(e) => {
                warn!(peer = %peer, header = %msg.header, error = %e, "Dropping malformed frame");
                return Ok(());
            }
        };

        match msg.header {
            MessageHeader::Heads => self.on_heads(peer, dto),
            MessageHeader::Msgs => self.on_msgs(peer, dto),
            MessageHeader::Needs => {
                self.on_needs(peer, dto);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn on_heads(&mut self, peer: PeerId, dto: MsgsDto) -> Result<()> {
        let heads = match dto.parse_hashes() {
            Ok(heads) => heads,
            Err(e) => {
                warn!(peer = %peer, key = ?dto.key, error = %e, "Dropping heads with bad hash");
                return Ok(());
            }
        };
        let Some(link) = self.links.get(&peer) else {
            return Ok(());
        };

        let missing: Vec<OpHash> = heads
            .into_iter()
            .filter(|h| !link.state.mconn.contains(h) && !self.pool.contains(h))
            .collect();
        debug!(peer = %peer, key = ?dto.key, missing = missing.len(), "Received heads");
        self.handle_missing(peer, dto.key, missing)
    }

    fn on_msgs(&mut self, peer: PeerId, dto: MsgsDto) -> Result<()> {
        let key = dto.key;
        let now = Instant::now();
        let Some(link) = self.links.get_mut(&peer) else {
            return Ok(());
        };

        let mut preds = BTreeSet::new();
        let mut accepted = 0usize;
        for entry in &dto.messages {
            let signed = match SignedOperation::from_hex(entry) {
                Ok(signed) => signed,
                Err(e) => {
                    warn!(peer = %peer, key = ?key, error = %e, "Dropping undecodable operation");
                    self.stats.record_invalid_op();
                    continue;
                }
            };
            let op = match signed.read() {
                Ok(op) => op,
                Err(e) => {
                    let author = payload_author(signed.as_bytes()).map(|k| hex::encode(&k.0[..8]));
                    warn!(
                        peer = %peer,
                        key = ?key,
                        op = ?signed.hash(),
                        author = ?author,
                        error = %e,
                        "Dropping invalid operation"
                    );
                    self.stats.record_invalid_op();
                    continue;
                }
            };

            preds.extend(op.preds.iter().copied());
            let round = link
                .state
                .rounds
                .entry(key)
                .or_insert_with(|| PendingRound::new(now));
            round.recvd.insert(signed.hash(), signed);
            accepted += 1;
        }

        if accepted == 0 && !link.state.rounds.contains_key(&key) {
            return Ok(());
        }

        let recvd = link.state.rounds.get(&key).map(|r| &r.recvd);
        let unresolved: Vec<OpHash> = preds
            .into_iter()
            .filter(|p| {
                !link.state.mconn.contains(p)
                    && !self.pool.contains(p)
                    && !recvd.map_or(false, |r| r.contains_key(p))
            })
            .collect();

        debug!(
            peer = %peer,
            key = ?key,
            received = accepted,
            unresolved = unresolved.len(),
            "Received operations"
        );
        self.handle_missing(peer, key, unresolved)
    }

    fn on_needs(&mut self, peer: PeerId, dto: MsgsDto) {
        let needs: HashSet<OpHash> = match dto.parse_hashes() {
            Ok(needs) => needs.into_iter().collect(),
            Err(e) => {
                warn!(peer = %peer, key = ?dto.key, error = %e, "Dropping needs with bad hash");
                return;
            }
        };
        let Some(link) = self.links.get_mut(&peer) else {
            return;
        };

        let serve_from_pool = self.config.serve_needs_from_pool;
        let mut reply: Vec<SignedOperation> = needs
            .iter()
            .filter(|h| !link.state.sent.contains(*h))
            .filter(|h| serve_from_pool || link.state.mconn.contains(*h))
            .filter_map(|h| self.pool.get(h).cloned())
            .collect();
        reply.sort_by_key(SignedOperation::hash);

        debug!(
            peer = %peer,
            key = ?dto.key,
            requested = needs.len(),
            served = reply.len(),
            "Received needs"
        );
        if reply.is_empty() {
            return;
        }

        link.state.sent.extend(reply.iter().map(SignedOperation::hash));
        match Message::with_content(MessageHeader::Msgs, &MsgsDto::operations(dto.key, &reply)) {
            Ok(msg) => link.send(peer, msg, &self.stats),
            Err(e) => warn!(key = ?dto.key, error = %e, "Failed to encode operations"),
        }
    }

    /// Fold `hashes` into the round for `key`; deliver it once nothing is missing
    fn handle_missing(&mut self, peer: PeerId, key: Key, hashes: Vec<OpHash>) -> Result<()> {
        let now = Instant::now();
        let pool = &self.pool;
        let Some(link) = self.links.get_mut(&peer) else {
            return Ok(());
        };

        let round = link
            .state
            .rounds
            .entry(key)
            .or_insert_with(|| PendingRound::new(now));
        round.missing.extend(hashes);
        let PendingRound { recvd, missing, .. } = &mut *round;
        missing.retain(|h| !recvd.contains_key(h) && !pool.contains(h));

        if !round.missing.is_empty() {
            let msg = Message::with_content(
                MessageHeader::Needs,
                &MsgsDto::hashes(key, &round.missing),
            );
            debug!(peer = %peer, key = ?key, missing = round.missing.len(), "Requesting missing operations");
            match msg {
                Ok(msg) => {
                    link.send(peer, msg, &self.stats);
                    self.stats.record_need_sent(key);
                }
                Err(e) => warn!(key = ?key, error = %e, "Failed to encode needs"),
            }
            return Ok(());
        }

        let Some(round) = link.state.rounds.remove(&key) else {
            return Ok(());
        };
        if round.recvd.is_empty() {
            return Ok(());
        }

        let mut settled = Vec::new();
        let mut newly = Vec::new();
        for (hash, op) in round.recvd {
            if self.pool.contains(&hash) {
                settled.push(hash);
            } else {
                newly.push(op);
            }
        }
        self.stats.record_round_completed(key);

        // Only operations storage accepts under `key` join the pool; a rejected
        // one stays requestable from any link.
        let ordered = topological_order(&newly)?;
        debug!(peer = %peer, key = ?key, delivering = ordered.len(), "Round complete");
        for op in ordered {
            if self.deliver(key, &op) {
                settled.push(op.hash());
                self.pool.insert(op);
            }
        }
        if let Some(link) = self.links.get_mut(&peer) {
            link.state.mconn.extend(settled);
        }
        self.resume_rounds(key)
    }

    /// Finish rounds on other links that were only waiting for operations now pooled
    fn resume_rounds(&mut self, key: Key) -> Result<()> {
        let ready: Vec<PeerId> = self
            .links
            .iter()
            .filter(|(_, link)| {
                link.state
                    .rounds
                    .get(&key)
                    .map_or(false, |r| r.missing.iter().all(|h| self.pool.contains(h)))
            })
            .map(|(peer, _)| *peer)
            .collect();

        for peer in ready {
            debug!(peer = %peer, key = ?key, "Resuming round satisfied by another link");
            self.handle_missing(peer, key, Vec::new())?;
        }
        Ok(())
    }

    /// Hand one operation to storage under `key`; `true` if it is now logged there
    fn deliver(&self, key: Key, op: &SignedOperation) -> bool {
        let result = match op.read() {
            Ok(decoded) if decoded.kind == OpKind::New => self.storage.assign(key, op.clone()),
            Ok(_) => self.storage.append(key, op.clone()).map(|_| ()),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.stats.record_delivery(key, true);
                true
            }
            Err(e) => {
                warn!(key = ?key, op = ?op.hash(), error = %e, "Could not deliver operation");
                self.stats.record_delivery(key, false);
                false
            }
        }
    }

    /// Pool a locally created operation and push it to every peer
    pub fn broadcast(&mut self, key: Key, op: SignedOperation) {
        let hash = op.hash();
        self.pool.insert(op.clone());

        let msg = match Message::with_content(
            MessageHeader::Msgs,
            &MsgsDto::operations(key, std::iter::once(&op)),
        ) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(key = ?key, error = %e, "Failed to encode broadcast");
                return;
            }
        };

        debug!(key = ?key, op = ?hash, peers = self.links.len(), "Broadcasting operation");
        for (peer, link) in self.links.iter_mut() {
            link.state.mconn.insert(hash);
            link.send(*peer, msg.clone(), &self.stats);
        }
    }

    /// Retry or abandon rounds older than the configured timeout
    pub fn expire_rounds(&mut self, now: Instant) {
        let timeout = self.config.round_timeout();
        let max_retries = self.config.max_round_retries;

        for (peer, link) in self.links.iter_mut() {
            let mut abandoned = Vec::new();
            let mut resend = Vec::new();

            for (key, round) in link.state.rounds.iter_mut() {
                if now.saturating_duration_since(round.opened_at) < timeout {
                    continue;
                }
                if round.retries >= max_retries || round.missing.is_empty() {
                    abandoned.push(*key);
                    continue;
                }

                round.retries += 1;
                round.opened_at = now;
                debug!(peer = %peer, key = ?key, retry = round.retries, "Re-sending needs");
                resend.push((*key, MsgsDto::hashes(*key, &round.missing)));
            }

            for (key, dto) in resend {
                match Message::with_content(MessageHeader::Needs, &dto) {
                    Ok(msg) => {
                        link.send(*peer, msg, &self.stats);
                        self.stats.record_need_sent(key);
                    }
                    Err(e) => warn!(key = ?key, error = %e, "Failed to encode needs"),
                }
            }

            for key in abandoned {
                if let Some(round) = link.state.rounds.remove(&key) {
                    warn!(
                        peer = %peer,
                        key = ?key,
                        missing = round.missing.len(),
                        discarded = round.recvd.len(),
                        "Abandoning anti-entropy round"
                    );
                    self.stats.record_round_abandoned(key);
                }
            }
        }
    }
}

/// Replication metrics and monitoring
///
/// Tracks anti-entropy rounds, operation delivery and link traffic per key

use crate::types::Key;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Metrics for a single key
#[derive(Debug, Clone)]
pub struct KeyStats {
    pub key: Key,

    /// Operations delivered into storage from peers
    pub ops_delivered: u64,

    /// Deliveries storage refused
    pub delivery_failures: u64,

    /// Rounds that resolved every missing predecessor
    pub rounds_completed: u64,

    /// Rounds given up after the retry budget ran out
    pub rounds_abandoned: u64,

    /// `NEED` frames sent, retries included
    pub needs_sent: u64,

    pub last_activity: Instant,
}

impl KeyStats {
    pub fn new(key: Key) -> Self {
        Self {
            key,
            ops_delivered: 0,
            delivery_failures: 0,
            rounds_completed: 0,
            rounds_abandoned: 0,
            needs_sent: 0,
            last_activity: Instant::now(),
        }
    }
}

/// Link-level counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkTotals {
    pub frames_in: u64,
    pub frames_out: u64,
    /// Operations dropped for bad signatures or payloads
    pub invalid_ops: u64,
    pub peers_connected: u64,
    pub peers_disconnected: u64,
}

#[derive(Debug, Default)]
struct Inner {
    keys: HashMap<Key, KeyStats>,
    totals: LinkTotals,
}

/// Replication statistics, shared between the coordinator and observers
#[derive(Debug, Clone, Default)]
pub struct ReplicationStats {
    inner: Arc<RwLock<Inner>>,
}

impl ReplicationStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_key(&self, key: Key, f: impl FnOnce(&mut KeyStats)) {
        let mut inner = self.inner.write();
        let entry = inner.keys.entry(key).or_insert_with(|| KeyStats::new(key));
        f(entry);
        entry.last_activity = Instant::now();
    }

    pub fn record_delivery(&self, key: Key, ok: bool) {
        self.with_key(key, |s| {
            if ok {
                s.ops_delivered += 1;
            } else {
                s.delivery_failures += 1;
            }
        });
    }

    pub fn record_round_completed(&self, key: Key) {
        self.with_key(key, |s| s.rounds_completed += 1);
    }

    pub fn record_round_abandoned(&self, key: Key) {
        self.with_key(key, |s| s.rounds_abandoned += 1);
    }

    pub fn record_need_sent(&self, key: Key) {
        self.with_key(key, |s| s.needs_sent += 1);
    }

    pub fn record_frame_in(&self) {
        self.inner.write().totals.frames_in += 1;
    }

    pub fn record_frame_out(&self) {
        self.inner.write().totals.frames_out += 1;
    }

    pub fn record_invalid_op(&self) {
        self.inner.write().totals.invalid_ops += 1;
    }

    pub fn record_peer(&self, connected: bool) {
        let mut inner = self.inner.write();
        if connected {
            inner.totals.peers_connected += 1;
        } else {
            inner.totals.peers_disconnected += 1;
        }
    }

    pub fn key_stats(&self, key: &Key) -> Option<KeyStats> {
        self.inner.read().keys.get(key).cloned()
    }

    pub fn totals(&self) -> LinkTotals {
        self.inner.read().totals.clone()
    }

    /// Sum of delivered operations over all keys
    pub fn ops_delivered(&self) -> u64 {
        self.inner.read().keys.values().map(|s| s.ops_delivered).sum()
    }

    /// One line per key plus the link totals
    pub fn summary(&self) -> Vec<String> {
        let inner = self.inner.read();
        let t = &inner.totals;
        let mut lines = vec![format!(
            "frames in/out {}/{}, invalid ops {}, peers +{} -{}",
            t.frames_in, t.frames_out, t.invalid_ops, t.peers_connected, t.peers_disconnected
        )];

        let mut keys: Vec<&KeyStats> = inner.keys.values().collect();
        keys.sort_by_key(|s| s.key);
        for s in keys {
            lines.push(format!(
                "{:?}: delivered {}, failed {}, rounds {} done / {} abandoned, needs {}, idle {:?}",
                s.key,
                s.ops_delivered,
                s.delivery_failures,
                s.rounds_completed,
                s.rounds_abandoned,
                s.needs_sent,
                s.last_activity.elapsed()
            ));
        }
        lines
    }
}

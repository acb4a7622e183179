//! Single in-process replica with its own key and storage

use crate::client::Client;
use crate::config::NodeConfig;
use crate::crdt::ops::SignedOperation;
use crate::crdt::reducer::CrdtValue;
use crate::crypto::signing::Keypair;
use crate::network::node::{EngineSnapshot, Node, NodeHandle};
use crate::network::stats::ReplicationStats;
use crate::storage::Storage;
use crate::types::{Key, OpHash};
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;

/// A running node bound to an ephemeral localhost port
///
/// Rounds expire after one second and the sweep runs every 100ms, so tests
/// that exercise retries finish quickly.
pub struct SmoothReplica {
    node: NodeHandle,
    keypair: Keypair,
}

impl SmoothReplica {
    /// Start a replica with a random identity
    pub async fn new() -> Result<Self> {
        Self::with_config(Self::test_config()).await
    }

    /// Start a replica with custom configuration
    pub async fn with_config(config: NodeConfig) -> Result<Self> {
        let keypair = Keypair::generate();
        let node = Node::bind(config, keypair.clone()).await?;

        Ok(Self {
            node: node.spawn(),
            keypair,
        })
    }

    /// Localhost config on an OS-assigned port with fast round expiry
    pub fn test_config() -> NodeConfig {
        let mut config = NodeConfig {
            listen: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Default::default()
        };
        config.anti_entropy.round_timeout_secs = 1;
        config.anti_entropy.sweep_interval_ms = 100;
        config
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn addr(&self) -> SocketAddr {
        self.node.local_addr()
    }

    pub fn storage(&self) -> &Arc<Storage> {
        self.node.storage()
    }

    pub fn stats(&self) -> &ReplicationStats {
        self.node.stats()
    }

    /// Open a fresh request connection
    pub async fn client(&self) -> Result<Client> {
        Ok(Client::connect(self.addr()).await?)
    }

    /// Ask this replica to open a link to `other`
    pub async fn link_to(&self, other: &SmoothReplica) -> Result<String> {
        let mut client = self.client().await?;
        let port = other.addr().port();
        Ok(client.connect_peer("127.0.0.1", port).await?)
    }

    /// Engine view: live links and pool size
    pub async fn engine(&self) -> Result<EngineSnapshot> {
        Ok(self.node.engine().snapshot().await?)
    }

    pub async fn peer_count(&self) -> Result<usize> {
        Ok(self.engine().await?.peers.len())
    }

    /// Local value of `key`, if the key is known here
    pub fn value(&self, key: &Key) -> Option<CrdtValue> {
        self.storage().get(key).ok().map(|snapshot| snapshot.value)
    }

    /// Sorted head hashes of `key`
    pub fn heads(&self, key: &Key) -> Option<Vec<OpHash>> {
        self.storage().get(key).ok().map(|snapshot| {
            let mut heads = snapshot.head_hashes();
            heads.sort();
            heads
        })
    }

    /// Full operation log of `key`
    pub fn operations(&self, key: &Key) -> Vec<SignedOperation> {
        self.storage().operations(key).unwrap_or_default()
    }

    /// Stop the node
    pub async fn shutdown(self) -> Result<()> {
        self.node.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CrdtType;

    #[tokio::test]
    async fn test_smooth_replica_creation() {
        let replica = SmoothReplica::new().await.unwrap();
        assert_ne!(replica.addr().port(), 0);
        assert!(replica.storage().is_empty());
        assert_eq!(replica.peer_count().await.unwrap(), 0);
        replica.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_smooth_replica_local_key() {
        let replica = SmoothReplica::new().await.unwrap();
        let mut client = replica.client().await.unwrap();
        client.ping().await.unwrap();

        let key = client.new_key(CrdtType::GSet).await.unwrap();
        assert_eq!(replica.heads(&key), Some(vec![key]));
        assert_eq!(replica.value(&key), Some(CrdtValue::Set(vec![])));
        assert_eq!(replica.operations(&key).len(), 1);
    }
}

//! Batch of replicas that can be linked to each other

use super::{await_peers, SmoothReplica};
use crate::config::NodeConfig;
use anyhow::Result;
use std::ops::Index;

/// A collection of SmoothReplicas
///
/// Operations are only forwarded to direct peers, so replicas that must all
/// converge on fresh updates should be linked with [`connect_all`].
///
/// [`connect_all`]: SmoothReplicaBatch::connect_all
pub struct SmoothReplicaBatch {
    replicas: Vec<SmoothReplica>,
}

impl SmoothReplicaBatch {
    /// Start N unlinked replicas
    pub async fn new(count: usize) -> Result<Self> {
        Self::with_config(count, SmoothReplica::test_config()).await
    }

    /// Start N unlinked replicas sharing one configuration
    pub async fn with_config(count: usize, config: NodeConfig) -> Result<Self> {
        let mut replicas = Vec::with_capacity(count);
        for _ in 0..count {
            replicas.push(SmoothReplica::with_config(config.clone()).await?);
        }
        Ok(Self { replicas })
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SmoothReplica> {
        self.replicas.iter()
    }

    pub fn get(&self, index: usize) -> Option<&SmoothReplica> {
        self.replicas.get(index)
    }

    /// Link every pair once and wait until each replica sees all the others
    pub async fn connect_all(&self) -> Result<()> {
        for (i, replica) in self.replicas.iter().enumerate() {
            for other in &self.replicas[i + 1..] {
                replica.link_to(other).await?;
            }
        }

        let expected = self.replicas.len().saturating_sub(1);
        for replica in &self.replicas {
            await_peers(5, replica, expected).await?;
        }
        Ok(())
    }

    /// Stop every replica
    pub async fn shutdown(self) -> Result<()> {
        for replica in self.replicas {
            replica.shutdown().await?;
        }
        Ok(())
    }

    pub fn into_inner(self) -> Vec<SmoothReplica> {
        self.replicas
    }
}

impl Index<usize> for SmoothReplicaBatch {
    type Output = SmoothReplica;

    fn index(&self, index: usize) -> &Self::Output {
        &self.replicas[index]
    }
}

//! Utilities for waiting on replication

use super::{SmoothReplica, SmoothReplicaBatch};
use crate::crdt::reducer::CrdtValue;
use crate::types::Key;
use anyhow::{bail, Result};
use std::time::Duration;

/// Wait until every replica holds `key` with the same value and heads
///
/// Returns the converged value.
pub async fn await_convergence(
    timeout_secs: u64,
    replicas: &[&SmoothReplica],
    key: Key,
) -> Result<CrdtValue> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);

    loop {
        if let Some(value) = converged(replicas, &key) {
            return Ok(value);
        }
        if tokio::time::Instant::now() > deadline {
            let views: Vec<String> = replicas
                .iter()
                .map(|r| format!("{}: {:?}", r.addr(), r.value(&key)))
                .collect();
            bail!(
                "key {} did not converge after {}s: {}",
                key,
                timeout_secs,
                views.join(", ")
            );
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn converged(replicas: &[&SmoothReplica], key: &Key) -> Option<CrdtValue> {
    let (first, rest) = replicas.split_first()?;
    let value = first.value(key)?;
    let heads = first.heads(key)?;

    rest.iter()
        .all(|r| r.value(key).as_ref() == Some(&value) && r.heads(key).as_ref() == Some(&heads))
        .then_some(value)
}

/// Wait until `replica` has at least `count` live links
pub async fn await_peers(timeout_secs: u64, replica: &SmoothReplica, count: usize) -> Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);

    loop {
        let peers = replica.peer_count().await?;
        if peers >= count {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            bail!(
                "{} has {} peers after {}s, expected {}",
                replica.addr(),
                peers,
                timeout_secs,
                count
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Wait for the whole batch to converge on `key`
pub async fn await_batch_convergence(
    timeout_secs: u64,
    batch: &SmoothReplicaBatch,
    key: Key,
) -> Result<CrdtValue> {
    let replicas: Vec<&SmoothReplica> = batch.iter().collect();
    await_convergence(timeout_secs, &replicas, key).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_convergence_timeout() {
        let batch = SmoothReplicaBatch::new(2).await.unwrap();
        let key = Key::from_hex(&"42".repeat(32)).unwrap();

        // Nobody holds the key
        let result = await_batch_convergence(1, &batch, key).await;
        assert!(result.is_err());
    }
}

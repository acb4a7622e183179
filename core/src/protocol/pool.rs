//! Global pool of accepted operations

use crate::crdt::ops::SignedOperation;
use crate::types::OpHash;
use std::collections::HashMap;

/// Every signed operation this node has accepted, indexed by hash.
///
/// Grows monotonically; entries are never removed.
#[derive(Debug, Default)]
pub struct MessagePool {
    ops: HashMap<OpHash, SignedOperation>,
}

impl MessagePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the operation was not yet pooled
    pub fn insert(&mut self, op: SignedOperation) -> bool {
        let hash = op.hash();
        if self.ops.contains_key(&hash) {
            return false;
        }
        self.ops.insert(hash, op);
        true
    }

    pub fn contains(&self, hash: &OpHash) -> bool {
        self.ops.contains_key(hash)
    }

    pub fn get(&self, hash: &OpHash) -> Option<&SignedOperation> {
        self.ops.get(hash)
    }

    pub fn hashes(&self) -> impl Iterator<Item = &OpHash> {
        self.ops.keys()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::ops::new_crdt;
    use crate::crypto::signing::Keypair;
    use crate::types::CrdtType;

    #[test]
    fn test_insert_is_idempotent() {
        let keypair = Keypair::generate();
        let (op, key) = new_crdt(&keypair, CrdtType::Counter).unwrap();
        let mut pool = MessagePool::new();

        assert!(pool.insert(op.clone()));
        assert!(!pool.insert(op.clone()));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.get(&key), Some(&op));
    }
}

//! In-memory key space
//!
//! One `StorageCell` per key, all guarded by a single readers-writer lock.
//! Reads take the shared lock; `assign` and `append` hold the exclusive lock
//! for the log mutation and the recompute only.

pub mod cell;

pub use cell::{CellSnapshot, StorageCell};

use crate::crdt::ops::SignedOperation;
use crate::types::{Key, OpHash};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

/// Storage manager
#[derive(Debug, Default)]
pub struct Storage {
    cells: RwLock<HashMap<Key, StorageCell>>,
}

impl Storage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `key` from its genesis operation
    pub fn assign(&self, key: Key, genesis: SignedOperation) -> Result<()> {
        let mut cells = self.cells.write();
        if cells.contains_key(&key) {
            return Err(Error::KeyExists(key));
        }
        let cell = StorageCell::create(key, genesis)?;
        debug!(key = ?key, crdt = %cell.crdt_type(), "Assigned key");
        cells.insert(key, cell);
        Ok(())
    }

    /// Append an operation to `key`.
    ///
    /// Returns `false` if the operation was already in the log.
    pub fn append(&self, key: Key, op: SignedOperation) -> Result<bool> {
        let mut cells = self.cells.write();
        let cell = cells.get_mut(&key).ok_or(Error::UnknownKey(key))?;
        let appended = cell.append(op)?;
        if appended {
            debug!(key = ?key, ops = cell.operations().len(), "Appended operation");
        }
        Ok(appended)
    }

    /// Current value, heads and type of `key`
    pub fn get(&self, key: &Key) -> Result<CellSnapshot> {
        self.cells
            .read()
            .get(key)
            .map(StorageCell::snapshot)
            .ok_or(Error::UnknownKey(*key))
    }

    /// Head hashes of every key, ordered by key
    pub fn heads(&self) -> Vec<(Key, Vec<OpHash>)> {
        let cells = self.cells.read();
        let mut heads: Vec<(Key, Vec<OpHash>)> = cells
            .iter()
            .map(|(key, cell)| (*key, cell.head_hashes()))
            .collect();
        heads.sort_by_key(|(key, _)| *key);
        heads
    }

    /// Full log of `key`
    pub fn operations(&self, key: &Key) -> Result<Vec<SignedOperation>> {
        self.cells
            .read()
            .get(key)
            .map(|cell| cell.operations().to_vec())
            .ok_or(Error::UnknownKey(*key))
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.cells.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.cells.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::ops::{new_crdt, OpPayload, Operation, SetElement};
    use crate::crdt::reducer::CrdtValue;
    use crate::crypto::signing::Keypair;
    use crate::types::{CrdtType, OpKind};
    use serde_json::json;

    fn counter_op(keypair: &Keypair, kind: OpKind, n: i64, heads: &[SignedOperation]) -> SignedOperation {
        Operation::successor(kind, CrdtType::Counter, OpPayload::Amount(n), heads)
            .sign(keypair)
            .unwrap()
    }

    #[test]
    fn test_assign_and_get() -> Result<()> {
        let keypair = Keypair::generate();
        let storage = Storage::new();
        let (genesis, key) = new_crdt(&keypair, CrdtType::Counter)?;

        storage.assign(key, genesis)?;
        let snapshot = storage.get(&key)?;
        assert_eq!(snapshot.value, CrdtValue::Counter(0));
        assert_eq!(snapshot.head_hashes(), vec![key]);
        assert_eq!(snapshot.crdt_type, CrdtType::Counter);
        Ok(())
    }

    #[test]
    fn test_assign_twice_fails() -> Result<()> {
        let keypair = Keypair::generate();
        let storage = Storage::new();
        let (genesis, key) = new_crdt(&keypair, CrdtType::GSet)?;

        storage.assign(key, genesis.clone())?;
        assert!(matches!(storage.assign(key, genesis), Err(Error::KeyExists(_))));
        Ok(())
    }

    #[test]
    fn test_assign_rejects_bad_genesis() -> Result<()> {
        let keypair = Keypair::generate();
        let storage = Storage::new();
        let (genesis, key) = new_crdt(&keypair, CrdtType::Counter)?;

        // key does not match the hash
        let other = OpHash([9u8; 32]);
        assert!(matches!(
            storage.assign(other, genesis.clone()),
            Err(Error::MalformedPayload(_))
        ));

        // not a new operation
        let inc = counter_op(&keypair, OpKind::Inc, 1, &[genesis.clone()]);
        assert!(matches!(storage.assign(inc.hash(), inc), Err(Error::MalformedPayload(_))));

        // tampered bytes
        let mut broken = genesis;
        broken.0[50] ^= 1;
        assert!(matches!(storage.assign(key, broken), Err(Error::MalformedPayload(_))));
        assert!(storage.is_empty());
        Ok(())
    }

    #[test]
    fn test_append_updates_heads_and_value() -> Result<()> {
        let keypair = Keypair::generate();
        let storage = Storage::new();
        let (genesis, key) = new_crdt(&keypair, CrdtType::Counter)?;
        storage.assign(key, genesis.clone())?;

        let inc = counter_op(&keypair, OpKind::Inc, 5, &[genesis.clone()]);
        let dec = counter_op(&keypair, OpKind::Dec, 3, &[genesis]);
        assert!(storage.append(key, inc.clone())?);
        assert!(storage.append(key, dec.clone())?);

        let snapshot = storage.get(&key)?;
        assert_eq!(snapshot.value, CrdtValue::Counter(2));
        let mut expected = vec![inc.hash(), dec.hash()];
        expected.sort();
        assert_eq!(snapshot.head_hashes(), expected);
        Ok(())
    }

    #[test]
    fn test_append_is_idempotent() -> Result<()> {
        let keypair = Keypair::generate();
        let storage = Storage::new();
        let (genesis, key) = new_crdt(&keypair, CrdtType::Counter)?;
        storage.assign(key, genesis.clone())?;

        let inc = counter_op(&keypair, OpKind::Inc, 7, &[genesis]);
        assert!(storage.append(key, inc.clone())?);
        assert!(!storage.append(key, inc)?);
        assert_eq!(storage.get(&key)?.value, CrdtValue::Counter(7));
        assert_eq!(storage.operations(&key)?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_append_errors() -> Result<()> {
        let keypair = Keypair::generate();
        let storage = Storage::new();
        let (genesis, key) = new_crdt(&keypair, CrdtType::Counter)?;

        let inc = counter_op(&keypair, OpKind::Inc, 1, &[genesis.clone()]);
        assert!(matches!(storage.append(key, inc.clone()), Err(Error::UnknownKey(_))));

        storage.assign(key, genesis.clone())?;

        // predecessor not in the log
        let orphan = counter_op(&keypair, OpKind::Inc, 1, &[inc.clone()]);
        assert!(matches!(
            storage.append(key, orphan),
            Err(Error::UnknownPredecessor(h)) if h == inc.hash()
        ));

        // set op on a counter key
        let add = Operation::successor(
            OpKind::Add,
            CrdtType::GSet,
            OpPayload::Element(SetElement::new(json!(1))),
            &[genesis],
        )
        .sign(&keypair)?;
        assert!(matches!(storage.append(key, add), Err(Error::TypeMismatch { .. })));

        // a second genesis
        let (other, _) = new_crdt(&keypair, CrdtType::Counter)?;
        assert!(matches!(storage.append(key, other), Err(Error::MalformedPayload(_))));

        assert_eq!(storage.get(&key)?.value, CrdtValue::Counter(0));
        Ok(())
    }

    #[test]
    fn test_heads_snapshot() -> Result<()> {
        let keypair = Keypair::generate();
        let storage = Storage::new();
        let (a, ka) = new_crdt(&keypair, CrdtType::Counter)?;
        let (b, kb) = new_crdt(&keypair, CrdtType::TwoPhaseSet)?;
        storage.assign(ka, a)?;
        storage.assign(kb, b)?;

        let heads = storage.heads();
        assert_eq!(heads.len(), 2);
        assert!(heads.contains(&(ka, vec![ka])));
        assert!(heads.contains(&(kb, vec![kb])));
        assert!(heads[0].0 < heads[1].0);
        Ok(())
    }
}

//! Append-only operation log for one key

use crate::crdt::ops::{Operation, SignedOperation};
use crate::crdt::reducer::{CrdtValue, Reducer};
use crate::types::{CrdtType, Key, OpHash, OpKind};
use crate::{Error, Result};
use std::collections::{BTreeMap, HashSet};

/// Point-in-time view of a cell
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CellSnapshot {
    pub value: CrdtValue,
    pub heads: Vec<SignedOperation>,
    pub crdt_type: CrdtType,
}

impl CellSnapshot {
    pub fn head_hashes(&self) -> Vec<OpHash> {
        self.heads.iter().map(SignedOperation::hash).collect()
    }
}

/// Log of every operation accepted under one key.
///
/// Only causally complete operations are logged, so heads and value are kept
/// up to date incrementally: each operation is verified and decoded once, on
/// the way in.
#[derive(Debug)]
pub struct StorageCell {
    operations: Vec<SignedOperation>,
    known: HashSet<OpHash>,
    crdt_type: CrdtType,
    heads: BTreeMap<OpHash, SignedOperation>,
    reducer: Reducer,
}

impl StorageCell {
    /// Open a cell from its genesis operation
    pub(crate) fn create(key: Key, genesis: SignedOperation) -> Result<Self> {
        let op = decode(&genesis)?;
        if op.kind != OpKind::New {
            return Err(Error::MalformedPayload(format!(
                "cannot assign a {} operation",
                op.kind
            )));
        }
        if genesis.hash() != key {
            return Err(Error::MalformedPayload(format!(
                "genesis hash {} does not match key {}",
                genesis.hash(),
                key
            )));
        }

        Ok(Self {
            known: HashSet::from([key]),
            crdt_type: op.crdt_type,
            heads: BTreeMap::from([(key, genesis.clone())]),
            reducer: Reducer::new(op.crdt_type),
            operations: vec![genesis],
        })
    }

    /// Add an operation whose whole history is already logged.
    ///
    /// Returns `false` when the operation was logged before.
    pub(crate) fn append(&mut self, signed: SignedOperation) -> Result<bool> {
        let hash = signed.hash();
        if self.known.contains(&hash) {
            return Ok(false);
        }

        let op = decode(&signed)?;
        if op.kind == OpKind::New {
            return Err(Error::MalformedPayload(
                "new operations can only be assigned".to_string(),
            ));
        }
        if op.crdt_type != self.crdt_type {
            return Err(Error::TypeMismatch {
                expected: self.crdt_type,
                actual: op.crdt_type,
            });
        }
        if let Some(pred) = op.preds.iter().find(|p| !self.known.contains(*p)) {
            return Err(Error::UnknownPredecessor(*pred));
        }

        self.reducer.apply(&op)?;
        // nothing logged can name an unseen hash, so the new operation is a head
        for pred in &op.preds {
            self.heads.remove(pred);
        }
        self.heads.insert(hash, signed.clone());
        self.operations.push(signed);
        self.known.insert(hash);
        Ok(true)
    }

    pub fn snapshot(&self) -> CellSnapshot {
        CellSnapshot {
            value: self.reducer.value(),
            heads: self.heads.values().cloned().collect(),
            crdt_type: self.crdt_type,
        }
    }

    /// Head hashes in ascending order
    pub fn head_hashes(&self) -> Vec<OpHash> {
        self.heads.keys().copied().collect()
    }

    pub fn operations(&self) -> &[SignedOperation] {
        &self.operations
    }

    pub fn crdt_type(&self) -> CrdtType {
        self.crdt_type
    }

    pub fn contains(&self, hash: &OpHash) -> bool {
        self.known.contains(hash)
    }
}

fn decode(signed: &SignedOperation) -> Result<Operation> {
    signed.read().map_err(|e| match e {
        Error::InvalidSignature => {
            Error::MalformedPayload("operation signature does not verify".to_string())
        }
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::graph::calculate_operations;
    use crate::crdt::ops::{new_crdt, OpPayload, SetElement};
    use crate::crdt::reducer::CrdtValue;
    use crate::crypto::signing::Keypair;
    use serde_json::json;
    use std::time::{Duration, Instant};

    fn counter_op(keypair: &Keypair, n: i64, heads: &[SignedOperation]) -> SignedOperation {
        Operation::successor(OpKind::Inc, CrdtType::Counter, OpPayload::Amount(n), heads)
            .sign(keypair)
            .unwrap()
    }

    #[test]
    fn test_incremental_state_matches_full_recompute() {
        let keypair = Keypair::generate();
        let (genesis, key) = new_crdt(&keypair, CrdtType::TwoPhaseSet).unwrap();
        let mut cell = StorageCell::create(key, genesis.clone()).unwrap();

        let element = |v| OpPayload::Element(SetElement::new(v));
        let add_a = Operation::successor(OpKind::Add, CrdtType::TwoPhaseSet, element(json!("a")), &[genesis.clone()])
            .sign(&keypair)
            .unwrap();
        let add_b = Operation::successor(OpKind::Add, CrdtType::TwoPhaseSet, element(json!("b")), &[genesis])
            .sign(&keypair)
            .unwrap();
        let rmv_a = Operation::successor(
            OpKind::Rmv,
            CrdtType::TwoPhaseSet,
            element(json!("a")),
            &[add_a.clone(), add_b.clone()],
        )
        .sign(&keypair)
        .unwrap();
        let add_c = Operation::successor(OpKind::Add, CrdtType::TwoPhaseSet, element(json!("c")), &[add_b.clone()])
            .sign(&keypair)
            .unwrap();

        for op in [add_a, add_b, rmv_a, add_c] {
            assert!(cell.append(op).unwrap());

            let full = calculate_operations(cell.operations(), CrdtType::TwoPhaseSet);
            let snapshot = cell.snapshot();
            assert_eq!(snapshot.value, full.value);
            assert_eq!(snapshot.head_hashes(), full.head_hashes());
        }
        assert_eq!(cell.snapshot().value, CrdtValue::Set(vec![json!("b"), json!("c")]));
        assert_eq!(cell.head_hashes().len(), 2);
    }

    #[test]
    fn test_long_chain_appends_stay_linear() {
        const CHAIN: usize = 1500;

        let keypair = Keypair::generate();
        let (genesis, key) = new_crdt(&keypair, CrdtType::Counter).unwrap();
        let mut cell = StorageCell::create(key, genesis.clone()).unwrap();

        let mut chain = Vec::with_capacity(CHAIN);
        let mut prev = genesis;
        for _ in 0..CHAIN {
            let op = counter_op(&keypair, 1, &[prev]);
            chain.push(op.clone());
            prev = op;
        }

        // one verification per append; a full re-verify per append would
        // need over a million here
        let start = Instant::now();
        for op in chain {
            cell.append(op).unwrap();
        }
        assert!(start.elapsed() < Duration::from_secs(60), "took {:?}", start.elapsed());

        let snapshot = cell.snapshot();
        assert_eq!(snapshot.value, CrdtValue::Counter(CHAIN as i64));
        assert_eq!(snapshot.head_hashes(), vec![prev.hash()]);
    }
}

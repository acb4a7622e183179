//! Causal graph over a pool of signed operations
//!
//! The pool may come from an untrusted peer: entries that fail signature
//! verification, fail to decode, or carry the wrong CRDT type are skipped, and
//! operations whose causal history is not fully present are pruned. What
//! survives is a DAG whose frontier (tier 0) is the set of heads.

use crate::crdt::ops::{Operation, SignedOperation};
use crate::crdt::reducer::{CrdtValue, Reducer};
use crate::types::{CrdtType, OpHash};
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

/// Outcome of folding a pool of operations
#[derive(Clone, Debug)]
pub struct OpCalcResult {
    /// Frontier operations, ordered by hash
    pub heads: Vec<SignedOperation>,

    /// Reduced value of every surviving operation
    pub value: CrdtValue,

    /// Predecessors referenced by the pool but absent from it
    pub preds_missing: BTreeSet<OpHash>,

    pub crdt_type: CrdtType,
}

impl OpCalcResult {
    pub fn head_hashes(&self) -> Vec<OpHash> {
        self.heads.iter().map(SignedOperation::hash).collect()
    }
}

#[derive(Debug)]
struct Node {
    signed: SignedOperation,
    preds: BTreeSet<OpHash>,
    succs: Vec<OpHash>,
    tier: usize,
}

/// DAG over a set of causally complete operations
#[derive(Debug)]
pub struct CausalGraph {
    nodes: BTreeMap<OpHash, Node>,
}

impl CausalGraph {
    /// Build a graph over decoded operations.
    ///
    /// Predecessor edges pointing outside the set are dropped.
    fn build(ops: BTreeMap<OpHash, (SignedOperation, Operation)>) -> Self {
        let mut nodes: BTreeMap<OpHash, Node> = ops
            .into_iter()
            .map(|(hash, (signed, op))| {
                let preds = op.preds.into_iter().collect();
                (
                    hash,
                    Node {
                        signed,
                        preds,
                        succs: Vec::new(),
                        tier: 0,
                    },
                )
            })
            .collect();

        let edges: Vec<(OpHash, OpHash)> = nodes
            .iter()
            .flat_map(|(hash, node)| node.preds.iter().map(move |pred| (*pred, *hash)))
            .collect();

        for (pred, succ) in edges {
            if let Some(node) = nodes.get_mut(&pred) {
                node.succs.push(succ);
            }
        }

        let mut graph = Self { nodes };
        graph.assign_tiers();
        graph
    }

    /// Longest distance from each node to the frontier.
    ///
    /// Iterative post-order walk; a chain of any depth uses heap memory only.
    fn assign_tiers(&mut self) {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Visit {
            Open,
            Done,
        }

        let mut state: HashMap<OpHash, Visit> = HashMap::with_capacity(self.nodes.len());
        let roots: Vec<OpHash> = self.nodes.keys().copied().collect();

        for root in roots {
            if state.contains_key(&root) {
                continue;
            }

            let mut stack = vec![(root, false)];
            while let Some((hash, expanded)) = stack.pop() {
                if expanded {
                    let tier = self.nodes[&hash]
                        .succs
                        .iter()
                        .filter(|s| state.get(*s) == Some(&Visit::Done))
                        .map(|s| self.nodes[s].tier + 1)
                        .max()
                        .unwrap_or(0);
                    if let Some(node) = self.nodes.get_mut(&hash) {
                        node.tier = tier;
                    }
                    state.insert(hash, Visit::Done);
                    continue;
                }

                if state.contains_key(&hash) {
                    // already done, or an open ancestor (cycle)
                    continue;
                }
                state.insert(hash, Visit::Open);
                stack.push((hash, true));
                for succ in &self.nodes[&hash].succs {
                    if !state.contains_key(succ) {
                        stack.push((*succ, false));
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn tier(&self, hash: &OpHash) -> Option<usize> {
        self.nodes.get(hash).map(|n| n.tier)
    }

    /// Tier-0 operations, ordered by hash
    pub fn heads(&self) -> Vec<SignedOperation> {
        self.nodes
            .values()
            .filter(|n| n.tier == 0)
            .map(|n| n.signed.clone())
            .collect()
    }

    /// Kahn's algorithm; ready nodes are taken in hash order
    fn kahn(&self) -> Vec<OpHash> {
        let mut in_degree: HashMap<OpHash, usize> = self
            .nodes
            .iter()
            .map(|(hash, node)| {
                let resolvable = node.preds.iter().filter(|p| self.nodes.contains_key(*p)).count();
                (*hash, resolvable)
            })
            .collect();

        let mut ready: BTreeSet<OpHash> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(h, _)| *h)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(hash) = ready.pop_first() {
            order.push(hash);
            for succ in &self.nodes[&hash].succs {
                if let Some(d) = in_degree.get_mut(succ) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(*succ);
                    }
                }
            }
        }
        order
    }
}

/// Verify and decode every entry, collapsing duplicates.
///
/// With `crdt_type` set, operations of any other type are skipped.
fn decode_pool(
    pool: &[SignedOperation],
    crdt_type: Option<CrdtType>,
) -> BTreeMap<OpHash, (SignedOperation, Operation)> {
    let mut decoded = BTreeMap::new();
    for signed in pool {
        let hash = signed.hash();
        if decoded.contains_key(&hash) {
            continue;
        }
        match signed.read() {
            Ok(op) => {
                if let Some(expected) = crdt_type {
                    if op.crdt_type != expected {
                        warn!(
                            op = ?hash,
                            expected = %expected,
                            actual = %op.crdt_type,
                            "Skipping operation of wrong crdt type"
                        );
                        continue;
                    }
                }
                decoded.insert(hash, (signed.clone(), op));
            }
            Err(e) => warn!(op = ?hash, error = %e, "Skipping invalid operation"),
        }
    }
    decoded
}

/// Derive heads and value for one object from a pool of its operations.
///
/// Never fails: bad entries and causally incomplete operations are excluded.
/// `preds_missing` lists the predecessors absent on the first pruning pass.
pub fn calculate_operations(pool: &[SignedOperation], crdt_type: CrdtType) -> OpCalcResult {
    let mut survivors = decode_pool(pool, Some(crdt_type));
    let mut preds_missing = BTreeSet::new();
    let mut first_pass = true;

    loop {
        let mut doomed = Vec::new();
        for (hash, (_, op)) in &survivors {
            let mut incomplete = false;
            for pred in &op.preds {
                if !survivors.contains_key(pred) {
                    incomplete = true;
                    if first_pass {
                        preds_missing.insert(*pred);
                    }
                }
            }
            if incomplete {
                doomed.push(*hash);
            }
        }

        if doomed.is_empty() {
            break;
        }
        for hash in doomed {
            debug!(op = ?hash, "Pruning operation with unresolved history");
            survivors.remove(&hash);
        }
        first_pass = false;
    }

    let mut reducer = Reducer::new(crdt_type);
    for (hash, (_, op)) in &survivors {
        if let Err(e) = reducer.apply(op) {
            warn!(op = ?hash, error = %e, "Reducer rejected operation");
        }
    }

    let graph = CausalGraph::build(survivors);
    OpCalcResult {
        heads: graph.heads(),
        value: reducer.value(),
        preds_missing,
        crdt_type,
    }
}

/// Order a pool so every operation follows its resolvable predecessors.
///
/// Predecessors outside the pool are ignored. Fails with
/// `InternalConsistency` if the sort cannot place every valid operation.
pub fn topological_order(pool: &[SignedOperation]) -> Result<Vec<SignedOperation>> {
    let graph = CausalGraph::build(decode_pool(pool, None));
    let order = graph.kahn();

    if order.len() != graph.len() {
        return Err(Error::InternalConsistency(format!(
            "topological sort placed {} of {} operations",
            order.len(),
            graph.len()
        )));
    }

    Ok(order
        .into_iter()
        .filter_map(|hash| graph.nodes.get(&hash).map(|n| n.signed.clone()))
        .collect())
}

//! CRDT (Conflict-free Replicated Data Types) module
//!
//! This module implements the operation layer of the store, including:
//! - Signed, hash-linked operations and their wire encoding
//! - Per-type reducers (counter, grow-only set, two-phase set)
//! - The causal graph: pruning, heads, topological delivery order

pub mod graph;
pub mod ops;
pub mod reducer;

pub use graph::{calculate_operations, topological_order, CausalGraph, OpCalcResult};
pub use ops::{new_crdt, read_operation, OpPayload, Operation, SetElement, SignedOperation};
pub use reducer::{initial_value, CrdtValue, Reducer};

//! Per-type folds of validated operations into a value
//!
//! Every reducer is commutative and idempotent per distinct operation, so the
//! graph engine may feed surviving operations in any order.

use crate::crdt::ops::{Operation, SetElement};
use crate::types::{CrdtType, OpKind};
use crate::{Error, Result};
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Reduced value of an object
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum CrdtValue {
    Counter(i64),
    Set(Vec<Value>),
}

impl CrdtValue {
    pub fn as_counter(&self) -> Option<i64> {
        match self {
            CrdtValue::Counter(n) => Some(*n),
            CrdtValue::Set(_) => None,
        }
    }

    pub fn as_set(&self) -> Option<&[Value]> {
        match self {
            CrdtValue::Set(items) => Some(items),
            CrdtValue::Counter(_) => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            CrdtValue::Counter(n) => Value::from(*n),
            CrdtValue::Set(items) => Value::Array(items.clone()),
        }
    }
}

impl Serialize for CrdtValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            CrdtValue::Counter(n) => serializer.serialize_i64(*n),
            CrdtValue::Set(items) => items.serialize(serializer),
        }
    }
}

/// Fold state for one CRDT type
#[derive(Debug)]
pub enum Reducer {
    /// Exact running total; clamped to `i64` only when read
    Counter(i128),
    GSet(BTreeSet<SetElement>),
    /// Element -> present; `false` is a tombstone
    TwoPhaseSet(BTreeMap<SetElement, bool>),
}

impl Reducer {
    pub fn new(crdt_type: CrdtType) -> Self {
        match crdt_type {
            CrdtType::Counter => Reducer::Counter(0),
            CrdtType::GSet => Reducer::GSet(BTreeSet::new()),
            CrdtType::TwoPhaseSet => Reducer::TwoPhaseSet(BTreeMap::new()),
        }
    }

    pub fn crdt_type(&self) -> CrdtType {
        match self {
            Reducer::Counter(_) => CrdtType::Counter,
            Reducer::GSet(_) => CrdtType::GSet,
            Reducer::TwoPhaseSet(_) => CrdtType::TwoPhaseSet,
        }
    }

    /// Fold one operation.
    ///
    /// Fails with `WrongCrdtType` when the operation belongs to another type;
    /// callers skip such operations.
    pub fn apply(&mut self, op: &Operation) -> Result<()> {
        let expected = self.crdt_type();
        if op.crdt_type != expected {
            return Err(Error::WrongCrdtType {
                expected,
                actual: op.crdt_type,
            });
        }

        match self {
            Reducer::Counter(total) => match (op.kind, op.amount()) {
                (OpKind::Inc, Some(n)) => *total = total.wrapping_add(i128::from(n)),
                (OpKind::Dec, Some(n)) => *total = total.wrapping_sub(i128::from(n)),
                _ => {}
            },
            Reducer::GSet(items) => {
                if let (OpKind::Add, Some(e)) = (op.kind, op.element()) {
                    items.insert(e.clone());
                }
            }
            Reducer::TwoPhaseSet(items) => match (op.kind, op.element()) {
                (OpKind::Add, Some(e)) => {
                    items.entry(e.clone()).or_insert(true);
                }
                (OpKind::Rmv, Some(e)) => {
                    items.insert(e.clone(), false);
                }
                _ => {}
            },
        }
        Ok(())
    }

    /// Current value, sets ordered by canonical encoding
    pub fn value(&self) -> CrdtValue {
        match self {
            Reducer::Counter(total) => {
                CrdtValue::Counter((*total).clamp(i64::MIN.into(), i64::MAX.into()) as i64)
            }
            Reducer::GSet(items) => {
                CrdtValue::Set(items.iter().map(|e| e.value().clone()).collect())
            }
            Reducer::TwoPhaseSet(items) => CrdtValue::Set(
                items
                    .iter()
                    .filter(|(_, present)| **present)
                    .map(|(e, _)| e.value().clone())
                    .collect(),
            ),
        }
    }
}

/// Value of an object with no operations beyond `new`
pub fn initial_value(crdt_type: CrdtType) -> CrdtValue {
    Reducer::new(crdt_type).value()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::ops::OpPayload;
    use serde_json::json;

    fn op(kind: OpKind, crdt_type: CrdtType, payload: OpPayload) -> Operation {
        Operation {
            kind,
            preds: vec![],
            payload,
            crdt_type,
            nonce: None,
        }
    }

    fn element(v: Value) -> OpPayload {
        OpPayload::Element(SetElement::new(v))
    }

    #[test]
    fn test_counter_fold() {
        let mut r = Reducer::new(CrdtType::Counter);
        r.apply(&op(OpKind::New, CrdtType::Counter, OpPayload::Genesis)).unwrap();
        r.apply(&op(OpKind::Inc, CrdtType::Counter, OpPayload::Amount(5))).unwrap();
        r.apply(&op(OpKind::Dec, CrdtType::Counter, OpPayload::Amount(3))).unwrap();
        assert_eq!(r.value(), CrdtValue::Counter(2));
    }

    #[test]
    fn test_counter_clamps_regardless_of_order() {
        let amounts = [
            (OpKind::Inc, i64::MAX),
            (OpKind::Inc, 1),
            (OpKind::Dec, 1),
            (OpKind::Dec, 1),
        ];
        let fold = |order: &[usize]| {
            let mut r = Reducer::new(CrdtType::Counter);
            for i in order {
                let (kind, n) = amounts[*i];
                r.apply(&op(kind, CrdtType::Counter, OpPayload::Amount(n))).unwrap();
            }
            r.value()
        };

        let expected = CrdtValue::Counter(i64::MAX - 1);
        assert_eq!(fold(&[0, 1, 2, 3]), expected);
        assert_eq!(fold(&[2, 3, 0, 1]), expected);
        assert_eq!(fold(&[0, 1, 3, 2]), expected);
        assert_eq!(fold(&[1, 0, 2, 3]), expected);

        // only the reported value is clamped
        assert_eq!(fold(&[0, 1]), CrdtValue::Counter(i64::MAX));
    }

    #[test]
    fn test_gset_deduplicates() {
        let mut r = Reducer::new(CrdtType::GSet);
        r.apply(&op(OpKind::Add, CrdtType::GSet, element(json!("b")))).unwrap();
        r.apply(&op(OpKind::Add, CrdtType::GSet, element(json!("a")))).unwrap();
        r.apply(&op(OpKind::Add, CrdtType::GSet, element(json!("b")))).unwrap();
        assert_eq!(r.value(), CrdtValue::Set(vec![json!("a"), json!("b")]));
    }

    #[test]
    fn test_two_phase_set_remove_wins() {
        let x = || element(json!({"id": 7}));

        // order of add/rmv must not matter
        let mut forward = Reducer::new(CrdtType::TwoPhaseSet);
        forward.apply(&op(OpKind::Add, CrdtType::TwoPhaseSet, x())).unwrap();
        forward.apply(&op(OpKind::Rmv, CrdtType::TwoPhaseSet, x())).unwrap();
        forward.apply(&op(OpKind::Add, CrdtType::TwoPhaseSet, x())).unwrap();

        let mut backward = Reducer::new(CrdtType::TwoPhaseSet);
        backward.apply(&op(OpKind::Rmv, CrdtType::TwoPhaseSet, x())).unwrap();
        backward.apply(&op(OpKind::Add, CrdtType::TwoPhaseSet, x())).unwrap();

        assert_eq!(forward.value(), CrdtValue::Set(vec![]));
        assert_eq!(backward.value(), CrdtValue::Set(vec![]));
    }

    #[test]
    fn test_wrong_type_rejected() {
        let mut r = Reducer::new(CrdtType::Counter);
        let result = r.apply(&op(OpKind::Add, CrdtType::GSet, element(json!(1))));
        assert!(matches!(result, Err(Error::WrongCrdtType { .. })));
        assert_eq!(r.value(), CrdtValue::Counter(0));
    }

    #[test]
    fn test_value_serialization() {
        assert_eq!(serde_json::to_value(CrdtValue::Counter(-4)).unwrap(), json!(-4));
        assert_eq!(
            serde_json::to_value(initial_value(CrdtType::TwoPhaseSet)).unwrap(),
            json!([])
        );
    }
}

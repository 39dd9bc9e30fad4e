//! CRDT operations: the mutation records exchanged between replicas,
//! their deterministic ordering, and how they fold into values.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::clock::{ReplicaId, VectorClock};

/// Operation payload. The `array-*` family first coerces a non-array
/// accumulator to an empty array; `set` always replaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum OpData {
    Set {
        value: Value,
    },
    ArrayAdd {
        value: Value,
    },
    ArrayAddUnique {
        value: Value,
    },
    ArrayRemoveMatching {
        value: Value,
    },
    ArrayUpdateMatching {
        value: Value,
        #[serde(rename = "updateValue")]
        update_value: Value,
    },
}

/// Operation kind selector for the public update API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OpKind {
    Set,
    ArrayAdd,
    ArrayAddUnique,
    ArrayRemoveMatching,
    ArrayUpdateMatching,
}

impl OpData {
    /// Build the payload from a kind plus its (already sanitized) values.
    /// `update_value` defaults to null when the kind does not need it.
    pub fn from_kind(kind: OpKind, value: Value, update_value: Option<Value>) -> Self {
        match kind {
            OpKind::Set => OpData::Set { value },
            OpKind::ArrayAdd => OpData::ArrayAdd { value },
            OpKind::ArrayAddUnique => OpData::ArrayAddUnique { value },
            OpKind::ArrayRemoveMatching => OpData::ArrayRemoveMatching { value },
            OpKind::ArrayUpdateMatching => OpData::ArrayUpdateMatching {
                value,
                update_value: update_value.unwrap_or(Value::Null),
            },
        }
    }

    pub fn value(&self) -> &Value {
        match self {
            OpData::Set { value }
            | OpData::ArrayAdd { value }
            | OpData::ArrayAddUnique { value }
            | OpData::ArrayRemoveMatching { value }
            | OpData::ArrayUpdateMatching { value, .. } => value,
        }
    }

    pub fn value_mut(&mut self) -> &mut Value {
        match self {
            OpData::Set { value }
            | OpData::ArrayAdd { value }
            | OpData::ArrayAddUnique { value }
            | OpData::ArrayRemoveMatching { value }
            | OpData::ArrayUpdateMatching { value, .. } => value,
        }
    }

    pub fn update_value_mut(&mut self) -> Option<&mut Value> {
        match self {
            OpData::ArrayUpdateMatching { update_value, .. } => Some(update_value),
            _ => None,
        }
    }

    /// Fold this operation into the accumulator. Equality for the
    /// `-matching` variants is deep structural equality; object keys
    /// compare order-independently.
    pub fn apply(&self, acc: Value) -> Value {
        match self {
            OpData::Set { value } => value.clone(),
            OpData::ArrayAdd { value } => {
                let mut items = coerce_array(acc);
                items.push(value.clone());
                Value::Array(items)
            }
            OpData::ArrayAddUnique { value } => {
                let mut items = coerce_array(acc);
                if !items.contains(value) {
                    items.push(value.clone());
                }
                Value::Array(items)
            }
            OpData::ArrayRemoveMatching { value } => {
                let mut items = coerce_array(acc);
                items.retain(|item| item != value);
                Value::Array(items)
            }
            OpData::ArrayUpdateMatching { value, update_value } => {
                let mut items = coerce_array(acc);
                if let Some(slot) = items.iter_mut().find(|item| *item == value) {
                    *slot = update_value.clone();
                }
                Value::Array(items)
            }
        }
    }
}

fn coerce_array(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        _ => Vec::new(),
    }
}

/// A single CRDT mutation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Globally unique; imports deduplicate on it.
    pub uuid: Uuid,
    /// Replica that authored the operation.
    pub source: ReplicaId,
    /// The author's vector clock at the moment of authorship.
    pub clock: VectorClock,
    pub data: OpData,
}

impl Operation {
    pub fn new(source: &str, clock: VectorClock, data: OpData) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            source: source.to_string(),
            clock,
            data,
        }
    }
}

/// Total order over operations: clock dominance first, then for
/// concurrent pairs the lower maximum counter sorts first, then the
/// lexicographically lower source replica. Every replica sorts the same
/// operation set identically.
pub fn causal_cmp(a: &Operation, b: &Operation) -> Ordering {
    if a.clock.dominates(&b.clock) {
        Ordering::Greater
    } else if b.clock.dominates(&a.clock) {
        Ordering::Less
    } else {
        a.clock
            .max_counter()
            .cmp(&b.clock.max_counter())
            .then_with(|| a.source.cmp(&b.source))
    }
}

/// Fold a sorted operation log into its materialized value.
pub fn materialize<'a>(ops: impl IntoIterator<Item = &'a Operation>) -> Value {
    ops.into_iter()
        .fold(Value::Null, |acc, op| op.data.apply(acc))
}

//! The per-room replicated document.
//!
//! One engine instance is one replica: the server holds one per room,
//! every client holds its own. Local mutations become exportable
//! operations; imported operations are deduplicated, causally sorted and
//! folded into the materialized store. A lazy compaction pass rewrites
//! stable log prefixes into single `set` operations.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use log::debug;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::clock::{ReplicaId, VectorClock};
use crate::error::EngineError;
use crate::limits::{GC_MIN_INTERVAL, GC_MIN_OPS, HEARTBEAT_INTERVAL, MAX_KEYS_PER_ROOM};
use crate::op::{causal_cmp, materialize, OpData, OpKind, Operation};
use crate::protocol::{PropertyUpdate, StateSnapshot};
use crate::value;

/// Compaction tuning. Production code uses the defaults; tests shrink
/// the windows to exercise compaction without waiting.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Operations younger than this never compact. Must equal one
    /// heartbeat interval.
    pub gc_min_age: std::time::Duration,
    /// Minimum spacing between compaction passes.
    pub gc_min_interval: std::time::Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gc_min_age: HEARTBEAT_INTERVAL,
            gc_min_interval: GC_MIN_INTERVAL,
        }
    }
}

pub struct CrdtEngine {
    replica: ReplicaId,
    key_ops: HashMap<String, Vec<Operation>>,
    clock: VectorClock,
    store: Map<String, Value>,
    last_store: Map<String, Value>,
    /// When this replica first learned each operation; drives compaction.
    learned_at: HashMap<Uuid, DateTime<Utc>>,
    last_gc: DateTime<Utc>,
    gc_min_age: Duration,
    gc_min_interval: Duration,
}

impl CrdtEngine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let mut clock = VectorClock::new();
        let replica = Uuid::new_v4().to_string();
        clock.ensure(&replica);
        Self {
            replica,
            key_ops: HashMap::new(),
            clock,
            store: Map::new(),
            last_store: Map::new(),
            learned_at: HashMap::new(),
            last_gc: Utc::now(),
            gc_min_age: Duration::from_std(config.gc_min_age).unwrap_or_default(),
            gc_min_interval: Duration::from_std(config.gc_min_interval).unwrap_or_default(),
        }
    }

    pub fn replica_id(&self) -> &str {
        &self.replica
    }

    /// The materialized document.
    pub fn properties(&self) -> &Map<String, Value> {
        &self.store
    }

    pub fn key_count(&self) -> usize {
        self.key_ops.len()
    }

    /// Apply a local mutation and return the export record for transport.
    /// Oversize values and the per-room key cap fail the operation
    /// without touching any state.
    pub fn update_property(
        &mut self,
        key: &str,
        kind: OpKind,
        value: Value,
        update_value: Option<Value>,
    ) -> Result<PropertyUpdate, EngineError> {
        let value = value::sanitize(value)?;
        let update_value = update_value.map(value::sanitize).transpose()?;
        if !self.key_ops.contains_key(key) && self.key_ops.len() >= MAX_KEYS_PER_ROOM {
            return Err(EngineError::KeyLimitExceeded);
        }

        self.clock.record(&self.replica);
        let op = Operation::new(
            &self.replica,
            self.clock.clone(),
            OpData::from_kind(kind, value, update_value),
        );

        // Local operations carry the newest clock, so the log stays sorted.
        self.key_ops
            .entry(key.to_string())
            .or_default()
            .push(op.clone());
        self.rematerialize(key);
        self.learned_at.insert(op.uuid, Utc::now());
        self.maybe_gc();

        Ok(PropertyUpdate {
            key: key.to_string(),
            operation: op,
            vector_clock: self.clock.clone(),
        })
    }

    /// Import one operation from a peer. Values are sanitized
    /// defensively; duplicates (by uuid) are no-ops.
    pub fn import_property_update(&mut self, update: PropertyUpdate) -> Result<(), EngineError> {
        let PropertyUpdate {
            key,
            mut operation,
            vector_clock,
        } = update;

        let size = value::serialized_len(operation.data.value());
        if size > crate::limits::MAX_VALUE_BYTES {
            return Err(EngineError::ValueTooLarge { size });
        }
        value::strip_tags(operation.data.value_mut());
        if let Some(update_value) = operation.data.update_value_mut() {
            let size = value::serialized_len(update_value);
            if size > crate::limits::MAX_VALUE_BYTES {
                return Err(EngineError::ValueTooLarge { size });
            }
            value::strip_tags(update_value);
        }

        if !self.key_ops.contains_key(&key) && self.key_ops.len() >= MAX_KEYS_PER_ROOM {
            return Err(EngineError::KeyLimitExceeded);
        }

        self.clock.merge(&vector_clock);

        let ops = self.key_ops.entry(key.clone()).or_default();
        let uuid = operation.uuid;
        if !ops.iter().any(|existing| existing.uuid == uuid) {
            ops.push(operation);
            ops.sort_by(causal_cmp);
        }
        self.learned_at.entry(uuid).or_insert_with(Utc::now);
        self.rematerialize(&key);
        self.maybe_gc();
        Ok(())
    }

    /// Replace this replica's document with a full peer snapshot.
    /// Every imported operation counts as freshly learned.
    pub fn import_state(&mut self, snapshot: StateSnapshot) {
        let StateSnapshot {
            key_operations,
            vector_clock,
        } = snapshot;

        self.key_ops = key_operations.into_iter().collect();
        self.clock = vector_clock;
        self.clock.ensure(&self.replica);
        self.store.clear();

        let now = Utc::now();
        self.learned_at.clear();
        for ops in self.key_ops.values_mut() {
            ops.sort_by(causal_cmp);
            for op in ops.iter() {
                self.learned_at.insert(op.uuid, now);
            }
        }
        let keys: Vec<String> = self.key_ops.keys().cloned().collect();
        for key in keys {
            self.rematerialize(&key);
        }
    }

    /// Deep, serializable snapshot of the full log and clock.
    pub fn state(&self) -> StateSnapshot {
        let mut key_operations: Vec<(String, Vec<Operation>)> = self
            .key_ops
            .iter()
            .map(|(key, ops)| (key.clone(), ops.clone()))
            .collect();
        key_operations.sort_by(|(a, _), (b, _)| a.cmp(b));
        StateSnapshot {
            key_operations,
            vector_clock: self.clock.clone(),
        }
    }

    /// Consume-once change flag: true iff the materialized store differs
    /// from the last time this was called.
    pub fn properties_changed(&mut self) -> bool {
        let changed = self.store != self.last_store;
        if changed {
            self.last_store = self.store.clone();
        }
        changed
    }

    fn rematerialize(&mut self, key: &str) {
        match self.key_ops.get(key) {
            Some(ops) => {
                let folded = materialize(ops.iter());
                self.store.insert(key.to_string(), folded);
            }
            None => {
                self.store.remove(key);
            }
        }
    }

    /// Lazy log compaction. Rewrites, per key, the longest stable prefix
    /// (everything learned more than one heartbeat ago) into a single
    /// synthetic `set` carrying the folded prefix value and the clock of
    /// the last removed operation. Never changes materialized values.
    fn maybe_gc(&mut self) {
        let now = Utc::now();
        if now - self.last_gc < self.gc_min_interval {
            return;
        }
        self.last_gc = now;
        let cutoff = now - self.gc_min_age;

        for ops in self.key_ops.values_mut() {
            if ops.len() < GC_MIN_OPS {
                continue;
            }
            let prefix = ops
                .iter()
                .take_while(|op| {
                    self.learned_at
                        .get(&op.uuid)
                        .is_some_and(|learned| *learned < cutoff)
                })
                .count();
            if prefix == 0 {
                continue;
            }

            let folded = materialize(ops[..prefix].iter());
            let last_clock = ops[prefix - 1].clock.clone();
            for removed in &ops[..prefix] {
                self.learned_at.remove(&removed.uuid);
            }
            let synthetic = Operation::new(&self.replica, last_clock, OpData::Set { value: folded });
            debug!(
                "[replica:{}] compacted {} op(s) into {}",
                self.replica, prefix, synthetic.uuid
            );
            self.learned_at.insert(synthetic.uuid, now);
            let suffix = ops.split_off(prefix);
            ops.clear();
            ops.push(synthetic);
            ops.extend(suffix);
        }
    }
}

impl Default for CrdtEngine {
    fn default() -> Self {
        Self::new()
    }
}

//! Vector clocks over replica ids.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::limits::{CLOCK_KEEP_ENTRIES, MAX_CLOCK_ENTRIES};

/// Identifies one CRDT engine instance. Every engine mints its own at
/// construction; a client reconnecting becomes a new replica.
pub type ReplicaId = String;

/// Per-replica counter map capturing causality. Entries keep insertion
/// order so the clock serializes as a stable pair-sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    entries: IndexMap<ReplicaId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment this replica's entry, returning the new counter.
    pub fn record(&mut self, replica: &str) -> u64 {
        let counter = {
            let entry = self.entries.entry(replica.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        self.truncate_if_oversized();
        counter
    }

    /// Make sure the replica has an entry without advancing it.
    pub fn ensure(&mut self, replica: &str) {
        self.entries.entry(replica.to_string()).or_insert(0);
    }

    /// Entry-wise max merge.
    pub fn merge(&mut self, other: &VectorClock) {
        for (replica, &counter) in &other.entries {
            let entry = self.entries.entry(replica.clone()).or_insert(0);
            if counter > *entry {
                *entry = counter;
            }
        }
        self.truncate_if_oversized();
    }

    pub fn counter(&self, replica: &str) -> u64 {
        self.entries.get(replica).copied().unwrap_or(0)
    }

    /// True when every entry is `>=` the other's and at least one is
    /// strictly greater.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        let mut strictly_greater = false;
        for (replica, &theirs) in &other.entries {
            let ours = self.counter(replica);
            if ours < theirs {
                return false;
            }
            if ours > theirs {
                strictly_greater = true;
            }
        }
        if !strictly_greater {
            strictly_greater = self
                .entries
                .iter()
                .any(|(replica, &ours)| ours > other.counter(replica));
        }
        strictly_greater
    }

    /// Largest counter across all entries; tie-break input for
    /// concurrent operations.
    pub fn max_counter(&self) -> u64 {
        self.entries.values().copied().max().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, &u64)> {
        self.entries.iter()
    }

    /// Safety valve against unbounded growth under replica churn: past
    /// 1,000 entries only the newest 100 (by insertion) survive.
    fn truncate_if_oversized(&mut self) {
        if self.entries.len() > MAX_CLOCK_ENTRIES {
            self.entries = self.entries.split_off(self.entries.len() - CLOCK_KEEP_ENTRIES);
        }
    }
}

//! Vector-clock algebra (C1): per-device causal counters and their
//! partial order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Per-device integer map encoding the causal history of an event.
///
/// Absent keys are treated as 0. Backed by a `BTreeMap` so iteration order
/// (and therefore serialization and checksumming) is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<String, u64>);

/// Result of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    Equal,
    Before,
    After,
    Concurrent,
}

impl VectorClock {
    /// `create(device_id)`: a clock with a single device at counter 0.
    pub fn create(device_id: impl Into<String>) -> Self {
        let mut map = BTreeMap::new();
        map.insert(device_id.into(), 0);
        Self(map)
    }

    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, device_id: &str) -> u64 {
        self.0.get(device_id).copied().unwrap_or(0)
    }

    pub fn set(&mut self, device_id: impl Into<String>, value: u64) {
        self.0.insert(device_id.into(), value);
    }

    pub fn device_ids(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `increment(clock, device_id)`: returns a new clock with
    /// `clock[device_id] += 1`. Does not mutate `self`.
    pub fn incremented(&self, device_id: &str) -> Self {
        let mut next = self.clone();
        let counter = next.0.entry(device_id.to_string()).or_insert(0);
        *counter += 1;
        next
    }

    /// `merge(a, b)`: component-wise max over the union of keys.
    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        let mut merged = self.0.clone();
        for (device_id, &value) in &other.0 {
            let entry = merged.entry(device_id.clone()).or_insert(0);
            if value > *entry {
                *entry = value;
            }
        }
        VectorClock(merged)
    }

    /// `compare(a, b)`: the standard Lamport/Fidge partial order.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut self_has_greater = false;
        let mut other_has_greater = false;

        for device_id in self.0.keys().chain(other.0.keys()) {
            let a = self.get(device_id);
            let b = other.get(device_id);
            if a > b {
                self_has_greater = true;
            } else if b > a {
                other_has_greater = true;
            }
        }

        match (self_has_greater, other_has_greater) {
            (false, false) => ClockOrdering::Equal,
            (false, true) => ClockOrdering::Before,
            (true, false) => ClockOrdering::After,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    pub fn dominates(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::After
    }

    pub fn is_concurrent_with(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Concurrent
    }

    /// `happens_before`: true when `self` strictly precedes `other`.
    pub fn happens_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Before
    }

    /// `valid(c)`: every value is a non-negative integer — always true for
    /// `u64`, so this only rejects clocks built from untrusted wire input
    /// via `TryFrom<serde_json::Value>`, which rejects negative or
    /// non-integer numbers before they ever become a `VectorClock`.
    pub fn valid(&self) -> bool {
        true
    }
}

/// Parses the wire form `{"<device_id>": <int>}`, rejecting anything that
/// is not a flat object of non-negative integers with `INVALID_VECTOR_CLOCK`
/// — the validation the spec asks `record_event` to perform at the JSON
/// boundary before a typed `VectorClock` ever exists.
impl TryFrom<serde_json::Value> for VectorClock {
    type Error = SyncError;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        let obj = value.as_object().ok_or_else(|| SyncError::InvalidVectorClock {
            reason: "vector clock must be a JSON object".to_string(),
        })?;
        let mut map = BTreeMap::new();
        for (device_id, v) in obj {
            let n = v.as_u64().ok_or_else(|| SyncError::InvalidVectorClock {
                reason: format!("clock value for {device_id} must be a non-negative integer"),
            })?;
            map.insert(device_id.clone(), n);
        }
        Ok(VectorClock(map))
    }
}

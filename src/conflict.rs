//! Conflict detector (C5): finds concurrent unresolved event pairs per
//! entity. Pure function over an in-memory slice — the coordinator is
//! responsible for fetching the relevant events from the `EventStore`
//! first.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::ClockOrdering;
use crate::event_log::SyncEvent;

/// A derived (never persisted) pair of concurrently-modified events on the
/// same entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub conflict_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub events: [SyncEvent; 2],
    pub detected_at: DateTime<Utc>,
}

/// `conflict_id` encodes the ordered pair of event ids as
/// `"<len(e1)>:<e1>-<e2>"`. A plain `"e1-e2"` concatenation is not
/// reversible: both production `IdGen` ids (UUIDv4, `8-4-4-4-12`) and the
/// `SequentialIdGen` test double (`"evt-4"`) themselves contain `-`, so a
/// naive split on the first or last hyphen does not recover the original
/// ids. Prefixing `e1`'s byte length lets [`split_conflict_id`] read back
/// exactly `e1` regardless of which characters it or `e2` contain.
pub fn conflict_id(e1: &str, e2: &str) -> String {
    format!("{}:{e1}-{e2}", e1.len())
}

/// Inverse of [`conflict_id`]: recovers the exact `(e1, e2)` pair.
pub fn split_conflict_id(conflict_id: &str) -> Option<(String, String)> {
    let (len_str, rest) = conflict_id.split_once(':')?;
    let len: usize = len_str.parse().ok()?;
    if rest.len() < len + 1 {
        return None;
    }
    let (e1, tail) = rest.split_at(len);
    let e2 = tail.strip_prefix('-')?;
    Some((e1.to_string(), e2.to_string()))
}

/// Bucket `events` by `(entity_type, entity_id)`, then report every
/// unresolved pair whose clocks are `CONCURRENT`.
///
/// Pairs where one side is `DELETE` and the other `UPDATE` still surface
/// if their clocks are incomparable — the resolver, not the detector,
/// handles that shape. Resolving one pair does not remove the others from
/// a subsequent detection pass over the same entity.
pub fn detect(events: &[SyncEvent], now: DateTime<Utc>) -> Vec<Conflict> {
    let mut buckets: HashMap<(&str, &str), Vec<&SyncEvent>> = HashMap::new();
    for event in events {
        buckets
            .entry((event.entity_type.as_str(), event.entity_id.as_str()))
            .or_default()
            .push(event);
    }

    let mut conflicts = Vec::new();
    for ((entity_type, entity_id), bucket) in buckets {
        for i in 0..bucket.len() {
            for j in (i + 1)..bucket.len() {
                let e1 = bucket[i];
                let e2 = bucket[j];
                if e1.conflict_resolved || e2.conflict_resolved {
                    continue;
                }
                if e1.vector_clock.compare(&e2.vector_clock) == ClockOrdering::Concurrent {
                    conflicts.push(Conflict {
                        conflict_id: conflict_id(&e1.event_id, &e2.event_id),
                        entity_type: entity_type.to_string(),
                        entity_id: entity_id.to_string(),
                        events: [e1.clone(), e2.clone()],
                        detected_at: now,
                    });
                }
            }
        }
    }
    conflicts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VectorClock;
    use crate::device_registry::DeviceId;
    use crate::event_log::Operation;
    use serde_json::json;

    fn event(id: &str, device: &str, entity_id: &str, clock: VectorClock, op: Operation) -> SyncEvent {
        SyncEvent {
            event_id: id.to_string(),
            device_id: DeviceId(device.to_string()),
            entity_type: "Thread".to_string(),
            entity_id: entity_id.to_string(),
            operation: op,
            payload: json!({}),
            vector_clock: clock,
            synced_at: Utc::now(),
            conflict_resolved: false,
            resolution_strategy: None,
        }
    }

    #[test]
    fn causal_chain_is_not_a_conflict() {
        let mut c1 = VectorClock::empty();
        c1.set("d1", 1);
        let mut c2 = VectorClock::empty();
        c2.set("d1", 1);
        c2.set("d2", 1);

        let events = vec![
            event("e1", "d1", "t1", c1, Operation::Create),
            event("e2", "d2", "t1", c2, Operation::Update),
        ];
        assert!(detect(&events, Utc::now()).is_empty());
    }

    #[test]
    fn concurrent_updates_are_reported() {
        let mut c1 = VectorClock::empty();
        c1.set("d1", 2);
        c1.set("d2", 1);
        let mut c2 = VectorClock::empty();
        c2.set("d1", 1);
        c2.set("d2", 2);

        let events = vec![
            event("e1", "d1", "t1", c1, Operation::Update),
            event("e2", "d2", "t1", c2, Operation::Update),
        ];
        let conflicts = detect(&events, Utc::now());
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_id, "2:e1-e2");
    }

    #[test]
    fn conflict_id_round_trips_ids_that_contain_hyphens() {
        // Both real IdGen output (UUIDv4, "8-4-4-4-12") and the
        // SequentialIdGen test double ("evt-4") embed hyphens; a naive
        // split on the first or last '-' would not recover these.
        let id = conflict_id("evt-4", "evt-5");
        assert_eq!(id, "5:evt-4-evt-5");
        assert_eq!(
            split_conflict_id(&id),
            Some(("evt-4".to_string(), "evt-5".to_string()))
        );

        let uuid1 = "550e8400-e29b-41d4-a716-446655440000";
        let uuid2 = "6ba7b810-9dad-11d1-80b4-00c04fd430c8";
        let id = conflict_id(uuid1, uuid2);
        assert_eq!(split_conflict_id(&id), Some((uuid1.to_string(), uuid2.to_string())));
    }

    #[test]
    fn delete_update_concurrency_still_surfaces() {
        let mut c1 = VectorClock::empty();
        c1.set("d1", 3);
        c1.set("d2", 2);
        let mut c2 = VectorClock::empty();
        c2.set("d1", 2);
        c2.set("d2", 3);

        let events = vec![
            event("e1", "d1", "m7", c1, Operation::Delete),
            event("e2", "d2", "m7", c2, Operation::Update),
        ];
        let conflicts = detect(&events, Utc::now());
        assert_eq!(conflicts.len(), 1);
    }

    #[test]
    fn already_resolved_events_are_skipped() {
        let mut c1 = VectorClock::empty();
        c1.set("d1", 2);
        let mut c2 = VectorClock::empty();
        c2.set("d2", 2);

        let mut e1 = event("e1", "d1", "t1", c1, Operation::Update);
        e1.conflict_resolved = true;
        let e2 = event("e2", "d2", "t1", c2, Operation::Update);

        assert!(detect(&[e1, e2], Utc::now()).is_empty());
    }

    #[test]
    fn resolving_one_pair_does_not_resolve_others_on_the_same_entity() {
        let mut c1 = VectorClock::empty();
        c1.set("d1", 1);
        let mut c2 = VectorClock::empty();
        c2.set("d2", 1);
        let mut c3 = VectorClock::empty();
        c3.set("d3", 1);

        let events = vec![
            event("e1", "d1", "t1", c1, Operation::Update),
            event("e2", "d2", "t1", c2, Operation::Update),
            event("e3", "d3", "t1", c3, Operation::Update),
        ];
        // All three pairs are pairwise concurrent.
        let conflicts = detect(&events, Utc::now());
        assert_eq!(conflicts.len(), 3);
    }
}

//! Conflict resolver (C6): applies LAST_WRITE_WINS / MANUAL / MERGE and
//! emits a resolution event.

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, instrument};

use crate::delta::three_way_merge;
use crate::error::{SyncError, SyncResult};
use crate::event_log::{EventStore, NewSyncEvent, Operation, ResolutionKind, SyncEvent};
use crate::ports::{Clock, IdGen};

/// Strategy a caller picks to resolve one [`crate::conflict::Conflict`].
///
/// `resolution` is threaded as a separate `Option<Value>` on
/// [`ConflictResolver::resolve`] rather than embedded in the `Manual`
/// variant, so that a manual resolve call missing its payload surfaces
/// `MISSING_RESOLUTION` as its own error instead of being unrepresentable
/// at the type level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStrategy {
    LastWriteWins,
    Manual,
    Merge,
}

impl ResolutionStrategy {
    fn kind(&self) -> ResolutionKind {
        match self {
            ResolutionStrategy::LastWriteWins => ResolutionKind::LastWriteWins,
            ResolutionStrategy::Manual => ResolutionKind::Manual,
            ResolutionStrategy::Merge => ResolutionKind::Merge,
        }
    }
}

/// Resolves a conflict between two events of the same entity, grounded on
/// this codebase's `lww_resolve`/`merge_deltas_lww` tiebreak rule for LWW
/// and on the delta engine's `three_way_merge` for MERGE.
pub struct ConflictResolver {
    events: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGen>,
}

impl ConflictResolver {
    pub fn new(events: Arc<dyn EventStore>, clock: Arc<dyn Clock>, ids: Arc<dyn IdGen>) -> Self {
        Self { events, clock, ids }
    }

    /// `resolve(conflict_id, strategy, resolution?)`. `resolution` is
    /// required (and used verbatim) for `Manual`; ignored otherwise.
    #[instrument(skip(self, strategy, resolution))]
    pub async fn resolve(
        &self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
        resolution: Option<Value>,
    ) -> SyncResult<String> {
        let (e1_id, e2_id) = split_conflict_id(conflict_id)?;

        let e1 = self
            .events
            .find_by_id(&e1_id)
            .await?
            .ok_or_else(|| SyncError::ConflictNotFound {
                conflict_id: conflict_id.to_string(),
            })?;
        let e2 = self
            .events
            .find_by_id(&e2_id)
            .await?
            .ok_or_else(|| SyncError::ConflictNotFound {
                conflict_id: conflict_id.to_string(),
            })?;

        if e1.conflict_resolved || e2.conflict_resolved {
            return Err(SyncError::AlreadyResolved {
                conflict_id: conflict_id.to_string(),
            });
        }

        let resolved_payload = match &strategy {
            ResolutionStrategy::LastWriteWins => last_write_wins(&e1, &e2).payload.clone(),
            ResolutionStrategy::Manual => resolution.ok_or_else(|| SyncError::MissingResolution {
                conflict_id: conflict_id.to_string(),
            })?,
            ResolutionStrategy::Merge => {
                let base = self.merge_base(&e1, &e2).await?;
                let base_payload = base.map(|e| e.payload).unwrap_or(Value::Null);
                let (merged, conflicts) = three_way_merge(&base_payload, &e1.payload, &e2.payload);
                if !conflicts.is_empty() {
                    return Err(SyncError::AutoMergeFailed {
                        conflict_id: conflict_id.to_string(),
                        conflicting_paths: conflicts.len(),
                    });
                }
                merged
            }
        };

        self.events
            .mark_resolved(&[e1.event_id.clone(), e2.event_id.clone()], strategy.kind())
            .await?;

        let merged_clock = e1.vector_clock.merge(&e2.vector_clock);
        let resolution = NewSyncEvent {
            device_id: e1.device_id.clone(),
            entity_type: e1.entity_type.clone(),
            entity_id: e1.entity_id.clone(),
            operation: Operation::Update,
            payload: resolved_payload,
            vector_clock: merged_clock,
        };
        let new_event = self
            .events
            .append(resolution, self.clock.now(), self.ids.new_id())
            .await?;

        info!(
            conflict_id,
            strategy = strategy.kind().as_str(),
            new_event_id = %new_event.event_id,
            "conflict resolved"
        );

        Ok(new_event.event_id)
    }

    /// The base state for MERGE: the latest event for the same entity that
    /// happens-before both `e1` and `e2` (may be none).
    async fn merge_base(&self, e1: &SyncEvent, e2: &SyncEvent) -> SyncResult<Option<SyncEvent>> {
        let history = self.events.by_entity(&e1.entity_type, &e1.entity_id).await?;
        let candidate = history
            .into_iter()
            .filter(|e| {
                e.event_id != e1.event_id
                    && e.event_id != e2.event_id
                    && e.vector_clock.happens_before(&e1.vector_clock)
                    && e.vector_clock.happens_before(&e2.vector_clock)
            })
            .max_by(|a, b| a.synced_at.cmp(&b.synced_at));
        Ok(candidate)
    }
}

/// LAST_WRITE_WINS tiebreak: later `synced_at` wins; ties broken by
/// lexicographic `event_id`.
fn last_write_wins<'a>(e1: &'a SyncEvent, e2: &'a SyncEvent) -> &'a SyncEvent {
    match e1.synced_at.cmp(&e2.synced_at) {
        std::cmp::Ordering::Greater => e1,
        std::cmp::Ordering::Less => e2,
        std::cmp::Ordering::Equal => {
            if e1.event_id >= e2.event_id {
                e1
            } else {
                e2
            }
        }
    }
}

fn split_conflict_id(conflict_id: &str) -> SyncResult<(String, String)> {
    crate::conflict::split_conflict_id(conflict_id).ok_or_else(|| SyncError::ConflictNotFound {
        conflict_id: conflict_id.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VectorClock;
    use crate::device_registry::DeviceId;
    use crate::event_log::InMemoryEventStore;
    use crate::ports::{FixedClock, SequentialIdGen};
    use chrono::Utc;
    use serde_json::json;

    fn resolver() -> (ConflictResolver, Arc<InMemoryEventStore>) {
        let store = Arc::new(InMemoryEventStore::new());
        let clock = Arc::new(FixedClock::new(Utc::now(), chrono::Duration::seconds(1)));
        let ids = Arc::new(SequentialIdGen::new("resolved-"));
        (
            ConflictResolver::new(store.clone(), clock, ids),
            store,
        )
    }

    async fn seed_conflict(
        store: &InMemoryEventStore,
        payload1: Value,
        payload2: Value,
    ) -> (String, String) {
        let mut c1 = VectorClock::empty();
        c1.set("d1", 2);
        c1.set("d2", 1);
        let mut c2 = VectorClock::empty();
        c2.set("d1", 1);
        c2.set("d2", 2);

        let t0 = Utc::now();
        let e1 = store
            .append(
                NewSyncEvent {
                    device_id: DeviceId("d1".to_string()),
                    entity_type: "Thread".to_string(),
                    entity_id: "t1".to_string(),
                    operation: Operation::Update,
                    payload: payload1,
                    vector_clock: c1,
                },
                t0,
                "e1".to_string(),
            )
            .await
            .unwrap();
        let e2 = store
            .append(
                NewSyncEvent {
                    device_id: DeviceId("d2".to_string()),
                    entity_type: "Thread".to_string(),
                    entity_id: "t1".to_string(),
                    operation: Operation::Update,
                    payload: payload2,
                    vector_clock: c2,
                },
                t0 + chrono::Duration::seconds(10),
                "e2".to_string(),
            )
            .await
            .unwrap();
        (e1.event_id, e2.event_id)
    }

    #[tokio::test]
    async fn last_write_wins_picks_later_synced_at() {
        let (resolver, store) = resolver();
        let (e1, e2) = seed_conflict(&store, json!({"title": "A"}), json!({"title": "B"})).await;
        let conflict_id = crate::conflict::conflict_id(&e1, &e2);

        let new_id = resolver
            .resolve(&conflict_id, ResolutionStrategy::LastWriteWins, None)
            .await
            .unwrap();

        let resolved = store.find_by_id(&new_id).await.unwrap().unwrap();
        assert_eq!(resolved.payload, json!({"title": "B"}));
        assert_eq!(resolved.vector_clock.get("d1"), 2);
        assert_eq!(resolved.vector_clock.get("d2"), 2);

        let e1 = store.find_by_id(&e1).await.unwrap().unwrap();
        let e2 = store.find_by_id(&e2).await.unwrap().unwrap();
        assert!(e1.conflict_resolved);
        assert!(e2.conflict_resolved);
    }

    #[tokio::test]
    async fn manual_requires_resolution_value() {
        let (resolver, store) = resolver();
        let (e1, e2) = seed_conflict(&store, json!({"title": "X"}), json!({"title": "Z"})).await;
        let conflict_id = crate::conflict::conflict_id(&e1, &e2);

        let new_id = resolver
            .resolve(&conflict_id, ResolutionStrategy::Manual, Some(json!({"title": "Final"})))
            .await
            .unwrap();
        let resolved = store.find_by_id(&new_id).await.unwrap().unwrap();
        assert_eq!(resolved.payload, json!({"title": "Final"}));
    }

    #[tokio::test]
    async fn manual_without_resolution_fails_missing_resolution() {
        let (resolver, store) = resolver();
        let (e1, e2) = seed_conflict(&store, json!({"title": "X"}), json!({"title": "Z"})).await;
        let conflict_id = crate::conflict::conflict_id(&e1, &e2);

        let err = resolver
            .resolve(&conflict_id, ResolutionStrategy::Manual, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "MISSING_RESOLUTION");
    }

    #[tokio::test]
    async fn merge_fails_when_both_sides_diverge_on_same_path() {
        let (resolver, store) = resolver();
        let (e1, e2) = seed_conflict(&store, json!({"title": "Y"}), json!({"title": "Z"})).await;
        let conflict_id = crate::conflict::conflict_id(&e1, &e2);

        let err = resolver.resolve(&conflict_id, ResolutionStrategy::Merge, None).await.unwrap_err();
        assert_eq!(err.code(), "AUTO_MERGE_FAILED");
    }

    #[tokio::test]
    async fn merge_succeeds_on_disjoint_fields_with_no_ancestor_event() {
        // No prior event happens-before both conflicting events, so
        // `merge_base` finds `None` and the merge runs against a `Null`
        // base. Disjoint top-level fields must still merge cleanly.
        let (resolver, store) = resolver();
        let (e1, e2) = seed_conflict(&store, json!({"owner": "alice"}), json!({"color": "blue"})).await;
        let conflict_id = crate::conflict::conflict_id(&e1, &e2);

        let new_id = resolver.resolve(&conflict_id, ResolutionStrategy::Merge, None).await.unwrap();
        let resolved = store.find_by_id(&new_id).await.unwrap().unwrap();
        assert_eq!(resolved.payload, json!({"owner": "alice", "color": "blue"}));
    }

    #[tokio::test]
    async fn resolving_twice_fails_already_resolved() {
        let (resolver, store) = resolver();
        let (e1, e2) = seed_conflict(&store, json!({"title": "A"}), json!({"title": "B"})).await;
        let conflict_id = crate::conflict::conflict_id(&e1, &e2);

        resolver.resolve(&conflict_id, ResolutionStrategy::LastWriteWins, None).await.unwrap();
        let err = resolver.resolve(&conflict_id, ResolutionStrategy::LastWriteWins, None).await.unwrap_err();
        assert_eq!(err.code(), "ALREADY_RESOLVED");
    }

    #[tokio::test]
    async fn unknown_conflict_id_fails_not_found() {
        let (resolver, _store) = resolver();
        let err = resolver
            .resolve("missing1-missing2", ResolutionStrategy::LastWriteWins, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT_NOT_FOUND");
    }
}

//! Sync coordinator (C7): the sole entry point a host calls — pulls
//! pending events for a device, records new ones, resolves conflicts, and
//! reports health/statistics.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{instrument, warn};

use crate::clock::VectorClock;
use crate::config::SyncConfig;
use crate::conflict::{self, Conflict};
use crate::device_registry::{Device, DeviceKind, DeviceStore};
use crate::error::{SyncError, SyncResult};
use crate::event_log::{EventStore, NewSyncEvent, Operation, SyncEvent};
use crate::ports::{Clock, IdGen};
use crate::resolver::{ConflictResolver, ResolutionStrategy};

pub use crate::device_registry::DeviceId;

/// Result of `initiate_sync`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSession {
    pub pending_events: Vec<SyncEvent>,
    pub current_clock: VectorClock,
}

/// Result of `sync_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub last_sync_at: Option<DateTime<Utc>>,
    pub pending_count: usize,
    pub unresolved_conflicts_involving_device: usize,
    pub clock: VectorClock,
    pub healthy: bool,
}

/// Result of `statistics`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatistics {
    pub total_devices: usize,
    pub active_devices: usize,
    pub total_events: usize,
    pub unresolved_conflicts: usize,
    pub latest_last_sync_at: Option<DateTime<Utc>>,
}

/// One event in a `batch_record` submission.
#[derive(Debug, Clone)]
pub struct BatchEvent {
    pub device_id: DeviceId,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: Operation,
    pub payload: Value,
    pub vector_clock: VectorClock,
}

/// A single failure within a `batch_record` call, keyed by the index of
/// the offending event in the submitted array.
#[derive(Debug)]
pub struct BatchError {
    pub index: usize,
    pub error: SyncError,
}

/// Outcome of `batch_record`: ids of events committed before the batch
/// stopped, plus per-event errors. Previously committed events are never
/// rolled back by a later failure in the same batch.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub saved_ids: Vec<String>,
    pub errors: Vec<BatchError>,
}

/// The engine's single entry point. Constructed once by the host and
/// passed by reference to request handlers — no ambient singleton.
pub struct SyncCoordinator {
    events: Arc<dyn EventStore>,
    devices: Arc<dyn DeviceStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGen>,
    config: SyncConfig,
    device_locks: SyncMutex<HashMap<DeviceId, Arc<AsyncMutex<()>>>>,
}

impl SyncCoordinator {
    pub fn new(
        events: Arc<dyn EventStore>,
        devices: Arc<dyn DeviceStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGen>,
        config: SyncConfig,
    ) -> Self {
        Self {
            events,
            devices,
            clock,
            ids,
            config,
            device_locks: SyncMutex::new(HashMap::new()),
        }
    }

    pub fn resolver(&self) -> ConflictResolver {
        ConflictResolver::new(self.events.clone(), self.clock.clone(), self.ids.clone())
    }

    fn device_lock(&self, device_id: &DeviceId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.device_locks.lock();
        locks
            .entry(device_id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    async fn with_timeout<T>(&self, fut: impl Future<Output = SyncResult<T>>) -> SyncResult<T> {
        match tokio::time::timeout(self.config.request_timeout(), fut).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout {
                elapsed_ms: self.config.request_timeout_secs * 1000,
            }),
        }
    }

    /// `register_device(user_id, name, kind, platform)`.
    #[instrument(skip(self))]
    pub async fn register_device(
        &self,
        user_id: &str,
        name: &str,
        kind: DeviceKind,
        platform: &str,
    ) -> SyncResult<(Device, VectorClock)> {
        self.with_timeout(async {
            if self.devices.find_by_user_name_active(user_id, name).await?.is_some() {
                return Err(SyncError::DuplicateDevice {
                    user_id: user_id.to_string(),
                    name: name.to_string(),
                });
            }

            let device_id = DeviceId(self.ids.new_id());
            let device = Device {
                device_id: device_id.clone(),
                user_id: user_id.to_string(),
                name: name.to_string(),
                kind,
                platform: platform.to_string(),
                active: true,
                last_sync_at: None,
            };
            let device = self.devices.insert(device).await?;

            let initial_clock = VectorClock::create(device_id.0.clone());
            let payload = serde_json::json!({
                "name": device.name,
                "kind": device.kind.as_str(),
                "platform": device.platform,
            });
            self.events
                .append(
                    NewSyncEvent {
                        device_id: device_id.clone(),
                        entity_type: "Device".to_string(),
                        entity_id: device_id.0.clone(),
                        operation: Operation::Create,
                        payload,
                        vector_clock: initial_clock.clone(),
                    },
                    self.clock.now(),
                    self.ids.new_id(),
                )
                .await?;

            Ok((device, initial_clock))
        })
        .await
    }

    /// `deactivate_device(device_id)`.
    #[instrument(skip(self))]
    pub async fn deactivate_device(&self, device_id: &DeviceId) -> SyncResult<()> {
        self.with_timeout(async {
            let device = self
                .devices
                .find_by_id(device_id)
                .await?
                .ok_or_else(|| SyncError::DeviceNotFound {
                    device_id: device_id.clone(),
                })?;

            self.devices.set_active(device_id, false).await?;

            let latest_clock = self
                .events
                .latest_for_device(device_id)
                .await?
                .map(|e| e.vector_clock)
                .unwrap_or_else(|| VectorClock::create(device_id.0.clone()));
            let next_clock = latest_clock.incremented(&device_id.0);

            self.events
                .append(
                    NewSyncEvent {
                        device_id: device_id.clone(),
                        entity_type: "Device".to_string(),
                        entity_id: device_id.0.clone(),
                        operation: Operation::Delete,
                        payload: serde_json::json!({"name": device.name}),
                        vector_clock: next_clock,
                    },
                    self.clock.now(),
                    self.ids.new_id(),
                )
                .await?;
            Ok(())
        })
        .await
    }

    /// `initiate_sync(device_id)`.
    #[instrument(skip(self))]
    pub async fn initiate_sync(&self, device_id: &DeviceId) -> SyncResult<SyncSession> {
        self.with_timeout(async {
            let device = self.active_device(device_id).await?;

            let current_clock = self
                .events
                .latest_for_device(device_id)
                .await?
                .map(|e| e.vector_clock)
                .unwrap_or_else(|| VectorClock::create(device_id.0.clone()));

            let since = device.last_sync_at.unwrap_or_else(epoch);
            let pending_events = self.events.by_device_since(device_id, since).await?;

            Ok(SyncSession {
                pending_events,
                current_clock,
            })
        })
        .await
    }

    /// `complete_sync(device_id, synced_up_to)`. Idempotent; a
    /// `synced_up_to` older than the current watermark is silently
    /// clamped rather than rewinding progress.
    #[instrument(skip(self))]
    pub async fn complete_sync(&self, device_id: &DeviceId, synced_up_to: DateTime<Utc>) -> SyncResult<()> {
        self.with_timeout(async {
            let device = self
                .devices
                .find_by_id(device_id)
                .await?
                .ok_or_else(|| SyncError::DeviceNotFound {
                    device_id: device_id.clone(),
                })?;

            let next = match device.last_sync_at {
                Some(current) if synced_up_to < current => current,
                _ => synced_up_to,
            };
            self.devices.update_last_sync(device_id, next).await
        })
        .await
    }

    /// `record_event(device_id, type, id, op, payload, clock)`.
    #[instrument(skip(self, payload, vector_clock))]
    pub async fn record_event(
        &self,
        device_id: &DeviceId,
        entity_type: &str,
        entity_id: &str,
        operation: Operation,
        payload: Value,
        vector_clock: VectorClock,
    ) -> SyncResult<SyncEvent> {
        let lock = self.device_lock(device_id);
        self.with_timeout(async {
            let _guard = lock.lock().await;
            self.active_device(device_id).await?;

            let prior_counter = self
                .events
                .latest_for_device(device_id)
                .await?
                .map(|e| e.vector_clock.get(&device_id.0))
                .unwrap_or(0);
            let submitted_counter = vector_clock.get(&device_id.0);
            if submitted_counter < prior_counter {
                return Err(SyncError::StaleDeviceCounter {
                    device_id: device_id.clone(),
                    got: submitted_counter,
                    expected: prior_counter,
                });
            }

            let event = self
                .events
                .append(
                    NewSyncEvent {
                        device_id: device_id.clone(),
                        entity_type: entity_type.to_string(),
                        entity_id: entity_id.to_string(),
                        operation,
                        payload,
                        vector_clock,
                    },
                    self.clock.now(),
                    self.ids.new_id(),
                )
                .await?;

            // Conflict detection failures here are logged, never fail the
            // append: the event is durably recorded regardless.
            match self.events.by_entity(entity_type, entity_id).await {
                Ok(entity_events) => {
                    let conflicts = conflict::detect(&entity_events, self.clock.now());
                    for c in &conflicts {
                        warn!(conflict_id = %c.conflict_id, entity_type, entity_id, "conflict detected on append");
                    }
                }
                Err(e) => warn!(error = %e, entity_type, entity_id, "conflict scan failed after append"),
            }

            Ok(event)
        })
        .await
    }

    /// `batch_record(events[])`: processes in arrays bounded by
    /// `config.batch_size`; a failure on one event does not roll back
    /// events already committed earlier in the batch.
    #[instrument(skip(self, events))]
    pub async fn batch_record(&self, events: Vec<BatchEvent>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for chunk in events.chunks(self.config.batch_size) {
            for (offset, event) in chunk.iter().enumerate() {
                let index = outcome.saved_ids.len() + outcome.errors.len();
                let _ = offset;
                match self
                    .record_event(
                        &event.device_id,
                        &event.entity_type,
                        &event.entity_id,
                        event.operation,
                        event.payload.clone(),
                        event.vector_clock.clone(),
                    )
                    .await
                {
                    Ok(saved) => outcome.saved_ids.push(saved.event_id),
                    Err(error) => outcome.errors.push(BatchError { index, error }),
                }
            }
        }
        outcome
    }

    /// `get_unresolved_conflicts(user_id)`.
    #[instrument(skip(self))]
    pub async fn get_unresolved_conflicts(&self, user_id: &str) -> SyncResult<Vec<Conflict>> {
        self.with_timeout(async {
            let device_ids = self.user_device_ids(user_id).await?;
            let unresolved = self.events.unresolved_for_user(&device_ids).await?;
            Ok(conflict::detect(&unresolved, self.clock.now()))
        })
        .await
    }

    /// `sync_status(device_id)`.
    #[instrument(skip(self))]
    pub async fn sync_status(&self, device_id: &DeviceId) -> SyncResult<SyncStatus> {
        self.with_timeout(async {
            let device = self
                .devices
                .find_by_id(device_id)
                .await?
                .ok_or_else(|| SyncError::DeviceNotFound {
                    device_id: device_id.clone(),
                })?;

            let since = device.last_sync_at.unwrap_or_else(epoch);
            let pending = self.events.by_device_since(device_id, since).await?;

            let device_ids = self.user_device_ids(&device.user_id).await?;
            let unresolved = self.events.unresolved_for_user(&device_ids).await?;
            let conflicts = conflict::detect(&unresolved, self.clock.now());
            let conflicts_involving_device = conflicts
                .iter()
                .filter(|c| c.events.iter().any(|e| e.device_id == *device_id))
                .count();

            let clock = self
                .events
                .latest_for_device(device_id)
                .await?
                .map(|e| e.vector_clock)
                .unwrap_or_else(|| VectorClock::create(device_id.0.clone()));

            let healthy = device.active
                && conflicts_involving_device == 0
                && device
                    .last_sync_at
                    .map(|t| (self.clock.now() - t).num_milliseconds() <= self.config.healthy_sync_window_ms)
                    .unwrap_or(false);

            Ok(SyncStatus {
                last_sync_at: device.last_sync_at,
                pending_count: pending.len(),
                unresolved_conflicts_involving_device: conflicts_involving_device,
                clock,
                healthy,
            })
        })
        .await
    }

    /// Lists a user's devices, newest-synced first.
    #[instrument(skip(self))]
    pub async fn list_devices(&self, user_id: &str, active_only: bool) -> SyncResult<Vec<Device>> {
        self.with_timeout(async { self.devices.list_for_user(user_id, active_only).await })
            .await
    }

    /// `statistics(user_id)`.
    #[instrument(skip(self))]
    pub async fn statistics(&self, user_id: &str) -> SyncResult<SyncStatistics> {
        self.with_timeout(async {
            let all_devices = self.devices.list_for_user(user_id, false).await?;
            let active_devices = all_devices.iter().filter(|d| d.active).count();
            let device_ids: Vec<DeviceId> = all_devices.iter().map(|d| d.device_id.clone()).collect();

            let total_events = self.events.count_for_user(&device_ids).await?;
            let unresolved = self.events.unresolved_for_user(&device_ids).await?;
            let unresolved_conflicts = conflict::detect(&unresolved, self.clock.now()).len();
            let latest_last_sync_at = all_devices.iter().filter_map(|d| d.last_sync_at).max();

            Ok(SyncStatistics {
                total_devices: all_devices.len(),
                active_devices,
                total_events,
                unresolved_conflicts,
                latest_last_sync_at,
            })
        })
        .await
    }

    /// Maintenance hook, invoked by an external scheduler (or the CLI's
    /// `maintain` subcommand) on its own cadence — this crate does not
    /// spawn a background timer for it.
    #[instrument(skip(self))]
    pub async fn delete_resolved_before(&self, device_id: &DeviceId, before: DateTime<Utc>) -> usize {
        match self.events.delete_resolved_before(device_id, before).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "maintenance pass failed, swallowing");
                0
            }
        }
    }

    async fn active_device(&self, device_id: &DeviceId) -> SyncResult<Device> {
        let device = self
            .devices
            .find_by_id(device_id)
            .await?
            .ok_or_else(|| SyncError::DeviceNotFound {
                device_id: device_id.clone(),
            })?;
        if !device.active {
            return Err(SyncError::DeviceInactive {
                device_id: device_id.clone(),
            });
        }
        Ok(device)
    }

    async fn user_device_ids(&self, user_id: &str) -> SyncResult<Vec<DeviceId>> {
        Ok(self
            .devices
            .list_for_user(user_id, false)
            .await?
            .into_iter()
            .map(|d| d.device_id)
            .collect())
    }
}

fn epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(0, 0).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_registry::InMemoryDeviceStore;
    use crate::event_log::InMemoryEventStore;
    use crate::ports::{FixedClock, SequentialIdGen};
    use serde_json::json;

    fn make_coordinator() -> SyncCoordinator {
        let events: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
        let devices: Arc<dyn DeviceStore> = Arc::new(InMemoryDeviceStore::new());
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(Utc::now(), chrono::Duration::milliseconds(10)));
        let ids: Arc<dyn IdGen> = Arc::new(SequentialIdGen::new("evt-"));
        SyncCoordinator::new(events, devices, clock, ids, SyncConfig::default())
    }

    #[tokio::test]
    async fn register_device_emits_create_event_with_initial_clock() {
        let coordinator = make_coordinator();
        let (device, clock) = coordinator
            .register_device("u1", "Workstation", DeviceKind::Desktop, "linux")
            .await
            .unwrap();
        assert!(device.active);
        assert_eq!(clock.get(&device.device_id.0), 0);
    }

    #[tokio::test]
    async fn register_device_rejects_duplicate_active_name() {
        let coordinator = make_coordinator();
        coordinator
            .register_device("u1", "Workstation", DeviceKind::Desktop, "linux")
            .await
            .unwrap();
        let err = coordinator
            .register_device("u1", "Workstation", DeviceKind::Mobile, "android")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_DEVICE");
    }

    #[tokio::test]
    async fn scenario_s1_single_device_create_update() {
        let coordinator = make_coordinator();
        let (device, _) = coordinator
            .register_device("u1", "d1", DeviceKind::Desktop, "linux")
            .await
            .unwrap();

        let mut c1 = VectorClock::empty();
        c1.set(&device.device_id.0, 1);
        coordinator
            .record_event(&device.device_id, "Message", "m1", Operation::Create, json!({"content": "hello"}), c1)
            .await
            .unwrap();

        let mut c2 = VectorClock::empty();
        c2.set(&device.device_id.0, 2);
        coordinator
            .record_event(&device.device_id, "Message", "m1", Operation::Update, json!({"content": "hi"}), c2)
            .await
            .unwrap();

        let session = coordinator.initiate_sync(&device.device_id).await.unwrap();
        // The device's own Device/CREATE event plus the two Message events.
        assert_eq!(session.pending_events.len(), 3);
        assert_eq!(session.current_clock.get(&device.device_id.0), 2);

        let conflicts = coordinator.get_unresolved_conflicts("u1").await.unwrap();
        assert!(conflicts.is_empty());
    }

    #[tokio::test]
    async fn record_event_rejects_stale_counter() {
        let coordinator = make_coordinator();
        let (device, _) = coordinator
            .register_device("u1", "d1", DeviceKind::Desktop, "linux")
            .await
            .unwrap();

        let mut c1 = VectorClock::empty();
        c1.set(&device.device_id.0, 2);
        coordinator
            .record_event(&device.device_id, "Message", "m1", Operation::Update, json!({"v": 1}), c1)
            .await
            .unwrap();

        let mut stale = VectorClock::empty();
        stale.set(&device.device_id.0, 1);
        let err = coordinator
            .record_event(&device.device_id, "Message", "m1", Operation::Update, json!({"v": 2}), stale)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "STALE_DEVICE_COUNTER");
    }

    #[tokio::test]
    async fn record_event_rejects_inactive_device() {
        let coordinator = make_coordinator();
        let (device, _) = coordinator
            .register_device("u1", "d1", DeviceKind::Desktop, "linux")
            .await
            .unwrap();
        coordinator.deactivate_device(&device.device_id).await.unwrap();

        let mut c1 = VectorClock::empty();
        c1.set(&device.device_id.0, 1);
        let err = coordinator
            .record_event(&device.device_id, "Message", "m1", Operation::Create, json!({}), c1)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DEVICE_INACTIVE");
    }

    #[tokio::test]
    async fn scenario_s3_concurrent_update_conflict_then_lww() {
        let coordinator = make_coordinator();
        let (d1, _) = coordinator
            .register_device("u1", "d1", DeviceKind::Desktop, "linux")
            .await
            .unwrap();
        let (d2, _) = coordinator
            .register_device("u1", "d2", DeviceKind::Mobile, "android")
            .await
            .unwrap();

        let mut c1 = VectorClock::empty();
        c1.set(&d1.device_id.0, 2);
        c1.set(&d2.device_id.0, 1);
        coordinator
            .record_event(&d1.device_id, "Thread", "t1", Operation::Update, json!({"title": "A"}), c1)
            .await
            .unwrap();

        let mut c2 = VectorClock::empty();
        c2.set(&d1.device_id.0, 1);
        c2.set(&d2.device_id.0, 2);
        coordinator
            .record_event(&d2.device_id, "Thread", "t1", Operation::Update, json!({"title": "B"}), c2)
            .await
            .unwrap();

        let conflicts = coordinator.get_unresolved_conflicts("u1").await.unwrap();
        assert_eq!(conflicts.len(), 1);

        let resolved_id = coordinator
            .resolver()
            .resolve(&conflicts[0].conflict_id, ResolutionStrategy::LastWriteWins, None)
            .await
            .unwrap();

        let status_after = coordinator.get_unresolved_conflicts("u1").await.unwrap();
        assert!(status_after.is_empty());
        assert!(!resolved_id.is_empty());
    }

    #[tokio::test]
    async fn complete_sync_clamps_monotonically() {
        let coordinator = make_coordinator();
        let (device, _) = coordinator
            .register_device("u1", "d1", DeviceKind::Desktop, "linux")
            .await
            .unwrap();

        let t1 = Utc::now();
        coordinator.complete_sync(&device.device_id, t1).await.unwrap();
        let earlier = t1 - chrono::Duration::hours(1);
        coordinator.complete_sync(&device.device_id, earlier).await.unwrap();

        let status = coordinator.sync_status(&device.device_id).await.unwrap();
        assert_eq!(status.last_sync_at, Some(t1));
    }

    #[tokio::test]
    async fn sync_status_pending_count_matches_by_device_since() {
        let coordinator = make_coordinator();
        let (device, _) = coordinator
            .register_device("u1", "d1", DeviceKind::Desktop, "linux")
            .await
            .unwrap();

        let mut c1 = VectorClock::empty();
        c1.set(&device.device_id.0, 1);
        coordinator
            .record_event(&device.device_id, "Message", "m1", Operation::Create, json!({}), c1)
            .await
            .unwrap();

        let status = coordinator.sync_status(&device.device_id).await.unwrap();
        let session = coordinator.initiate_sync(&device.device_id).await.unwrap();
        assert_eq!(status.pending_count, session.pending_events.len());
    }

    #[tokio::test]
    async fn batch_record_reports_per_event_errors_by_index() {
        let coordinator = make_coordinator();
        let (device, _) = coordinator
            .register_device("u1", "d1", DeviceKind::Desktop, "linux")
            .await
            .unwrap();

        let mut ok_clock = VectorClock::empty();
        ok_clock.set(&device.device_id.0, 1);
        let mut stale_clock = VectorClock::empty();
        stale_clock.set(&device.device_id.0, 0);

        let batch = vec![
            BatchEvent {
                device_id: device.device_id.clone(),
                entity_type: "Message".to_string(),
                entity_id: "m1".to_string(),
                operation: Operation::Create,
                payload: json!({}),
                vector_clock: ok_clock,
            },
            BatchEvent {
                device_id: DeviceId("ghost".to_string()),
                entity_type: "Message".to_string(),
                entity_id: "m2".to_string(),
                operation: Operation::Create,
                payload: json!({}),
                vector_clock: stale_clock,
            },
        ];

        let outcome = coordinator.batch_record(batch).await;
        assert_eq!(outcome.saved_ids.len(), 1);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].index, 1);
        assert_eq!(outcome.errors[0].error.code(), "DEVICE_NOT_FOUND");
    }
}

//! Event log (C3): append-only persistence of sync events and the
//! `EventStore` port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::VectorClock;
use crate::device_registry::DeviceId;
use crate::error::SyncResult;

/// Kind of mutation a [`SyncEvent`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATE" => Some(Operation::Create),
            "UPDATE" => Some(Operation::Update),
            "DELETE" => Some(Operation::Delete),
            _ => None,
        }
    }
}

/// Which strategy resolved a conflict, recorded on the resolution event
/// and on the two events it resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionKind {
    LastWriteWins,
    Manual,
    Merge,
}

impl ResolutionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionKind::LastWriteWins => "LAST_WRITE_WINS",
            ResolutionKind::Manual => "MANUAL",
            ResolutionKind::Merge => "MERGE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LAST_WRITE_WINS" => Some(ResolutionKind::LastWriteWins),
            "MANUAL" => Some(ResolutionKind::Manual),
            "MERGE" => Some(ResolutionKind::Merge),
            _ => None,
        }
    }
}

/// Append-only record of one mutation to one entity, originated by one
/// device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub event_id: String,
    pub device_id: DeviceId,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: Operation,
    pub payload: Value,
    pub vector_clock: VectorClock,
    pub synced_at: DateTime<Utc>,
    pub conflict_resolved: bool,
    pub resolution_strategy: Option<ResolutionKind>,
}

/// A new event awaiting an `event_id` and `synced_at` stamp, as submitted
/// to [`EventStore::append`].
#[derive(Debug, Clone)]
pub struct NewSyncEvent {
    pub device_id: DeviceId,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: Operation,
    pub payload: Value,
    pub vector_clock: VectorClock,
}

/// Repository port the sync engine depends on for event persistence.
///
/// The coordinator treats the log as ground truth: no in-memory caching
/// of events is permitted across requests, so every query here goes
/// through this port.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, event: NewSyncEvent, synced_at: DateTime<Utc>, event_id: String) -> SyncResult<SyncEvent>;
    async fn by_entity(&self, entity_type: &str, entity_id: &str) -> SyncResult<Vec<SyncEvent>>;
    async fn by_device_since(&self, device_id: &DeviceId, since: DateTime<Utc>) -> SyncResult<Vec<SyncEvent>>;
    async fn latest_for_device(&self, device_id: &DeviceId) -> SyncResult<Option<SyncEvent>>;
    async fn find_by_id(&self, event_id: &str) -> SyncResult<Option<SyncEvent>>;
    async fn mark_resolved(&self, event_ids: &[String], strategy: ResolutionKind) -> SyncResult<()>;
    async fn unresolved_for_user(&self, device_ids: &[DeviceId]) -> SyncResult<Vec<SyncEvent>>;
    async fn count_for_user(&self, device_ids: &[DeviceId]) -> SyncResult<usize>;
    async fn delete_resolved_before(&self, device_id: &DeviceId, before: DateTime<Utc>) -> SyncResult<usize>;
}

// ── In-memory adapter ────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryEventStore {
    events: Mutex<Vec<SyncEvent>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, event: NewSyncEvent, synced_at: DateTime<Utc>, event_id: String) -> SyncResult<SyncEvent> {
        let stored = SyncEvent {
            event_id,
            device_id: event.device_id,
            entity_type: event.entity_type,
            entity_id: event.entity_id,
            operation: event.operation,
            payload: event.payload,
            vector_clock: event.vector_clock,
            synced_at,
            conflict_resolved: false,
            resolution_strategy: None,
        };
        self.events.lock().push(stored.clone());
        Ok(stored)
    }

    async fn by_entity(&self, entity_type: &str, entity_id: &str) -> SyncResult<Vec<SyncEvent>> {
        let mut events: Vec<SyncEvent> = self
            .events
            .lock()
            .iter()
            .filter(|e| e.entity_type == entity_type && e.entity_id == entity_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.synced_at);
        Ok(events)
    }

    async fn by_device_since(&self, device_id: &DeviceId, since: DateTime<Utc>) -> SyncResult<Vec<SyncEvent>> {
        let mut events: Vec<SyncEvent> = self
            .events
            .lock()
            .iter()
            .filter(|e| e.device_id == *device_id && e.synced_at > since)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.synced_at);
        Ok(events)
    }

    async fn latest_for_device(&self, device_id: &DeviceId) -> SyncResult<Option<SyncEvent>> {
        Ok(self
            .events
            .lock()
            .iter()
            .filter(|e| e.device_id == *device_id)
            .max_by_key(|e| e.synced_at)
            .cloned())
    }

    async fn find_by_id(&self, event_id: &str) -> SyncResult<Option<SyncEvent>> {
        Ok(self.events.lock().iter().find(|e| e.event_id == event_id).cloned())
    }

    async fn mark_resolved(&self, event_ids: &[String], strategy: ResolutionKind) -> SyncResult<()> {
        let mut events = self.events.lock();
        for event in events.iter_mut() {
            if event_ids.contains(&event.event_id) {
                event.conflict_resolved = true;
                event.resolution_strategy = Some(strategy);
            }
        }
        Ok(())
    }

    async fn unresolved_for_user(&self, device_ids: &[DeviceId]) -> SyncResult<Vec<SyncEvent>> {
        Ok(self
            .events
            .lock()
            .iter()
            .filter(|e| !e.conflict_resolved && device_ids.contains(&e.device_id))
            .cloned()
            .collect())
    }

    async fn count_for_user(&self, device_ids: &[DeviceId]) -> SyncResult<usize> {
        Ok(self
            .events
            .lock()
            .iter()
            .filter(|e| device_ids.contains(&e.device_id))
            .count())
    }

    async fn delete_resolved_before(&self, device_id: &DeviceId, before: DateTime<Utc>) -> SyncResult<usize> {
        let mut events = self.events.lock();
        let before_len = events.len();
        events.retain(|e| !(e.device_id == *device_id && e.conflict_resolved && e.synced_at < before));
        Ok(before_len - events.len())
    }
}

// ── SQLite adapter ───────────────────────────────────────────────────────

/// `rusqlite`-backed `EventStore`, grounded on this codebase's existing
/// `init_db`/journal table conventions (`memory/sync.rs`).
pub struct SqliteEventStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteEventStore {
    pub fn new(pool: Pool<SqliteConnectionManager>) -> SyncResult<Self> {
        let conn = pool.get()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sync_events (
                event_id TEXT PRIMARY KEY,
                device_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                payload TEXT NOT NULL,
                vector_clock TEXT NOT NULL,
                synced_at TEXT NOT NULL,
                conflict_resolved INTEGER NOT NULL DEFAULT 0,
                resolution_strategy TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_events_entity ON sync_events(entity_type, entity_id);
            CREATE INDEX IF NOT EXISTS idx_events_device_synced ON sync_events(device_id, synced_at);
            CREATE INDEX IF NOT EXISTS idx_events_resolved ON sync_events(conflict_resolved);",
        )?;
        Ok(Self { pool })
    }

    fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<SyncEvent> {
        let operation: String = row.get("operation")?;
        let payload: String = row.get("payload")?;
        let clock: String = row.get("vector_clock")?;
        let synced_at: String = row.get("synced_at")?;
        let strategy: Option<String> = row.get("resolution_strategy")?;
        Ok(SyncEvent {
            event_id: row.get("event_id")?,
            device_id: DeviceId(row.get("device_id")?),
            entity_type: row.get("entity_type")?,
            entity_id: row.get("entity_id")?,
            operation: Operation::parse(&operation).unwrap_or(Operation::Update),
            payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
            vector_clock: serde_json::from_str(&clock).unwrap_or_else(|_| VectorClock::empty()),
            synced_at: DateTime::parse_from_rfc3339(&synced_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            conflict_resolved: row.get::<_, i64>("conflict_resolved")? != 0,
            resolution_strategy: strategy.and_then(|s| ResolutionKind::parse(&s)),
        })
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn append(&self, event: NewSyncEvent, synced_at: DateTime<Utc>, event_id: String) -> SyncResult<SyncEvent> {
        let conn = self.pool.get()?;
        let payload = serde_json::to_string(&event.payload).map_err(|e| crate::error::SyncError::Validation {
            detail: format!("payload is not serializable: {e}"),
        })?;
        let clock = serde_json::to_string(&event.vector_clock).map_err(|e| crate::error::SyncError::Validation {
            detail: format!("vector clock is not serializable: {e}"),
        })?;
        conn.execute(
            "INSERT INTO sync_events
                (event_id, device_id, entity_type, entity_id, operation, payload, vector_clock, synced_at, conflict_resolved, resolution_strategy)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, NULL)",
            rusqlite::params![
                event_id,
                event.device_id.0,
                event.entity_type,
                event.entity_id,
                event.operation.as_str(),
                payload,
                clock,
                synced_at.to_rfc3339(),
            ],
        )?;
        Ok(SyncEvent {
            event_id,
            device_id: event.device_id,
            entity_type: event.entity_type,
            entity_id: event.entity_id,
            operation: event.operation,
            payload: event.payload,
            vector_clock: event.vector_clock,
            synced_at,
            conflict_resolved: false,
            resolution_strategy: None,
        })
    }

    async fn by_entity(&self, entity_type: &str, entity_id: &str) -> SyncResult<Vec<SyncEvent>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM sync_events WHERE entity_type = ?1 AND entity_id = ?2 ORDER BY synced_at ASC",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![entity_type, entity_id], Self::row_to_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn by_device_since(&self, device_id: &DeviceId, since: DateTime<Utc>) -> SyncResult<Vec<SyncEvent>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM sync_events WHERE device_id = ?1 AND synced_at > ?2 ORDER BY synced_at ASC",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![device_id.0, since.to_rfc3339()], Self::row_to_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn latest_for_device(&self, device_id: &DeviceId) -> SyncResult<Option<SyncEvent>> {
        let conn = self.pool.get()?;
        conn.query_row(
            "SELECT * FROM sync_events WHERE device_id = ?1 ORDER BY synced_at DESC LIMIT 1",
            rusqlite::params![device_id.0],
            Self::row_to_event,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other.into()),
        })
    }

    async fn find_by_id(&self, event_id: &str) -> SyncResult<Option<SyncEvent>> {
        let conn = self.pool.get()?;
        conn.query_row(
            "SELECT * FROM sync_events WHERE event_id = ?1",
            rusqlite::params![event_id],
            Self::row_to_event,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other.into()),
        })
    }

    async fn mark_resolved(&self, event_ids: &[String], strategy: ResolutionKind) -> SyncResult<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        for event_id in event_ids {
            tx.execute(
                "UPDATE sync_events SET conflict_resolved = 1, resolution_strategy = ?1 WHERE event_id = ?2",
                rusqlite::params![strategy.as_str(), event_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn unresolved_for_user(&self, device_ids: &[DeviceId]) -> SyncResult<Vec<SyncEvent>> {
        if device_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.pool.get()?;
        let placeholders = device_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let query = format!(
            "SELECT * FROM sync_events WHERE conflict_resolved = 0 AND device_id IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&query)?;
        let params: Vec<&dyn rusqlite::ToSql> = device_ids.iter().map(|d| &d.0 as &dyn rusqlite::ToSql).collect();
        let rows = stmt
            .query_map(params.as_slice(), Self::row_to_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn count_for_user(&self, device_ids: &[DeviceId]) -> SyncResult<usize> {
        if device_ids.is_empty() {
            return Ok(0);
        }
        let conn = self.pool.get()?;
        let placeholders = device_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let query = format!("SELECT COUNT(*) FROM sync_events WHERE device_id IN ({placeholders})");
        let params: Vec<&dyn rusqlite::ToSql> = device_ids.iter().map(|d| &d.0 as &dyn rusqlite::ToSql).collect();
        let count: i64 = conn.query_row(&query, params.as_slice(), |r| r.get(0))?;
        Ok(count as usize)
    }

    async fn delete_resolved_before(&self, device_id: &DeviceId, before: DateTime<Utc>) -> SyncResult<usize> {
        let conn = self.pool.get()?;
        let deleted = conn.execute(
            "DELETE FROM sync_events WHERE device_id = ?1 AND conflict_resolved = 1 AND synced_at < ?2",
            rusqlite::params![device_id.0, before.to_rfc3339()],
        )?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_event(device_id: &str, entity_id: &str, clock: VectorClock) -> NewSyncEvent {
        NewSyncEvent {
            device_id: DeviceId(device_id.to_string()),
            entity_type: "Message".to_string(),
            entity_id: entity_id.to_string(),
            operation: Operation::Create,
            payload: json!({"content": "hello"}),
            vector_clock: clock,
        }
    }

    #[tokio::test]
    async fn append_assigns_timestamp_and_id() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        let event = store
            .append(new_event("d1", "m1", VectorClock::create("d1")), now, "e1".to_string())
            .await
            .unwrap();
        assert_eq!(event.event_id, "e1");
        assert_eq!(event.synced_at, now);
        assert!(!event.conflict_resolved);
    }

    #[tokio::test]
    async fn by_device_since_is_exclusive_of_the_bound() {
        let store = InMemoryEventStore::new();
        let t0 = Utc::now();
        store
            .append(new_event("d1", "m1", VectorClock::create("d1")), t0, "e1".to_string())
            .await
            .unwrap();
        let t1 = t0 + chrono::Duration::seconds(5);
        store
            .append(new_event("d1", "m2", VectorClock::create("d1")), t1, "e2".to_string())
            .await
            .unwrap();

        let pending = store
            .by_device_since(&DeviceId("d1".to_string()), t0)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event_id, "e2");
    }

    #[tokio::test]
    async fn mark_resolved_flips_flag_for_named_events_only() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        store
            .append(new_event("d1", "m1", VectorClock::create("d1")), now, "e1".to_string())
            .await
            .unwrap();
        store
            .append(new_event("d2", "m1", VectorClock::create("d2")), now, "e2".to_string())
            .await
            .unwrap();

        store
            .mark_resolved(&["e1".to_string()], ResolutionKind::LastWriteWins)
            .await
            .unwrap();

        let e1 = store.find_by_id("e1").await.unwrap().unwrap();
        let e2 = store.find_by_id("e2").await.unwrap().unwrap();
        assert!(e1.conflict_resolved);
        assert!(!e2.conflict_resolved);
    }

    #[tokio::test]
    async fn delete_resolved_before_only_removes_resolved_events() {
        let store = InMemoryEventStore::new();
        let old = Utc::now() - chrono::Duration::days(40);
        store
            .append(new_event("d1", "m1", VectorClock::create("d1")), old, "e1".to_string())
            .await
            .unwrap();
        store.mark_resolved(&["e1".to_string()], ResolutionKind::LastWriteWins).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::days(30);
        let deleted = store.delete_resolved_before(&DeviceId("d1".to_string()), cutoff).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.find_by_id("e1").await.unwrap().is_none());
    }
}

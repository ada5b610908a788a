//! Device registry (C4): device lifecycle and the `DeviceStore` port.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Opaque, unique device identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        DeviceId(s)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        DeviceId(s.to_string())
    }
}

/// Class of client a device represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceKind {
    Desktop,
    Mobile,
    Web,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Desktop => "DESKTOP",
            DeviceKind::Mobile => "MOBILE",
            DeviceKind::Web => "WEB",
        }
    }

    pub fn parse(s: &str) -> SyncResult<Self> {
        match s {
            "DESKTOP" => Ok(DeviceKind::Desktop),
            "MOBILE" => Ok(DeviceKind::Mobile),
            "WEB" => Ok(DeviceKind::Web),
            other => Err(SyncError::Validation {
                detail: format!("unknown device kind: {other}"),
            }),
        }
    }
}

/// A registered device belonging to one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: DeviceId,
    pub user_id: String,
    pub name: String,
    pub kind: DeviceKind,
    pub platform: String,
    pub active: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// Repository port the sync engine depends on for device persistence.
///
/// Implemented independently of the core's logic (no ambient singleton
/// data source) — this crate ships a SQLite-backed adapter and an
/// in-memory adapter for tests.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn insert(&self, device: Device) -> SyncResult<Device>;
    async fn find_by_user_name_active(&self, user_id: &str, name: &str) -> SyncResult<Option<Device>>;
    async fn find_by_id(&self, device_id: &DeviceId) -> SyncResult<Option<Device>>;
    async fn list_for_user(&self, user_id: &str, active_only: bool) -> SyncResult<Vec<Device>>;
    async fn update_last_sync(&self, device_id: &DeviceId, at: DateTime<Utc>) -> SyncResult<()>;
    async fn set_active(&self, device_id: &DeviceId, active: bool) -> SyncResult<()>;
}

// ── In-memory adapter ────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryDeviceStore {
    devices: Mutex<HashMap<DeviceId, Device>>,
}

impl InMemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceStore for InMemoryDeviceStore {
    async fn insert(&self, device: Device) -> SyncResult<Device> {
        let mut devices = self.devices.lock();
        devices.insert(device.device_id.clone(), device.clone());
        Ok(device)
    }

    async fn find_by_user_name_active(&self, user_id: &str, name: &str) -> SyncResult<Option<Device>> {
        let devices = self.devices.lock();
        Ok(devices
            .values()
            .find(|d| d.active && d.user_id == user_id && d.name == name)
            .cloned())
    }

    async fn find_by_id(&self, device_id: &DeviceId) -> SyncResult<Option<Device>> {
        Ok(self.devices.lock().get(device_id).cloned())
    }

    async fn list_for_user(&self, user_id: &str, active_only: bool) -> SyncResult<Vec<Device>> {
        let devices = self.devices.lock();
        let mut result: Vec<Device> = devices
            .values()
            .filter(|d| d.user_id == user_id && (!active_only || d.active))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.last_sync_at.cmp(&a.last_sync_at));
        Ok(result)
    }

    async fn update_last_sync(&self, device_id: &DeviceId, at: DateTime<Utc>) -> SyncResult<()> {
        let mut devices = self.devices.lock();
        let device = devices.get_mut(device_id).ok_or_else(|| SyncError::DeviceNotFound {
            device_id: device_id.clone(),
        })?;
        device.last_sync_at = Some(at);
        Ok(())
    }

    async fn set_active(&self, device_id: &DeviceId, active: bool) -> SyncResult<()> {
        let mut devices = self.devices.lock();
        let device = devices.get_mut(device_id).ok_or_else(|| SyncError::DeviceNotFound {
            device_id: device_id.clone(),
        })?;
        device.active = active;
        Ok(())
    }
}

// ── SQLite adapter ───────────────────────────────────────────────────────

/// `rusqlite`-backed `DeviceStore`, grounded on the `devices` table and
/// `ON CONFLICT DO UPDATE` upsert idiom already used elsewhere in this
/// codebase's auth store.
pub struct SqliteDeviceStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteDeviceStore {
    pub fn new(pool: Pool<SqliteConnectionManager>) -> SyncResult<Self> {
        let conn = pool.get()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS devices (
                device_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                platform TEXT NOT NULL,
                active INTEGER NOT NULL,
                last_sync_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_devices_user ON devices(user_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_devices_user_name_active
                ON devices(user_id, name) WHERE active = 1;",
        )?;
        Ok(Self { pool })
    }

    fn row_to_device(row: &rusqlite::Row) -> rusqlite::Result<Device> {
        let last_sync_at: Option<String> = row.get("last_sync_at")?;
        let kind: String = row.get("kind")?;
        Ok(Device {
            device_id: DeviceId(row.get("device_id")?),
            user_id: row.get("user_id")?,
            name: row.get("name")?,
            kind: DeviceKind::parse(&kind).unwrap_or(DeviceKind::Desktop),
            platform: row.get("platform")?,
            active: row.get::<_, i64>("active")? != 0,
            last_sync_at: last_sync_at.and_then(|s| DateTime::parse_from_rfc3339(&s).ok().map(|d| d.with_timezone(&Utc))),
        })
    }
}

#[async_trait]
impl DeviceStore for SqliteDeviceStore {
    async fn insert(&self, device: Device) -> SyncResult<Device> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO devices (device_id, user_id, name, kind, platform, active, last_sync_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(device_id) DO UPDATE SET
                user_id = excluded.user_id,
                name = excluded.name,
                kind = excluded.kind,
                platform = excluded.platform,
                active = excluded.active,
                last_sync_at = excluded.last_sync_at",
            rusqlite::params![
                device.device_id.0,
                device.user_id,
                device.name,
                device.kind.as_str(),
                device.platform,
                device.active as i64,
                device.last_sync_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(device)
    }

    async fn find_by_user_name_active(&self, user_id: &str, name: &str) -> SyncResult<Option<Device>> {
        let conn = self.pool.get()?;
        conn.query_row(
            "SELECT * FROM devices WHERE user_id = ?1 AND name = ?2 AND active = 1",
            rusqlite::params![user_id, name],
            Self::row_to_device,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other.into()),
        })
    }

    async fn find_by_id(&self, device_id: &DeviceId) -> SyncResult<Option<Device>> {
        let conn = self.pool.get()?;
        conn.query_row(
            "SELECT * FROM devices WHERE device_id = ?1",
            rusqlite::params![device_id.0],
            Self::row_to_device,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other.into()),
        })
    }

    async fn list_for_user(&self, user_id: &str, active_only: bool) -> SyncResult<Vec<Device>> {
        let conn = self.pool.get()?;
        let query = if active_only {
            "SELECT * FROM devices WHERE user_id = ?1 AND active = 1 ORDER BY last_sync_at DESC"
        } else {
            "SELECT * FROM devices WHERE user_id = ?1 ORDER BY last_sync_at DESC"
        };
        let mut stmt = conn.prepare(query)?;
        let rows = stmt
            .query_map(rusqlite::params![user_id], Self::row_to_device)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn update_last_sync(&self, device_id: &DeviceId, at: DateTime<Utc>) -> SyncResult<()> {
        let conn = self.pool.get()?;
        let updated = conn.execute(
            "UPDATE devices SET last_sync_at = ?1 WHERE device_id = ?2",
            rusqlite::params![at.to_rfc3339(), device_id.0],
        )?;
        if updated == 0 {
            return Err(SyncError::DeviceNotFound {
                device_id: device_id.clone(),
            });
        }
        Ok(())
    }

    async fn set_active(&self, device_id: &DeviceId, active: bool) -> SyncResult<()> {
        let conn = self.pool.get()?;
        let updated = conn.execute(
            "UPDATE devices SET active = ?1 WHERE device_id = ?2",
            rusqlite::params![active as i64, device_id.0],
        )?;
        if updated == 0 {
            return Err(SyncError::DeviceNotFound {
                device_id: device_id.clone(),
            });
        }
        Ok(())
    }
}

//! `Clock` and `IdGen` ports: inject wall-clock time and id generation so
//! that tests stay deterministic instead of reaching for an implicit
//! `now()` or a bare random call.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Source of wall-clock time for `synced_at`/`detected_at` stamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// System-backed `Clock` — the production implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Collision-resistant opaque id generator for `event_id`/`device_id`.
pub trait IdGen: Send + Sync {
    fn new_id(&self) -> String;
}

/// UUIDv4-backed `IdGen` — the production implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGen;

impl IdGen for UuidGen {
    fn new_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

#[cfg(test)]
/// Deterministic test double: ticks forward by a fixed step on every call
/// so successive events sort predictably without a real clock.
pub struct FixedClock {
    pub start: DateTime<Utc>,
    pub step: chrono::Duration,
    pub calls: std::sync::atomic::AtomicI64,
}

#[cfg(test)]
impl FixedClock {
    pub fn new(start: DateTime<Utc>, step: chrono::Duration) -> Self {
        Self {
            start,
            step,
            calls: std::sync::atomic::AtomicI64::new(0),
        }
    }
}

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.start + self.step * n as i32
    }
}

#[cfg(test)]
/// Deterministic test double: returns ids from a fixed counter sequence.
pub struct SequentialIdGen {
    pub prefix: String,
    pub counter: std::sync::atomic::AtomicU64,
}

#[cfg(test)]
impl SequentialIdGen {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

#[cfg(test)]
impl IdGen for SequentialIdGen {
    fn new_id(&self) -> String {
        let n = self.counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        format!("{}{n}", self.prefix)
    }
}

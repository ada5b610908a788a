//! `syncmesh` — a multi-device synchronization engine: vector clocks, a
//! JSON delta/merge algebra, an append-only sync-event log, device
//! registry, conflict detection, conflict resolution, and the coordinator
//! that ties them together behind repository ports.

pub mod cli;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod delta;
pub mod device_registry;
pub mod error;
pub mod event_log;
pub mod ports;
pub mod resolver;

pub use clock::{ClockOrdering, VectorClock};
pub use config::SyncConfig;
pub use conflict::Conflict;
pub use coordinator::{BatchEvent, BatchOutcome, SyncCoordinator, SyncSession, SyncStatistics, SyncStatus};
pub use delta::{apply, checksum, diff, optimize, three_way_merge, Change, Delta, MergeConflict};
pub use device_registry::{Device, DeviceId, DeviceKind, DeviceStore};
pub use error::{SyncError, SyncResult};
pub use event_log::{EventStore, NewSyncEvent, Operation, ResolutionKind, SyncEvent};
pub use ports::{Clock, IdGen, SystemClock, UuidGen};
pub use resolver::{ConflictResolver, ResolutionStrategy};

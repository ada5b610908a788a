//! Command-line surface (A5): a thin dispatcher over [`SyncCoordinator`],
//! grounded on this codebase's existing `clap` derive + `tracing-subscriber`
//! bootstrap stack rather than a bespoke arg parser.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use r2d2_sqlite::SqliteConnectionManager;
use serde_json::json;

use crate::config::SyncConfig;
use crate::coordinator::SyncCoordinator;
use crate::device_registry::{DeviceId, DeviceKind, DeviceStore, SqliteDeviceStore};
use crate::event_log::{EventStore, SqliteEventStore};
use crate::ports::{Clock, IdGen, SystemClock, UuidGen};
use crate::resolver::ResolutionStrategy;

#[derive(Parser)]
#[command(name = "syncmesh", version, about = "Multi-device sync engine CLI")]
pub struct Cli {
    /// Path to a TOML config file; falls back to defaults + environment.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Device registry operations.
    Devices {
        #[command(subcommand)]
        action: DevicesAction,
    },
    /// Sync session operations.
    Sync {
        #[command(subcommand)]
        action: SyncAction,
    },
    /// Conflict inspection and resolution.
    Conflicts {
        #[command(subcommand)]
        action: ConflictsAction,
    },
    /// Run the maintenance sweep (`delete_resolved_before`) for one device.
    Maintain {
        #[arg(long = "device")]
        device_id: String,
        /// RFC 3339 cutoff; defaults to `now - max_event_age_resolved_secs`.
        #[arg(long)]
        before: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum DevicesAction {
    /// List a user's devices.
    List {
        #[arg(long = "user")]
        user_id: String,
        #[arg(long)]
        active_only: bool,
    },
    /// Register a new device.
    Register {
        #[arg(long = "user")]
        user_id: String,
        #[arg(long)]
        name: String,
        #[arg(long, value_enum)]
        kind: DeviceKindArg,
        #[arg(long)]
        platform: String,
    },
    /// Deactivate a device.
    Deactivate {
        #[arg(long = "device")]
        device_id: String,
    },
}

#[derive(Subcommand)]
pub enum SyncAction {
    /// Report `sync_status` for one device.
    Status {
        #[arg(long = "device")]
        device_id: String,
    },
    /// Report aggregate `statistics` for one user.
    Stats {
        #[arg(long = "user")]
        user_id: String,
    },
}

#[derive(Subcommand)]
pub enum ConflictsAction {
    /// List unresolved conflicts for a user.
    List {
        #[arg(long = "user")]
        user_id: String,
    },
    /// Resolve one conflict.
    Resolve {
        #[arg(long = "conflict")]
        conflict_id: String,
        #[arg(long, value_enum)]
        strategy: StrategyArg,
        /// Required JSON value when `strategy` is `manual`.
        #[arg(long = "resolution")]
        value: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum DeviceKindArg {
    Desktop,
    Mobile,
    Web,
}

impl From<DeviceKindArg> for DeviceKind {
    fn from(arg: DeviceKindArg) -> Self {
        match arg {
            DeviceKindArg::Desktop => DeviceKind::Desktop,
            DeviceKindArg::Mobile => DeviceKind::Mobile,
            DeviceKindArg::Web => DeviceKind::Web,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum StrategyArg {
    LastWriteWins,
    Manual,
    Merge,
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = SyncConfig::load(cli.config.as_deref())?;
    let db_path = config.resolved_database_path()?;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let manager = SqliteConnectionManager::file(&db_path);
    let pool = r2d2::Pool::new(manager)?;

    let events: Arc<dyn EventStore> = Arc::new(SqliteEventStore::new(pool.clone())?);
    let devices: Arc<dyn DeviceStore> = Arc::new(SqliteDeviceStore::new(pool)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ids: Arc<dyn IdGen> = Arc::new(UuidGen);
    let max_event_age_resolved_secs = config.max_event_age_resolved_secs;
    let coordinator = SyncCoordinator::new(events, devices, clock, ids, config);

    match cli.command {
        Command::Devices { action } => run_devices(&coordinator, action).await,
        Command::Sync { action } => run_sync(&coordinator, action).await,
        Command::Conflicts { action } => run_conflicts(&coordinator, action).await,
        Command::Maintain { device_id, before } => {
            let cutoff = match before {
                Some(raw) => chrono::DateTime::parse_from_rfc3339(&raw)?.with_timezone(&chrono::Utc),
                None => chrono::Utc::now() - chrono::Duration::seconds(max_event_age_resolved_secs),
            };
            let deleted = coordinator.delete_resolved_before(&DeviceId(device_id), cutoff).await;
            println!("{}", json!({"deleted": deleted}));
            Ok(())
        }
    }
}

async fn run_devices(coordinator: &SyncCoordinator, action: DevicesAction) -> anyhow::Result<()> {
    match action {
        DevicesAction::List { user_id, active_only } => {
            let devices = coordinator.list_devices(&user_id, active_only).await?;
            println!("{}", serde_json::to_string_pretty(&devices)?);
        }
        DevicesAction::Register {
            user_id,
            name,
            kind,
            platform,
        } => {
            let (device, clock) = coordinator.register_device(&user_id, &name, kind.into(), &platform).await?;
            println!("{}", json!({"device": device, "clock": clock}));
        }
        DevicesAction::Deactivate { device_id } => {
            coordinator.deactivate_device(&DeviceId(device_id)).await?;
            println!("{}", json!({"ok": true}));
        }
    }
    Ok(())
}

async fn run_sync(coordinator: &SyncCoordinator, action: SyncAction) -> anyhow::Result<()> {
    match action {
        SyncAction::Status { device_id } => {
            let status = coordinator.sync_status(&DeviceId(device_id)).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        SyncAction::Stats { user_id } => {
            let stats = coordinator.statistics(&user_id).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }
    Ok(())
}

async fn run_conflicts(coordinator: &SyncCoordinator, action: ConflictsAction) -> anyhow::Result<()> {
    match action {
        ConflictsAction::List { user_id } => {
            let conflicts = coordinator.get_unresolved_conflicts(&user_id).await?;
            println!("{}", serde_json::to_string_pretty(&conflicts)?);
        }
        ConflictsAction::Resolve {
            conflict_id,
            strategy,
            value,
        } => {
            let resolved_strategy = match strategy {
                StrategyArg::LastWriteWins => ResolutionStrategy::LastWriteWins,
                StrategyArg::Merge => ResolutionStrategy::Merge,
                StrategyArg::Manual => ResolutionStrategy::Manual,
            };
            let resolution = value.map(|raw| serde_json::from_str(&raw)).transpose()?;
            let new_event_id = coordinator
                .resolver()
                .resolve(&conflict_id, resolved_strategy, resolution)
                .await?;
            println!("{}", json!({"resolved_event_id": new_event_id}));
        }
    }
    Ok(())
}

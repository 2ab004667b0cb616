pub mod chapter;
pub mod config;
pub mod errors;
pub mod models;
pub mod reconcile;
pub mod remote;
pub mod series;
pub mod service;
pub mod store;
pub mod tags;

pub use crate::config::{CacheConfig, CacheSettings, HotkeySettings};
pub use crate::errors::{AppError, AppResult};
pub use crate::models::{
    CacheEvent, ChapterParent, ContentKind, MemoRecord, RemoteDocument, SeriesLink, SeriesMap, StatusLevel,
    StatusMessage, SyncReport, TagCounts,
};
pub use crate::remote::{InMemoryRemoteStore, RemoteOp, RemoteStore};
pub use crate::service::CacheService;

use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Startup sequence for a shell: logging, cache load from disk, periodic sync.
///
/// The returned service already renders the last persisted state; the sync
/// loop's first tick reconciles it with the remote store.
pub fn start(config: CacheConfig, remote: Arc<dyn RemoteStore>) -> AppResult<(CacheService, JoinHandle<()>)> {
    std::fs::create_dir_all(&config.data_dir)?;
    if let Err(error) = init_tracing(&config.log_dir()) {
        // An embedding application may already own the global subscriber.
        tracing::warn!(error = %error, "file logging not installed");
    }

    let service = CacheService::open(config, remote)?;
    let sync_task = service.start_background_sync()?;
    Ok((service, sync_task))
}

pub fn init_tracing(log_dir: &Path) -> Result<(), String> {
    std::fs::create_dir_all(log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "akashic-memo.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())
}

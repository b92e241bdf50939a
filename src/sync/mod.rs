pub mod config;
pub mod drive;
pub mod engine;
pub mod metadata;
pub mod oauth;
pub mod reconciler;
pub mod tokens;

mod manager;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ConfigError, ConfigLoader, Credentials, DriveEndpoints, LoadedConfig, SyncPaths};
pub use drive::{DriveClient, DriveError, ReqwestTransport};
pub use engine::{start_sync_engine, SyncCommand, SyncEngine, SyncHandle};
pub use manager::{
    Effect, ErrorKind, SyncError, SyncEvent, SyncManager, SyncMode, SyncPhase, SyncStatus,
};
pub use metadata::SyncStateFile;
pub use oauth::{AuthError, OAuthClient};
pub use reconciler::{ReconcileSummary, StructureReconciler};
pub use tokens::{TokenState, TokenStore};

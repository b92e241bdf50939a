use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use notesync_lib::storage::{NoteStore, SqliteNoteStore};
use notesync_lib::sync::{
    start_sync_engine, ConfigLoader, DriveClient, DriveEndpoints, LoadedConfig, ReqwestTransport,
    SyncEvent, SyncHandle, SyncManager, SyncPaths, TokenStore,
};

const KEYRING_SERVICE: &str = "notesync";

/// Longest a single command waits on Google Drive.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Shared application state for CLI commands
pub struct App {
    pub config: LoadedConfig,
    pub paths: SyncPaths,
    pub store: Arc<SqliteNoteStore>,
}

impl App {
    pub fn new(config_file: Option<PathBuf>, data_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match data_dir {
            Some(dir) => dir,
            None => SyncPaths::default_data_dir().context("Failed to get data directory")?,
        };
        let paths = SyncPaths::in_dir(&data_dir);

        let loader = match config_file {
            Some(path) => ConfigLoader::new().with_config_file(path),
            None => ConfigLoader::new(),
        };
        let config = loader.load();

        let store = SqliteNoteStore::open(&paths.database)
            .with_context(|| format!("Failed to open {}", paths.database.display()))?;

        Ok(Self {
            config,
            paths,
            store: Arc::new(store),
        })
    }

    pub fn manager(&self) -> Result<SyncManager> {
        let tokens = TokenStore::new(self.paths.tokens.clone()).with_keyring(KEYRING_SERVICE);
        let store: Arc<dyn NoteStore> = self.store.clone();
        SyncManager::new(
            self.config.credentials.clone(),
            DriveEndpoints::default(),
            tokens,
            self.paths.state.clone(),
            store,
        )
        .context("Failed to initialize sync")
    }

    /// Start the engine for commands that talk to Google Drive.
    pub async fn start_engine(&self) -> Result<Engine> {
        let manager = self.manager()?;
        let transport = ReqwestTransport::new().context("Failed to build HTTP client")?;
        let client = Arc::new(DriveClient::new(
            Arc::new(transport),
            DriveEndpoints::default(),
        ));
        let (handle, task) = start_sync_engine(manager, client, None);
        let events = handle.subscribe();
        let mut engine = Engine {
            handle,
            task,
            events,
        };
        engine.settle().await?;
        Ok(engine)
    }
}

pub struct Engine {
    pub handle: SyncHandle,
    task: JoinHandle<()>,
    events: broadcast::Receiver<SyncEvent>,
}

impl Engine {
    /// Wait for the engine's startup and drop the events it emitted, so
    /// later waits only see replies to this command.
    async fn settle(&mut self) -> Result<()> {
        self.handle.status().await?;
        while self.events.try_recv().is_ok() {}
        Ok(())
    }

    /// Feed events to `pick` until it produces a result.
    pub async fn wait_for<T>(
        &mut self,
        mut pick: impl FnMut(SyncEvent) -> Option<Result<T>>,
    ) -> Result<T> {
        let events = &mut self.events;
        let wait = async {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some(outcome) = pick(event) {
                            return outcome;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        log::warn!("CLI: missed {} sync event(s)", missed);
                    }
                    Err(RecvError::Closed) => bail!("Sync engine stopped unexpectedly"),
                }
            }
        };
        tokio::time::timeout(COMMAND_TIMEOUT, wait)
            .await
            .context("Timed out waiting for Google Drive")?
    }

    pub async fn shutdown(self) -> Result<()> {
        self.handle.shutdown();
        self.task.await.context("Sync engine panicked")
    }
}

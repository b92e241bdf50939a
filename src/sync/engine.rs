use std::future::pending;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, sleep_until, Instant, Interval, MissedTickBehavior};

use crate::storage::StoreEvent;

use super::drive::{Completion, DriveClient, SessionId};
use super::manager::{
    Effect, SyncError, SyncEvent, SyncManager, SyncMode, SyncStatus, TOKEN_CHECK_INTERVAL,
};

const COMMAND_CAPACITY: usize = 32;
const COMPLETION_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;

pub type Reply<T> = oneshot::Sender<Result<T, SyncError>>;

/// Messages to control the sync engine
#[derive(Debug)]
pub enum SyncCommand {
    StartAuthentication(Reply<String>),
    CompleteAuthentication { code: String, reply: Reply<()> },
    Sync { mode: SyncMode, reply: Reply<SessionId> },
    /// Editor save; fire and forget
    NoteChanged {
        folder: String,
        title: String,
        body: String,
    },
    Download { file_id: String, reply: Reply<()> },
    Delete { file_id: String, reply: Reply<()> },
    ListRemote(Reply<()>),
    SetAutoSync {
        enabled: bool,
        interval_minutes: i64,
        reply: Reply<()>,
    },
    Logout(Reply<()>),
    Status(oneshot::Sender<SyncStatus>),
    /// App closing
    Shutdown,
}

/// Handle for the sync engine
#[derive(Clone)]
pub struct SyncHandle {
    sender: mpsc::Sender<SyncCommand>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncHandle {
    /// Events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> SyncCommand,
    ) -> Result<T, SyncError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(command(reply))
            .await
            .map_err(|_| SyncError::EngineStopped)?;
        response.await.map_err(|_| SyncError::EngineStopped)?
    }

    /// Returns the authorization URL to open in a browser.
    pub async fn start_authentication(&self) -> Result<String, SyncError> {
        self.request(SyncCommand::StartAuthentication).await
    }

    pub async fn complete_authentication(&self, code: &str) -> Result<(), SyncError> {
        let code = code.to_string();
        self.request(|reply| SyncCommand::CompleteAuthentication { code, reply })
            .await
    }

    pub async fn sync(&self, mode: SyncMode) -> Result<SessionId, SyncError> {
        self.request(|reply| SyncCommand::Sync { mode, reply }).await
    }

    pub fn note_changed(&self, folder: &str, title: &str, body: &str) {
        let _ = self.sender.try_send(SyncCommand::NoteChanged {
            folder: folder.to_string(),
            title: title.to_string(),
            body: body.to_string(),
        });
    }

    pub async fn download(&self, file_id: &str) -> Result<(), SyncError> {
        let file_id = file_id.to_string();
        self.request(|reply| SyncCommand::Download { file_id, reply })
            .await
    }

    pub async fn delete(&self, file_id: &str) -> Result<(), SyncError> {
        let file_id = file_id.to_string();
        self.request(|reply| SyncCommand::Delete { file_id, reply }).await
    }

    pub async fn list_remote(&self) -> Result<(), SyncError> {
        self.request(SyncCommand::ListRemote).await
    }

    pub async fn set_auto_sync(&self, enabled: bool, interval_minutes: i64) -> Result<(), SyncError> {
        self.request(|reply| SyncCommand::SetAutoSync {
            enabled,
            interval_minutes,
            reply,
        })
        .await
    }

    pub async fn logout(&self) -> Result<(), SyncError> {
        self.request(SyncCommand::Logout).await
    }

    pub async fn status(&self) -> Result<SyncStatus, SyncError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(SyncCommand::Status(reply))
            .await
            .map_err(|_| SyncError::EngineStopped)?;
        response.await.map_err(|_| SyncError::EngineStopped)
    }

    /// Shut down the engine
    pub fn shutdown(&self) {
        let _ = self.sender.try_send(SyncCommand::Shutdown);
    }
}

enum Wake {
    Command(Option<SyncCommand>),
    Completion(Completion),
    AutoSync,
    TokenCheck,
    Reauth,
    Store(Result<StoreEvent, RecvError>),
}

/// Owns the [`SyncManager`] and carries out its effects: requests run as
/// spawned tasks that report back on one completion channel, timers drive
/// auto-sync, token checks and forced re-authentication.
pub struct SyncEngine {
    manager: SyncManager,
    client: Arc<DriveClient>,
    commands: mpsc::Receiver<SyncCommand>,
    completion_tx: mpsc::Sender<Completion>,
    completions: mpsc::Receiver<Completion>,
    store_events: Option<broadcast::Receiver<StoreEvent>>,
    events: broadcast::Sender<SyncEvent>,
    auto_sync: Option<Interval>,
    token_check: Interval,
    reauth_at: Option<Instant>,
}

impl SyncEngine {
    pub fn new(
        manager: SyncManager,
        client: Arc<DriveClient>,
        store_events: Option<broadcast::Receiver<StoreEvent>>,
    ) -> (Self, SyncHandle) {
        let (sender, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (completion_tx, completions) = mpsc::channel(COMPLETION_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let mut token_check = interval(TOKEN_CHECK_INTERVAL);
        token_check.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let handle = SyncHandle {
            sender,
            events: events.clone(),
        };
        let engine = Self {
            manager,
            client,
            commands,
            completion_tx,
            completions,
            store_events,
            events,
            auto_sync: None,
            token_check,
            reauth_at: None,
        };
        (engine, handle)
    }

    pub async fn run(mut self) {
        log::info!("Sync engine: started");
        self.manager.resume();
        self.apply_effects();

        loop {
            let wake = tokio::select! {
                command = self.commands.recv() => Wake::Command(command),
                Some(completion) = self.completions.recv() => Wake::Completion(completion),
                _ = tick(&mut self.auto_sync) => Wake::AutoSync,
                _ = self.token_check.tick() => Wake::TokenCheck,
                _ = sleep_until_opt(self.reauth_at) => Wake::Reauth,
                event = recv_store(&mut self.store_events) => Wake::Store(event),
            };

            match wake {
                Wake::Command(Some(SyncCommand::Shutdown)) | Wake::Command(None) => {
                    log::info!("Sync engine: shutting down");
                    break;
                }
                Wake::Command(Some(command)) => self.handle_command(command),
                Wake::Completion(completion) => self.manager.handle_completion(completion),
                Wake::AutoSync => {
                    log::debug!("Sync engine: auto-sync timer fired");
                    self.manager.on_auto_sync_tick();
                }
                Wake::TokenCheck => self.manager.check_tokens(Utc::now()),
                Wake::Reauth => {
                    self.reauth_at = None;
                    self.manager.force_reauthenticate();
                }
                Wake::Store(Ok(event)) => self.manager.handle_store_event(event),
                Wake::Store(Err(RecvError::Lagged(missed))) => {
                    log::warn!("Sync engine: missed {} store change(s)", missed);
                }
                Wake::Store(Err(RecvError::Closed)) => {
                    log::debug!("Sync engine: note store closed its change feed");
                    self.store_events = None;
                }
            }
            self.apply_effects();
        }
    }

    fn handle_command(&mut self, command: SyncCommand) {
        match command {
            SyncCommand::StartAuthentication(reply) => {
                let _ = reply.send(self.manager.start_authentication());
            }
            SyncCommand::CompleteAuthentication { code, reply } => {
                let _ = reply.send(self.manager.complete_authentication(&code));
            }
            SyncCommand::Sync { mode, reply } => {
                let _ = reply.send(self.manager.start_sync(mode));
            }
            SyncCommand::NoteChanged {
                folder,
                title,
                body,
            } => {
                if let Err(e) = self.manager.handle_note_changed(&folder, &title, &body) {
                    log::warn!("Sync engine: change to '{}/{}' not synced: {}", folder, title, e);
                }
            }
            SyncCommand::Download { file_id, reply } => {
                let _ = reply.send(self.manager.download_note(&file_id));
            }
            SyncCommand::Delete { file_id, reply } => {
                let _ = reply.send(self.manager.delete_remote_note(&file_id));
            }
            SyncCommand::ListRemote(reply) => {
                let _ = reply.send(self.manager.list_remote());
            }
            SyncCommand::SetAutoSync {
                enabled,
                interval_minutes,
                reply,
            } => {
                let _ = reply.send(self.manager.set_auto_sync(enabled, interval_minutes));
            }
            SyncCommand::Logout(reply) => {
                self.reauth_at = None;
                let _ = reply.send(self.manager.logout());
            }
            SyncCommand::Status(reply) => {
                let _ = reply.send(self.manager.status());
            }
            SyncCommand::Shutdown => {}
        }
    }

    fn apply_effects(&mut self) {
        for effect in self.manager.take_effects() {
            match effect {
                Effect::Dispatch(tagged) => self.client.dispatch(tagged, self.completion_tx.clone()),
                Effect::Emit(event) => {
                    // No subscribers is fine
                    let _ = self.events.send(event);
                }
                Effect::ScheduleReauth(delay) => {
                    self.reauth_at = Some(Instant::now() + delay);
                }
                Effect::AutoSync(Some(period)) => {
                    log::info!("Sync engine: auto-sync every {}s", period.as_secs());
                    let mut timer = interval_at(Instant::now() + period, period);
                    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    self.auto_sync = Some(timer);
                }
                Effect::AutoSync(None) => {
                    if self.auto_sync.take().is_some() {
                        log::info!("Sync engine: auto-sync stopped");
                    }
                }
            }
        }
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn recv_store(
    receiver: &mut Option<broadcast::Receiver<StoreEvent>>,
) -> Result<StoreEvent, RecvError> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => pending().await,
    }
}

/// Start the sync engine.
///
/// Spawns the engine loop on the current runtime and returns its handle.
pub fn start_sync_engine(
    manager: SyncManager,
    client: Arc<DriveClient>,
    store_events: Option<broadcast::Receiver<StoreEvent>>,
) -> (SyncHandle, JoinHandle<()>) {
    let (engine, handle) = SyncEngine::new(manager, client, store_events);
    let task = tokio::spawn(engine.run());
    (handle, task)
}

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::storage::{FolderStructure, NoteStore, StorageError, StoreEvent};

use super::config::{ConfigError, Credentials, DriveEndpoints};
use super::drive::{
    validate_upload, Completion, ContentIssue, DriveError, DriveReply, DriveRequest, RemoteFile,
    RequestId, RequestKind, SessionId, Tagged,
};
use super::metadata::SyncStateFile;
use super::oauth::{AuthError, Freshness, OAuthClient};
use super::reconciler::{
    ReconcileError, ReconcileEvent, ReconcileSummary, StructureReconciler, UpdatePolicy,
};
use super::tokens::{TokenState, TokenStore, TokenStoreError};

/// Delay before a forced re-authentication after an auth failure.
pub const REAUTH_DELAY: Duration = Duration::from_secs(1);

/// How often token expiry is checked.
pub const TOKEN_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("OAuth error: {0}")]
    Auth(#[from] AuthError),
    #[error("Drive error: {0}")]
    Drive(#[from] DriveError),
    #[error("Reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Token store error: {0}")]
    TokenStore(#[from] TokenStoreError),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Not authenticated")]
    NotAuthenticated,
    #[error("A sync is already running")]
    Busy,
    #[error("Access token expired and cannot be refreshed")]
    AuthExpired,
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),
    #[error("Authorization code rejected: {0}")]
    AuthorizationRejected(String),
    #[error("{failed} item(s) could not be synced")]
    Incomplete { failed: usize },
    #[error("Sync engine has stopped")]
    EngineStopped,
}

/// User-facing classification of a [`SyncError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    ConfigInvalid,
    NotAuthenticated,
    AuthExpired,
    RefreshFailed,
    ContentInvalid,
    RemoteRequestFailed,
    DuplicationRisk,
    Busy,
    LocalFailure,
}

fn drive_kind(error: &DriveError) -> ErrorKind {
    match error {
        DriveError::NotAuthenticated => ErrorKind::NotAuthenticated,
        DriveError::InvalidContent(_) => ErrorKind::ContentInvalid,
        DriveError::Unauthorized { .. } => ErrorKind::AuthExpired,
        DriveError::Server { .. } | DriveError::Transport(_) | DriveError::Malformed(_) => {
            ErrorKind::RemoteRequestFailed
        }
    }
}

impl SyncError {
    fn drive_error(&self) -> Option<&DriveError> {
        match self {
            SyncError::Drive(e)
            | SyncError::Auth(AuthError::Request(e))
            | SyncError::Reconcile(ReconcileError::Discovery(e)) => Some(e),
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        if let Some(e) = self.drive_error() {
            return drive_kind(e);
        }
        match self {
            SyncError::Config(_) => ErrorKind::ConfigInvalid,
            SyncError::Auth(AuthError::MissingClientCredentials) => ErrorKind::ConfigInvalid,
            SyncError::Auth(AuthError::EmptyCode) => ErrorKind::NotAuthenticated,
            SyncError::Auth(
                AuthError::NoRefreshToken
                | AuthError::RefreshInProgress
                | AuthError::NoRefreshPending,
            ) => {
                ErrorKind::RefreshFailed
            }
            SyncError::Auth(AuthError::EmptyGrant) => ErrorKind::RemoteRequestFailed,
            SyncError::Auth(AuthError::Store(_)) => ErrorKind::LocalFailure,
            SyncError::Reconcile(_) => ErrorKind::DuplicationRisk,
            SyncError::Storage(_)
            | SyncError::TokenStore(_)
            | SyncError::IO(_)
            | SyncError::Json(_)
            | SyncError::EngineStopped => ErrorKind::LocalFailure,
            SyncError::NotAuthenticated | SyncError::AuthorizationRejected(_) => {
                ErrorKind::NotAuthenticated
            }
            SyncError::Busy => ErrorKind::Busy,
            SyncError::AuthExpired => ErrorKind::AuthExpired,
            SyncError::RefreshFailed(_) => ErrorKind::RefreshFailed,
            SyncError::Incomplete { .. } => ErrorKind::RemoteRequestFailed,
            SyncError::Drive(e) | SyncError::Auth(AuthError::Request(e)) => drive_kind(e),
        }
    }

    /// Friendly text for the user. Technical detail stays in the log.
    pub fn user_message(&self) -> String {
        match self.kind() {
            ErrorKind::ConfigInvalid => {
                "Google Drive sync is not configured. Please check the client id and secret in notesync.conf."
                    .to_string()
            }
            ErrorKind::NotAuthenticated => match self {
                SyncError::AuthorizationRejected(_) => {
                    "Google Drive did not accept the authorization code. Please try connecting again."
                        .to_string()
                }
                _ => "Please connect to Google Drive first to sync your notes.".to_string(),
            },
            ErrorKind::AuthExpired | ErrorKind::RefreshFailed => {
                "Google Drive connection has expired. Please reconnect to Google Drive.".to_string()
            }
            ErrorKind::ContentInvalid => match self.drive_error() {
                Some(DriveError::InvalidContent(issue)) => issue.user_message().to_string(),
                _ => ContentIssue::Empty.user_message().to_string(),
            },
            ErrorKind::RemoteRequestFailed => match self {
                SyncError::Incomplete { failed } => format!(
                    "{} item(s) could not be synced to Google Drive. Please check your internet connection and try again.",
                    failed
                ),
                _ => "Unable to connect to Google Drive. Please check your internet connection and try again."
                    .to_string(),
            },
            ErrorKind::DuplicationRisk => {
                "Sync stopped to avoid creating duplicate folders on Google Drive. Please try again."
                    .to_string()
            }
            ErrorKind::Busy => "A sync is already in progress.".to_string(),
            ErrorKind::LocalFailure => format!("Could not access local sync data: {}", self),
        }
    }
}

impl From<SyncError> for String {
    fn from(err: SyncError) -> String {
        err.to_string()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncPhase {
    #[default]
    Idle,
    Authenticating,
    CheckingStructure,
    Syncing,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMode {
    /// Re-upload every note.
    Full,
    /// Upload only what changed.
    Smart,
    /// One note, typically just saved in the editor.
    SingleNote {
        folder: String,
        title: String,
        body: String,
    },
}

impl SyncMode {
    pub fn label(&self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::Smart => "smart",
            SyncMode::SingleNote { .. } => "single-note",
        }
    }

    fn policy(&self) -> UpdatePolicy {
        match self {
            SyncMode::Full => UpdatePolicy::Always,
            SyncMode::Smart | SyncMode::SingleNote { .. } => UpdatePolicy::IfChanged,
        }
    }
}

/// Notifications for whoever drives the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    PhaseChanged(SyncPhase),
    AuthenticationChanged(bool),
    ReauthenticationRequired {
        auth_url: String,
    },
    TokenRefreshed,
    SyncStarted {
        session: SessionId,
        mode: &'static str,
    },
    SyncProgress {
        current: usize,
        total: usize,
    },
    FolderCreated {
        name: String,
    },
    NoteUploaded {
        folder: String,
        title: String,
        remote_id: String,
    },
    NoteSkipped {
        folder: String,
        title: String,
        message: String,
    },
    NoteFailed {
        folder: String,
        title: String,
        message: String,
    },
    SyncCompleted {
        session: SessionId,
        summary: ReconcileSummary,
    },
    SyncFailed {
        session: Option<SessionId>,
        kind: ErrorKind,
        message: String,
    },
    NoteDownloaded {
        file_id: String,
        content: String,
    },
    NoteDeleted {
        file_id: String,
    },
    RemoteListing {
        files: Vec<RemoteFile>,
    },
    /// A request outside any sync session failed.
    OperationFailed {
        operation: RequestKind,
        kind: ErrorKind,
        message: String,
    },
}

/// Point-in-time view for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub authenticated: bool,
    pub syncing: bool,
    pub status_text: String,
    pub last_sync_text: String,
    pub auto_sync_enabled: bool,
    pub auto_sync_interval_minutes: i64,
    pub root_folder_id: Option<String>,
    pub config_error: Option<String>,
}

/// Work the manager asks its driver to carry out.
#[derive(Debug, Clone)]
pub enum Effect {
    Dispatch(Tagged),
    Emit(SyncEvent),
    /// Call [`SyncManager::force_reauthenticate`] after this delay.
    ScheduleReauth(Duration),
    /// Restart the auto-sync timer with this period, or stop it.
    AutoSync(Option<Duration>),
}

struct ActiveSync {
    id: SessionId,
    mode: SyncMode,
    /// Set once the root folder id is known.
    reconciler: Option<StructureReconciler>,
    in_flight: HashSet<RequestId>,
    /// The stored root id was found stale and looked up again.
    root_rechecked: bool,
    /// An editor save arrived mid-sync.
    changes_pending: bool,
}

/// The sync state machine.
///
/// Performs no I/O of its own apart from persisting tokens and sync state:
/// every remote call leaves as an [`Effect::Dispatch`] and comes back through
/// [`SyncManager::handle_completion`].
pub struct SyncManager {
    credentials: Credentials,
    config_error: Option<ConfigError>,
    oauth: OAuthClient,
    store: Arc<dyn NoteStore>,
    state: SyncStateFile,
    state_path: PathBuf,
    phase: SyncPhase,
    session: Option<ActiveSync>,
    /// The token refresh whose reply is still wanted.
    pending_refresh: Option<RequestId>,
    reauth_scheduled: bool,
    effects: Vec<Effect>,
}

impl SyncManager {
    /// Invalid credentials do not fail construction; they block sync until fixed.
    pub fn new(
        credentials: Credentials,
        endpoints: DriveEndpoints,
        token_store: TokenStore,
        state_path: PathBuf,
        store: Arc<dyn NoteStore>,
    ) -> Result<Self, SyncError> {
        let config_error = credentials.validate().err();
        if let Some(e) = &config_error {
            log::warn!("Sync: {}; sync is disabled until this is fixed", e);
        }
        let oauth = OAuthClient::new(credentials.clone(), endpoints, token_store)?;
        let state = SyncStateFile::load_or_default(&state_path);

        Ok(Self {
            credentials,
            config_error,
            oauth,
            store,
            state,
            state_path,
            phase: SyncPhase::Idle,
            session: None,
            pending_refresh: None,
            reauth_scheduled: false,
            effects: Vec::new(),
        })
    }

    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn is_syncing(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_authenticated(&self) -> bool {
        self.oauth.is_authenticated()
    }

    pub fn current_session(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id)
    }

    /// True while the running sync has finished discovery.
    pub fn structure_checked(&self) -> bool {
        self.session
            .as_ref()
            .and_then(|s| s.reconciler.as_ref())
            .map(StructureReconciler::structure_checked)
            .unwrap_or(false)
    }

    pub fn tokens(&self) -> &TokenState {
        self.oauth.tokens()
    }

    pub fn state(&self) -> &SyncStateFile {
        &self.state
    }

    pub fn config_error(&self) -> Option<&ConfigError> {
        self.config_error.as_ref()
    }

    pub fn status_text(&self) -> &'static str {
        if self.is_syncing() {
            "Syncing..."
        } else if self.is_authenticated() {
            "Connected"
        } else {
            "Not connected"
        }
    }

    pub fn last_sync_text(&self) -> String {
        match self.state.last_sync {
            Some(at) => at
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
            None => "Never".to_string(),
        }
    }

    pub fn auto_sync_interval(&self) -> Duration {
        Duration::from_secs(self.state.auto_sync_interval.max(1) as u64 * 60)
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            phase: self.phase,
            authenticated: self.is_authenticated(),
            syncing: self.is_syncing(),
            status_text: self.status_text().to_string(),
            last_sync_text: self.last_sync_text(),
            auto_sync_enabled: self.state.auto_sync_enabled,
            auto_sync_interval_minutes: self.state.auto_sync_interval,
            root_folder_id: self.state.root_folder_id.clone(),
            config_error: self.config_error.as_ref().map(ToString::to_string),
        }
    }

    /// Announce the restored state and start auto-sync if it was on.
    pub fn resume(&mut self) {
        let authenticated = self.is_authenticated();
        self.emit(SyncEvent::AuthenticationChanged(authenticated));
        if authenticated && self.state.auto_sync_enabled {
            self.effects
                .push(Effect::AutoSync(Some(self.auto_sync_interval())));
        }
    }

    fn ensure_configured(&self) -> Result<(), SyncError> {
        match &self.config_error {
            Some(e) => Err(e.clone().into()),
            None => Ok(()),
        }
    }

    fn require_auth(&self) -> Result<(), SyncError> {
        self.ensure_configured()?;
        if !self.is_authenticated() {
            return Err(SyncError::NotAuthenticated);
        }
        Ok(())
    }

    fn emit(&mut self, event: SyncEvent) {
        self.effects.push(Effect::Emit(event));
    }

    fn set_phase(&mut self, phase: SyncPhase) {
        if self.phase != phase {
            log::debug!("Sync: {:?} -> {:?}", self.phase, phase);
            self.phase = phase;
            self.emit(SyncEvent::PhaseChanged(phase));
        }
    }

    fn dispatch(&mut self, session: Option<SessionId>, request: DriveRequest) -> RequestId {
        let bearer = if request.needs_bearer() {
            self.oauth.access_token().map(str::to_string)
        } else {
            None
        };
        let tagged = Tagged::new(session, bearer, request);
        if let Some(active) = self.session.as_mut().filter(|s| Some(s.id) == session) {
            active.in_flight.insert(tagged.id);
        }
        let id = tagged.id;
        self.effects.push(Effect::Dispatch(tagged));
        id
    }

    fn save_state(&self) {
        if let Err(e) = self.state.save(&self.state_path) {
            log::error!(
                "Sync: could not save sync state to {}: {}",
                self.state_path.display(),
                e
            );
        }
    }

    // Authentication

    pub fn authorization_url(&self) -> Result<String, SyncError> {
        self.ensure_configured()?;
        Ok(self.oauth.build_authorization_url())
    }

    /// Begin connecting; the returned URL is opened in a browser.
    pub fn start_authentication(&mut self) -> Result<String, SyncError> {
        let url = self.authorization_url()?;
        if self.is_syncing() {
            return Err(SyncError::Busy);
        }
        self.set_phase(SyncPhase::Authenticating);
        Ok(url)
    }

    /// Exchange the code the user pasted back.
    pub fn complete_authentication(&mut self, code: &str) -> Result<(), SyncError> {
        self.ensure_configured()?;
        if self.is_syncing() {
            return Err(SyncError::Busy);
        }
        let form = self.oauth.exchange_form(code)?;
        log::info!(
            "OAuth: exchanging authorization code ({} chars)",
            code.trim().len()
        );
        self.set_phase(SyncPhase::Authenticating);
        self.dispatch(None, DriveRequest::AuthExchange { form });
        Ok(())
    }

    fn on_authorization(&mut self, reply: Result<DriveReply, DriveError>) {
        let grant = match reply {
            Ok(DriveReply::Tokens(grant)) => grant,
            Ok(other) => {
                let error = DriveError::Malformed(format!("unexpected token reply: {:?}", other));
                return self.authorization_failed(error.into());
            }
            Err(e @ DriveError::Server { status: 400..=499, .. }) => {
                return self.authorization_failed(SyncError::AuthorizationRejected(e.to_string()));
            }
            Err(e) => return self.authorization_failed(e.into()),
        };
        if let Err(e) = self.oauth.apply_exchange(grant, Utc::now()) {
            return self.authorization_failed(e.into());
        }

        self.reauth_scheduled = false;
        self.pending_refresh = None;
        // The new grant may belong to another account
        self.state.forget_remote();
        self.save_state();
        self.emit(SyncEvent::AuthenticationChanged(true));
        self.set_phase(SyncPhase::Idle);
        if self.state.auto_sync_enabled {
            self.effects
                .push(Effect::AutoSync(Some(self.auto_sync_interval())));
        }
        if let Err(e) = self.start_sync(SyncMode::Smart) {
            log::warn!("Sync: initial sync not started: {}", e);
        }
    }

    fn authorization_failed(&mut self, error: SyncError) {
        log::error!("OAuth: authorization failed: {}", error);
        self.set_phase(SyncPhase::Idle);
        self.emit(SyncEvent::OperationFailed {
            operation: RequestKind::AuthExchange,
            kind: error.kind(),
            message: error.user_message(),
        });
    }

    /// Periodic expiry check; refreshes ahead of time without blocking anything.
    pub fn check_tokens(&mut self, now: DateTime<Utc>) {
        match self.oauth.check_freshness(now) {
            Freshness::Unauthenticated | Freshness::Fresh => {}
            Freshness::RefreshDue => match self.oauth.begin_refresh() {
                Ok(form) => {
                    let id = self.dispatch(None, DriveRequest::TokenRefresh { form });
                    self.pending_refresh = Some(id);
                }
                Err(AuthError::RefreshInProgress) => {
                    log::debug!("Sync: token refresh already in flight")
                }
                Err(e) => log::warn!("Sync: cannot refresh access token: {}", e),
            },
            Freshness::Expired => {
                log::warn!("Sync: access token expired and no refresh token is available");
                if let Err(e) = self.oauth.clear() {
                    log::error!("Sync: could not clear tokens: {}", e);
                }
                self.pending_refresh = None;
                self.emit(SyncEvent::AuthenticationChanged(false));
                self.report_auth_loss(SyncError::AuthExpired);
                self.schedule_reauth();
            }
        }
    }

    fn on_refresh(&mut self, reply: Result<DriveReply, DriveError>) {
        match reply {
            Ok(DriveReply::Tokens(grant)) => match self.oauth.apply_refresh(grant, Utc::now()) {
                Ok(()) => self.emit(SyncEvent::TokenRefreshed),
                Err(e) => self.refresh_lost(e.to_string()),
            },
            Ok(other) => self.refresh_lost(format!("unexpected token reply: {:?}", other)),
            Err(e) => self.refresh_lost(e.to_string()),
        }
    }

    fn refresh_lost(&mut self, reason: String) {
        log::error!("OAuth: token refresh failed: {}", reason);
        if let Err(e) = self.oauth.refresh_failed() {
            log::error!("Sync: could not clear tokens: {}", e);
        }
        self.emit(SyncEvent::AuthenticationChanged(false));
        self.report_auth_loss(SyncError::RefreshFailed(reason));
        self.schedule_reauth();
    }

    /// Fails the running sync, or reports the loss on its own when idle.
    fn report_auth_loss(&mut self, error: SyncError) {
        if self.is_syncing() {
            return self.fail_session(error);
        }
        self.emit(SyncEvent::OperationFailed {
            operation: RequestKind::TokenRefresh,
            kind: error.kind(),
            message: error.user_message(),
        });
    }

    /// At most one re-authentication is pending at a time.
    fn schedule_reauth(&mut self) {
        if self.reauth_scheduled {
            return;
        }
        self.reauth_scheduled = true;
        log::info!("Sync: re-authentication scheduled in {:?}", REAUTH_DELAY);
        self.effects.push(Effect::ScheduleReauth(REAUTH_DELAY));
    }

    /// Drop the current tokens and ask the user to connect again.
    pub fn force_reauthenticate(&mut self) {
        self.reauth_scheduled = false;
        log::warn!("Sync: forcing re-authentication");
        if self.is_syncing() {
            self.fail_session(SyncError::AuthExpired);
        }
        self.pending_refresh = None;
        if let Err(e) = self.oauth.clear() {
            log::error!("Sync: could not clear tokens: {}", e);
        }
        self.state.forget_remote();
        self.save_state();
        self.emit(SyncEvent::AuthenticationChanged(false));
        self.set_phase(SyncPhase::Authenticating);
        let auth_url = self.oauth.build_authorization_url();
        self.emit(SyncEvent::ReauthenticationRequired { auth_url });
    }

    pub fn logout(&mut self) -> Result<(), SyncError> {
        if let Some(active) = self.session.take() {
            log::info!("Sync: abandoning sync {} on logout", active.id);
        }
        self.reauth_scheduled = false;
        self.pending_refresh = None;
        self.oauth.logout()?;
        self.state.forget_remote();
        self.state.save(&self.state_path)?;
        self.effects.push(Effect::AutoSync(None));
        self.set_phase(SyncPhase::Idle);
        self.emit(SyncEvent::AuthenticationChanged(false));
        Ok(())
    }

    pub fn set_auto_sync(&mut self, enabled: bool, interval_minutes: i64) -> Result<(), SyncError> {
        if interval_minutes <= 0 {
            return Err(ConfigError::Invalid(vec![format!(
                "sync interval must be a positive number of minutes, got {}",
                interval_minutes
            )])
            .into());
        }
        self.state.auto_sync_enabled = enabled;
        self.state.auto_sync_interval = interval_minutes;
        self.state.save(&self.state_path)?;
        log::info!(
            "Sync: auto-sync {} every {} minute(s)",
            if enabled { "enabled" } else { "disabled" },
            interval_minutes
        );

        let period = (enabled && self.is_authenticated()).then(|| self.auto_sync_interval());
        self.effects.push(Effect::AutoSync(period));
        Ok(())
    }

    pub fn on_auto_sync_tick(&mut self) {
        if !self.is_authenticated() {
            log::debug!("Sync: auto-sync skipped, not connected");
            return;
        }
        if self.is_syncing() {
            log::debug!("Sync: auto-sync skipped, a sync is already running");
            return;
        }
        if let Err(e) = self.start_sync(SyncMode::Smart) {
            log::warn!("Sync: auto-sync not started: {}", e);
        }
    }

    // Sync sessions

    pub fn start_sync(&mut self, mode: SyncMode) -> Result<SessionId, SyncError> {
        self.ensure_configured()?;
        if !self.is_authenticated() {
            log::warn!("Sync: {} sync requested while not connected", mode.label());
            return Err(SyncError::NotAuthenticated);
        }
        if self.is_syncing() {
            return Err(SyncError::Busy);
        }

        let id = Uuid::new_v4();
        let label = mode.label();
        log::info!("Sync: starting {} sync {}", label, id);
        self.session = Some(ActiveSync {
            id,
            mode,
            reconciler: None,
            in_flight: HashSet::new(),
            root_rechecked: false,
            changes_pending: false,
        });
        self.emit(SyncEvent::SyncStarted {
            session: id,
            mode: label,
        });
        self.set_phase(SyncPhase::CheckingStructure);

        match self.state.root_folder_id.clone() {
            Some(root_id) => self.begin_discovery(&root_id),
            None => {
                let name = self.credentials.sync_folder_name.clone();
                self.dispatch(Some(id), DriveRequest::FindFolder { name });
            }
        }
        Ok(id)
    }

    pub fn sync_now(&mut self, full: bool) -> Result<SessionId, SyncError> {
        self.start_sync(if full { SyncMode::Full } else { SyncMode::Smart })
    }

    /// Editor save hook. Silently does nothing while disconnected.
    pub fn handle_note_changed(
        &mut self,
        folder: &str,
        title: &str,
        body: &str,
    ) -> Result<Option<SessionId>, SyncError> {
        if !self.is_authenticated() {
            log::debug!("Sync: not connected, ignoring change to '{}/{}'", folder, title);
            return Ok(None);
        }
        if let Err(issue) = validate_upload(title, body) {
            log::info!("Sync: not uploading '{}/{}': {}", folder, title, issue);
            self.emit(SyncEvent::NoteSkipped {
                folder: folder.to_string(),
                title: title.to_string(),
                message: issue.user_message().to_string(),
            });
            return Ok(None);
        }
        if let Some(active) = self.session.as_mut() {
            log::info!(
                "Sync: sync in progress, '{}/{}' queued for a follow-up sync",
                folder,
                title
            );
            active.changes_pending = true;
            return Ok(None);
        }
        self.start_sync(SyncMode::SingleNote {
            folder: folder.to_string(),
            title: title.to_string(),
            body: body.to_string(),
        })
        .map(Some)
    }

    pub fn handle_store_event(&mut self, event: StoreEvent) {
        let result = match event {
            StoreEvent::NoteSaved {
                folder,
                title,
                body,
                ..
            } => self.handle_note_changed(&folder, &title, &body).map(|_| ()),
            StoreEvent::NoteDeleted { folder, title, .. } => self.handle_note_deleted(&folder, &title),
            StoreEvent::FolderSaved { name, .. } => {
                log::debug!("Sync: folder '{}' saved, created remotely on the next sync", name);
                Ok(())
            }
        };
        if let Err(e) = result {
            log::warn!("Sync: store change not synced: {}", e);
        }
    }

    fn handle_note_deleted(&mut self, folder: &str, title: &str) -> Result<(), SyncError> {
        if !self.is_authenticated() {
            return Ok(());
        }
        match self.state.remote_id_for(folder, title).map(str::to_string) {
            Some(file_id) => self.delete_remote_note(&file_id),
            None => {
                log::debug!("Sync: '{}/{}' was never uploaded, nothing to delete", folder, title);
                Ok(())
            }
        }
    }

    pub fn download_note(&mut self, file_id: &str) -> Result<(), SyncError> {
        self.require_auth()?;
        self.dispatch(
            None,
            DriveRequest::Download {
                file_id: file_id.to_string(),
            },
        );
        Ok(())
    }

    pub fn delete_remote_note(&mut self, file_id: &str) -> Result<(), SyncError> {
        self.require_auth()?;
        log::info!("Sync: deleting remote file {}", file_id);
        self.dispatch(
            None,
            DriveRequest::Delete {
                file_id: file_id.to_string(),
            },
        );
        Ok(())
    }

    /// List the sync folder, or the drive root before the first sync.
    pub fn list_remote(&mut self) -> Result<(), SyncError> {
        self.require_auth()?;
        let parent_id = self
            .state
            .root_folder_id
            .clone()
            .unwrap_or_else(|| "root".to_string());
        self.dispatch(None, DriveRequest::List { parent_id });
        Ok(())
    }

    fn begin_discovery(&mut self, root_id: &str) {
        let Some(active) = self.session.as_ref() else {
            return;
        };
        let (id, mode) = (active.id, active.mode.clone());

        let local = match &mode {
            SyncMode::SingleNote {
                folder,
                title,
                body,
            } => FolderStructure::new().with_note(folder, title, body),
            SyncMode::Full | SyncMode::Smart => match self.store.folder_structure() {
                Ok(structure) => structure,
                Err(e) => return self.fail_session(e.into()),
            },
        };
        log::debug!(
            "Sync: reconciling {} folder(s), {} note(s) under {}",
            local.folders.len(),
            local.note_count(),
            root_id
        );

        let reconciler = StructureReconciler::new(
            root_id,
            local,
            mode.policy(),
            self.state.content_hashes.clone(),
        );
        let requests = reconciler.start();
        if let Some(active) = self.session.as_mut() {
            active.reconciler = Some(reconciler);
        }
        for request in requests {
            self.dispatch(Some(id), request);
        }
    }

    fn on_root_lookup(&mut self, reply: Result<DriveReply, DriveError>) {
        match reply {
            Ok(DriveReply::FolderFound(Some(folder))) => {
                log::info!("Sync: using sync folder '{}' ({})", folder.name, folder.id);
                self.set_root(folder.id);
            }
            Ok(DriveReply::FolderFound(None)) => {
                let name = self.credentials.sync_folder_name.clone();
                log::info!("Sync: creating sync folder '{}'", name);
                let session = self.current_session();
                self.dispatch(session, DriveRequest::CreateRootFolder { name });
            }
            Ok(other) => self.fail_session(
                DriveError::Malformed(format!("unexpected folder search reply: {:?}", other)).into(),
            ),
            Err(e) => self.fail_session(e.into()),
        }
    }

    fn on_root_created(&mut self, reply: Result<DriveReply, DriveError>) {
        match reply {
            Ok(DriveReply::FolderCreated(folder)) => {
                log::info!("Sync: created sync folder '{}' ({})", folder.name, folder.id);
                self.set_root(folder.id);
            }
            Ok(other) => self.fail_session(
                DriveError::Malformed(format!("unexpected folder reply: {:?}", other)).into(),
            ),
            Err(e) => self.fail_session(e.into()),
        }
    }

    fn set_root(&mut self, root_id: String) {
        self.state.root_folder_id = Some(root_id.clone());
        self.save_state();
        self.begin_discovery(&root_id);
    }

    /// Route one finished request. Completions from an abandoned or finished
    /// session, and repeats of one already handled, are dropped.
    pub fn handle_completion(&mut self, completion: Completion) {
        let Completion {
            id,
            session,
            request,
            reply,
        } = completion;

        if matches!(request, DriveRequest::TokenRefresh { .. }) {
            if self.pending_refresh != Some(id) {
                log::debug!("Sync: dropping token refresh {} that is no longer wanted", id);
                return;
            }
            self.pending_refresh = None;
        }

        if let Some(session) = session {
            let tracked = match self.session.as_mut() {
                Some(active) if active.id == session => active.in_flight.remove(&id),
                _ => false,
            };
            if !tracked {
                log::debug!(
                    "Sync: dropping {} completion {} for inactive session {}",
                    request.kind(),
                    id,
                    session
                );
                return;
            }
        }

        if let Err(e) = &reply {
            if e.is_auth_failure() && !matches!(request, DriveRequest::AuthExchange { .. }) {
                log::warn!("Sync: {} rejected as unauthorized", request.kind());
                self.schedule_reauth();
            }
        }

        match request {
            DriveRequest::AuthExchange { .. } => self.on_authorization(reply),
            DriveRequest::TokenRefresh { .. } => self.on_refresh(reply),
            DriveRequest::FindFolder { .. } => self.on_root_lookup(reply),
            DriveRequest::CreateRootFolder { .. } => self.on_root_created(reply),
            DriveRequest::Download { file_id } => match reply {
                Ok(DriveReply::Downloaded(content)) => {
                    self.emit(SyncEvent::NoteDownloaded { file_id, content })
                }
                other => self.operation_failed(RequestKind::Download, other),
            },
            DriveRequest::Delete { file_id } => match reply {
                Ok(DriveReply::Deleted) => {
                    self.state.forget_file(&file_id);
                    self.save_state();
                    self.emit(SyncEvent::NoteDeleted { file_id });
                }
                other => self.operation_failed(RequestKind::Delete, other),
            },
            DriveRequest::List { .. } => match reply {
                Ok(DriveReply::Files(files)) => self.emit(SyncEvent::RemoteListing { files }),
                other => self.operation_failed(RequestKind::List, other),
            },
            request @ (DriveRequest::ListSubfolders { .. }
            | DriveRequest::ListNotesInFolder { .. }
            | DriveRequest::CreateFolder { .. }
            | DriveRequest::UploadMetadata { .. }
            | DriveRequest::UploadContent { .. }) => self.on_reconcile(request, reply),
        }
    }

    fn operation_failed(&mut self, operation: RequestKind, reply: Result<DriveReply, DriveError>) {
        let error = match reply {
            Err(e) => e,
            Ok(other) => DriveError::Malformed(format!("unexpected reply: {:?}", other)),
        };
        log::error!("Sync: {} failed: {}", operation, error);
        let error = SyncError::from(error);
        self.emit(SyncEvent::OperationFailed {
            operation,
            kind: error.kind(),
            message: error.user_message(),
        });
    }

    /// Requests whose parent is the stored sync folder.
    fn targets_root(&self, request: &DriveRequest) -> bool {
        let parent_id = match request {
            DriveRequest::ListSubfolders { parent_id }
            | DriveRequest::CreateFolder { parent_id, .. } => parent_id,
            _ => return false,
        };
        self.state.root_folder_id.as_deref() == Some(parent_id.as_str())
    }

    /// The stored sync folder is gone remotely. Forget it and search again,
    /// once per sync.
    fn rediscover_root(&mut self, error: DriveError) {
        let Some(active) = self.session.as_mut() else {
            return;
        };
        if active.root_rechecked {
            return self.fail_session(error.into());
        }
        active.root_rechecked = true;
        active.reconciler = None;
        active.in_flight.clear();
        let id = active.id;

        log::warn!(
            "Sync: sync folder {} no longer exists, searching again",
            self.state.root_folder_id.as_deref().unwrap_or_default()
        );
        self.state.forget_remote();
        self.save_state();
        self.set_phase(SyncPhase::CheckingStructure);
        let name = self.credentials.sync_folder_name.clone();
        self.dispatch(Some(id), DriveRequest::FindFolder { name });
    }

    fn on_reconcile(&mut self, request: DriveRequest, reply: Result<DriveReply, DriveError>) {
        if let Err(error @ DriveError::Server { status: 404, .. }) = &reply {
            if self.targets_root(&request) {
                return self.rediscover_root(error.clone());
            }
        }
        let Some(active) = self.session.as_mut() else {
            log::warn!("Sync: {} completion outside a sync", request.kind());
            return;
        };
        let session_id = active.id;
        let Some(reconciler) = active.reconciler.as_mut() else {
            let error = ReconcileError::DuplicationRisk(format!(
                "{} completed before discovery started",
                request.kind()
            ));
            return self.fail_session(error.into());
        };

        let was_checked = reconciler.structure_checked();
        let step = match reconciler.handle(request, reply) {
            Ok(step) => step,
            Err(e) => return self.fail_session(e.into()),
        };
        let checked = reconciler.structure_checked();
        let finished = reconciler.is_finished();
        let (current, total) = reconciler.progress();

        let mut progressed = checked && !was_checked;
        for event in step.events {
            progressed |= self.on_reconcile_event(event);
        }
        if checked {
            self.set_phase(SyncPhase::Syncing);
        }
        if progressed && total > 0 {
            self.emit(SyncEvent::SyncProgress { current, total });
        }
        for request in step.requests {
            self.dispatch(Some(session_id), request);
        }
        if finished {
            self.finish_session();
        }
    }

    /// Returns true when an upload finished.
    fn on_reconcile_event(&mut self, event: ReconcileEvent) -> bool {
        match event {
            ReconcileEvent::DiscoveryComplete {
                remote_folders,
                remote_notes,
                planned,
            } => {
                log::debug!(
                    "Sync: remote has {} folder(s), {} note(s); {} change(s) planned",
                    remote_folders,
                    remote_notes,
                    planned
                );
                false
            }
            ReconcileEvent::FolderCreated { name, remote_id } => {
                log::info!("Sync: created folder '{}' ({})", name, remote_id);
                self.emit(SyncEvent::FolderCreated { name });
                false
            }
            ReconcileEvent::FolderFailed { name, error } => {
                log::error!("Sync: folder '{}' could not be created: {}", name, error);
                false
            }
            ReconcileEvent::NoteRejected {
                folder,
                title,
                issue,
            } => {
                log::warn!("Sync: skipping '{}/{}': {}", folder, title, issue);
                self.emit(SyncEvent::NoteSkipped {
                    folder,
                    title,
                    message: issue.user_message().to_string(),
                });
                false
            }
            ReconcileEvent::NoteUploaded {
                folder,
                title,
                remote_id,
                content_hash,
                created,
            } => {
                log::info!(
                    "Sync: {} '{}/{}'",
                    if created { "created" } else { "updated" },
                    folder,
                    title
                );
                self.state
                    .mark_note_synced(&folder, &title, &remote_id, &content_hash);
                self.emit(SyncEvent::NoteUploaded {
                    folder,
                    title,
                    remote_id,
                });
                true
            }
            ReconcileEvent::NoteFailed {
                folder,
                title,
                error,
            } => {
                log::error!("Sync: upload of '{}/{}' failed: {}", folder, title, error);
                let message = SyncError::from(error).user_message();
                self.emit(SyncEvent::NoteFailed {
                    folder,
                    title,
                    message,
                });
                true
            }
        }
    }

    fn finish_session(&mut self) {
        // Taking the session is what makes completion one-shot
        let Some(active) = self.session.take() else {
            return;
        };
        let summary = match active.reconciler.as_ref().and_then(|r| r.mutation()) {
            Some(mutation) => {
                self.state.absorb_snapshot(mutation.snapshot());
                mutation.summary().clone()
            }
            None => ReconcileSummary::default(),
        };

        if summary.failures > 0 {
            self.save_state();
            self.conclude_failed(
                Some(active.id),
                SyncError::Incomplete {
                    failed: summary.failures,
                },
            );
            return;
        }

        self.state.mark_synced(Utc::now());
        self.save_state();
        log::info!(
            "Sync: {} sync {} complete: {} folder(s) created, {} note(s) created, {} updated, {} unchanged, {} skipped",
            active.mode.label(),
            active.id,
            summary.folders_created,
            summary.notes_created,
            summary.notes_updated,
            summary.notes_unchanged,
            summary.notes_rejected
        );
        self.set_phase(SyncPhase::Complete);
        self.emit(SyncEvent::SyncCompleted {
            session: active.id,
            summary,
        });
        self.set_phase(SyncPhase::Idle);

        if active.changes_pending {
            log::info!("Sync: notes changed during sync {}, syncing again", active.id);
            if let Err(e) = self.start_sync(SyncMode::Smart) {
                log::warn!("Sync: follow-up sync not started: {}", e);
            }
        }
    }

    fn fail_session(&mut self, error: SyncError) {
        let session = self.session.take().map(|active| active.id);
        if session.is_some() {
            self.save_state();
        }
        self.conclude_failed(session, error);
    }

    fn conclude_failed(&mut self, session: Option<SessionId>, error: SyncError) {
        log::error!("Sync: failed: {}", error);
        self.set_phase(SyncPhase::Failed);
        self.emit(SyncEvent::SyncFailed {
            session,
            kind: error.kind(),
            message: error.user_message(),
        });
        self.set_phase(SyncPhase::Idle);
    }
}

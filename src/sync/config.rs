use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_REDIRECT_URI: &str = "urn:ietf:wg:oauth:2.0:oob";
pub const DEFAULT_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";
pub const DEFAULT_SYNC_INTERVAL_MINUTES: i64 = 15;
pub const DEFAULT_SYNC_FOLDER: &str = "Notes App";

pub const CONFIG_FILE_NAME: &str = "notesync.conf";
const ENV_PREFIX: &str = "NOTESYNC_";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
    #[error("Could not read config file {path}: {message}")]
    Unreadable { path: PathBuf, message: String },
}

/// OAuth client registration and sync preferences.
///
/// Loaded once at startup and not mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub scope: String,
    pub sync_interval_minutes: i64,
    pub sync_folder_name: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
            scope: DEFAULT_SCOPE.to_string(),
            sync_interval_minutes: DEFAULT_SYNC_INTERVAL_MINUTES,
            sync_folder_name: DEFAULT_SYNC_FOLDER.to_string(),
        }
    }
}

impl Credentials {
    /// Collects every problem instead of stopping at the first one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        if self.client_id.trim().is_empty() {
            errors.push("Client ID is missing".to_string());
        }
        if self.client_secret.trim().is_empty() {
            errors.push("Client secret is missing".to_string());
        }
        if self.redirect_uri.trim().is_empty() {
            errors.push("Redirect URI is missing".to_string());
        }
        if self.scope.trim().is_empty() {
            errors.push("Scope is missing".to_string());
        }
        if self.sync_interval_minutes <= 0 {
            errors.push("Sync interval must be positive".to_string());
        }
        if self.sync_folder_name.trim().is_empty() {
            errors.push("Sync folder name is missing".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_minutes.max(1) as u64 * 60)
    }

    /// Applies one `key=value` setting. Returns false for unknown keys.
    fn apply(&mut self, key: &str, value: &str) -> bool {
        match key {
            "client_id" => self.client_id = value.to_string(),
            "client_secret" => self.client_secret = value.to_string(),
            "redirect_uri" => self.redirect_uri = value.to_string(),
            "scope" => self.scope = value.to_string(),
            "sync_interval" => {
                // Non-numeric values surface as a validation error
                self.sync_interval_minutes = value.parse().unwrap_or(0);
            }
            "sync_folder" => self.sync_folder_name = value.to_string(),
            _ => return false,
        }
        true
    }
}

/// Remote endpoints. Overridable so tests can point the client at a fake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveEndpoints {
    pub auth_url: String,
    pub token_url: String,
    pub api_base: String,
    pub upload_base: String,
}

impl Default for DriveEndpoints {
    fn default() -> Self {
        Self {
            auth_url: "https://accounts.google.com/o/oauth2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            api_base: "https://www.googleapis.com/drive/v3".to_string(),
            upload_base: "https://www.googleapis.com/upload/drive/v3".to_string(),
        }
    }
}

/// Where the effective credentials came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Environment,
    File(PathBuf),
    Defaults,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Environment => write!(f, "environment"),
            ConfigSource::File(path) => write!(f, "{}", path.display()),
            ConfigSource::Defaults => write!(f, "built-in defaults"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub credentials: Credentials,
    pub source: ConfigSource,
}

impl LoadedConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.credentials.validate()
    }
}

/// Resolves credentials: environment, then config file, then defaults.
pub struct ConfigLoader {
    env: HashMap<String, String>,
    search_paths: Vec<PathBuf>,
    explicit_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Loader over the process environment and the standard search paths.
    pub fn new() -> Self {
        let env = std::env::vars()
            .filter(|(k, _)| k.starts_with(ENV_PREFIX))
            .collect();
        Self {
            env,
            search_paths: default_search_paths(),
            explicit_path: None,
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_search_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.search_paths = paths;
        self
    }

    /// Use exactly this file instead of searching.
    pub fn with_config_file(mut self, path: PathBuf) -> Self {
        self.explicit_path = Some(path);
        self
    }

    pub fn load(&self) -> LoadedConfig {
        if let Some(credentials) = self.from_environment() {
            log::info!("Sync: loaded credentials from environment");
            return LoadedConfig {
                credentials,
                source: ConfigSource::Environment,
            };
        }

        let candidates: Vec<&PathBuf> = match &self.explicit_path {
            Some(path) => vec![path],
            None => self.search_paths.iter().collect(),
        };

        for path in candidates {
            if !path.is_file() {
                continue;
            }
            match parse_config_file(path) {
                Ok(credentials) => {
                    log::info!("Sync: loaded credentials from {}", path.display());
                    return LoadedConfig {
                        credentials,
                        source: ConfigSource::File(path.clone()),
                    };
                }
                Err(e) => log::warn!("Sync: skipping config file: {}", e),
            }
        }

        log::warn!("Sync: no credentials found, using defaults");
        LoadedConfig {
            credentials: Credentials::default(),
            source: ConfigSource::Defaults,
        }
    }

    /// Environment wins only when it supplies both client id and secret.
    fn from_environment(&self) -> Option<Credentials> {
        let var = |name: &str| {
            self.env
                .get(&format!("{}{}", ENV_PREFIX, name))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let client_id = var("CLIENT_ID")?;
        let client_secret = var("CLIENT_SECRET")?;

        let mut credentials = Credentials {
            client_id,
            client_secret,
            ..Credentials::default()
        };
        for (key, name) in [
            ("redirect_uri", "REDIRECT_URI"),
            ("scope", "SCOPE"),
            ("sync_interval", "SYNC_INTERVAL"),
            ("sync_folder", "SYNC_FOLDER"),
        ] {
            if let Some(value) = var(name) {
                credentials.apply(key, &value);
            }
        }
        Some(credentials)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse `key=value` lines. `#` comments and blank lines are skipped.
pub fn parse_config(contents: &str) -> Credentials {
    let mut credentials = Credentials::default();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            log::debug!("Sync: ignoring config line without '='");
            continue;
        };
        let key = key.trim();
        if !credentials.apply(key, value.trim()) {
            log::debug!("Sync: ignoring unknown config key '{}'", key);
        }
    }
    credentials
}

fn parse_config_file(path: &Path) -> Result<Credentials, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok(parse_config(&contents))
}

/// Candidate config file locations, in search order.
pub fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("config").join(CONFIG_FILE_NAME)];
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("notesync").join(CONFIG_FILE_NAME));
    }
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".notesync").join(CONFIG_FILE_NAME));
    }
    paths.push(PathBuf::from(CONFIG_FILE_NAME));
    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        paths.push(exe_dir.join("..").join("config").join(CONFIG_FILE_NAME));
        paths.push(exe_dir.join("..").join("..").join("config").join(CONFIG_FILE_NAME));
    }
    paths
}

/// On-disk locations of the sync core's own files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPaths {
    pub tokens: PathBuf,
    pub state: PathBuf,
    pub database: PathBuf,
}

impl SyncPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            tokens: dir.join("tokens.json"),
            state: dir.join("sync_state.json"),
            database: dir.join("notes.db"),
        }
    }

    /// `<data dir>/notesync`
    pub fn default_data_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|p| p.join("notesync"))
    }
}

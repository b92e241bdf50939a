use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const KEYRING_ACCOUNT: &str = "oauth-tokens";

#[derive(Error, Debug)]
pub enum TokenStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// OAuth tokens as persisted in `tokens.json`.
///
/// An empty `access_token` means "not authenticated". `expiry` is advisory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenState {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default, with = "iso8601_or_empty")]
    pub expiry: Option<DateTime<Utc>>,
}

impl TokenState {
    pub fn is_authenticated(&self) -> bool {
        !self.access_token.is_empty()
    }

    pub fn has_refresh_token(&self) -> bool {
        !self.refresh_token.is_empty()
    }

    /// True if the token expires within `margin` of `now` (or already has).
    /// Tokens without a known expiry are treated as fresh.
    pub fn expires_within(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        match self.expiry {
            Some(expiry) => expiry - now <= margin,
            None => false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_within(now, Duration::zero())
    }

    pub fn clear(&mut self) {
        *self = TokenState::default();
    }

    /// Short, log-safe description of the access token.
    pub fn redacted(&self) -> String {
        if self.access_token.is_empty() {
            "<none>".to_string()
        } else {
            let prefix: String = self.access_token.chars().take(6).collect();
            format!("{}... ({} chars)", prefix, self.access_token.len())
        }
    }
}

/// File-backed token persistence with a best-effort keyring mirror.
///
/// The file is authoritative; every save rewrites it in full.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
    keyring_service: Option<String>,
}

impl TokenStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            keyring_service: None,
        }
    }

    /// Also mirror tokens into the OS keyring under `service`.
    pub fn with_keyring(mut self, service: &str) -> Self {
        self.keyring_service = Some(service.to_string());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file loads as the empty (unauthenticated) state.
    pub fn load(&self) -> Result<TokenState, TokenStoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(data) => Ok(serde_json::from_str(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(self.load_from_keyring().unwrap_or_default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, tokens: &TokenState) -> Result<(), TokenStoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(tokens)?;
        std::fs::write(&self.path, &data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600));
        }

        if let Some(service) = &self.keyring_service {
            if let Ok(entry) = keyring::Entry::new(service, KEYRING_ACCOUNT) {
                let result = if tokens.is_authenticated() {
                    entry.set_password(&data)
                } else {
                    entry.delete_credential()
                };
                if let Err(e) = result {
                    log::debug!("OAuth: keyring mirror not updated: {}", e);
                }
            }
        }
        Ok(())
    }

    fn load_from_keyring(&self) -> Option<TokenState> {
        let service = self.keyring_service.as_ref()?;
        let entry = keyring::Entry::new(service, KEYRING_ACCOUNT).ok()?;
        let data = entry.get_password().ok()?;
        log::info!("OAuth: token file missing, restored tokens from keyring");
        serde_json::from_str(&data).ok()
    }
}

/// ISO-8601 timestamps; an empty or unparseable string reads as `None`.
pub(crate) mod iso8601_or_empty {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(dt) => serializer.serialize_str(&dt.to_rfc3339()),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        Ok(raw
            .filter(|s| !s.is_empty())
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use super::config::DEFAULT_SYNC_INTERVAL_MINUTES;
use super::reconciler::RemoteSnapshot;
use super::tokens::iso8601_or_empty;

/// Sync bookkeeping kept next to the token file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStateFile {
    /// Last completed sync
    #[serde(default, with = "iso8601_or_empty")]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    pub auto_sync_enabled: bool,
    /// Minutes between automatic syncs
    #[serde(default = "default_interval")]
    pub auto_sync_interval: i64,
    /// Folder name to note title to remote file id
    #[serde(default)]
    pub local_to_remote: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_folder_id: Option<String>,
    /// Remote file id to the hash of the body last uploaded there
    #[serde(default)]
    pub content_hashes: BTreeMap<String, String>,
}

fn default_interval() -> i64 {
    DEFAULT_SYNC_INTERVAL_MINUTES
}

impl Default for SyncStateFile {
    fn default() -> Self {
        Self {
            last_sync: None,
            auto_sync_enabled: false,
            auto_sync_interval: DEFAULT_SYNC_INTERVAL_MINUTES,
            local_to_remote: BTreeMap::new(),
            root_folder_id: None,
            content_hashes: BTreeMap::new(),
        }
    }
}

impl SyncStateFile {
    /// Load from file
    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Load from file, starting fresh if it is missing or unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(state) => state,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                log::warn!(
                    "Sync: ignoring unreadable sync state at {}: {}",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save to file
    pub fn save(&self, path: &Path) -> Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)
    }

    pub fn remote_id_for(&self, folder: &str, title: &str) -> Option<&str> {
        self.local_to_remote
            .get(folder)
            .and_then(|notes| notes.get(title))
            .map(String::as_str)
    }

    fn knows_file(&self, remote_id: &str) -> bool {
        self.local_to_remote
            .values()
            .any(|notes| notes.values().any(|id| id == remote_id))
    }

    /// Record a successful content upload.
    pub fn mark_note_synced(&mut self, folder: &str, title: &str, remote_id: &str, hash: &str) {
        self.local_to_remote
            .entry(folder.to_string())
            .or_default()
            .insert(title.to_string(), remote_id.to_string());
        self.content_hashes
            .insert(remote_id.to_string(), hash.to_string());
    }

    /// Forget a remote file that was deleted.
    pub fn forget_file(&mut self, remote_id: &str) {
        for notes in self.local_to_remote.values_mut() {
            notes.retain(|_, id| id != remote_id);
        }
        self.local_to_remote.retain(|_, notes| !notes.is_empty());
        self.content_hashes.remove(remote_id);
    }

    /// Drop everything tied to the connected account's drive. Auto-sync
    /// settings and the last sync time are kept.
    pub fn forget_remote(&mut self) {
        self.root_folder_id = None;
        self.local_to_remote.clear();
        self.content_hashes.clear();
    }

    /// Bring the id map in line with what a finished reconcile saw remotely.
    /// Hash entries for files no longer present are dropped.
    pub fn absorb_snapshot(&mut self, snapshot: &RemoteSnapshot) {
        self.local_to_remote.clear();
        for (folder, note) in snapshot.notes() {
            self.local_to_remote
                .entry(folder.to_string())
                .or_default()
                .insert(note.title.clone(), note.remote_id.clone());
        }
        let stale: Vec<String> = self
            .content_hashes
            .keys()
            .filter(|id| !self.knows_file(id))
            .cloned()
            .collect();
        for id in stale {
            self.content_hashes.remove(&id);
        }
    }

    pub fn mark_synced(&mut self, at: DateTime<Utc>) {
        self.last_sync = Some(at);
    }
}

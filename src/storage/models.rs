use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A local folder. Folders are flat; `parent_id` is kept for future nesting
/// but the sync layer only ever mirrors top-level folders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<i64>,
}

/// A note inside a folder. `body` is the markdown the user typed, including
/// any heading the editor placed on the first line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: i64,
    pub folder_id: i64,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub pinned: bool,
}

/// One note as seen by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalNote {
    pub title: String,
    pub body: String,
}

/// One folder and its notes as seen by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFolder {
    pub name: String,
    pub notes: Vec<LocalNote>,
}

/// Ordered snapshot of every local folder with its notes.
///
/// Order matters: remote folders are created in this order, one at a time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderStructure {
    pub folders: Vec<LocalFolder>,
}

impl FolderStructure {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder used by tests and by single-note syncs.
    pub fn with_note(mut self, folder: &str, title: &str, body: &str) -> Self {
        let note = LocalNote {
            title: title.to_string(),
            body: body.to_string(),
        };
        match self.folders.iter_mut().find(|f| f.name == folder) {
            Some(existing) => existing.notes.push(note),
            None => self.folders.push(LocalFolder {
                name: folder.to_string(),
                notes: vec![note],
            }),
        }
        self
    }

    /// Adds an empty folder if one with this name is not already present.
    pub fn with_folder(mut self, folder: &str) -> Self {
        if !self.folders.iter().any(|f| f.name == folder) {
            self.folders.push(LocalFolder {
                name: folder.to_string(),
                notes: Vec::new(),
            });
        }
        self
    }

    pub fn folder(&self, name: &str) -> Option<&LocalFolder> {
        self.folders.iter().find(|f| f.name == name)
    }

    pub fn note_count(&self) -> usize {
        self.folders.iter().map(|f| f.notes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.folders.is_empty()
    }
}

/// Change notifications published by a note store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    NoteSaved {
        note_id: i64,
        folder: String,
        title: String,
        body: String,
    },
    NoteDeleted {
        note_id: i64,
        folder: String,
        title: String,
    },
    FolderSaved {
        folder_id: i64,
        name: String,
    },
}

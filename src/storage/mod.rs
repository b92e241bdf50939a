mod models;
mod sqlite_store;

use thiserror::Error;
use tokio::sync::broadcast;

pub use models::*;
pub use sqlite_store::SqliteNoteStore;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Folder not found: {0}")]
    FolderNotFound(i64),

    #[error("Note not found: {0}")]
    NoteNotFound(i64),

    #[error("Store lock poisoned")]
    Poisoned,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Local note database seen by the sync layer.
///
/// The sync core only reads through this trait; writes come from the editor
/// and are announced on the `subscribe` channel.
pub trait NoteStore: Send + Sync {
    fn list_folders(&self) -> Result<Vec<Folder>>;

    fn list_notes_in_folder(&self, folder_id: i64) -> Result<Vec<Note>>;

    fn get_note(&self, note_id: i64) -> Result<Note>;

    fn create_folder(&self, name: &str) -> Result<Folder>;

    fn create_note(&self, folder_id: i64, title: &str, body: &str) -> Result<Note>;

    fn update_note(&self, note_id: i64, title: &str, body: &str) -> Result<Note>;

    fn delete_note(&self, note_id: i64) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;

    /// Every folder in id order together with its notes.
    fn folder_structure(&self) -> Result<FolderStructure> {
        let mut structure = FolderStructure::new();
        for folder in self.list_folders()? {
            let notes = self
                .list_notes_in_folder(folder.id)?
                .into_iter()
                .map(|n| LocalNote {
                    title: n.title,
                    body: n.body,
                })
                .collect();
            structure.folders.push(LocalFolder {
                name: folder.name,
                notes,
            });
        }
        Ok(structure)
    }

    fn find_folder_by_name(&self, name: &str) -> Result<Option<Folder>> {
        Ok(self.list_folders()?.into_iter().find(|f| f.name == name))
    }
}

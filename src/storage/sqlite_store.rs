use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::broadcast;

use super::models::{Folder, Note, StoreEvent};
use super::{NoteStore, Result, StorageError};

const EVENT_CAPACITY: usize = 64;

/// SQLite-backed note store.
pub struct SqliteNoteStore {
    conn: Mutex<Connection>,
    events: broadcast::Sender<StoreEvent>,
}

impl SqliteNoteStore {
    /// Open (or create) the database at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(db_path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS folders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                parent_id INTEGER
            );

            CREATE TABLE IF NOT EXISTS notes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                folder_id INTEGER NOT NULL,
                title TEXT NOT NULL,
                body TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                pinned INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (folder_id) REFERENCES folders(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_notes_folder_id ON notes(folder_id);
            "#,
        )?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            conn: Mutex::new(conn),
            events,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    fn publish(&self, event: StoreEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn folder_name(conn: &Connection, folder_id: i64) -> Result<String> {
        conn.query_row(
            "SELECT name FROM folders WHERE id = ?1",
            params![folder_id],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .ok_or(StorageError::FolderNotFound(folder_id))
    }

    fn load_note(conn: &Connection, note_id: i64) -> Result<Note> {
        conn.query_row(
            "SELECT id, folder_id, title, body, created_at, updated_at, pinned
             FROM notes WHERE id = ?1",
            params![note_id],
            note_from_row,
        )
        .optional()?
        .ok_or(StorageError::NoteNotFound(note_id))
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn note_from_row(row: &Row<'_>) -> rusqlite::Result<Note> {
    let created: String = row.get(4)?;
    let updated: String = row.get(5)?;
    Ok(Note {
        id: row.get(0)?,
        folder_id: row.get(1)?,
        title: row.get(2)?,
        body: row.get(3)?,
        created_at: parse_timestamp(&created),
        updated_at: parse_timestamp(&updated),
        pinned: row.get::<_, i64>(6)? != 0,
    })
}

impl NoteStore for SqliteNoteStore {
    fn list_folders(&self) -> Result<Vec<Folder>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, name, parent_id FROM folders ORDER BY id")?;
        let folders = stmt
            .query_map([], |row| {
                Ok(Folder {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    parent_id: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(folders)
    }

    fn list_notes_in_folder(&self, folder_id: i64) -> Result<Vec<Note>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, folder_id, title, body, created_at, updated_at, pinned
             FROM notes WHERE folder_id = ?1 ORDER BY id",
        )?;
        let notes = stmt
            .query_map(params![folder_id], note_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(notes)
    }

    fn get_note(&self, note_id: i64) -> Result<Note> {
        let conn = self.conn()?;
        Self::load_note(&conn, note_id)
    }

    fn create_folder(&self, name: &str) -> Result<Folder> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StorageError::InvalidOperation(
                "Folder name cannot be empty".to_string(),
            ));
        }

        let folder = {
            let conn = self.conn()?;
            conn.execute("INSERT INTO folders (name) VALUES (?1)", params![name])?;
            Folder {
                id: conn.last_insert_rowid(),
                name: name.to_string(),
                parent_id: None,
            }
        };

        self.publish(StoreEvent::FolderSaved {
            folder_id: folder.id,
            name: folder.name.clone(),
        });
        Ok(folder)
    }

    fn create_note(&self, folder_id: i64, title: &str, body: &str) -> Result<Note> {
        let (note, folder) = {
            let conn = self.conn()?;
            let folder = Self::folder_name(&conn, folder_id)?;
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO notes (folder_id, title, body, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![folder_id, title, body, now],
            )?;
            let note = Self::load_note(&conn, conn.last_insert_rowid())?;
            (note, folder)
        };

        self.publish(StoreEvent::NoteSaved {
            note_id: note.id,
            folder,
            title: note.title.clone(),
            body: note.body.clone(),
        });
        Ok(note)
    }

    fn update_note(&self, note_id: i64, title: &str, body: &str) -> Result<Note> {
        let (note, folder) = {
            let conn = self.conn()?;
            let changed = conn.execute(
                "UPDATE notes SET title = ?1, body = ?2, updated_at = ?3 WHERE id = ?4",
                params![title, body, Utc::now().to_rfc3339(), note_id],
            )?;
            if changed == 0 {
                return Err(StorageError::NoteNotFound(note_id));
            }
            let note = Self::load_note(&conn, note_id)?;
            let folder = Self::folder_name(&conn, note.folder_id)?;
            (note, folder)
        };

        self.publish(StoreEvent::NoteSaved {
            note_id: note.id,
            folder,
            title: note.title.clone(),
            body: note.body.clone(),
        });
        Ok(note)
    }

    fn delete_note(&self, note_id: i64) -> Result<()> {
        let (note, folder) = {
            let conn = self.conn()?;
            let note = Self::load_note(&conn, note_id)?;
            let folder = Self::folder_name(&conn, note.folder_id)?;
            conn.execute("DELETE FROM notes WHERE id = ?1", params![note_id])?;
            (note, folder)
        };

        self.publish(StoreEvent::NoteDeleted {
            note_id,
            folder,
            title: note.title,
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_folder_structure_keeps_insertion_order() {
        let store = SqliteNoteStore::open_in_memory().unwrap();
        let work = store.create_folder("Work").unwrap();
        let home = store.create_folder("Home").unwrap();
        store.create_note(work.id, "Plan", "# Plan\nship it").unwrap();
        store.create_note(home.id, "Groceries", "milk").unwrap();
        store.create_note(work.id, "Retro", "went well").unwrap();

        let structure = store.folder_structure().unwrap();
        let names: Vec<_> = structure.folders.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["Work", "Home"]);

        let work_titles: Vec<_> = structure.folders[0]
            .notes
            .iter()
            .map(|n| n.title.as_str())
            .collect();
        assert_eq!(work_titles, vec!["Plan", "Retro"]);
        assert_eq!(structure.note_count(), 3);
    }

    #[test]
    fn test_create_note_in_missing_folder_fails() {
        let store = SqliteNoteStore::open_in_memory().unwrap();
        let err = store.create_note(42, "Orphan", "body").unwrap_err();
        assert!(matches!(err, StorageError::FolderNotFound(42)));
    }

    #[test]
    fn test_update_and_delete_publish_events() {
        let store = SqliteNoteStore::open_in_memory().unwrap();
        let mut events = store.subscribe();

        let folder = store.create_folder("Work").unwrap();
        let note = store.create_note(folder.id, "Plan", "v1").unwrap();
        store.update_note(note.id, "Plan", "v2").unwrap();
        store.delete_note(note.id).unwrap();

        assert!(matches!(events.try_recv().unwrap(), StoreEvent::FolderSaved { .. }));
        assert!(matches!(events.try_recv().unwrap(), StoreEvent::NoteSaved { .. }));
        match events.try_recv().unwrap() {
            StoreEvent::NoteSaved { folder, body, .. } => {
                assert_eq!(folder, "Work");
                assert_eq!(body, "v2");
            }
            other => panic!("unexpected event {:?}", other),
        }
        match events.try_recv().unwrap() {
            StoreEvent::NoteDeleted { folder, title, .. } => {
                assert_eq!(folder, "Work");
                assert_eq!(title, "Plan");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(store.get_note(note.id), Err(StorageError::NoteNotFound(_))));
    }

    #[test]
    fn test_database_persists_across_opens() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("notes.db");
        {
            let store = SqliteNoteStore::open(&path).unwrap();
            let folder = store.create_folder("Work").unwrap();
            store.create_note(folder.id, "Plan", "body").unwrap();
        }

        let store = SqliteNoteStore::open(&path).unwrap();
        let folder = store.find_folder_by_name("Work").unwrap().unwrap();
        let notes = store.list_notes_in_folder(folder.id).unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].body, "body");
    }

    #[test]
    fn test_empty_folder_name_rejected() {
        let store = SqliteNoteStore::open_in_memory().unwrap();
        assert!(matches!(
            store.create_folder("   "),
            Err(StorageError::InvalidOperation(_))
        ));
    }
}

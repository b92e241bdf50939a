use anyhow::{Context, Result};

use notesync_lib::storage::NoteStore;

use crate::app::App;
use crate::OutputFormat;

pub fn run_add_note(
    app: &App,
    folder_name: &str,
    title: &str,
    body: &str,
    format: &OutputFormat,
) -> Result<()> {
    let folder = match app
        .store
        .find_folder_by_name(folder_name)
        .context("Failed to read folders")?
    {
        Some(folder) => folder,
        None => app
            .store
            .create_folder(folder_name)
            .context("Failed to create folder")?,
    };
    let note = app
        .store
        .create_note(folder.id, title, body)
        .context("Failed to create note")?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&note)?),
        OutputFormat::Plain => {
            println!("Added \"{}\" to folder \"{}\"", note.title, folder.name);
            println!("  ID: {}", note.id);
        }
    }
    Ok(())
}

use anyhow::{anyhow, Context, Result};

use notesync_lib::storage::NoteStore;
use notesync_lib::sync::drive::SessionId;
use notesync_lib::sync::{ReconcileSummary, SyncEvent, SyncMode};

use crate::app::{App, Engine};
use crate::render::terminal::{render_event, render_summary, summary_json};
use crate::OutputFormat;

/// Follow a sync until it ends. With no session id, the next sync to start
/// is followed.
pub async fn await_sync(
    engine: &mut Engine,
    session: Option<SessionId>,
    format: &OutputFormat,
    use_color: bool,
) -> Result<ReconcileSummary> {
    let mut session = session;
    engine
        .wait_for(|event| {
            if matches!(format, OutputFormat::Plain) {
                if let Some(line) = render_event(&event, use_color) {
                    println!("{}", line);
                }
            }
            match event {
                SyncEvent::SyncStarted { session: started, .. } if session.is_none() => {
                    session = Some(started);
                    None
                }
                SyncEvent::SyncCompleted {
                    session: done,
                    summary,
                } if Some(done) == session => Some(Ok(summary)),
                SyncEvent::SyncFailed {
                    session: failed,
                    message,
                    ..
                } if failed.is_none() || failed == session => Some(Err(anyhow!(message))),
                _ => None,
            }
        })
        .await
}

async fn run_mode(app: &App, mode: SyncMode, format: &OutputFormat, use_color: bool) -> Result<()> {
    let mut engine = app.start_engine().await?;
    let outcome = match engine.handle.sync(mode).await {
        Ok(session) => await_sync(&mut engine, Some(session), format, use_color).await,
        Err(e) => Err(anyhow!(e.user_message())),
    };
    engine.shutdown().await?;
    let summary = outcome?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&summary_json(&summary))?)
        }
        OutputFormat::Plain => println!("{}", render_summary(&summary, use_color)),
    }
    Ok(())
}

pub async fn run_sync(app: &App, full: bool, format: &OutputFormat, use_color: bool) -> Result<()> {
    let mode = if full { SyncMode::Full } else { SyncMode::Smart };
    run_mode(app, mode, format, use_color).await
}

pub async fn run_sync_note(
    app: &App,
    folder: &str,
    title: &str,
    body: Option<String>,
    format: &OutputFormat,
    use_color: bool,
) -> Result<()> {
    let body = match body {
        Some(body) => body,
        None => stored_body(app, folder, title)?,
    };
    let mode = SyncMode::SingleNote {
        folder: folder.to_string(),
        title: title.to_string(),
        body,
    };
    run_mode(app, mode, format, use_color).await
}

fn stored_body(app: &App, folder: &str, title: &str) -> Result<String> {
    let found = app
        .store
        .find_folder_by_name(folder)
        .context("Failed to read folders")?
        .with_context(|| format!("No local folder named '{}'", folder))?;
    let notes = app
        .store
        .list_notes_in_folder(found.id)
        .context("Failed to read notes")?;
    notes
        .into_iter()
        .find(|n| n.title == title)
        .map(|n| n.body)
        .with_context(|| format!("No note '{}' in folder '{}'", title, folder))
}

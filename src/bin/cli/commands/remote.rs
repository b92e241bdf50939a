use anyhow::{anyhow, Result};

use notesync_lib::sync::drive::RequestKind;
use notesync_lib::sync::SyncEvent;

use crate::app::App;
use crate::OutputFormat;

fn failure(event: &SyncEvent, kind: RequestKind) -> Option<Result<()>> {
    match event {
        SyncEvent::OperationFailed {
            operation, message, ..
        } if *operation == kind => Some(Err(anyhow!(message.clone()))),
        _ => None,
    }
}

pub async fn run_list(app: &App, format: &OutputFormat) -> Result<()> {
    let mut engine = app.start_engine().await?;
    engine.handle.list_remote().await?;
    let files = engine
        .wait_for(|event| match event {
            SyncEvent::RemoteListing { files } => Some(Ok(files)),
            other => failure(&other, RequestKind::List).map(|r| r.map(|_| Vec::new())),
        })
        .await;
    engine.shutdown().await?;
    let files = files?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&files)?),
        OutputFormat::Plain => {
            if files.is_empty() {
                println!("(no files)");
            }
            for file in &files {
                let size = file.size.as_deref().unwrap_or("-");
                println!("{:<40} {:>8}  {}", file.name, size, file.id);
            }
        }
    }
    Ok(())
}

pub async fn run_download(app: &App, file_id: &str) -> Result<()> {
    let mut engine = app.start_engine().await?;
    engine.handle.download(file_id).await?;
    let wanted = file_id.to_string();
    let content = engine
        .wait_for(|event| match event {
            SyncEvent::NoteDownloaded { file_id, content } if file_id == wanted => {
                Some(Ok(content))
            }
            other => failure(&other, RequestKind::Download).map(|r| r.map(|_| String::new())),
        })
        .await;
    engine.shutdown().await?;

    print!("{}", content?);
    Ok(())
}

pub async fn run_delete(app: &App, file_id: &str, format: &OutputFormat) -> Result<()> {
    let mut engine = app.start_engine().await?;
    engine.handle.delete(file_id).await?;
    let wanted = file_id.to_string();
    let outcome = engine
        .wait_for(|event| match event {
            SyncEvent::NoteDeleted { file_id } if file_id == wanted => Some(Ok(())),
            other => failure(&other, RequestKind::Delete),
        })
        .await;
    engine.shutdown().await?;
    outcome?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::json!({ "deleted": file_id })),
        OutputFormat::Plain => println!("Deleted {}", file_id),
    }
    Ok(())
}

use anyhow::{anyhow, Result};

use notesync_lib::sync::drive::RequestKind;
use notesync_lib::sync::SyncEvent;

use crate::app::App;
use crate::commands::sync::await_sync;
use crate::render::terminal::{paint, render_summary, summary_json, Color};
use crate::OutputFormat;

pub fn run_auth_url(app: &App, format: &OutputFormat) -> Result<()> {
    let url = app.manager()?.authorization_url()?;
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "authUrl": url }))?)
        }
        OutputFormat::Plain => println!("{}", url),
    }
    Ok(())
}

pub fn run_connect(app: &App, open_browser: bool, format: &OutputFormat) -> Result<()> {
    let url = app.manager()?.start_authentication()?;

    let opened = open_browser
        && match open::that(&url) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("CLI: could not open a browser: {}", e);
                false
            }
        };

    match format {
        OutputFormat::Json => {
            let output = serde_json::json!({ "authUrl": url, "opened": opened });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Plain => {
            if !opened {
                println!("Open this URL in a browser and allow access:\n\n  {}\n", url);
            }
            println!("Then run: notesync-cli complete-auth <code>");
        }
    }
    Ok(())
}

/// Exchange the code, then wait for the initial sync that follows.
pub async fn run_complete(
    app: &App,
    code: &str,
    format: &OutputFormat,
    use_color: bool,
) -> Result<()> {
    let mut engine = app.start_engine().await?;
    engine.handle.complete_authentication(code).await?;

    engine
        .wait_for(|event| match event {
            SyncEvent::AuthenticationChanged(true) => Some(Ok(())),
            SyncEvent::OperationFailed {
                operation: RequestKind::AuthExchange,
                message,
                ..
            } => Some(Err(anyhow!(message))),
            _ => None,
        })
        .await?;
    if matches!(format, OutputFormat::Plain) {
        println!("{}", paint("Connected to Google Drive", Color::GREEN, use_color));
    }

    let summary = await_sync(&mut engine, None, format, use_color).await;
    engine.shutdown().await?;
    let summary = summary?;

    match format {
        OutputFormat::Json => {
            let output = serde_json::json!({ "connected": true, "sync": summary_json(&summary) });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Plain => println!("{}", render_summary(&summary, use_color)),
    }
    Ok(())
}

pub fn run_logout(app: &App, format: &OutputFormat) -> Result<()> {
    app.manager()?.logout()?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::json!({ "connected": false })),
        OutputFormat::Plain => println!("Disconnected from Google Drive"),
    }
    Ok(())
}

use anyhow::{bail, Result};

use notesync_lib::sync::ConfigError;

use crate::app::App;
use crate::render::terminal::{paint, Color};
use crate::OutputFormat;

pub fn run_status(app: &App, format: &OutputFormat) -> Result<()> {
    let status = app.manager()?.status();

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
        OutputFormat::Plain => {
            println!("Status:     {}", status.status_text);
            println!("Last sync:  {}", status.last_sync_text);
            let auto = if status.auto_sync_enabled {
                format!("every {} minute(s)", status.auto_sync_interval_minutes)
            } else {
                "off".to_string()
            };
            println!("Auto-sync:  {}", auto);
            if let Some(root) = &status.root_folder_id {
                println!("Folder id:  {}", root);
            }
            if let Some(error) = &status.config_error {
                println!("Config:     {}", error);
            }
        }
    }
    Ok(())
}

pub fn run_auto_sync(
    app: &App,
    enabled: bool,
    interval: Option<i64>,
    format: &OutputFormat,
) -> Result<()> {
    let mut manager = app.manager()?;
    let interval = interval.unwrap_or(manager.state().auto_sync_interval);
    manager.set_auto_sync(enabled, interval)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&manager.status())?),
        OutputFormat::Plain if enabled => println!("Auto-sync every {} minute(s)", interval),
        OutputFormat::Plain => println!("Auto-sync off"),
    }
    Ok(())
}

pub fn run_config_check(app: &App, format: &OutputFormat, use_color: bool) -> Result<()> {
    let problems = match app.config.validate() {
        Ok(()) => Vec::new(),
        Err(ConfigError::Invalid(problems)) => problems,
        Err(other) => vec![other.to_string()],
    };
    let credentials = &app.config.credentials;

    match format {
        OutputFormat::Json => {
            let output = serde_json::json!({
                "source": app.config.source.to_string(),
                "valid": problems.is_empty(),
                "problems": problems,
                "redirectUri": credentials.redirect_uri,
                "scope": credentials.scope,
                "syncIntervalMinutes": credentials.sync_interval_minutes,
                "syncFolder": credentials.sync_folder_name,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Plain => {
            println!("Source:       {}", app.config.source);
            println!("Sync folder:  {}", credentials.sync_folder_name);
            println!("Interval:     {} minute(s)", credentials.sync_interval_minutes);
            if problems.is_empty() {
                println!("{}", paint("Configuration is valid", Color::GREEN, use_color));
            }
            for problem in &problems {
                println!("{} {}", paint("error:", Color::RED, use_color), problem);
            }
        }
    }

    if !problems.is_empty() {
        bail!("{} configuration problem(s)", problems.len());
    }
    Ok(())
}

mod app;
mod commands;
mod render;

use std::io::IsTerminal;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "notesync-cli", about = "Sync local notes to Google Drive", version)]
struct Cli {
    /// Read credentials from this file instead of searching for notesync.conf
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding tokens, sync state and the notes database
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, default_value = "plain")]
    format: OutputFormat,

    /// Disable ANSI colors
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Plain,
    Json,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[derive(Subcommand)]
enum Command {
    /// Print the Google authorization URL
    AuthUrl,

    /// Start connecting to Google Drive
    Connect {
        /// Open the authorization URL in the default browser
        #[arg(long)]
        open: bool,
    },

    /// Finish connecting with the code Google displayed
    CompleteAuth {
        code: String,
    },

    /// Upload new and changed notes
    Sync {
        /// Re-upload every note, changed or not
        #[arg(long)]
        full: bool,
    },

    /// Upload a single note
    SyncNote {
        folder: String,
        title: String,
        /// Body to upload (use "-" to read from stdin); defaults to the stored note
        #[arg(long)]
        body: Option<String>,
    },

    /// List files in the remote sync folder
    Remote,

    /// Print a remote note's content
    Download {
        file_id: String,
    },

    /// Delete a remote note
    Delete {
        file_id: String,
    },

    /// Show connection and sync status
    Status,

    /// Turn periodic syncing on or off
    AutoSync {
        state: Toggle,
        /// Minutes between syncs
        #[arg(long)]
        interval: Option<i64>,
    },

    /// Forget the stored Google Drive tokens
    Logout,

    /// Validate the credential configuration
    ConfigCheck,

    /// Add a note to the local store
    AddNote {
        folder: String,
        title: String,
        /// Note body (use "-" to read from stdin)
        body: String,
    },
}

/// Resolve "-" as stdin
fn resolve_body(body: Option<String>) -> anyhow::Result<Option<String>> {
    match body.as_deref() {
        Some("-") => {
            let mut buf = String::new();
            std::io::Read::read_to_string(&mut std::io::stdin(), &mut buf)?;
            Ok(Some(buf))
        }
        _ => Ok(body),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let use_color = !cli.no_color && std::io::stdout().is_terminal();
    let app = app::App::new(cli.config, cli.data_dir)?;
    let format = &cli.format;

    match cli.command {
        Command::AuthUrl => commands::auth::run_auth_url(&app, format)?,
        Command::Connect { open } => commands::auth::run_connect(&app, open, format)?,
        Command::CompleteAuth { code } => {
            commands::auth::run_complete(&app, &code, format, use_color).await?
        }
        Command::Logout => commands::auth::run_logout(&app, format)?,
        Command::Sync { full } => commands::sync::run_sync(&app, full, format, use_color).await?,
        Command::SyncNote { folder, title, body } => {
            let body = resolve_body(body)?;
            commands::sync::run_sync_note(&app, &folder, &title, body, format, use_color).await?
        }
        Command::Remote => commands::remote::run_list(&app, format).await?,
        Command::Download { file_id } => commands::remote::run_download(&app, &file_id).await?,
        Command::Delete { file_id } => commands::remote::run_delete(&app, &file_id, format).await?,
        Command::Status => commands::status::run_status(&app, format)?,
        Command::AutoSync { state, interval } => {
            let enabled = matches!(state, Toggle::On);
            commands::status::run_auto_sync(&app, enabled, interval, format)?
        }
        Command::ConfigCheck => commands::status::run_config_check(&app, format, use_color)?,
        Command::AddNote { folder, title, body } => {
            let body = resolve_body(Some(body))?.unwrap_or_default();
            commands::notes::run_add_note(&app, &folder, &title, &body, format)?
        }
    }

    Ok(())
}

use notesync_lib::sync::{ReconcileSummary, SyncEvent};

/// ANSI color codes
pub struct Color;

impl Color {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const RED: &str = "\x1b[31m";
    pub const GREEN: &str = "\x1b[32m";
    pub const YELLOW: &str = "\x1b[33m";
}

pub fn paint(text: &str, color: &str, use_color: bool) -> String {
    if use_color {
        format!("{}{}{}", color, text, Color::RESET)
    } else {
        text.to_string()
    }
}

/// One line per note-level event; `None` for events not worth printing.
pub fn render_event(event: &SyncEvent, use_color: bool) -> Option<String> {
    match event {
        SyncEvent::FolderCreated { name } => {
            Some(format!("  {} folder {}", paint("+", Color::GREEN, use_color), name))
        }
        SyncEvent::NoteUploaded { folder, title, .. } => Some(format!(
            "  {} {}/{}",
            paint("^", Color::GREEN, use_color),
            folder,
            title
        )),
        SyncEvent::NoteSkipped {
            folder,
            title,
            message,
        } => Some(format!(
            "  {} {}/{} {}",
            paint("-", Color::YELLOW, use_color),
            folder,
            title,
            paint(message, Color::DIM, use_color)
        )),
        SyncEvent::NoteFailed {
            folder,
            title,
            message,
        } => Some(format!(
            "  {} {}/{} {}",
            paint("!", Color::RED, use_color),
            folder,
            title,
            paint(message, Color::DIM, use_color)
        )),
        _ => None,
    }
}

pub fn render_summary(summary: &ReconcileSummary, use_color: bool) -> String {
    let headline = if summary.mutations() == 0 {
        "Everything is up to date".to_string()
    } else {
        format!(
            "Synced: {} folder(s) created, {} note(s) created, {} updated",
            summary.folders_created, summary.notes_created, summary.notes_updated
        )
    };
    let mut out = paint(&headline, Color::BOLD, use_color);
    if summary.notes_unchanged > 0 || summary.notes_rejected > 0 {
        out.push_str(&paint(
            &format!(
                " ({} unchanged, {} skipped)",
                summary.notes_unchanged, summary.notes_rejected
            ),
            Color::DIM,
            use_color,
        ));
    }
    out
}

pub fn summary_json(summary: &ReconcileSummary) -> serde_json::Value {
    serde_json::json!({
        "foldersCreated": summary.folders_created,
        "notesCreated": summary.notes_created,
        "notesUpdated": summary.notes_updated,
        "notesUnchanged": summary.notes_unchanged,
        "notesSkipped": summary.notes_rejected,
        "failures": summary.failures,
    })
}

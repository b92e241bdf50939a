//! Naming and validation rules for note files on the remote side.

use thiserror::Error;

pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
pub const NOTE_MIME_TYPE: &str = "text/markdown";
pub const NOTE_CONTENT_TYPE: &str = "text/markdown; charset=utf-8";
pub const NOTE_EXTENSION: &str = ".md";

/// Why a note body was refused before any upload.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentIssue {
    #[error("note content is empty")]
    Empty,
    #[error("note content contains only whitespace")]
    WhitespaceOnly,
    #[error("note content is identical to its title")]
    TitleOnly,
}

impl ContentIssue {
    pub fn user_message(&self) -> &'static str {
        match self {
            ContentIssue::Empty => {
                "Cannot sync empty notes. Please add some content to your note first."
            }
            ContentIssue::WhitespaceOnly => {
                "Cannot sync notes with only spaces. Please add some content to your note first."
            }
            ContentIssue::TitleOnly => {
                "Note content is the same as its title, so it was not uploaded. \
                 Please add some content to your note first."
            }
        }
    }
}

/// Checks that `content` is worth uploading as the body of `title`.
pub fn validate_upload(title: &str, content: &str) -> Result<(), ContentIssue> {
    if content.is_empty() {
        return Err(ContentIssue::Empty);
    }
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ContentIssue::WhitespaceOnly);
    }
    // A body equal to the title means the caller passed the wrong field
    if trimmed == title.trim() {
        return Err(ContentIssue::TitleOnly);
    }
    Ok(())
}

pub fn note_file_name(title: &str) -> String {
    format!("{}{}", title, NOTE_EXTENSION)
}

/// Inverse of [`note_file_name`]; names without the suffix pass through.
pub fn title_from_file_name(name: &str) -> &str {
    name.strip_suffix(NOTE_EXTENSION).unwrap_or(name)
}

/// Escape a value for use inside a single-quoted Drive query literal.
pub fn quote_query_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

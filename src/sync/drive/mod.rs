mod client;
pub mod content;
mod request;
mod transport;

use thiserror::Error;

pub use client::DriveClient;
pub use content::{validate_upload, ContentIssue};
pub use request::{
    Completion, DriveReply, DriveRequest, NoteUpload, RemoteFile, RequestId, RequestKind,
    SessionId, Tagged, UploadTarget,
};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriveError {
    #[error("Not authenticated")]
    NotAuthenticated,
    #[error("Invalid note content: {0}")]
    InvalidContent(#[from] ContentIssue),
    #[error("Authentication failed: {status} - {message}")]
    Unauthorized { status: u16, message: String },
    #[error("Server error: {status} - {message}")]
    Server { status: u16, message: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl DriveError {
    /// 401s and bodies that say "unauthorized" trigger re-authentication.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, DriveError::Unauthorized { .. })
    }

    /// Raised before any network call was made.
    pub fn is_local(&self) -> bool {
        matches!(self, DriveError::NotAuthenticated | DriveError::InvalidContent(_))
    }
}

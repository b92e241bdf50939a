use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::DriveError;
use crate::sync::oauth::{TokenForm, TokenGrant};

pub type RequestId = Uuid;
pub type SessionId = Uuid;

/// A file or folder as returned by a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct FileList {
    #[serde(default)]
    pub files: Vec<RemoteFile>,
}

/// One note body headed for a known remote folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteUpload {
    pub folder: String,
    pub folder_id: String,
    pub title: String,
    pub content: String,
    /// Set when overwriting an existing remote file.
    pub existing_id: Option<String>,
}

impl NoteUpload {
    pub fn is_update(&self) -> bool {
        self.existing_id.is_some()
    }
}

/// Where the second upload phase sends the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadTarget {
    /// Resumable session URL; the URL itself authorizes the upload.
    Session(String),
    /// The server answered with a file id instead; use a direct media PUT.
    File(String),
}

/// Every remote operation the sync core can issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveRequest {
    AuthExchange { form: TokenForm },
    TokenRefresh { form: TokenForm },
    FindFolder { name: String },
    CreateRootFolder { name: String },
    ListSubfolders { parent_id: String },
    ListNotesInFolder { folder: String, folder_id: String },
    CreateFolder { parent_id: String, name: String },
    UploadMetadata { upload: NoteUpload },
    UploadContent { upload: NoteUpload, target: UploadTarget },
    Download { file_id: String },
    Delete { file_id: String },
    List { parent_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    AuthExchange,
    TokenRefresh,
    FindFolder,
    CreateRootFolder,
    ListSubfolders,
    ListNotesInFolder,
    CreateFolder,
    UploadMetadata,
    UploadContent,
    Download,
    Delete,
    List,
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RequestKind::AuthExchange => "authExchange",
            RequestKind::TokenRefresh => "tokenRefresh",
            RequestKind::FindFolder => "findFolder",
            RequestKind::CreateRootFolder => "createRootFolder",
            RequestKind::ListSubfolders => "listSubfolders",
            RequestKind::ListNotesInFolder => "listNotesInFolder",
            RequestKind::CreateFolder => "createFolder",
            RequestKind::UploadMetadata => "uploadMetadata",
            RequestKind::UploadContent => "uploadContent",
            RequestKind::Download => "download",
            RequestKind::Delete => "delete",
            RequestKind::List => "list",
        };
        f.write_str(name)
    }
}

impl DriveRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            DriveRequest::AuthExchange { .. } => RequestKind::AuthExchange,
            DriveRequest::TokenRefresh { .. } => RequestKind::TokenRefresh,
            DriveRequest::FindFolder { .. } => RequestKind::FindFolder,
            DriveRequest::CreateRootFolder { .. } => RequestKind::CreateRootFolder,
            DriveRequest::ListSubfolders { .. } => RequestKind::ListSubfolders,
            DriveRequest::ListNotesInFolder { .. } => RequestKind::ListNotesInFolder,
            DriveRequest::CreateFolder { .. } => RequestKind::CreateFolder,
            DriveRequest::UploadMetadata { .. } => RequestKind::UploadMetadata,
            DriveRequest::UploadContent { .. } => RequestKind::UploadContent,
            DriveRequest::Download { .. } => RequestKind::Download,
            DriveRequest::Delete { .. } => RequestKind::Delete,
            DriveRequest::List { .. } => RequestKind::List,
        }
    }

    /// Token endpoint calls and session-URL uploads carry no bearer token.
    pub fn needs_bearer(&self) -> bool {
        match self {
            DriveRequest::AuthExchange { .. } | DriveRequest::TokenRefresh { .. } => false,
            DriveRequest::UploadContent {
                target: UploadTarget::Session(_),
                ..
            } => false,
            _ => true,
        }
    }
}

/// Typed result of a successful request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveReply {
    Tokens(TokenGrant),
    FolderFound(Option<RemoteFile>),
    FolderCreated(RemoteFile),
    Files(Vec<RemoteFile>),
    UploadStarted(UploadTarget),
    Uploaded { file_id: String },
    Downloaded(String),
    Deleted,
}

/// A request stamped with its id, owning session and bearer token.
#[derive(Debug, Clone)]
pub struct Tagged {
    pub id: RequestId,
    pub session: Option<SessionId>,
    pub bearer: Option<String>,
    pub request: DriveRequest,
}

impl Tagged {
    pub fn new(session: Option<SessionId>, bearer: Option<String>, request: DriveRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            session,
            bearer,
            request,
        }
    }

    pub fn complete(self, reply: Result<DriveReply, DriveError>) -> Completion {
        Completion {
            id: self.id,
            session: self.session,
            request: self.request,
            reply,
        }
    }
}

/// Delivered on the single completion channel when a request finishes.
#[derive(Debug, Clone)]
pub struct Completion {
    pub id: RequestId,
    pub session: Option<SessionId>,
    pub request: DriveRequest,
    pub reply: Result<DriveReply, DriveError>,
}

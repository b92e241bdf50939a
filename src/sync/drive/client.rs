use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;

use super::content::{
    note_file_name, quote_query_value, validate_upload, FOLDER_MIME_TYPE, NOTE_CONTENT_TYPE,
    NOTE_MIME_TYPE,
};
use super::request::{
    Completion, DriveReply, DriveRequest, FileList, NoteUpload, RemoteFile, Tagged, UploadTarget,
};
use super::transport::{HttpRequest, HttpResponse, HttpTransport};
use super::DriveError;
use crate::sync::config::DriveEndpoints;
use crate::sync::oauth::TokenGrant;

const FOLDER_FIELDS: &str = "files(id,name)";
const FILE_FIELDS: &str = "files(id,name,mimeType,modifiedTime,size)";
const ROOT_SEARCH_PAGE_SIZE: u32 = 10;

/// REST client for the remote drive.
///
/// Every operation is a [`DriveRequest`]; `execute` runs one to completion and
/// `dispatch` runs it in the background, reporting on the completion channel.
pub struct DriveClient {
    transport: Arc<dyn HttpTransport>,
    endpoints: DriveEndpoints,
}

impl DriveClient {
    pub fn new(transport: Arc<dyn HttpTransport>, endpoints: DriveEndpoints) -> Self {
        let endpoints = DriveEndpoints {
            api_base: endpoints.api_base.trim_end_matches('/').to_string(),
            upload_base: endpoints.upload_base.trim_end_matches('/').to_string(),
            ..endpoints
        };
        Self {
            transport,
            endpoints,
        }
    }

    pub fn endpoints(&self) -> &DriveEndpoints {
        &self.endpoints
    }

    fn files_url(&self) -> String {
        format!("{}/files", self.endpoints.api_base)
    }

    fn file_url(&self, file_id: &str) -> String {
        format!("{}/files/{}", self.endpoints.api_base, urlencoding::encode(file_id))
    }

    fn query_url(&self, q: &str, fields: &str, page_size: Option<u32>) -> String {
        let mut url = format!(
            "{}?q={}&fields={}",
            self.files_url(),
            urlencoding::encode(q),
            urlencoding::encode(fields)
        );
        if let Some(size) = page_size {
            url.push_str(&format!("&pageSize={}", size));
        }
        url
    }

    /// Translate a request into HTTP. Fails locally, without touching the
    /// network, when a bearer token is required but missing or when an
    /// upload body is not acceptable.
    pub fn build_request(
        &self,
        request: &DriveRequest,
        bearer: Option<&str>,
    ) -> Result<HttpRequest, DriveError> {
        match request {
            DriveRequest::UploadMetadata { upload } | DriveRequest::UploadContent { upload, .. } => {
                validate_upload(&upload.title, &upload.content)?;
            }
            _ => {}
        }

        let bearer = match (request.needs_bearer(), bearer) {
            (true, Some(token)) if !token.is_empty() => Some(token),
            (true, _) => return Err(DriveError::NotAuthenticated),
            (false, _) => None,
        };

        let http = match request {
            DriveRequest::AuthExchange { form } | DriveRequest::TokenRefresh { form } => {
                HttpRequest::post(&self.endpoints.token_url).form_body(form.fields())
            }
            DriveRequest::FindFolder { name } => {
                let q = format!(
                    "name='{}' and mimeType='{}' and trashed=false",
                    quote_query_value(name),
                    FOLDER_MIME_TYPE
                );
                HttpRequest::get(self.query_url(&q, FOLDER_FIELDS, Some(ROOT_SEARCH_PAGE_SIZE)))
            }
            DriveRequest::CreateRootFolder { name } => {
                HttpRequest::post(format!("{}?fields=id,name", self.files_url())).json_body(&json!({
                    "name": name,
                    "mimeType": FOLDER_MIME_TYPE,
                    "parents": ["root"],
                }))
            }
            DriveRequest::ListSubfolders { parent_id } => {
                let q = format!(
                    "'{}' in parents and mimeType='{}' and trashed=false",
                    quote_query_value(parent_id),
                    FOLDER_MIME_TYPE
                );
                HttpRequest::get(self.query_url(&q, FOLDER_FIELDS, None))
            }
            DriveRequest::ListNotesInFolder { folder_id: parent_id, .. }
            | DriveRequest::List { parent_id } => {
                let q = format!("'{}' in parents and trashed=false", quote_query_value(parent_id));
                HttpRequest::get(self.query_url(&q, FILE_FIELDS, None))
            }
            DriveRequest::CreateFolder { parent_id, name } => {
                HttpRequest::post(format!("{}?fields=id,name", self.files_url())).json_body(&json!({
                    "name": name,
                    "mimeType": FOLDER_MIME_TYPE,
                    "parents": [parent_id],
                }))
            }
            DriveRequest::UploadMetadata { upload } => self.metadata_request(upload),
            DriveRequest::UploadContent { target, upload } => match target {
                UploadTarget::Session(url) => {
                    HttpRequest::put(url.as_str()).text_body(NOTE_CONTENT_TYPE, &upload.content)
                }
                UploadTarget::File(file_id) => {
                    HttpRequest::put(format!("{}?alt=media", self.file_url(file_id)))
                        .text_body(NOTE_CONTENT_TYPE, &upload.content)
                }
            },
            DriveRequest::Download { file_id } => {
                HttpRequest::get(format!("{}?alt=media", self.file_url(file_id)))
            }
            DriveRequest::Delete { file_id } => HttpRequest::delete(self.file_url(file_id)),
        };

        Ok(match bearer {
            Some(token) => http.bearer(token),
            None => http,
        })
    }

    fn metadata_request(&self, upload: &NoteUpload) -> HttpRequest {
        let name = note_file_name(&upload.title);
        let request = match &upload.existing_id {
            // Drive refuses `parents` on update requests
            Some(file_id) => HttpRequest::put(format!(
                "{}/files/{}?uploadType=resumable",
                self.endpoints.upload_base,
                urlencoding::encode(file_id)
            ))
            .json_body(&json!({ "name": name, "mimeType": NOTE_MIME_TYPE })),
            None => HttpRequest::post(format!(
                "{}/files?uploadType=resumable",
                self.endpoints.upload_base
            ))
            .json_body(&json!({
                "name": name,
                "mimeType": NOTE_MIME_TYPE,
                "parents": [upload.folder_id],
            })),
        };
        request.header("X-Upload-Content-Type", NOTE_MIME_TYPE)
    }

    /// Run one request to completion.
    pub async fn execute(
        &self,
        request: &DriveRequest,
        bearer: Option<&str>,
    ) -> Result<DriveReply, DriveError> {
        let kind = request.kind();
        let http = match self.build_request(request, bearer) {
            Ok(http) => http,
            Err(e) => {
                log::warn!("Drive: {} rejected locally: {}", kind, e);
                return Err(e);
            }
        };

        log::debug!("Drive: {} {} ({})", http.method, strip_query(&http.url), kind);
        let response = self.transport.execute(http).await.map_err(|e| {
            log::error!("Drive: {} transport failure: {}", kind, e);
            e
        })?;
        let response = check_status(response).map_err(|e| {
            log::error!("Drive: {} failed: {}", kind, e);
            e
        })?;

        parse_reply(request, &response)
    }

    /// Run a tagged request in the background; its completion is sent on
    /// `completions` whatever the outcome.
    pub fn dispatch(self: &Arc<Self>, tagged: Tagged, completions: mpsc::Sender<Completion>) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let reply = client
                .execute(&tagged.request, tagged.bearer.as_deref())
                .await;
            if completions.send(tagged.complete(reply)).await.is_err() {
                log::debug!("Drive: completion dropped, sync engine has stopped");
            }
        });
    }

    /// List non-trashed children of a folder.
    pub async fn list_children(
        &self,
        parent_id: &str,
        bearer: Option<&str>,
    ) -> Result<Vec<RemoteFile>, DriveError> {
        let request = DriveRequest::List {
            parent_id: parent_id.to_string(),
        };
        match self.execute(&request, bearer).await? {
            DriveReply::Files(files) => Ok(files),
            other => Err(unexpected(&request, &other)),
        }
    }

    /// Both upload phases back to back. Returns the remote file id.
    pub async fn upload_note(
        &self,
        upload: NoteUpload,
        bearer: Option<&str>,
    ) -> Result<String, DriveError> {
        let metadata = DriveRequest::UploadMetadata { upload };
        let target = match self.execute(&metadata, bearer).await? {
            DriveReply::UploadStarted(target) => target,
            other => return Err(unexpected(&metadata, &other)),
        };
        let DriveRequest::UploadMetadata { upload } = metadata else {
            return Err(DriveError::Malformed("upload request lost".to_string()));
        };

        let content = DriveRequest::UploadContent { upload, target };
        match self.execute(&content, bearer).await? {
            DriveReply::Uploaded { file_id } => Ok(file_id),
            other => Err(unexpected(&content, &other)),
        }
    }

    pub async fn download_note(
        &self,
        file_id: &str,
        bearer: Option<&str>,
    ) -> Result<String, DriveError> {
        let request = DriveRequest::Download {
            file_id: file_id.to_string(),
        };
        match self.execute(&request, bearer).await? {
            DriveReply::Downloaded(body) => Ok(body),
            other => Err(unexpected(&request, &other)),
        }
    }

    pub async fn delete_note(&self, file_id: &str, bearer: Option<&str>) -> Result<(), DriveError> {
        let request = DriveRequest::Delete {
            file_id: file_id.to_string(),
        };
        match self.execute(&request, bearer).await? {
            DriveReply::Deleted => Ok(()),
            other => Err(unexpected(&request, &other)),
        }
    }
}

fn strip_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

fn unexpected(request: &DriveRequest, reply: &DriveReply) -> DriveError {
    DriveError::Malformed(format!("unexpected reply to {}: {:?}", request.kind(), reply))
}

/// Map non-2xx responses onto the error taxonomy.
fn check_status(response: HttpResponse) -> Result<HttpResponse, DriveError> {
    if response.is_success() {
        return Ok(response);
    }
    let message = response.text();
    if response.status == 401 || message.to_lowercase().contains("unauthorized") {
        return Err(DriveError::Unauthorized {
            status: response.status,
            message,
        });
    }
    Err(DriveError::Server {
        status: response.status,
        message,
    })
}

fn file_id_from(response: &HttpResponse) -> Option<String> {
    serde_json::from_slice::<serde_json::Value>(&response.body)
        .ok()?
        .get("id")?
        .as_str()
        .map(str::to_string)
}

fn parse_reply(request: &DriveRequest, response: &HttpResponse) -> Result<DriveReply, DriveError> {
    let reply = match request {
        DriveRequest::AuthExchange { .. } | DriveRequest::TokenRefresh { .. } => {
            DriveReply::Tokens(response.json::<TokenGrant>()?)
        }
        DriveRequest::FindFolder { .. } => {
            let list: FileList = response.json()?;
            DriveReply::FolderFound(list.files.into_iter().next())
        }
        DriveRequest::CreateRootFolder { .. } | DriveRequest::CreateFolder { .. } => {
            DriveReply::FolderCreated(response.json::<RemoteFile>()?)
        }
        DriveRequest::ListSubfolders { .. }
        | DriveRequest::ListNotesInFolder { .. }
        | DriveRequest::List { .. } => {
            let list: FileList = response.json()?;
            DriveReply::Files(list.files)
        }
        DriveRequest::UploadMetadata { upload } => {
            if let Some(location) = response.header("Location") {
                DriveReply::UploadStarted(UploadTarget::Session(location.to_string()))
            } else if let Some(id) = file_id_from(response).or_else(|| upload.existing_id.clone()) {
                log::info!("Drive: no upload session offered for '{}', using direct upload", upload.title);
                DriveReply::UploadStarted(UploadTarget::File(id))
            } else {
                return Err(DriveError::Malformed(
                    "upload metadata response had neither a session nor a file id".to_string(),
                ));
            }
        }
        DriveRequest::UploadContent { upload, target } => {
            let fallback = match target {
                UploadTarget::File(id) => Some(id.clone()),
                UploadTarget::Session(_) => upload.existing_id.clone(),
            };
            match file_id_from(response).or(fallback) {
                Some(file_id) => DriveReply::Uploaded { file_id },
                None => {
                    return Err(DriveError::Malformed(
                        "upload finished without a file id".to_string(),
                    ))
                }
            }
        }
        DriveRequest::Download { .. } => DriveReply::Downloaded(response.text()),
        DriveRequest::Delete { .. } => DriveReply::Deleted,
    };
    Ok(reply)
}

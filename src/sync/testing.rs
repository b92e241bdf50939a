//! In-memory stand-ins for the network, shared by the sync tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::json;

use super::config::{Credentials, DriveEndpoints};
use super::drive::content::FOLDER_MIME_TYPE;
use super::drive::{DriveError, HttpRequest, HttpResponse, HttpTransport};

pub const GOOD_CODE: &str = "good-code";
pub const INITIAL_ACCESS: &str = "fake-access-0";
pub const INITIAL_REFRESH: &str = "fake-refresh";

pub fn test_endpoints() -> DriveEndpoints {
    DriveEndpoints {
        auth_url: "https://fake.test/auth".to_string(),
        token_url: "https://fake.test/token".to_string(),
        api_base: "https://fake.test/drive/v3".to_string(),
        upload_base: "https://fake.test/upload/drive/v3".to_string(),
    }
}

pub fn test_credentials() -> Credentials {
    Credentials {
        client_id: "client-123".to_string(),
        client_secret: "secret-456".to_string(),
        ..Credentials::default()
    }
}

/// Replays canned responses in order and records every request.
#[derive(Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<Result<HttpResponse, DriveError>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, response: HttpResponse) {
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    pub fn push_json(&self, status: u16, body: serde_json::Value) {
        self.push(HttpResponse::new(status).with_json(&body));
    }

    pub fn push_error(&self, error: DriveError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, DriveError> {
        self.requests.lock().unwrap().push(request);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(DriveError::Transport("no scripted response".to_string())))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub parents: Vec<String>,
    pub content: String,
    pub trashed: bool,
}

impl FakeFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }
}

#[derive(Debug, Clone)]
struct PendingUpload {
    file_id: Option<String>,
    name: String,
    mime_type: String,
    parent: Option<String>,
}

#[derive(Default)]
struct FakeState {
    files: Vec<FakeFile>,
    next_id: u32,
    next_token: u32,
    sessions: HashMap<String, PendingUpload>,
    calls: Vec<(Method, String)>,
    valid_tokens: HashSet<String>,
    refresh_token: String,
    direct_uploads: bool,
}

/// A small Drive v3 look-alike: folders, markdown files, resumable
/// sessions, the token endpoint and bearer checks.
pub struct FakeDrive {
    endpoints: DriveEndpoints,
    state: Mutex<FakeState>,
}

impl Default for FakeDrive {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDrive {
    pub fn new() -> Self {
        let mut state = FakeState {
            refresh_token: INITIAL_REFRESH.to_string(),
            ..FakeState::default()
        };
        state.valid_tokens.insert(INITIAL_ACCESS.to_string());
        Self {
            endpoints: test_endpoints(),
            state: Mutex::new(state),
        }
    }

    /// Answer resumable-session requests with a file id instead of a
    /// Location header, forcing the direct media upload path.
    pub fn use_direct_uploads(&self) {
        self.state.lock().unwrap().direct_uploads = true;
    }

    pub fn revoke_tokens(&self) {
        self.state.lock().unwrap().valid_tokens.clear();
    }

    pub fn add_folder(&self, name: &str, parent: &str) -> String {
        self.insert(name, FOLDER_MIME_TYPE, Some(parent), "")
    }

    pub fn add_note(&self, parent: &str, file_name: &str, content: &str) -> String {
        self.insert(file_name, "text/markdown", Some(parent), content)
    }

    pub fn folder(&self, name: &str, parent: &str) -> Option<FakeFile> {
        self.children(parent)
            .into_iter()
            .find(|f| f.is_folder() && f.name == name)
    }

    pub fn root_folders(&self, name: &str) -> Vec<FakeFile> {
        let state = self.state.lock().unwrap();
        state
            .files
            .iter()
            .filter(|f| f.is_folder() && f.name == name && f.parents.iter().any(|p| p == "root"))
            .cloned()
            .collect()
    }

    pub fn children(&self, parent: &str) -> Vec<FakeFile> {
        let state = self.state.lock().unwrap();
        state
            .files
            .iter()
            .filter(|f| !f.trashed && f.parents.iter().any(|p| p == parent))
            .cloned()
            .collect()
    }

    pub fn file(&self, id: &str) -> Option<FakeFile> {
        let state = self.state.lock().unwrap();
        state.files.iter().find(|f| f.id == id).cloned()
    }

    /// `"METHOD path"` for every call, query string stripped.
    pub fn calls(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .calls
            .iter()
            .map(|(m, url)| format!("{} {}", m, url.split('?').next().unwrap_or(url)))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Calls that change remote state (everything except GET and token calls).
    pub fn mutation_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .calls
            .iter()
            .filter(|(m, url)| *m != Method::GET && !url.starts_with(&self.endpoints.token_url))
            .count()
    }

    fn insert(&self, name: &str, mime_type: &str, parent: Option<&str>, content: &str) -> String {
        let mut state = self.state.lock().unwrap();
        Self::insert_locked(&mut state, name, mime_type, parent, content)
    }

    fn insert_locked(
        state: &mut FakeState,
        name: &str,
        mime_type: &str,
        parent: Option<&str>,
        content: &str,
    ) -> String {
        state.next_id += 1;
        let id = format!("id-{}", state.next_id);
        state.files.push(FakeFile {
            id: id.clone(),
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            parents: parent.map(|p| vec![p.to_string()]).unwrap_or_default(),
            content: content.to_string(),
            trashed: false,
        });
        id
    }

    fn handle(&self, request: &HttpRequest) -> HttpResponse {
        let mut state = self.state.lock().unwrap();
        state.calls.push((request.method.clone(), request.url.clone()));

        let (path, query) = match request.url.split_once('?') {
            Some((p, q)) => (p.to_string(), parse_pairs(q)),
            None => (request.url.clone(), HashMap::new()),
        };

        if path == self.endpoints.token_url {
            return Self::token(&mut state, request);
        }

        let upload_sessions = format!("{}/sessions/", self.endpoints.upload_base);
        if let Some(session_id) = path.strip_prefix(&upload_sessions) {
            return Self::finish_session(&mut state, session_id, request);
        }

        let authorized = request
            .header_value("Authorization")
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|t| state.valid_tokens.contains(t))
            .unwrap_or(false);
        if !authorized {
            return HttpResponse::new(401).with_json(&json!({
                "error": { "code": 401, "message": "Request had invalid authentication credentials." }
            }));
        }

        let api_files = format!("{}/files", self.endpoints.api_base);
        let upload_files = format!("{}/files", self.endpoints.upload_base);

        if path == api_files && request.method == Method::GET {
            return Self::list(&state, query.get("q").map(String::as_str).unwrap_or(""));
        }
        if path == api_files && request.method == Method::POST {
            let body: serde_json::Value =
                serde_json::from_slice(request.body.as_deref().unwrap_or(b"{}")).unwrap_or_default();
            let name = body["name"].as_str().unwrap_or("").to_string();
            let mime = body["mimeType"].as_str().unwrap_or("").to_string();
            let parent = body["parents"][0].as_str().map(str::to_string);
            if !parent.as_deref().map_or(true, |p| Self::parent_exists(&state, p)) {
                return HttpResponse::new(404).with_text("File not found");
            }
            let id = Self::insert_locked(&mut state, &name, &mime, parent.as_deref(), "");
            return HttpResponse::new(200).with_json(&json!({ "id": id, "name": name }));
        }
        if path == upload_files && request.method == Method::POST {
            let body: serde_json::Value =
                serde_json::from_slice(request.body.as_deref().unwrap_or(b"{}")).unwrap_or_default();
            let pending = PendingUpload {
                file_id: None,
                name: body["name"].as_str().unwrap_or("").to_string(),
                mime_type: body["mimeType"].as_str().unwrap_or("").to_string(),
                parent: body["parents"][0].as_str().map(str::to_string),
            };
            if !pending.parent.as_deref().map_or(true, |p| Self::parent_exists(&state, p)) {
                return HttpResponse::new(404).with_text("File not found");
            }
            return self.open_session(&mut state, pending);
        }
        if let Some(id) = path.strip_prefix(&format!("{}/", upload_files)) {
            let Some(existing) = state.files.iter().find(|f| f.id == id).cloned() else {
                return HttpResponse::new(404).with_text("File not found");
            };
            let pending = PendingUpload {
                file_id: Some(existing.id.clone()),
                name: existing.name.clone(),
                mime_type: existing.mime_type.clone(),
                parent: None,
            };
            return self.open_session(&mut state, pending);
        }
        if let Some(id) = path.strip_prefix(&format!("{}/", api_files)) {
            let Some(i) = state.files.iter().position(|f| f.id == id && !f.trashed) else {
                return HttpResponse::new(404).with_text("File not found");
            };
            return if request.method == Method::GET {
                HttpResponse::new(200).with_text(&state.files[i].content)
            } else if request.method == Method::PUT {
                state.files[i].content = request.body_text();
                let file = &state.files[i];
                HttpResponse::new(200).with_json(&json!({ "id": file.id, "name": file.name }))
            } else if request.method == Method::DELETE {
                state.files.remove(i);
                HttpResponse::new(204)
            } else {
                HttpResponse::new(405)
            };
        }

        HttpResponse::new(404).with_text("Not found")
    }

    /// Drive answers 404 for a deleted or unknown parent folder.
    fn parent_exists(state: &FakeState, parent: &str) -> bool {
        parent == "root"
            || state
                .files
                .iter()
                .any(|f| f.id == parent && f.is_folder() && !f.trashed)
    }

    fn open_session(&self, state: &mut FakeState, pending: PendingUpload) -> HttpResponse {
        if state.direct_uploads {
            let id = match pending.file_id {
                Some(id) => id,
                None => Self::insert_locked(
                    state,
                    &pending.name,
                    &pending.mime_type,
                    pending.parent.as_deref(),
                    "",
                ),
            };
            return HttpResponse::new(200).with_json(&json!({ "id": id }));
        }

        state.next_id += 1;
        let session_id = format!("s-{}", state.next_id);
        state.sessions.insert(session_id.clone(), pending);
        HttpResponse::new(200).with_header(
            "Location",
            format!("{}/sessions/{}", self.endpoints.upload_base, session_id),
        )
    }

    fn finish_session(state: &mut FakeState, session_id: &str, request: &HttpRequest) -> HttpResponse {
        let Some(pending) = state.sessions.remove(session_id) else {
            return HttpResponse::new(404).with_text("Upload session not found");
        };
        let content = request.body_text();
        let id = match pending.file_id {
            Some(id) => {
                if let Some(file) = state.files.iter_mut().find(|f| f.id == id) {
                    file.content = content;
                }
                id
            }
            None => Self::insert_locked(
                state,
                &pending.name,
                &pending.mime_type,
                pending.parent.as_deref(),
                &content,
            ),
        };
        HttpResponse::new(200).with_json(&json!({ "id": id, "name": pending.name }))
    }

    fn token(state: &mut FakeState, request: &HttpRequest) -> HttpResponse {
        let form = parse_pairs(&request.body_text());
        let grant = form.get("grant_type").map(String::as_str).unwrap_or("");
        let accepted = match grant {
            "authorization_code" => form.get("code").map(String::as_str) == Some(GOOD_CODE),
            "refresh_token" => form.get("refresh_token") == Some(&state.refresh_token),
            _ => false,
        };
        if !accepted {
            return HttpResponse::new(400).with_json(&json!({ "error": "invalid_grant" }));
        }

        state.next_token += 1;
        let access = format!("fake-access-{}", state.next_token);
        state.valid_tokens.insert(access.clone());
        let mut body = json!({ "access_token": access, "expires_in": 3600, "token_type": "Bearer" });
        if grant == "authorization_code" {
            body["refresh_token"] = json!(state.refresh_token);
        }
        HttpResponse::new(200).with_json(&body)
    }

    fn list(state: &FakeState, q: &str) -> HttpResponse {
        let folders_only = q.contains(&format!("mimeType='{}'", FOLDER_MIME_TYPE));
        let files: Vec<serde_json::Value> = if let Some(rest) = q.strip_prefix("name='") {
            let name = quoted_prefix(rest);
            state
                .files
                .iter()
                .filter(|f| !f.trashed && f.name == name && (!folders_only || f.is_folder()))
                .map(|f| json!({ "id": f.id, "name": f.name }))
                .collect()
        } else if let Some(rest) = q.strip_prefix('\'') {
            let parent = quoted_prefix(rest);
            if !Self::parent_exists(state, &parent) {
                return HttpResponse::new(404).with_text("File not found");
            }
            state
                .files
                .iter()
                .filter(|f| !f.trashed && f.parents.iter().any(|p| *p == parent))
                .filter(|f| !folders_only || f.is_folder())
                .map(|f| {
                    json!({
                        "id": f.id,
                        "name": f.name,
                        "mimeType": f.mime_type,
                        "size": f.content.len().to_string(),
                    })
                })
                .collect()
        } else {
            Vec::new()
        };
        HttpResponse::new(200).with_json(&json!({ "files": files }))
    }
}

#[async_trait]
impl HttpTransport for FakeDrive {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, DriveError> {
        Ok(self.handle(&request))
    }
}

/// Text up to the next unescaped single quote.
fn quoted_prefix(s: &str) -> String {
    let mut out = String::new();
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            '\'' => break,
            _ => out.push(c),
        }
    }
    out
}

fn parse_pairs(raw: &str) -> HashMap<String, String> {
    raw.split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| {
            let decode = |s: &str| {
                urlencoding::decode(&s.replace('+', " "))
                    .map(|c| c.into_owned())
                    .unwrap_or_else(|_| s.to_string())
            };
            (decode(k), decode(v))
        })
        .collect()
}

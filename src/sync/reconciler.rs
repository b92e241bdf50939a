//! Turns the local folder structure into the minimal set of remote changes.
//!
//! A reconcile runs in two stages. Discovery lists the subfolders of the
//! root sync folder and the notes inside each, producing a [`RemoteSnapshot`].
//! Mutation then creates missing folders strictly one at a time, and only
//! once every folder exists fires the note uploads, which may run
//! concurrently. The snapshot is built fresh for every reconcile and never
//! outlives it.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use thiserror::Error;

use super::drive::content::{title_from_file_name, validate_upload, FOLDER_MIME_TYPE, NOTE_EXTENSION};
use super::drive::{ContentIssue, DriveError, DriveReply, DriveRequest, NoteUpload, RemoteFile, UploadTarget};
use crate::storage::FolderStructure;

/// MD5 hex digest of a note body. Change detection only.
pub fn content_hash(body: &str) -> String {
    format!("{:x}", md5::compute(body.as_bytes()))
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("Structure discovery failed: {0}")]
    Discovery(DriveError),
    #[error("Duplicate creation guard tripped: {0}")]
    DuplicationRisk(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFolderRef {
    pub local_folder_name: String,
    pub remote_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteNoteRef {
    pub title: String,
    pub remote_id: String,
    /// Hash of the body we last uploaded, if known.
    pub content_hash: Option<String>,
}

/// Remote folders and notes under the root sync folder.
///
/// Folder names and `(folder, title)` pairs are unique keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteSnapshot {
    folders: BTreeMap<String, String>,
    notes: BTreeMap<String, BTreeMap<String, RemoteNoteRef>>,
}

impl RemoteSnapshot {
    pub fn folder_id(&self, name: &str) -> Option<&str> {
        self.folders.get(name).map(String::as_str)
    }

    pub fn note(&self, folder: &str, title: &str) -> Option<&RemoteNoteRef> {
        self.notes.get(folder)?.get(title)
    }

    pub fn folders(&self) -> impl Iterator<Item = RemoteFolderRef> + '_ {
        self.folders.iter().map(|(name, id)| RemoteFolderRef {
            local_folder_name: name.clone(),
            remote_id: id.clone(),
        })
    }

    /// `(folder, note)` pairs in folder order.
    pub fn notes(&self) -> impl Iterator<Item = (&str, &RemoteNoteRef)> + '_ {
        self.notes
            .iter()
            .flat_map(|(folder, notes)| notes.values().map(move |n| (folder.as_str(), n)))
    }

    pub fn folder_count(&self) -> usize {
        self.folders.len()
    }

    pub fn note_count(&self) -> usize {
        self.notes.values().map(BTreeMap::len).sum()
    }

    /// Returns false, leaving the existing entry, if the name is already known.
    pub fn insert_folder(&mut self, name: &str, remote_id: &str) -> bool {
        if self.folders.contains_key(name) {
            return false;
        }
        self.folders.insert(name.to_string(), remote_id.to_string());
        true
    }

    /// Returns false, leaving the existing entry, if the title is already known.
    pub fn insert_note(&mut self, folder: &str, note: RemoteNoteRef) -> bool {
        let notes = self.notes.entry(folder.to_string()).or_default();
        if notes.contains_key(&note.title) {
            return false;
        }
        notes.insert(note.title.clone(), note);
        true
    }

    /// Record a finished upload, replacing any previous entry.
    pub fn record_upload(&mut self, folder: &str, title: &str, remote_id: &str, hash: &str) {
        self.notes.entry(folder.to_string()).or_default().insert(
            title.to_string(),
            RemoteNoteRef {
                title: title.to_string(),
                remote_id: remote_id.to_string(),
                content_hash: Some(hash.to_string()),
            },
        );
    }
}

/// Listing phase: builds a snapshot from one subfolder listing plus one
/// note listing per subfolder.
#[derive(Debug)]
pub struct Discovery {
    root_id: String,
    snapshot: RemoteSnapshot,
    hashes: BTreeMap<String, String>,
    subfolders_listed: bool,
    awaiting: BTreeSet<String>,
}

impl Discovery {
    /// `hashes` maps remote id to the hash of the body last uploaded there.
    pub fn new(root_id: &str, hashes: BTreeMap<String, String>) -> Self {
        Self {
            root_id: root_id.to_string(),
            snapshot: RemoteSnapshot::default(),
            hashes,
            subfolders_listed: false,
            awaiting: BTreeSet::new(),
        }
    }

    pub fn start(&self) -> DriveRequest {
        DriveRequest::ListSubfolders {
            parent_id: self.root_id.clone(),
        }
    }

    pub fn on_subfolders(&mut self, files: Vec<RemoteFile>) -> Vec<DriveRequest> {
        self.subfolders_listed = true;
        let mut requests = Vec::new();
        for folder in files {
            if !self.snapshot.insert_folder(&folder.name, &folder.id) {
                log::warn!(
                    "Sync: remote already holds more than one folder named '{}', using the first",
                    folder.name
                );
                continue;
            }
            self.awaiting.insert(folder.name.clone());
            requests.push(DriveRequest::ListNotesInFolder {
                folder: folder.name,
                folder_id: folder.id,
            });
        }
        requests
    }

    pub fn on_notes(&mut self, folder: &str, files: Vec<RemoteFile>) {
        self.awaiting.remove(folder);
        for file in files {
            let is_folder = file.mime_type.as_deref() == Some(FOLDER_MIME_TYPE);
            if is_folder || !file.name.ends_with(NOTE_EXTENSION) {
                continue;
            }
            let note = RemoteNoteRef {
                title: title_from_file_name(&file.name).to_string(),
                content_hash: self.hashes.get(&file.id).cloned(),
                remote_id: file.id,
            };
            if !self.snapshot.insert_note(folder, note) {
                log::warn!(
                    "Sync: folder '{}' holds duplicate note files named '{}', using the first",
                    folder,
                    file.name
                );
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.subfolders_listed && self.awaiting.is_empty()
    }

    pub fn into_snapshot(self) -> RemoteSnapshot {
        self.snapshot
    }
}

/// Whether unchanged-looking notes are re-uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePolicy {
    /// Full sync: every existing note is overwritten.
    Always,
    /// Smart sync: only notes whose hash differs (or is unknown).
    IfChanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedNote {
    pub folder: String,
    pub title: String,
    pub body: String,
    pub existing_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedNote {
    pub folder: String,
    pub title: String,
    pub issue: ContentIssue,
}

/// Remote mutations needed to mirror a local structure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// In local order. Created one at a time.
    pub folders_to_create: Vec<String>,
    pub notes_to_create: Vec<PlannedNote>,
    pub notes_to_update: Vec<PlannedNote>,
    pub unchanged: usize,
    pub rejected: Vec<RejectedNote>,
}

impl Plan {
    pub fn mutation_count(&self) -> usize {
        self.folders_to_create.len() + self.notes_to_create.len() + self.notes_to_update.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutation_count() == 0
    }
}

/// Decide what to create and update. Pure.
pub fn plan(local: &FolderStructure, snapshot: &RemoteSnapshot, policy: UpdatePolicy) -> Plan {
    let mut plan = Plan::default();
    let mut planned_folders = HashSet::new();
    let mut seen_notes = HashSet::new();

    for folder in &local.folders {
        if snapshot.folder_id(&folder.name).is_none() && planned_folders.insert(folder.name.clone()) {
            plan.folders_to_create.push(folder.name.clone());
        }

        for note in &folder.notes {
            if !seen_notes.insert((folder.name.clone(), note.title.clone())) {
                log::warn!(
                    "Sync: duplicate local note '{}/{}' skipped",
                    folder.name,
                    note.title
                );
                continue;
            }
            if let Err(issue) = validate_upload(&note.title, &note.body) {
                plan.rejected.push(RejectedNote {
                    folder: folder.name.clone(),
                    title: note.title.clone(),
                    issue,
                });
                continue;
            }

            let planned = |existing_id: Option<String>| PlannedNote {
                folder: folder.name.clone(),
                title: note.title.clone(),
                body: note.body.clone(),
                existing_id,
            };

            match snapshot.note(&folder.name, &note.title) {
                None => plan.notes_to_create.push(planned(None)),
                Some(remote) => {
                    let unchanged = policy == UpdatePolicy::IfChanged
                        && remote.content_hash.as_deref() == Some(content_hash(&note.body).as_str());
                    if unchanged {
                        plan.unchanged += 1;
                    } else {
                        plan.notes_to_update.push(planned(Some(remote.remote_id.clone())));
                    }
                }
            }
        }
    }

    plan
}

/// Per-item outcomes surfaced to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileEvent {
    DiscoveryComplete {
        remote_folders: usize,
        remote_notes: usize,
        planned: usize,
    },
    FolderCreated {
        name: String,
        remote_id: String,
    },
    FolderFailed {
        name: String,
        error: DriveError,
    },
    NoteRejected {
        folder: String,
        title: String,
        issue: ContentIssue,
    },
    NoteUploaded {
        folder: String,
        title: String,
        remote_id: String,
        content_hash: String,
        created: bool,
    },
    NoteFailed {
        folder: String,
        title: String,
        error: DriveError,
    },
}

/// Follow-up requests and events produced by one completion.
#[derive(Debug, Default)]
pub struct Step {
    pub requests: Vec<DriveRequest>,
    pub events: Vec<ReconcileEvent>,
}

impl Step {
    fn requests(requests: Vec<DriveRequest>) -> Self {
        Self {
            requests,
            events: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub folders_created: usize,
    pub notes_created: usize,
    pub notes_updated: usize,
    pub notes_unchanged: usize,
    pub notes_rejected: usize,
    pub failures: usize,
}

impl ReconcileSummary {
    pub fn mutations(&self) -> usize {
        self.folders_created + self.notes_created + self.notes_updated
    }
}

/// Mutation phase over a finished discovery.
#[derive(Debug)]
pub struct Mutation {
    root_id: String,
    snapshot: RemoteSnapshot,
    plan: Plan,
    cursor: usize,
    uploads_started: bool,
    outstanding: usize,
    total_uploads: usize,
    summary: ReconcileSummary,
}

impl Mutation {
    pub fn new(root_id: &str, snapshot: RemoteSnapshot, plan: Plan) -> Self {
        let summary = ReconcileSummary {
            notes_unchanged: plan.unchanged,
            notes_rejected: plan.rejected.len(),
            ..ReconcileSummary::default()
        };
        Self {
            root_id: root_id.to_string(),
            snapshot,
            plan,
            cursor: 0,
            uploads_started: false,
            outstanding: 0,
            total_uploads: 0,
            summary,
        }
    }

    pub fn start(&mut self) -> Vec<DriveRequest> {
        self.advance()
    }

    /// Next folder creation, or every upload once all folders are done.
    fn advance(&mut self) -> Vec<DriveRequest> {
        if let Some(name) = self.plan.folders_to_create.get(self.cursor) {
            log::info!("Sync: creating remote folder '{}'", name);
            return vec![DriveRequest::CreateFolder {
                parent_id: self.root_id.clone(),
                name: name.clone(),
            }];
        }
        if self.uploads_started {
            return Vec::new();
        }
        self.start_uploads()
    }

    fn start_uploads(&mut self) -> Vec<DriveRequest> {
        self.uploads_started = true;
        let notes: Vec<PlannedNote> = self
            .plan
            .notes_to_create
            .iter()
            .chain(self.plan.notes_to_update.iter())
            .cloned()
            .collect();

        let mut requests = Vec::new();
        for note in notes {
            let Some(folder_id) = self.snapshot.folder_id(&note.folder) else {
                // Its folder could not be created
                self.summary.failures += 1;
                continue;
            };
            requests.push(DriveRequest::UploadMetadata {
                upload: NoteUpload {
                    folder_id: folder_id.to_string(),
                    folder: note.folder,
                    title: note.title,
                    content: note.body,
                    existing_id: note.existing_id,
                },
            });
        }
        self.outstanding = requests.len();
        self.total_uploads = requests.len();
        requests
    }

    pub fn on_folder_created(
        &mut self,
        name: &str,
        result: Result<&RemoteFile, &DriveError>,
    ) -> Result<Step, ReconcileError> {
        let expected = self.plan.folders_to_create.get(self.cursor);
        if expected.map(String::as_str) != Some(name) {
            return Err(ReconcileError::DuplicationRisk(format!(
                "folder '{}' completed while waiting for {:?}",
                name, expected
            )));
        }
        if self.snapshot.folder_id(name).is_some() {
            return Err(ReconcileError::DuplicationRisk(format!(
                "folder '{}' was created twice",
                name
            )));
        }

        let event = match result {
            Ok(folder) => {
                self.snapshot.insert_folder(name, &folder.id);
                self.summary.folders_created += 1;
                ReconcileEvent::FolderCreated {
                    name: name.to_string(),
                    remote_id: folder.id.clone(),
                }
            }
            Err(error) => {
                log::error!("Sync: could not create folder '{}': {}", name, error);
                self.summary.failures += 1;
                ReconcileEvent::FolderFailed {
                    name: name.to_string(),
                    error: error.clone(),
                }
            }
        };

        self.cursor += 1;
        Ok(Step {
            requests: self.advance(),
            events: vec![event],
        })
    }

    pub fn on_upload_started(&self, upload: NoteUpload, target: UploadTarget) -> DriveRequest {
        DriveRequest::UploadContent { upload, target }
    }

    pub fn on_upload_finished(
        &mut self,
        upload: &NoteUpload,
        result: Result<&str, &DriveError>,
    ) -> ReconcileEvent {
        self.outstanding = self.outstanding.saturating_sub(1);
        match result {
            Ok(remote_id) => {
                let hash = content_hash(&upload.content);
                self.snapshot
                    .record_upload(&upload.folder, &upload.title, remote_id, &hash);
                if upload.is_update() {
                    self.summary.notes_updated += 1;
                } else {
                    self.summary.notes_created += 1;
                }
                ReconcileEvent::NoteUploaded {
                    folder: upload.folder.clone(),
                    title: upload.title.clone(),
                    remote_id: remote_id.to_string(),
                    content_hash: hash,
                    created: !upload.is_update(),
                }
            }
            Err(error) => {
                self.summary.failures += 1;
                ReconcileEvent::NoteFailed {
                    folder: upload.folder.clone(),
                    title: upload.title.clone(),
                    error: error.clone(),
                }
            }
        }
    }

    pub fn is_done(&self) -> bool {
        self.uploads_started && self.outstanding == 0
    }

    /// `(finished, total)` uploads.
    pub fn progress(&self) -> (usize, usize) {
        (self.total_uploads - self.outstanding, self.total_uploads)
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn snapshot(&self) -> &RemoteSnapshot {
        &self.snapshot
    }

    pub fn summary(&self) -> &ReconcileSummary {
        &self.summary
    }
}

enum Stage {
    Discovering(Discovery),
    Mutating(Mutation),
}

/// Discovery followed by mutation, driven one completion at a time.
pub struct StructureReconciler {
    root_id: String,
    local: FolderStructure,
    policy: UpdatePolicy,
    stage: Stage,
}

impl StructureReconciler {
    pub fn new(
        root_id: &str,
        local: FolderStructure,
        policy: UpdatePolicy,
        hashes: BTreeMap<String, String>,
    ) -> Self {
        Self {
            root_id: root_id.to_string(),
            local,
            policy,
            stage: Stage::Discovering(Discovery::new(root_id, hashes)),
        }
    }

    pub fn start(&self) -> Vec<DriveRequest> {
        match &self.stage {
            Stage::Discovering(discovery) => vec![discovery.start()],
            Stage::Mutating(_) => Vec::new(),
        }
    }

    /// True once discovery has completed, i.e. the snapshot reflects the remote.
    pub fn structure_checked(&self) -> bool {
        matches!(self.stage, Stage::Mutating(_))
    }

    pub fn is_finished(&self) -> bool {
        match &self.stage {
            Stage::Discovering(_) => false,
            Stage::Mutating(mutation) => mutation.is_done(),
        }
    }

    pub fn mutation(&self) -> Option<&Mutation> {
        match &self.stage {
            Stage::Mutating(mutation) => Some(mutation),
            Stage::Discovering(_) => None,
        }
    }

    pub fn progress(&self) -> (usize, usize) {
        self.mutation().map(Mutation::progress).unwrap_or((0, 0))
    }

    /// Feed one completed request back in.
    pub fn handle(
        &mut self,
        request: DriveRequest,
        reply: Result<DriveReply, DriveError>,
    ) -> Result<Step, ReconcileError> {
        if let Stage::Discovering(discovery) = &mut self.stage {
            let requests = match (request, reply) {
                (DriveRequest::ListSubfolders { .. }, Ok(DriveReply::Files(files))) => {
                    discovery.on_subfolders(files)
                }
                (DriveRequest::ListNotesInFolder { folder, .. }, Ok(DriveReply::Files(files))) => {
                    discovery.on_notes(&folder, files);
                    Vec::new()
                }
                (
                    DriveRequest::ListSubfolders { .. } | DriveRequest::ListNotesInFolder { .. },
                    Ok(other),
                ) => return Err(ReconcileError::Discovery(unexpected(&other))),
                (
                    DriveRequest::ListSubfolders { .. } | DriveRequest::ListNotesInFolder { .. },
                    Err(error),
                ) => return Err(ReconcileError::Discovery(error)),
                (request, _) => return Err(out_of_stage(&request)),
            };
            return self.after_discovery_step(requests);
        }

        let Stage::Mutating(mutation) = &mut self.stage else {
            return Err(out_of_stage(&request));
        };
        match request {
            DriveRequest::CreateFolder { name, .. } => match reply {
                Ok(DriveReply::FolderCreated(folder)) => mutation.on_folder_created(&name, Ok(&folder)),
                Ok(other) => mutation.on_folder_created(&name, Err(&unexpected(&other))),
                Err(error) => mutation.on_folder_created(&name, Err(&error)),
            },
            DriveRequest::UploadMetadata { upload } => {
                let finished = match reply {
                    Ok(DriveReply::UploadStarted(target)) => {
                        return Ok(Step::requests(vec![mutation.on_upload_started(upload, target)]));
                    }
                    Ok(other) => mutation.on_upload_finished(&upload, Err(&unexpected(&other))),
                    Err(error) => mutation.on_upload_finished(&upload, Err(&error)),
                };
                Ok(Step {
                    requests: Vec::new(),
                    events: vec![finished],
                })
            }
            DriveRequest::UploadContent { upload, .. } => {
                let finished = match reply {
                    Ok(DriveReply::Uploaded { file_id }) => mutation.on_upload_finished(&upload, Ok(file_id.as_str())),
                    Ok(other) => mutation.on_upload_finished(&upload, Err(&unexpected(&other))),
                    Err(error) => mutation.on_upload_finished(&upload, Err(&error)),
                };
                Ok(Step {
                    requests: Vec::new(),
                    events: vec![finished],
                })
            }
            request => Err(out_of_stage(&request)),
        }
    }

    fn after_discovery_step(&mut self, requests: Vec<DriveRequest>) -> Result<Step, ReconcileError> {
        let complete = matches!(&self.stage, Stage::Discovering(d) if d.is_complete());
        if !complete {
            return Ok(Step::requests(requests));
        }

        let placeholder = Stage::Discovering(Discovery::new(&self.root_id, BTreeMap::new()));
        let Stage::Discovering(discovery) = std::mem::replace(&mut self.stage, placeholder) else {
            return Err(ReconcileError::DuplicationRisk(
                "discovery finished twice".to_string(),
            ));
        };
        let snapshot = discovery.into_snapshot();
        let plan = plan(&self.local, &snapshot, self.policy);

        let mut events = vec![ReconcileEvent::DiscoveryComplete {
            remote_folders: snapshot.folder_count(),
            remote_notes: snapshot.note_count(),
            planned: plan.mutation_count(),
        }];
        events.extend(plan.rejected.iter().map(|r| ReconcileEvent::NoteRejected {
            folder: r.folder.clone(),
            title: r.title.clone(),
            issue: r.issue,
        }));
        log::info!(
            "Sync: discovery found {} folder(s) and {} note(s); {} folder(s) to create, {} note(s) to create, {} to update, {} unchanged",
            snapshot.folder_count(),
            snapshot.note_count(),
            plan.folders_to_create.len(),
            plan.notes_to_create.len(),
            plan.notes_to_update.len(),
            plan.unchanged
        );

        let mut mutation = Mutation::new(&self.root_id, snapshot, plan);
        let requests = mutation.start();
        self.stage = Stage::Mutating(mutation);
        Ok(Step { requests, events })
    }
}

fn out_of_stage(request: &DriveRequest) -> ReconcileError {
    ReconcileError::DuplicationRisk(format!(
        "{} completion does not fit the current stage",
        request.kind()
    ))
}

fn unexpected(reply: &DriveReply) -> DriveError {
    DriveError::Malformed(format!("unexpected reply: {:?}", reply))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::drive::DriveClient;
    use crate::sync::testing::{test_endpoints, FakeDrive, INITIAL_ACCESS};
    use std::collections::VecDeque;
    use std::sync::Arc;

    fn folder(id: &str, name: &str) -> RemoteFile {
        RemoteFile {
            id: id.to_string(),
            name: name.to_string(),
            mime_type: None,
            modified_time: None,
            size: None,
        }
    }

    fn work_plan(body: &str) -> FolderStructure {
        FolderStructure::new().with_note("Work", "Plan", body)
    }

    /// Drive a reconciler to completion, executing each request in order.
    async fn run(
        drive: &Arc<FakeDrive>,
        root: &str,
        local: FolderStructure,
        policy: UpdatePolicy,
        hashes: BTreeMap<String, String>,
    ) -> (ReconcileSummary, RemoteSnapshot, Vec<ReconcileEvent>) {
        let client = DriveClient::new(drive.clone(), test_endpoints());
        let mut reconciler = StructureReconciler::new(root, local, policy, hashes);
        let mut queue: VecDeque<DriveRequest> = reconciler.start().into();
        let mut events = Vec::new();
        while let Some(request) = queue.pop_front() {
            let reply = client.execute(&request, Some(INITIAL_ACCESS)).await;
            let step = reconciler.handle(request, reply).unwrap();
            queue.extend(step.requests);
            events.extend(step.events);
        }
        assert!(reconciler.is_finished());
        let mutation = reconciler.mutation().unwrap();
        (mutation.summary().clone(), mutation.snapshot().clone(), events)
    }

    fn hashes_of(events: &[ReconcileEvent]) -> BTreeMap<String, String> {
        events
            .iter()
            .filter_map(|e| match e {
                ReconcileEvent::NoteUploaded {
                    remote_id,
                    content_hash,
                    ..
                } => Some((remote_id.clone(), content_hash.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(content_hash("Q1 goals"), content_hash("Q1 goals"));
        assert_ne!(content_hash("Q1 goals"), content_hash("Q1 goals v2"));
        assert_eq!(content_hash(""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn test_work_plan_scenario_against_empty_root() {
        let mut reconciler = StructureReconciler::new(
            "root-id",
            work_plan("Q1 goals"),
            UpdatePolicy::IfChanged,
            BTreeMap::new(),
        );
        assert_eq!(
            reconciler.start(),
            vec![DriveRequest::ListSubfolders {
                parent_id: "root-id".to_string()
            }]
        );

        let step = reconciler
            .handle(
                DriveRequest::ListSubfolders {
                    parent_id: "root-id".to_string(),
                },
                Ok(DriveReply::Files(Vec::new())),
            )
            .unwrap();
        assert_eq!(
            step.requests,
            vec![DriveRequest::CreateFolder {
                parent_id: "root-id".to_string(),
                name: "Work".to_string()
            }]
        );

        let step = reconciler
            .handle(
                step.requests[0].clone(),
                Ok(DriveReply::FolderCreated(folder("work-id", "Work"))),
            )
            .unwrap();
        assert_eq!(step.requests.len(), 1);
        let DriveRequest::UploadMetadata { upload } = &step.requests[0] else {
            panic!("expected an upload, got {:?}", step.requests[0]);
        };
        assert_eq!(upload.folder_id, "work-id");
        assert_eq!(upload.title, "Plan");
        assert_eq!(upload.existing_id, None);

        let content = reconciler
            .handle(
                step.requests[0].clone(),
                Ok(DriveReply::UploadStarted(UploadTarget::Session("s".to_string()))),
            )
            .unwrap();
        reconciler
            .handle(
                content.requests[0].clone(),
                Ok(DriveReply::Uploaded {
                    file_id: "plan-id".to_string(),
                }),
            )
            .unwrap();

        assert!(reconciler.is_finished());
        let snapshot = reconciler.mutation().unwrap().snapshot();
        assert_eq!(
            snapshot.folders().collect::<Vec<_>>(),
            vec![RemoteFolderRef {
                local_folder_name: "Work".to_string(),
                remote_id: "work-id".to_string()
            }]
        );
        assert_eq!(snapshot.note("Work", "Plan").unwrap().remote_id, "plan-id");
    }

    #[test]
    fn test_folders_are_created_one_at_a_time_in_order() {
        let local = FolderStructure::new()
            .with_folder("A")
            .with_folder("B")
            .with_folder("C");
        let mut reconciler =
            StructureReconciler::new("root", local, UpdatePolicy::IfChanged, BTreeMap::new());

        let mut step = reconciler
            .handle(
                DriveRequest::ListSubfolders {
                    parent_id: "root".to_string(),
                },
                Ok(DriveReply::Files(Vec::new())),
            )
            .unwrap();

        let mut order = Vec::new();
        while let Some(request) = step.requests.pop() {
            assert!(step.requests.is_empty(), "more than one request in flight");
            let DriveRequest::CreateFolder { name, .. } = &request else {
                panic!("unexpected request {:?}", request);
            };
            order.push(name.clone());
            let id = format!("{}-id", name);
            let created = folder(&id, name);
            step = reconciler
                .handle(request.clone(), Ok(DriveReply::FolderCreated(created)))
                .unwrap();
        }

        assert_eq!(order, vec!["A", "B", "C"]);
        assert!(reconciler.is_finished());
    }

    #[test]
    fn test_out_of_order_folder_completion_is_rejected() {
        let local = FolderStructure::new().with_folder("A").with_folder("B");
        let mut reconciler =
            StructureReconciler::new("root", local, UpdatePolicy::IfChanged, BTreeMap::new());
        reconciler
            .handle(
                DriveRequest::ListSubfolders {
                    parent_id: "root".to_string(),
                },
                Ok(DriveReply::Files(Vec::new())),
            )
            .unwrap();

        let err = reconciler
            .handle(
                DriveRequest::CreateFolder {
                    parent_id: "root".to_string(),
                    name: "B".to_string(),
                },
                Ok(DriveReply::FolderCreated(folder("b", "B"))),
            )
            .unwrap_err();
        assert!(matches!(err, ReconcileError::DuplicationRisk(_)));
    }

    #[test]
    fn test_changed_body_plans_one_update_to_existing_id() {
        let mut snapshot = RemoteSnapshot::default();
        snapshot.insert_folder("Work", "work-id");
        snapshot.record_upload("Work", "Plan", "plan-id", &content_hash("Q1 goals"));

        let plan = plan(&work_plan("Q1 goals v2"), &snapshot, UpdatePolicy::IfChanged);
        assert!(plan.folders_to_create.is_empty());
        assert!(plan.notes_to_create.is_empty());
        assert_eq!(plan.notes_to_update.len(), 1);
        assert_eq!(plan.notes_to_update[0].existing_id.as_deref(), Some("plan-id"));
    }

    #[test]
    fn test_unchanged_body_plans_nothing() {
        let mut snapshot = RemoteSnapshot::default();
        snapshot.insert_folder("Work", "work-id");
        snapshot.record_upload("Work", "Plan", "plan-id", &content_hash("Q1 goals"));

        let plan = plan(&work_plan("Q1 goals"), &snapshot, UpdatePolicy::IfChanged);
        assert!(plan.is_empty());
        assert_eq!(plan.unchanged, 1);

        let full = super::plan(&work_plan("Q1 goals"), &snapshot, UpdatePolicy::Always);
        assert_eq!(full.notes_to_update.len(), 1);
    }

    #[test]
    fn test_unknown_hash_forces_conservative_update() {
        let mut snapshot = RemoteSnapshot::default();
        snapshot.insert_folder("Work", "work-id");
        snapshot.insert_note(
            "Work",
            RemoteNoteRef {
                title: "Plan".to_string(),
                remote_id: "plan-id".to_string(),
                content_hash: None,
            },
        );
        let plan = plan(&work_plan("Q1 goals"), &snapshot, UpdatePolicy::IfChanged);
        assert_eq!(plan.notes_to_update.len(), 1);
    }

    #[test]
    fn test_duplicate_local_folders_create_one_remote_folder() {
        let local = FolderStructure {
            folders: vec![
                crate::storage::LocalFolder {
                    name: "Work".to_string(),
                    notes: Vec::new(),
                },
                crate::storage::LocalFolder {
                    name: "Work".to_string(),
                    notes: Vec::new(),
                },
            ],
        };
        let plan = plan(&local, &RemoteSnapshot::default(), UpdatePolicy::IfChanged);
        assert_eq!(plan.folders_to_create, vec!["Work".to_string()]);
    }

    #[test]
    fn test_invalid_notes_are_rejected_not_uploaded() {
        let local = FolderStructure::new()
            .with_note("Work", "Empty", "")
            .with_note("Work", "Blank", "   ")
            .with_note("Work", "Echo", "Echo");
        let plan = plan(&local, &RemoteSnapshot::default(), UpdatePolicy::Always);
        assert!(plan.notes_to_create.is_empty());
        let issues: Vec<_> = plan.rejected.iter().map(|r| r.issue).collect();
        assert_eq!(
            issues,
            vec![
                ContentIssue::Empty,
                ContentIssue::WhitespaceOnly,
                ContentIssue::TitleOnly
            ]
        );
    }

    #[test]
    fn test_discovery_ignores_non_note_files_and_joins_hashes() {
        let mut hashes = BTreeMap::new();
        hashes.insert("n1".to_string(), "abc".to_string());
        let mut discovery = Discovery::new("root", hashes);

        let listings = discovery.on_subfolders(vec![folder("f1", "Work"), folder("f2", "Work")]);
        assert_eq!(listings.len(), 1);
        assert!(!discovery.is_complete());

        discovery.on_notes(
            "Work",
            vec![
                folder("n1", "Plan.md"),
                folder("n2", "image.png"),
                RemoteFile {
                    mime_type: Some(FOLDER_MIME_TYPE.to_string()),
                    ..folder("n3", "Nested.md")
                },
            ],
        );
        assert!(discovery.is_complete());
        let snapshot = discovery.into_snapshot();
        assert_eq!(snapshot.folder_id("Work"), Some("f1"));
        assert_eq!(snapshot.note_count(), 1);
        assert_eq!(
            snapshot.note("Work", "Plan").unwrap().content_hash.as_deref(),
            Some("abc")
        );
    }

    #[test]
    fn test_discovery_failure_is_an_error() {
        let mut reconciler = StructureReconciler::new(
            "root",
            work_plan("Q1 goals"),
            UpdatePolicy::IfChanged,
            BTreeMap::new(),
        );
        let err = reconciler
            .handle(
                DriveRequest::ListSubfolders {
                    parent_id: "root".to_string(),
                },
                Err(DriveError::Transport("offline".to_string())),
            )
            .err()
            .unwrap();
        assert!(matches!(err, ReconcileError::Discovery(_)));
    }

    #[tokio::test]
    async fn test_second_run_makes_no_remote_changes() {
        let drive = Arc::new(FakeDrive::new());
        let root = drive.add_folder("Notes App", "root");
        let local = FolderStructure::new()
            .with_note("Work", "Plan", "Q1 goals")
            .with_note("Work", "Retro", "went well")
            .with_note("Home", "Groceries", "milk")
            .with_folder("Empty");

        let (first, _, events) =
            run(&drive, &root, local.clone(), UpdatePolicy::IfChanged, BTreeMap::new()).await;
        assert_eq!(first.folders_created, 3);
        assert_eq!(first.notes_created, 3);

        drive.clear_calls();
        let (second, snapshot, _) =
            run(&drive, &root, local, UpdatePolicy::IfChanged, hashes_of(&events)).await;
        assert_eq!(second.mutations(), 0);
        assert_eq!(second.notes_unchanged, 3);
        assert_eq!(drive.mutation_count(), 0);
        assert_eq!(snapshot.folder_count(), 3);
        assert_eq!(drive.children(&root).len(), 3);
    }

    #[tokio::test]
    async fn test_changed_body_updates_in_place_against_fake() {
        let drive = Arc::new(FakeDrive::new());
        let root = drive.add_folder("Notes App", "root");
        let (_, snapshot, events) = run(
            &drive,
            &root,
            work_plan("Q1 goals"),
            UpdatePolicy::IfChanged,
            BTreeMap::new(),
        )
        .await;
        let plan_id = snapshot.note("Work", "Plan").unwrap().remote_id.clone();

        drive.clear_calls();
        let (summary, _, _) = run(
            &drive,
            &root,
            work_plan("Q1 goals v2"),
            UpdatePolicy::IfChanged,
            hashes_of(&events),
        )
        .await;

        assert_eq!(summary.notes_updated, 1);
        assert_eq!(summary.notes_created, 0);
        assert_eq!(summary.folders_created, 0);
        assert_eq!(drive.file(&plan_id).unwrap().content, "Q1 goals v2");
        let work = drive.folder("Work", &root).unwrap();
        assert_eq!(drive.children(&work.id).len(), 1);
        assert!(drive
            .calls()
            .contains(&format!("PUT https://fake.test/upload/drive/v3/files/{}", plan_id)));
    }
}

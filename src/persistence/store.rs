//! Workflow Store
//!
//! Keeps one current document per workflow plus an append-only history:
//!
//! ```text
//! <root>/current/<id>.json   latest save, tagged form plus store fields
//! <root>/history/<id>.json   [{version, saved_at, state, agent_count, snapshot}, ...]
//! ```
//!
//! Documents are written to a temporary file and renamed into place. All
//! writes go through one async lock, so concurrent saves of the same id
//! never interleave their history appends.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::fs;
use tokio::sync::{Mutex, OnceCell};

use super::codec::{datetime_marker, decode, decode_workflow, encode_workflow};
use crate::config::StorageConfig;
use crate::error::PersistenceError;
use crate::workflow::{Status, Workflow};

type Result<T> = std::result::Result<T, PersistenceError>;

const CURRENT_DIR: &str = "current";
const HISTORY_DIR: &str = "history";

/// Fields the store adds to a current document.
const STORE_FIELDS: [&str; 5] = ["version", "saved_at", "state", "recovered_at", "recovered_from"];

/// State recorded for a recovery save.
pub const RECOVERED_STATE: &str = "recovered";

/// A loaded current document.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadedWorkflow {
    Typed(Box<Workflow>),
    /// A document without a `steps` field, returned verbatim.
    Opaque(Value),
}

impl LoadedWorkflow {
    pub fn into_workflow(self) -> Option<Workflow> {
        match self {
            Self::Typed(workflow) => Some(*workflow),
            Self::Opaque(_) => None,
        }
    }
}

/// One saved version of a workflow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub version: u64,
    pub saved_at: DateTime<Utc>,
    pub state: String,
    pub agent_count: usize,
    /// Tagged document as it was saved
    #[serde(default)]
    pub snapshot: Value,
}

/// Projection of a current document used by [`WorkflowStore::list`].
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct WorkflowListing {
    pub workflow_id: String,
    pub name: String,
    pub status: String,
    pub state: String,
    pub version: u64,
    pub saved_at: Option<DateTime<Utc>>,
    pub step_count: usize,
}

/// File-backed workflow persistence.
pub struct WorkflowStore {
    root: PathBuf,
    init: OnceCell<()>,
    write_lock: Mutex<()>,
}

impl WorkflowStore {
    /// Creates a store rooted at `root`. Directories are created on first use.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            init: OnceCell::new(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(config.root.clone())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn ensure_dirs(&self) -> Result<()> {
        self.init
            .get_or_try_init(|| async move {
                for dir in [CURRENT_DIR, HISTORY_DIR] {
                    let path = self.root.join(dir);
                    fs::create_dir_all(&path)
                        .await
                        .map_err(|e| PersistenceError::io(&path, e))?;
                }
                debug!("Initialized workflow store at {}", self.root.display());
                Ok::<(), PersistenceError>(())
            })
            .await?;
        Ok(())
    }

    fn current_path(&self, id: &str) -> PathBuf {
        self.root.join(CURRENT_DIR).join(format!("{}.json", id))
    }

    fn history_path(&self, id: &str) -> PathBuf {
        self.root.join(HISTORY_DIR).join(format!("{}.json", id))
    }

    /// Saves `workflow` as a new version. Returns the version number.
    pub async fn save(&self, workflow: &Workflow) -> Result<u64> {
        validate_id(&workflow.id)?;
        self.ensure_dirs().await?;
        let _guard = self.write_lock.lock().await;

        let snapshot = encode_workflow(workflow)?;
        let version = self
            .write_version(
                &workflow.id,
                snapshot,
                workflow.status.as_str(),
                workflow.agent_count(),
            )
            .await?;

        info!("Saved workflow '{}' version {}", workflow.id, version);
        Ok(version)
    }

    /// Writes `snapshot` as the current document and appends it to history.
    /// Caller holds the write lock.
    async fn write_version(
        &self,
        id: &str,
        snapshot: Value,
        state: &str,
        agent_count: usize,
    ) -> Result<u64> {
        let mut history = self.read_history(id).await;
        let version = history.len() as u64 + 1;
        let saved_at = Utc::now();

        let mut document = match snapshot.clone() {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };
        document.insert("version".to_string(), Value::from(version));
        document.insert("saved_at".to_string(), datetime_marker(&saved_at));
        document.insert("state".to_string(), Value::String(state.to_string()));

        write_json(&self.current_path(id), &Value::Object(document)).await?;

        history.push(HistoryEntry {
            version,
            saved_at,
            state: state.to_string(),
            agent_count,
            snapshot,
        });
        write_json(&self.history_path(id), &serde_json::to_value(&history)?).await?;

        Ok(version)
    }

    /// Loads the current document for `id`.
    pub async fn load(&self, id: &str) -> Result<Option<LoadedWorkflow>> {
        validate_id(id)?;
        let Some(document) = self.read_current(id).await? else {
            return Ok(None);
        };

        if document.get("steps").is_none() {
            debug!("Workflow '{}' has no steps field, returning it as is", id);
            return Ok(Some(LoadedWorkflow::Opaque(document)));
        }

        let workflow = decode_workflow(strip_store_fields(document)).map_err(|e| {
            PersistenceError::InvalidRecord {
                id: id.to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(Some(LoadedWorkflow::Typed(Box::new(workflow))))
    }

    /// Saved versions of `id`, oldest first. Empty when none are readable.
    pub async fn history(&self, id: &str) -> Result<Vec<HistoryEntry>> {
        validate_id(id)?;
        Ok(self.read_history(id).await)
    }

    /// Re-saves the current document of `id` as a recovery.
    ///
    /// With `version`, the document is rewound to that history entry first.
    /// The recovery is itself a new version, returned on success.
    pub async fn recover(&self, id: &str, version: Option<u64>) -> Result<u64> {
        validate_id(id)?;
        self.ensure_dirs().await?;
        let _guard = self.write_lock.lock().await;

        let current = self
            .read_current(id)
            .await?
            .ok_or_else(|| PersistenceError::NotFound(id.to_string()))?;
        let current_version = current.get("version").and_then(Value::as_u64);

        let mut document = match version {
            Some(wanted) => {
                let history = self.read_history(id).await;
                let entry = history
                    .into_iter()
                    .find(|entry| entry.version == wanted)
                    .ok_or_else(|| PersistenceError::VersionNotFound {
                        id: id.to_string(),
                        version: wanted,
                    })?;

                if entry.snapshot.is_object() {
                    entry.snapshot
                } else {
                    // Entry without a snapshot only rewinds the status
                    let mut document = current;
                    if let (Some(status), Some(fields)) =
                        (Status::parse(&entry.state), document.as_object_mut())
                    {
                        fields.insert(
                            "status".to_string(),
                            Value::String(status.as_str().to_string()),
                        );
                    }
                    document
                }
            }
            None => current,
        };

        document = strip_store_fields(document);
        let agent_count = agent_count_of(&document);
        if let Value::Object(fields) = &mut document {
            fields.insert("recovered_at".to_string(), datetime_marker(&Utc::now()));
            fields.insert(
                "recovered_from".to_string(),
                version.or(current_version).map(Value::from).unwrap_or(Value::Null),
            );
        }

        let saved = self
            .write_version(id, document, RECOVERED_STATE, agent_count)
            .await?;
        info!("Recovered workflow '{}' as version {}", id, saved);
        Ok(saved)
    }

    /// Removes the current document and history of `id`. Returns whether
    /// anything was removed.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        validate_id(id)?;
        let _guard = self.write_lock.lock().await;

        let mut removed = false;
        for path in [self.current_path(id), self.history_path(id)] {
            match fs::remove_file(&path).await {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(PersistenceError::io(&path, e)),
            }
        }

        if removed {
            info!("Deleted stored workflow '{}'", id);
        }
        Ok(removed)
    }

    /// All current documents, most recently saved first.
    pub async fn list(&self) -> Result<Vec<WorkflowListing>> {
        self.ensure_dirs().await?;
        let dir = self.root.join(CURRENT_DIR);
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| PersistenceError::io(&dir, e))?;

        let mut listings = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PersistenceError::io(&dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            match read_json(&path).await {
                Ok(Some(document)) => listings.push(listing(stem, decode(document))),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable workflow document: {}", e),
            }
        }

        listings.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
        Ok(listings)
    }

    async fn read_current(&self, id: &str) -> Result<Option<Value>> {
        read_json(&self.current_path(id)).await
    }

    async fn read_history(&self, id: &str) -> Vec<HistoryEntry> {
        let path = self.history_path(id);
        match read_json(&path).await {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(history) => history,
                Err(e) => {
                    warn!("Ignoring corrupt history for '{}': {}", id, e);
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Ignoring unreadable history for '{}': {}", id, e);
                Vec::new()
            }
        }
    }
}

/// Rejects ids that would escape the storage root.
fn validate_id(id: &str) -> Result<()> {
    let invalid = id.trim().is_empty()
        || id.contains('/')
        || id.contains('\\')
        || id.contains("..")
        || id.contains('\0');
    if invalid {
        Err(PersistenceError::InvalidId(id.to_string()))
    } else {
        Ok(())
    }
}

fn strip_store_fields(mut document: Value) -> Value {
    if let Value::Object(fields) = &mut document {
        for key in STORE_FIELDS {
            fields.remove(key);
        }
    }
    document
}

fn agent_count_of(document: &Value) -> usize {
    let plain = decode(document.clone());
    plain["steps"]
        .as_array()
        .map(|steps| {
            steps
                .iter()
                .filter_map(|step| step["assigned_agent"].as_str())
                .collect::<HashSet<_>>()
                .len()
        })
        .unwrap_or(0)
}

fn listing(stem: &str, plain: Value) -> WorkflowListing {
    let text = |key: &str| plain[key].as_str().unwrap_or_default().to_string();
    WorkflowListing {
        workflow_id: plain["id"].as_str().unwrap_or(stem).to_string(),
        name: text("name"),
        status: text("status"),
        state: text("state"),
        version: plain["version"].as_u64().unwrap_or(0),
        saved_at: plain["saved_at"]
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
        step_count: plain["steps"].as_array().map(Vec::len).unwrap_or(0),
    }
}

async fn read_json(path: &Path) -> Result<Option<Value>> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(PersistenceError::io(path, e)),
    };
    Ok(Some(serde_json::from_str(&content)?))
}

async fn write_json(path: &Path, value: &Value) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(value)?;

    fs::write(&tmp, json)
        .await
        .map_err(|e| PersistenceError::io(&tmp, e))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| PersistenceError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Step;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn workflow(name: &str) -> Workflow {
        let mut workflow = Workflow::from_steps(
            name,
            vec![Step::new("a", "search"), Step::new("b", "write")],
        );
        workflow.steps[0].assigned_agent = Some("agent-1".to_string());
        workflow.steps[1].assigned_agent = Some("agent-1".to_string());
        workflow
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = WorkflowStore::new(dir.path());
        let workflow = workflow("stored");

        assert_eq!(store.save(&workflow).await.unwrap(), 1);

        let loaded = store.load(&workflow.id).await.unwrap().unwrap();
        assert_eq!(loaded.into_workflow().unwrap(), workflow);
        assert!(dir.path().join("current").join(format!("{}.json", workflow.id)).exists());
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let store = WorkflowStore::new(dir.path());
        assert!(store.load("nope").await.unwrap().is_none());
        assert!(store.history("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_two_saves_append_two_entries() {
        let dir = TempDir::new().unwrap();
        let store = WorkflowStore::new(dir.path());
        let mut workflow = workflow("twice");

        store.save(&workflow).await.unwrap();
        workflow.status = Status::Completed;
        store.save(&workflow).await.unwrap();

        let history = store.history(&workflow.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].version, 1);
        assert_eq!(history[0].state, "created");
        assert_eq!(history[1].state, "completed");
        assert_eq!(history[1].agent_count, 1);

        let loaded = store.load(&workflow.id).await.unwrap().unwrap();
        assert_eq!(loaded.into_workflow().unwrap(), workflow);
    }

    #[tokio::test]
    async fn test_corrupt_history_does_not_block_save() {
        let dir = TempDir::new().unwrap();
        let store = WorkflowStore::new(dir.path());
        let workflow = workflow("corrupt");

        store.save(&workflow).await.unwrap();
        std::fs::write(store.history_path(&workflow.id), "{not json").unwrap();

        assert_eq!(store.save(&workflow).await.unwrap(), 1);
        assert_eq!(store.history(&workflow.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_recover_appends_history() {
        let dir = TempDir::new().unwrap();
        let store = WorkflowStore::new(dir.path());
        let mut workflow = workflow("recover");

        store.save(&workflow).await.unwrap();
        workflow.status = Status::Failed;
        store.save(&workflow).await.unwrap();

        assert_eq!(store.recover(&workflow.id, None).await.unwrap(), 3);

        let history = store.history(&workflow.id).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].state, RECOVERED_STATE);

        let raw = read_json(&store.current_path(&workflow.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(raw["state"], RECOVERED_STATE);
        assert_eq!(raw["recovered_from"], 2);
        assert_eq!(raw["recovered_at"]["__type__"], "datetime");
    }

    #[tokio::test]
    async fn test_recover_to_version_rewinds() {
        let dir = TempDir::new().unwrap();
        let store = WorkflowStore::new(dir.path());
        let mut workflow = workflow("rewind");

        store.save(&workflow).await.unwrap();
        workflow.status = Status::Failed;
        store.save(&workflow).await.unwrap();

        store.recover(&workflow.id, Some(1)).await.unwrap();

        let loaded = store.load(&workflow.id).await.unwrap().unwrap();
        assert_eq!(loaded.into_workflow().unwrap().status, Status::Created);
    }

    #[tokio::test]
    async fn test_recover_unknown_version() {
        let dir = TempDir::new().unwrap();
        let store = WorkflowStore::new(dir.path());
        let workflow = workflow("unknown");
        store.save(&workflow).await.unwrap();

        let err = store.recover(&workflow.id, Some(9)).await.unwrap_err();
        assert!(matches!(err, PersistenceError::VersionNotFound { version: 9, .. }));

        let err = store.recover("missing", None).await.unwrap_err();
        assert!(matches!(err, PersistenceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_opaque_document_passes_through() {
        let dir = TempDir::new().unwrap();
        let store = WorkflowStore::new(dir.path());
        store.ensure_dirs().await.unwrap();

        let legacy = json!({ "id": "legacy", "state": "done", "notes": [1, 2] });
        std::fs::write(store.current_path("legacy"), legacy.to_string()).unwrap();

        match store.load("legacy").await.unwrap() {
            Some(LoadedWorkflow::Opaque(value)) => assert_eq!(value, legacy),
            other => panic!("expected opaque document, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = WorkflowStore::new(dir.path());
        let workflow = workflow("delete");
        store.save(&workflow).await.unwrap();

        assert!(store.delete(&workflow.id).await.unwrap());
        assert!(!store.delete(&workflow.id).await.unwrap());
        assert!(store.load(&workflow.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_newest_first() {
        let dir = TempDir::new().unwrap();
        let store = WorkflowStore::new(dir.path());
        let first = workflow("first");
        let second = workflow("second");

        store.save(&first).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        store.save(&second).await.unwrap();
        std::fs::write(store.current_path("broken"), "garbage").unwrap();

        let listings = store.list().await.unwrap();
        assert_eq!(listings.len(), 2);
        assert_eq!(listings[0].name, "second");
        assert_eq!(listings[0].state, "created");
        assert_eq!(listings[0].version, 1);
        assert_eq!(listings[0].step_count, 2);
        assert_eq!(listings[1].workflow_id, first.id);
    }

    #[tokio::test]
    async fn test_invalid_ids_rejected() {
        let dir = TempDir::new().unwrap();
        let store = WorkflowStore::new(dir.path());

        for id in ["", "../escape", "a/b", "a\\b"] {
            assert!(matches!(
                store.load(id).await,
                Err(PersistenceError::InvalidId(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_concurrent_saves_keep_every_version() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(WorkflowStore::new(dir.path()));
        let workflow = workflow("concurrent");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let workflow = workflow.clone();
            handles.push(tokio::spawn(async move { store.save(&workflow).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let versions: Vec<u64> = store
            .history(&workflow.id)
            .await
            .unwrap()
            .iter()
            .map(|e| e.version)
            .collect();
        assert_eq!(versions, (1..=8).collect::<Vec<_>>());
    }
}

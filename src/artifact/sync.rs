use std::collections::HashMap;
use std::fs::FileTimes;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::artifact::checksum::{file_checksum, is_content_id};
use crate::artifact::store::BlobStore;
use crate::error::ArtifactError;
use crate::job::{JobRecord, JobStatus, CMD_GET};

/// A staged file as referenced from a job record: the blob id plus the name
/// the receiver should give it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPair {
    pub content_id: String,
    pub base_name: String,
}

impl PathPair {
    /// Wire form used for a single file: `"<content_id>,<base_name>"`.
    pub fn to_arg(&self) -> Value {
        Value::String(self.to_string())
    }

    /// Wire form used in `copy_pair` lists: `[content_id, base_name]`.
    pub fn to_tuple(&self) -> Value {
        Value::Array(vec![
            Value::String(self.content_id.clone()),
            Value::String(self.base_name.clone()),
        ])
    }
}

impl std::fmt::Display for PathPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.content_id, self.base_name)
    }
}

/// What reconciling a `sys.get` result did.
#[derive(Debug)]
pub enum SyncOutcome {
    /// The destination already held the expected content; nothing was touched.
    AlreadyPresent(PathBuf),
    /// The blob was copied from the cache to the destination.
    Placed(PathBuf),
    Failed(ArtifactError),
}

impl SyncOutcome {
    pub fn path(&self) -> Option<&Path> {
        match self {
            SyncOutcome::AlreadyPresent(p) | SyncOutcome::Placed(p) => Some(p),
            SyncOutcome::Failed(_) => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.path().is_some()
    }
}

/// Moves files between the dispatcher host and the blob store, through a
/// local content-addressed cache.
pub struct ArtifactSync {
    store: Arc<dyn BlobStore>,
    cache_dir: PathBuf,
    /// One lock per content id being fetched into the cache.
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for ArtifactSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactSync")
            .field("cache_dir", &self.cache_dir)
            .finish_non_exhaustive()
    }
}

impl ArtifactSync {
    pub fn new(store: Arc<dyn BlobStore>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            cache_dir: cache_dir.into(),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache_path(&self, content_id: &str) -> PathBuf {
        self.cache_dir.join(content_id)
    }

    /// Upload a local file and return the pair to embed in the job record.
    pub async fn stage_file(&self, path: &Path) -> Result<PathPair, ArtifactError> {
        let is_file = tokio::fs::metadata(path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !is_file {
            return Err(ArtifactError::LocalNotFound(path.to_path_buf()));
        }
        let base_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ArtifactError::LocalNotFound(path.to_path_buf()))?;

        let content_id = self.store.upload(path).await?;
        tracing::debug!(content_id = %content_id, path = %path.display(), "Staged file");
        Ok(PathPair {
            content_id,
            base_name,
        })
    }

    /// Upload every regular file in `dir` with the given extension, in name
    /// order.
    pub async fn stage_module_dir(
        &self,
        dir: &Path,
        extension: &str,
    ) -> Result<Vec<PathPair>, ArtifactError> {
        let mut modules = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) == Some(extension) {
                modules.push(path);
            }
        }
        modules.sort();

        let mut pairs = Vec::with_capacity(modules.len());
        for path in modules {
            pairs.push(self.stage_file(&path).await?);
        }
        tracing::info!(dir = %dir.display(), count = pairs.len(), "Staged module directory");
        Ok(pairs)
    }

    /// True if `record` is a finished `sys.get` whose file still has to be
    /// brought onto this host.
    pub fn needs_reconcile(record: &JobRecord) -> bool {
        record.cmd == CMD_GET
            && record.status == JobStatus::Finish
            && !record.is_help()
            && matches!(record.return_value(), Some(Value::String(s)) if !s.is_empty())
    }

    /// Bring the file named by a finished `sys.get` record onto this host and
    /// rewrite its return value to the local path, or to `""` on failure.
    ///
    /// Returns `None` when the record is not a file retrieval.
    pub async fn reconcile(&self, record: &mut JobRecord) -> Option<SyncOutcome> {
        if !Self::needs_reconcile(record) {
            return None;
        }
        let content_id = record.return_value()?.as_str()?.to_string();

        let outcome = self.place(record, &content_id).await;
        let ret = match &outcome {
            SyncOutcome::AlreadyPresent(path) | SyncOutcome::Placed(path) => {
                path.display().to_string()
            }
            SyncOutcome::Failed(e) => {
                tracing::warn!(jid = %record.jid, content_id = %content_id, error = %e, "File retrieval failed");
                String::new()
            }
        };
        record.ret = Some(Value::String(ret));
        Some(outcome)
    }

    async fn place(&self, record: &JobRecord, content_id: &str) -> SyncOutcome {
        if !is_content_id(content_id) {
            return SyncOutcome::Failed(ArtifactError::InvalidContentId(content_id.to_string()));
        }
        let dest = match resolve_destination(record).await {
            Ok(dest) => dest,
            Err(e) => return SyncOutcome::Failed(e),
        };

        match file_checksum(&dest).await {
            Ok(Some(sum)) if sum == content_id => {
                tracing::debug!(path = %dest.display(), "Destination already up to date");
                return SyncOutcome::AlreadyPresent(dest);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(path = %dest.display(), error = %e, "Could not checksum destination");
            }
        }

        if let Err(e) = self.ensure_cached(content_id).await {
            return SyncOutcome::Failed(e);
        }

        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                tracing::error!(path = %parent.display(), error = %e, "Failed to create destination directory");
            }
        }

        let preserve = record.kwargs.get("stat").map(is_truthy).unwrap_or(false);
        match copy_blob(&self.cache_path(content_id), &dest, preserve).await {
            Ok(()) => {
                tracing::info!(content_id, path = %dest.display(), "File placed");
                SyncOutcome::Placed(dest)
            }
            Err(source) => SyncOutcome::Failed(ArtifactError::Copy { path: dest, source }),
        }
    }

    /// Make sure a verified copy of `content_id` is in the cache, downloading
    /// it at most once at a time.
    async fn ensure_cached(&self, content_id: &str) -> Result<(), ArtifactError> {
        let slot = {
            let mut inflight = self.inflight.lock().await;
            inflight.entry(content_id.to_string()).or_default().clone()
        };

        let result = {
            let _guard = slot.lock().await;
            self.fetch_into_cache(content_id).await
        };

        drop(slot);
        let mut inflight = self.inflight.lock().await;
        if inflight
            .get(content_id)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            inflight.remove(content_id);
        }
        result
    }

    async fn fetch_into_cache(&self, content_id: &str) -> Result<(), ArtifactError> {
        if self.cache_has(content_id).await {
            tracing::debug!(content_id, "Cache hit");
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let partial = self.cache_dir.join(format!(".{}.part", content_id));
        tracing::info!(content_id, "Downloading blob into cache");
        if let Err(e) = self.store.download(content_id, &partial).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e.into());
        }
        tokio::fs::rename(&partial, self.cache_path(content_id)).await?;

        if self.cache_has(content_id).await {
            Ok(())
        } else {
            Err(ArtifactError::CacheMiss(content_id.to_string()))
        }
    }

    /// A cache entry counts only if its content matches its name; a corrupt
    /// entry is removed.
    async fn cache_has(&self, content_id: &str) -> bool {
        let path = self.cache_path(content_id);
        match file_checksum(&path).await {
            Ok(Some(sum)) if sum == content_id => true,
            Ok(None) => false,
            Ok(Some(_)) => {
                tracing::warn!(content_id, "Corrupt cache entry removed");
                let _ = tokio::fs::remove_file(&path).await;
                false
            }
            Err(e) => {
                tracing::warn!(content_id, error = %e, "Cache entry unreadable");
                false
            }
        }
    }
}

/// Local destination of a `sys.get`: explicit `local_path`/`remote_path`
/// kwargs, else `args[1]`/`args[0]`. A directory destination receives the
/// remote file's base name.
async fn resolve_destination(record: &JobRecord) -> Result<PathBuf, ArtifactError> {
    let (local, remote) = match (record.kwarg_str("local_path"), record.kwarg_str("remote_path")) {
        (Some(local), Some(remote)) => (local, remote),
        _ => (
            record
                .arg_str(1)
                .ok_or(ArtifactError::MissingPath("local_path"))?,
            record
                .arg_str(0)
                .ok_or(ArtifactError::MissingPath("remote_path"))?,
        ),
    };

    let mut dest = PathBuf::from(local);
    let is_dir = tokio::fs::metadata(&dest)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if local.ends_with('/') || is_dir {
        if let Some(name) = Path::new(remote).file_name() {
            dest.push(name);
        }
    }
    Ok(dest)
}

/// Copy `src` to `dest`. Permission bits follow the source; timestamps are
/// carried over when `preserve` is set.
async fn copy_blob(src: &Path, dest: &Path, preserve: bool) -> std::io::Result<()> {
    tokio::fs::copy(src, dest).await?;
    if !preserve {
        return Ok(());
    }

    let meta = tokio::fs::metadata(src).await?;
    let times = FileTimes::new()
        .set_accessed(meta.accessed()?)
        .set_modified(meta.modified()?);
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || std::fs::File::open(&dest)?.set_times(times))
        .await
        .map_err(std::io::Error::other)?
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty() && s != "0" && !s.eq_ignore_ascii_case("false"),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

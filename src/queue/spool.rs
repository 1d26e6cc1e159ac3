//! File-backed job queue.
//!
//! Layout: `<root>/<node>/<jid>.json`, one envelope per file. A node agent
//! watches its own subdirectory and rewrites the file as the job progresses.
//! Every subdirectory of the root is a registered node, which lets the spool
//! act as the [`NodeDirectory`] as well.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::directory::{match_nodes, NodeDirectory};
use crate::error::{DirectoryError, QueueError};
use crate::job::Envelope;
use crate::queue::{JobQueue, QueueEntry};

#[derive(Debug, Clone)]
pub struct SpoolQueue {
    root: PathBuf,
}

impl SpoolQueue {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the subdirectory that marks `node` as part of the fleet.
    pub async fn register_node(&self, node: &str) -> Result<(), QueueError> {
        check_component(node)?;
        tokio::fs::create_dir_all(self.root.join(node)).await?;
        Ok(())
    }

    pub fn entry_path(&self, node: &str, jid: &str) -> Result<PathBuf, QueueError> {
        check_component(node)?;
        check_component(jid)?;
        Ok(self.root.join(node).join(format!("{}.json", jid)))
    }

    async fn discard(staged: &[(PathBuf, PathBuf)]) {
        for (partial, _) in staged {
            let _ = tokio::fs::remove_file(partial).await;
        }
    }
}

/// Node names and jids become path components; refuse anything that could
/// escape the spool root.
fn check_component(name: &str) -> Result<(), QueueError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(QueueError::Rejected(format!(
            "invalid spool path component {:?}",
            name
        )))
    }
}

#[async_trait]
impl JobQueue for SpoolQueue {
    /// Every entry is written to a hidden temp file first; nothing is renamed
    /// into place until all writes succeeded.
    async fn put_many(&self, entries: Vec<QueueEntry>) -> Result<(), QueueError> {
        let mut staged: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(entries.len());

        for entry in &entries {
            let target = match self.entry_path(&entry.node, &entry.jid) {
                Ok(target) => target,
                Err(e) => {
                    Self::discard(&staged).await;
                    return Err(e);
                }
            };
            let partial = self
                .root
                .join(&entry.node)
                .join(format!(".{}.json.part", entry.jid));

            let write = async {
                tokio::fs::create_dir_all(self.root.join(&entry.node)).await?;
                let body = serde_json::to_vec(&entry.envelope).map_err(|source| {
                    QueueError::Malformed {
                        node: entry.node.clone(),
                        jid: entry.jid.clone(),
                        source,
                    }
                })?;
                tokio::fs::write(&partial, body).await?;
                Ok::<(), QueueError>(())
            };
            if let Err(e) = write.await {
                let _ = tokio::fs::remove_file(&partial).await;
                Self::discard(&staged).await;
                return Err(e);
            }
            staged.push((partial, target));
        }

        for (i, (partial, target)) in staged.iter().enumerate() {
            if let Err(e) = tokio::fs::rename(partial, target).await {
                tracing::error!(
                    path = %target.display(),
                    error = %e,
                    committed = i,
                    "Spool commit interrupted"
                );
                Self::discard(&staged[i..]).await;
                return Err(e.into());
            }
        }

        tracing::debug!(count = staged.len(), "Spooled job entries");
        Ok(())
    }

    async fn get(&self, node: &str, jid: &str) -> Result<Option<Envelope>, QueueError> {
        let path = self.entry_path(node, jid)?;
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|source| QueueError::Malformed {
                node: node.to_string(),
                jid: jid.to_string(),
                source,
            })
    }

    /// An unreadable entry, such as one an agent is halfway through
    /// rewriting, maps to `None` for its node instead of failing the batch.
    async fn get_many(
        &self,
        keys: &[(String, String)],
    ) -> Result<HashMap<String, Option<Envelope>>, QueueError> {
        let mut found = HashMap::with_capacity(keys.len());
        for (node, jid) in keys {
            let envelope = match self.get(node, jid).await {
                Ok(envelope) => envelope,
                Err(e @ (QueueError::Malformed { .. } | QueueError::Rejected(_))) => {
                    tracing::warn!(node = %node, jid = %jid, error = %e, "Skipping unreadable spool entry");
                    None
                }
                Err(e) => return Err(e),
            };
            found.insert(node.clone(), envelope);
        }
        Ok(found)
    }

    async fn delete(&self, node: &str, jid: &str) -> Result<bool, QueueError> {
        let path = self.entry_path(node, jid)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl NodeDirectory for SpoolQueue {
    async fn resolve(
        &self,
        pattern: &str,
        exclude: Option<&str>,
    ) -> Result<Vec<String>, DirectoryError> {
        let mut nodes = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') {
                nodes.push(name);
            }
        }
        match_nodes(nodes, pattern, exclude)
    }
}

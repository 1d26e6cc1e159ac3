use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::QueueError;
use crate::job::Envelope;
use crate::queue::{JobQueue, QueueEntry};

const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// In-process job queue.
#[derive(Debug)]
pub struct MemoryQueue {
    entries: RwLock<HashMap<(String, String), Envelope>>,
    max_entries: usize,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries,
        }
    }

    /// Store an envelope directly, the way a node agent reports progress.
    pub async fn insert(&self, node: &str, jid: &str, envelope: Envelope) {
        self.entries
            .write()
            .await
            .insert((node.to_string(), jid.to_string()), envelope);
    }

    /// Mutate a stored envelope in place. Returns false if there is no entry.
    pub async fn update_with<F>(&self, node: &str, jid: &str, f: F) -> bool
    where
        F: FnOnce(&mut Envelope),
    {
        let mut entries = self.entries.write().await;
        match entries.get_mut(&(node.to_string(), jid.to_string())) {
            Some(envelope) => {
                f(envelope);
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn put_many(&self, entries: Vec<QueueEntry>) -> Result<(), QueueError> {
        let mut stored = self.entries.write().await;
        let new_keys = entries
            .iter()
            .filter(|e| !stored.contains_key(&(e.node.clone(), e.jid.clone())))
            .count();
        if stored.len() + new_keys > self.max_entries {
            return Err(QueueError::Rejected(format!(
                "queue at capacity ({} entries)",
                self.max_entries
            )));
        }
        for entry in entries {
            stored.insert((entry.node, entry.jid), entry.envelope);
        }
        Ok(())
    }

    async fn get(&self, node: &str, jid: &str) -> Result<Option<Envelope>, QueueError> {
        Ok(self
            .entries
            .read()
            .await
            .get(&(node.to_string(), jid.to_string()))
            .cloned())
    }

    async fn get_many(
        &self,
        keys: &[(String, String)],
    ) -> Result<HashMap<String, Option<Envelope>>, QueueError> {
        let stored = self.entries.read().await;
        Ok(keys
            .iter()
            .map(|key| (key.0.clone(), stored.get(key).cloned()))
            .collect())
    }

    async fn delete(&self, node: &str, jid: &str) -> Result<bool, QueueError> {
        Ok(self
            .entries
            .write()
            .await
            .remove(&(node.to_string(), jid.to_string()))
            .is_some())
    }
}

//! Job queue collaborators.
//!
//! The dispatcher only needs four operations against the shared queue,
//! all keyed by `(node, jid)`:
//!
//! - [`JobQueue::put_many`]: write one envelope per node, all or nothing
//! - [`JobQueue::get_many`]: batched read used by the result poller
//! - [`JobQueue::get`]: single read
//! - [`JobQueue::delete`]: drop an entry once the caller is done with it
//!
//! Two backends are provided: [`MemoryQueue`] for in-process use and tests,
//! and [`SpoolQueue`] over a directory shared with the node agents.

pub mod memory;
pub mod spool;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::QueueError;
use crate::job::Envelope;

pub use memory::MemoryQueue;
pub use spool::SpoolQueue;

/// One envelope addressed to one node.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub node: String,
    pub jid: String,
    pub envelope: Envelope,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Write every entry, or none of them.
    async fn put_many(&self, entries: Vec<QueueEntry>) -> Result<(), QueueError>;

    async fn get(&self, node: &str, jid: &str) -> Result<Option<Envelope>, QueueError>;

    /// Read several entries at once. The result has one key per requested
    /// node; a missing entry maps to `None`.
    async fn get_many(
        &self,
        keys: &[(String, String)],
    ) -> Result<HashMap<String, Option<Envelope>>, QueueError> {
        let mut found = HashMap::with_capacity(keys.len());
        for (node, jid) in keys {
            found.insert(node.clone(), self.get(node, jid).await?);
        }
        Ok(found)
    }

    /// Remove an entry. Returns false if there was nothing to remove.
    async fn delete(&self, node: &str, jid: &str) -> Result<bool, QueueError>;
}

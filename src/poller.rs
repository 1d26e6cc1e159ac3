//! Deadline-bounded collection of per-node results.
//!
//! The poller asks a [`ResultSource`] for every `(node, jid)` pair once per
//! iteration and stops as soon as every node has reported a return value.
//! Iterations are spaced by a fixed interval; neither the sleep nor an
//! in-flight fetch is allowed to run past the [`Deadline`].

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use crate::dispatcher::FetchedJob;

/// Point in time after which polling gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    expires_at: Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            expires_at: Instant::now() + timeout,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Time left, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// Anything that can answer a batched `(node, jid)` lookup with opened
/// records. Failures are absorbed by the source and show up as missing nodes.
#[async_trait]
pub trait ResultSource: Send + Sync {
    async fn fetch(&self, pairs: &[(String, String)]) -> HashMap<String, Option<FetchedJob>>;
}

/// Results gathered before completion or expiry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollOutcome {
    /// Return value per node that has reported one.
    pub results: BTreeMap<String, Value>,
    pub timed_out: bool,
    pub iterations: u32,
}

impl PollOutcome {
    pub fn is_complete(&self) -> bool {
        !self.timed_out
    }
}

pub struct ResultPoller<'a, S: ?Sized> {
    source: &'a S,
    interval: Duration,
}

impl<'a, S> ResultPoller<'a, S>
where
    S: ResultSource + ?Sized,
{
    pub fn new(source: &'a S, interval: Duration) -> Self {
        Self { source, interval }
    }

    /// Poll until every node in `nodes` has a return value for `jid`, or the
    /// deadline passes.
    ///
    /// A node counts as done only when its record carries a non-null
    /// `return`; status alone is not trusted. Values of done nodes are
    /// refreshed from every fetch, and a value already collected is kept if a
    /// later fetch misses the node.
    pub async fn await_all(&self, nodes: &[String], jid: &str, deadline: Deadline) -> PollOutcome {
        let pairs: Vec<(String, String)> = nodes
            .iter()
            .map(|node| (node.clone(), jid.to_string()))
            .collect();
        let mut outcome = PollOutcome::default();
        let mut pending = nodes.len();

        loop {
            if deadline.is_expired() {
                break;
            }
            let fetched =
                match tokio::time::timeout(deadline.remaining(), self.source.fetch(&pairs)).await {
                    Ok(fetched) => fetched,
                    Err(_) => break,
                };
            outcome.iterations += 1;

            pending = 0;
            for node in nodes {
                let value = fetched
                    .get(node)
                    .and_then(Option::as_ref)
                    .and_then(|job| job.record.return_value());
                match value {
                    Some(value) => {
                        outcome.results.insert(node.clone(), value.clone());
                    }
                    None => pending += 1,
                }
            }

            if pending == 0 {
                tracing::debug!(jid, nodes = nodes.len(), iterations = outcome.iterations, "All results collected");
                return outcome;
            }

            let pause = self.interval.min(deadline.remaining());
            if pause.is_zero() {
                break;
            }
            tokio::time::sleep(pause).await;
        }

        outcome.timed_out = true;
        tracing::warn!(
            jid,
            pending,
            collected = outcome.results.len(),
            "Timed out waiting for job results"
        );
        outcome
    }
}

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::artifact::{ArtifactSync, BlobStore, SyncOutcome};
use crate::config::DispatchConfig;
use crate::crypt::Cipher;
use crate::directory::NodeDirectory;
use crate::error::{ArtifactError, DispatchError, Result};
use crate::job::{
    EnvMode, Envelope, JidGenerator, JobRecord, JobTemplate, CMD_COPY, CMD_RSYNC_MODULE,
    HELP_MARKER,
};
use crate::poller::{Deadline, ResultPoller, ResultSource};
use crate::queue::{JobQueue, QueueEntry};

/// What the caller asks `submit` to do.
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    pub cmd: String,
    pub node_pattern: String,
    pub node_exclude: Option<String>,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    /// Zero means fire and forget.
    pub wait_timeout: Duration,
    pub nthread: Option<u32>,
}

impl SubmitRequest {
    pub fn new(cmd: impl Into<String>, node_pattern: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            node_pattern: node_pattern.into(),
            ..Default::default()
        }
    }

    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.node_exclude = Some(pattern.into());
        self
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn wait(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn nthread(mut self, nthread: u32) -> Self {
        self.nthread = Some(nthread);
        self
    }
}

/// How a submit ended, in more detail than `retcode`.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// The pattern selected no node; nothing was sent.
    NoMatch,
    /// Every node's entry was accepted by the queue.
    Queued { nodes: Vec<String> },
    /// Entries were queued and results polled for.
    Collected { nodes: Vec<String>, timed_out: bool },
    Failed(DispatchError),
}

/// Result of [`Dispatcher::submit`].
///
/// `retcode` is 1 on success and 0 on failure. `extra_data` holds
/// `{"jid": ..}` after a fire-and-forget submit, the node to return value
/// map after a waiting submit, and nothing otherwise.
#[derive(Debug, Serialize)]
pub struct SubmitReport {
    pub retcode: u8,
    pub extra_data: Map<String, Value>,
    pub message: String,
    #[serde(skip)]
    pub jid: String,
    #[serde(skip)]
    pub outcome: SubmitOutcome,
}

impl SubmitReport {
    pub fn is_success(&self) -> bool {
        self.retcode == 1
    }

    fn failed(jid: String, message: &str, error: DispatchError) -> Self {
        Self {
            retcode: 0,
            extra_data: Map::new(),
            message: format!("{}: {}", message, error),
            jid,
            outcome: SubmitOutcome::Failed(error),
        }
    }
}

/// A record read back from the queue, opened and reconciled.
#[derive(Debug)]
pub struct FetchedJob {
    pub node: String,
    pub env: EnvMode,
    pub record: JobRecord,
    /// Set when the record was a finished `sys.get`.
    pub sync: Option<SyncOutcome>,
}

/// Sends jobs to the fleet and reads their results back.
///
/// None of the public operations return errors: failures are logged and
/// show up in the returned data (`retcode = 0`, missing nodes, `None`,
/// `false`).
pub struct Dispatcher {
    config: DispatchConfig,
    queue: Arc<dyn JobQueue>,
    directory: Arc<dyn NodeDirectory>,
    artifacts: ArtifactSync,
    cipher: Option<Cipher>,
    jid: Option<String>,
    jids: JidGenerator,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("env", &self.config.env)
            .field("jid", &self.jid)
            .field("artifacts", &self.artifacts)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        config: DispatchConfig,
        queue: Arc<dyn JobQueue>,
        directory: Arc<dyn NodeDirectory>,
        store: Arc<dyn BlobStore>,
    ) -> Result<Self> {
        config.validate()?;
        let cipher = if config.token.is_empty() {
            None
        } else {
            Some(Cipher::new(&config.token)?)
        };
        let artifacts = ArtifactSync::new(store, config.cache_dir.clone());

        Ok(Self {
            config,
            queue,
            directory,
            artifacts,
            cipher,
            jid: None,
            jids: JidGenerator::new(),
        })
    }

    /// Use `jid` for every submit instead of generating one per call.
    pub fn with_jid(mut self, jid: impl Into<String>) -> Self {
        let jid = jid.into();
        self.jid = if jid.is_empty() { None } else { Some(jid) };
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn artifacts(&self) -> &ArtifactSync {
        &self.artifacts
    }

    /// The configured jid, or a freshly generated one.
    pub fn jid(&self) -> String {
        match &self.jid {
            Some(jid) => jid.clone(),
            None => self.jids.next_jid(),
        }
    }

    /// Send `request.cmd` to every node selected by the request's patterns.
    ///
    /// File commands are staged first: `sys.copy` uploads the local file and
    /// replaces its path with `"<content_id>,<base_name>"`, `sys.rsync_module`
    /// uploads the module directory and attaches `copy_pair`. One record per
    /// node is then written to the queue in a single multi-put.
    ///
    /// With a zero `wait_timeout` the report only says whether the queue
    /// accepted every entry. Otherwise the call polls until all nodes have
    /// answered or the timeout passes, and reports what was collected; a
    /// failed enqueue is only logged in that case.
    pub async fn submit(&self, mut request: SubmitRequest) -> SubmitReport {
        let jid = self.jid();

        let nodes = match self
            .directory
            .resolve(&request.node_pattern, request.node_exclude.as_deref())
            .await
        {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::error!(jid = %jid, pattern = %request.node_pattern, error = %e, "Node resolution failed");
                return SubmitReport::failed(jid, "send_job fail", e.into());
            }
        };
        if nodes.is_empty() {
            tracing::warn!(jid = %jid, cmd = %request.cmd, pattern = %request.node_pattern, "0 node match");
            return SubmitReport {
                retcode: 1,
                extra_data: Map::new(),
                message: "send_job complete,0 node match".to_string(),
                jid,
                outcome: SubmitOutcome::NoMatch,
            };
        }

        if let Err(e) = self.stage(&mut request).await {
            tracing::error!(jid = %jid, cmd = %request.cmd, error = %e, "Artifact staging failed");
            return SubmitReport::failed(jid, "send_job fail", e.into());
        }

        let template = JobTemplate::new(jid.clone(), request.cmd, request.args, request.kwargs)
            .with_hints(self.config.job_timeout_secs, self.config.retry_times)
            .with_nthread(request.nthread);

        match self.enqueue(&template, &nodes).await {
            Ok(()) => {
                tracing::info!(jid = %jid, cmd = template.cmd(), nodes = nodes.len(), env = %self.config.env, "Job dispatched");
            }
            Err(e) if request.wait_timeout.is_zero() => {
                tracing::error!(jid = %jid, cmd = template.cmd(), kind = e.kind(), error = %e, "send_job error");
                return SubmitReport::failed(jid, "send_job complete,fail", e);
            }
            Err(e) => {
                // Waiting callers get whatever the poller can still collect.
                tracing::error!(jid = %jid, cmd = template.cmd(), kind = e.kind(), error = %e, "send_job error, polling anyway");
            }
        }

        if request.wait_timeout.is_zero() {
            let mut extra_data = Map::new();
            extra_data.insert("jid".to_string(), Value::String(jid.clone()));
            return SubmitReport {
                retcode: 1,
                extra_data,
                message: "send_job complete,all success".to_string(),
                jid,
                outcome: SubmitOutcome::Queued { nodes },
            };
        }

        let poll = ResultPoller::new(self, self.config.poll_interval())
            .await_all(&nodes, &jid, Deadline::after(request.wait_timeout))
            .await;
        let message = if poll.timed_out {
            "get result timeout"
        } else {
            "get result complete!"
        };
        SubmitReport {
            retcode: 1,
            extra_data: poll.results.into_iter().collect(),
            message: message.to_string(),
            jid,
            outcome: SubmitOutcome::Collected {
                nodes,
                timed_out: poll.timed_out,
            },
        }
    }

    /// Upload the files a `sys.copy` or `sys.rsync_module` refers to and
    /// rewrite the request to carry content ids.
    async fn stage(&self, request: &mut SubmitRequest) -> Result<(), ArtifactError> {
        let help = |v: &Value| v.as_str() == Some(HELP_MARKER);

        match request.cmd.as_str() {
            CMD_COPY if !request.args.iter().any(help) => {
                let explicit = request.kwargs.contains_key("local_path")
                    && request.kwargs.contains_key("remote_path");
                let local = if explicit {
                    request.kwargs.get("local_path")
                } else {
                    request.args.first()
                };
                let local = local
                    .and_then(Value::as_str)
                    .map(PathBuf::from)
                    .ok_or(ArtifactError::MissingPath("local_path"))?;

                let pair = self.artifacts.stage_file(&local).await?;
                if explicit {
                    request.kwargs.insert("path_pair".to_string(), pair.to_arg());
                } else {
                    request.args[0] = pair.to_arg();
                }
            }
            CMD_RSYNC_MODULE if !request.args.first().is_some_and(help) => {
                let pairs = self
                    .artifacts
                    .stage_module_dir(&self.config.module_dir, &self.config.module_extension)
                    .await?;
                request.kwargs.insert(
                    "copy_pair".to_string(),
                    Value::Array(pairs.iter().map(|p| p.to_tuple()).collect()),
                );
            }
            _ => {}
        }
        Ok(())
    }

    async fn enqueue(&self, template: &JobTemplate, nodes: &[String]) -> Result<()> {
        let mut entries = Vec::with_capacity(nodes.len());
        for job in template.fan_out(nodes) {
            let envelope = Envelope::seal(&job.record, self.config.env, self.cipher.as_ref())?;
            entries.push(QueueEntry {
                node: job.node,
                jid: template.jid().to_string(),
                envelope,
            });
        }
        self.queue.put_many(entries).await?;
        Ok(())
    }

    /// Read the entries for `pairs`, opening `aes` payloads and bringing
    /// finished `sys.get` files onto this host.
    ///
    /// A queue failure yields an empty map; an envelope that cannot be opened
    /// is reported as `None`.
    pub async fn fetch(&self, pairs: &[(String, String)]) -> HashMap<String, Option<FetchedJob>> {
        let raw = match self.queue.get_many(pairs).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!(error = %e, kind = "queue", "Job fetch failed");
                return HashMap::new();
            }
        };

        let mut fetched = HashMap::with_capacity(raw.len());
        for (node, envelope) in raw {
            let job = match envelope {
                Some(envelope) => self.open_fetched(&node, envelope).await,
                None => None,
            };
            fetched.insert(node, job);
        }
        fetched
    }

    async fn open_fetched(&self, node: &str, envelope: Envelope) -> Option<FetchedJob> {
        let env = envelope.mode();
        let mut record = match envelope.open(self.cipher.as_ref()) {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(node, error = %e, kind = "crypt", "Cannot open job envelope");
                return None;
            }
        };
        let sync = self.artifacts.reconcile(&mut record).await;
        Some(FetchedJob {
            node: node.to_string(),
            env,
            record,
            sync,
        })
    }

    /// The opened record for one node, without file reconciliation.
    pub async fn fetch_one(&self, node: &str, jid: &str) -> Option<JobRecord> {
        match self.queue.get(node, jid).await {
            Ok(Some(envelope)) => match envelope.open(self.cipher.as_ref()) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::error!(node, jid, error = %e, kind = "crypt", "Cannot open job envelope");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::error!(node, jid, error = %e, kind = "queue", "Job fetch failed");
                None
            }
        }
    }

    /// Remove a node's entry from the queue.
    pub async fn delete(&self, node: &str, jid: &str) -> bool {
        match self.queue.delete(node, jid).await {
            Ok(deleted) => deleted,
            Err(e) => {
                tracing::error!(node, jid, error = %e, "Job delete failed");
                false
            }
        }
    }
}

#[async_trait]
impl ResultSource for Dispatcher {
    async fn fetch(&self, pairs: &[(String, String)]) -> HashMap<String, Option<FetchedJob>> {
        Dispatcher::fetch(self, pairs).await
    }
}

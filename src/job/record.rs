use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Push a local file to the targeted nodes.
pub const CMD_COPY: &str = "sys.copy";
/// Push every module file to the targeted nodes.
pub const CMD_RSYNC_MODULE: &str = "sys.rsync_module";
/// Pull a file from a node back to the dispatcher host.
pub const CMD_GET: &str = "sys.get";
/// Argument that turns a file command into a documentation request.
pub const HELP_MARKER: &str = "help";

/// Wire status of a job record. Only `Ready` is ever written by the
/// dispatcher; the others are set by the node agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Ready,
    Running,
    Finish,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Ready => write!(f, "READY"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Finish => write!(f, "FINISH"),
            JobStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Status and return value read together.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JobState<'a> {
    Ready,
    Running,
    Finished(Option<&'a Value>),
    Failed(Option<&'a Value>),
}

/// The unit of work delivered to one node.
///
/// Unknown fields written by the node agent are kept in `extra` so a record
/// read from the queue serializes back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub jid: String,
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    pub status: JobStatus,
    #[serde(default)]
    pub timeout: u64,
    #[serde(default)]
    pub retry_times: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nthread: Option<u32>,
    #[serde(rename = "return", default, skip_serializing_if = "Option::is_none")]
    pub ret: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JobRecord {
    pub fn state(&self) -> JobState<'_> {
        match self.status {
            JobStatus::Ready => JobState::Ready,
            JobStatus::Running => JobState::Running,
            JobStatus::Finish => JobState::Finished(self.return_value()),
            JobStatus::Failed => JobState::Failed(self.return_value()),
        }
    }

    /// The node's return value, if it has reported one. This is the
    /// completion signal: a `FINISH` status without a value is still pending.
    pub fn return_value(&self) -> Option<&Value> {
        self.ret.as_ref().filter(|v| !v.is_null())
    }

    pub fn arg_str(&self, index: usize) -> Option<&str> {
        self.args.get(index).and_then(Value::as_str)
    }

    pub fn kwarg_str(&self, key: &str) -> Option<&str> {
        self.kwargs.get(key).and_then(Value::as_str)
    }

    /// True when the first positional argument is the `help` marker.
    pub fn is_help(&self) -> bool {
        self.arg_str(0) == Some(HELP_MARKER)
    }
}

/// One record bound to the node it is addressed to.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeJob {
    pub node: String,
    pub record: JobRecord,
}

/// Immutable description of a dispatch, shared by every targeted node.
///
/// Records are produced by value from the template, so no two nodes (and not
/// the template itself) ever share mutable state.
#[derive(Debug)]
pub struct JobTemplate {
    jid: String,
    cmd: String,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    timeout: u64,
    retry_times: u32,
    nthread: Option<u32>,
}

impl JobTemplate {
    pub fn new(
        jid: impl Into<String>,
        cmd: impl Into<String>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Self {
        Self {
            jid: jid.into(),
            cmd: cmd.into(),
            args,
            kwargs,
            timeout: crate::config::DEFAULT_JOB_TIMEOUT_SECS,
            retry_times: crate::config::DEFAULT_RETRY_TIMES,
            nthread: None,
        }
    }

    pub fn with_hints(mut self, timeout: u64, retry_times: u32) -> Self {
        self.timeout = timeout;
        self.retry_times = retry_times;
        self
    }

    pub fn with_nthread(mut self, nthread: Option<u32>) -> Self {
        self.nthread = nthread;
        self
    }

    pub fn jid(&self) -> &str {
        &self.jid
    }

    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    /// A fresh `READY` record addressed to `node`.
    pub fn for_node(&self, node: &str) -> NodeJob {
        NodeJob {
            node: node.to_string(),
            record: JobRecord {
                jid: self.jid.clone(),
                cmd: self.cmd.clone(),
                args: self.args.clone(),
                kwargs: self.kwargs.clone(),
                status: JobStatus::Ready,
                timeout: self.timeout,
                retry_times: self.retry_times,
                nthread: self.nthread,
                ret: None,
                extra: Map::new(),
            },
        }
    }

    pub fn fan_out<'a>(&'a self, nodes: &'a [String]) -> impl Iterator<Item = NodeJob> + 'a {
        nodes.iter().map(move |node| self.for_node(node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ready_record_omits_optional_fields() {
        let template = JobTemplate::new("j1", "sys.ping", vec![], Map::new());
        let job = template.for_node("web-1");
        let value = serde_json::to_value(&job.record).unwrap();
        assert_eq!(value["status"], "READY");
        assert!(value.get("nthread").is_none());
        assert!(value.get("return").is_none());
        assert_eq!(value["timeout"], 60);
        assert_eq!(value["retry_times"], 3);
    }

    #[test]
    fn null_return_is_not_a_result() {
        let record: JobRecord = serde_json::from_value(json!({
            "jid": "j1", "cmd": "sys.ping", "args": [], "kwargs": {},
            "status": "FINISH", "timeout": 60, "retry_times": 3, "return": null
        }))
        .unwrap();
        assert!(record.return_value().is_none());
        assert_eq!(record.state(), JobState::Finished(None));
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let raw = json!({
            "jid": "j1", "cmd": "sys.ping", "args": [], "kwargs": {},
            "status": "RUNNING", "timeout": 60, "retry_times": 3, "pid": 4242
        });
        let record: JobRecord = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(record.extra.get("pid"), Some(&json!(4242)));
        assert_eq!(serde_json::to_value(&record).unwrap(), raw);
    }
}

pub mod envelope;
pub mod jid;
pub mod record;

pub use envelope::{EnvMode, Envelope};
pub use jid::JidGenerator;
pub use record::{
    JobRecord, JobState, JobStatus, JobTemplate, NodeJob, CMD_COPY, CMD_GET, CMD_RSYNC_MODULE,
    HELP_MARKER,
};

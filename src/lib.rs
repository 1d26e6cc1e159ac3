pub mod artifact;
pub mod config;
pub mod crypt;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod poller;
pub mod queue;

pub use dispatcher::{Dispatcher, FetchedJob, SubmitOutcome, SubmitReport, SubmitRequest};

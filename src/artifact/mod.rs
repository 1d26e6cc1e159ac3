//! Content-addressed file transfer for `sys.copy`, `sys.rsync_module` and
//! `sys.get`.
//!
//! # Upload
//!
//! Before dispatch, a local file is pushed to the [`BlobStore`] and the job
//! carries `(content_id, base_name)` instead of the path. Identical content
//! uploads to the same id no matter how many jobs reference it.
//!
//! # Retrieval
//!
//! When a finished `sys.get` record is fetched, [`ArtifactSync::reconcile`]
//! runs three separate steps:
//!
//! 1. **Verify**: if the destination already has the expected checksum, stop.
//! 2. **Cache**: make sure the blob is in the local cache, downloading it once.
//! 3. **Place**: copy the cached blob to the destination.
//!
//! Failures never propagate; the record's return value becomes `""` and the
//! reason is reported as [`SyncOutcome::Failed`].

pub mod checksum;
pub mod store;
pub mod sync;

pub use store::{BlobStore, LocalBlobStore};
pub use sync::{ArtifactSync, PathPair, SyncOutcome};

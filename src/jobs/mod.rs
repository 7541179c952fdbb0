//! Streaming job output.
//!
//! [`OutputHandler`] is what producers and viewers talk to; [`JobStore`]
//! holds the per-job buffers behind it and [`StorageBackend`] is where
//! completed output ends up.

pub mod handler;
pub mod storage;
pub mod store;

pub use handler::{HandlerStats, OutputHandler};
pub use storage::{FilesystemStorageBackend, NoopStorageBackend, StorageBackend};
pub use store::{Job, JobStatus, JobStore};

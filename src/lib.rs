//! artsync - content-addressed repository synchronization.
//!
//! Two repositories converge their artifact sets by exchanging line-oriented
//! batches: the client pushes what it has, pulls what it lacks, and the
//! server answers each request batch from its own store.

pub mod cli;
pub mod config;
pub mod error;
pub mod hash;
pub mod server;
pub mod store;
pub mod transport;
pub mod xfer;

pub use error::{Result, SyncError};
pub use hash::ArtifactId;

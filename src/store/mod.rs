//! Artifact store adapter.
//!
//! The sync engine only talks to the store through [`ArtifactStore`]. The
//! crate ships [`MemoryStore`], a reference implementation that keeps every
//! table in memory and persists through [`snapshot`].

pub mod delta;
pub mod memory;
pub mod snapshot;

pub use memory::MemoryStore;

use crate::error::Result;
use crate::hash::{sha1_hex, ArtifactId};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};

/// Where newly stored content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Created in this repository; must eventually be pushed
    Local,
    /// Received from a peer, which therefore already has it
    Received,
}

/// Content-addressed artifact storage consumed by the sync engine.
///
/// Single writer. All mutation between `begin` and `commit` is undone by
/// `rollback`.
pub trait ArtifactStore {
    /// Code identifying this copy of the repository
    fn server_code(&self) -> &str;

    /// Code shared by every copy of the project
    fn project_code(&self) -> &str;

    fn set_project_code(&mut self, code: &str);

    /// Known either as content or as a phantom
    fn contains(&self, id: &ArtifactId) -> bool;

    fn is_phantom(&self, id: &ArtifactId) -> bool;

    /// Full content can be produced, including through stored deltas.
    fn is_available(&self, id: &ArtifactId) -> bool;

    /// Full content of `id`, expanding stored deltas.
    fn get(&self, id: &ArtifactId) -> Result<Option<Bytes>>;

    /// Store full content, promoting a phantom of the same id.
    fn put(&mut self, content: Bytes, origin: Origin) -> Result<ArtifactId>;

    /// Store `id` as a delta against `source`. The caller has verified that
    /// the expanded content hashes to `id`.
    fn put_delta(
        &mut self,
        id: &ArtifactId,
        source: &ArtifactId,
        delta: Bytes,
        origin: Origin,
    ) -> Result<()>;

    /// The delta `id` is stored as, if any.
    fn stored_delta(&self, id: &ArtifactId) -> Option<(ArtifactId, Bytes)>;

    /// Structural ancestors: check-in parent or prior file revision.
    fn ancestors(&self, id: &ArtifactId) -> Vec<ArtifactId>;

    /// Record a phantom for an unknown id. Returns whether one was created.
    fn new_phantom(&mut self, id: &ArtifactId) -> bool;

    /// Outstanding phantoms in id order.
    fn phantoms(&self) -> Vec<ArtifactId>;

    /// Ids not yet recorded in a cluster, phantoms included, in id order.
    fn unclustered(&self) -> Vec<ArtifactId>;

    fn remove_unclustered(&mut self, ids: &[ArtifactId]);

    /// Local artifacts never yet sent to the peer, in id order.
    fn unsent(&self) -> Vec<ArtifactId>;

    fn mark_sent(&mut self, id: &ArtifactId);

    fn is_shunned(&self, id: &ArtifactId) -> bool;

    fn begin(&mut self);

    fn commit(&mut self);

    fn rollback(&mut self);
}

static CODE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Mint a fresh 40-hex server or project code.
pub fn mint_code() -> String {
    let now = chrono::Utc::now();
    let seed = format!(
        "{}:{}:{}",
        now.timestamp_nanos_opt().unwrap_or_default(),
        std::process::id(),
        CODE_COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    sha1_hex(seed.as_bytes())
}

//! Per-exchange transfer state.
//!
//! A [`Session`] lives for one request/response cycle: the server builds one
//! per incoming batch, the client one per reply it processes. It owns the
//! outgoing batch, the byte budget for it, and the counters both sides use
//! to decide what happens next.

use crate::error::{Result, SyncError};
use crate::hash::ArtifactId;
use crate::store::{delta, ArtifactStore, Origin};
use crate::xfer::cluster;
use crate::xfer::codec::Message;
use crate::xfer::delta_select::{self, DeltaPolicy};
use bytes::{Bytes, BytesMut};
use std::collections::HashSet;

// =============================================================================
// Statistics
// =============================================================================

/// Counters for one exchange
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct XferStats {
    /// Artifacts sent as full content
    pub files_sent: u64,

    /// Artifacts sent as deltas
    pub deltas_sent: u64,

    /// Artifacts received as full content
    pub files_received: u64,

    /// Artifacts received as deltas
    pub deltas_received: u64,

    /// Deltas received whose source is not available here
    pub dangling: u64,

    pub gimme_sent: u64,
    pub igot_sent: u64,
    pub gimme_received: u64,
    pub igot_received: u64,

    /// Phantoms created while processing
    pub new_phantoms: u64,
}

impl XferStats {
    /// Artifacts accepted, full or delta
    pub fn received(&self) -> u64 {
        self.files_received + self.deltas_received
    }

    pub fn sent(&self) -> u64 {
        self.files_sent + self.deltas_sent
    }
}

impl std::ops::AddAssign for XferStats {
    fn add_assign(&mut self, other: Self) {
        self.files_sent += other.files_sent;
        self.deltas_sent += other.deltas_sent;
        self.files_received += other.files_received;
        self.deltas_received += other.deltas_received;
        self.dangling += other.dangling;
        self.gimme_sent += other.gimme_sent;
        self.igot_sent += other.igot_sent;
        self.gimme_received += other.gimme_received;
        self.igot_received += other.igot_received;
        self.new_phantoms += other.new_phantoms;
    }
}

/// What happened to an incoming `file`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accepted {
    /// Verified and stored (or already present)
    Stored(ArtifactId),
    /// The artifact or its delta source is shunned; payload discarded
    Shunned,
    /// Delta source unavailable; source requested, artifact left a phantom
    Dangling { source: ArtifactId },
}

// =============================================================================
// Session
// =============================================================================

/// Mutable state shared by every message handler during one exchange.
pub struct Session {
    out: BytesMut,
    mx_send: usize,
    policy: DeltaPolicy,
    /// Sending an artifact removes it from the store's unsent set
    consume_unsent: bool,
    pub stats: XferStats,
    /// Last cookie the peer sent
    pub cookie: Option<String>,
    /// Ids the peer announced with `igot`
    on_remote: HashSet<ArtifactId>,
    advertised: HashSet<ArtifactId>,
    requested: HashSet<ArtifactId>,
    sent: HashSet<ArtifactId>,
}

impl Session {
    pub fn new(mx_send: usize, delta_margin: usize) -> Self {
        Self {
            out: BytesMut::new(),
            mx_send,
            policy: DeltaPolicy {
                native_only: false,
                margin: delta_margin,
            },
            consume_unsent: false,
            stats: XferStats::default(),
            cookie: None,
            on_remote: HashSet::new(),
            advertised: HashSet::new(),
            requested: HashSet::new(),
            sent: HashSet::new(),
        }
    }

    /// Sent artifacts leave the store's unsent set (pushing side).
    pub fn consume_unsent(mut self, yes: bool) -> Self {
        self.consume_unsent = yes;
        self
    }

    /// Only reuse stored deltas from now on.
    pub fn set_native_only(&mut self) {
        self.policy.native_only = true;
    }

    pub fn over_budget(&self) -> bool {
        self.out.len() >= self.mx_send
    }

    /// Queue a message verbatim.
    pub fn emit(&mut self, message: &Message) {
        message.encode(&mut self.out);
    }

    /// Take the queued batch, leaving the buffer empty.
    pub fn take_output(&mut self) -> Bytes {
        self.out.split().freeze()
    }

    /// Record that the peer holds `id`.
    pub fn note_remote_has(&mut self, id: &ArtifactId) {
        self.on_remote.insert(id.clone());
    }

    /// Queue `igot id` once, unless the peer already has it or it is shunned.
    pub fn send_igot<S: ArtifactStore + ?Sized>(&mut self, store: &S, id: &ArtifactId) {
        if store.is_shunned(id) || self.on_remote.contains(id) || self.sent.contains(id) {
            return;
        }
        if self.advertised.insert(id.clone()) {
            self.emit(&Message::Igot(id.clone()));
            self.stats.igot_sent += 1;
        }
    }

    /// Queue `gimme id` once.
    pub fn send_gimme<S: ArtifactStore + ?Sized>(&mut self, store: &S, id: &ArtifactId) {
        if store.is_shunned(id) {
            return;
        }
        if self.requested.insert(id.clone()) {
            self.emit(&Message::Gimme(id.clone()));
            self.stats.gimme_sent += 1;
        }
    }

    /// Queue the content of `id`, or just `igot id` once the budget is spent.
    /// Unknown, phantom and shunned ids are skipped.
    pub fn send_file<S: ArtifactStore + ?Sized>(&mut self, store: &mut S, id: &ArtifactId) -> Result<()> {
        if store.is_shunned(id) || self.on_remote.contains(id) || self.sent.contains(id) {
            return Ok(());
        }
        if self.over_budget() {
            self.send_igot(&*store, id);
            return Ok(());
        }
        let Some(content) = store.get(id)? else {
            return Ok(());
        };

        let encoding = delta_select::select(&*store, id, &content, self.policy)?;
        tracing::debug!(
            "send {} ({} bytes{})",
            id,
            encoding.payload().len(),
            encoding
                .source()
                .map(|s| format!(", delta from {}", s))
                .unwrap_or_default()
        );
        if encoding.is_delta() {
            self.stats.deltas_sent += 1;
        } else {
            self.stats.files_sent += 1;
        }
        let delta_source = encoding.source().cloned();
        let payload = encoding.payload().clone();
        self.emit(&Message::File {
            id: id.clone(),
            delta_source,
            content: payload,
        });

        self.sent.insert(id.clone());
        if self.consume_unsent {
            store.mark_sent(id);
        }
        Ok(())
    }

    /// Accept an incoming artifact. The hash check is the only way content
    /// enters the store; a mismatch is an integrity error and nothing is
    /// stored.
    pub fn accept_file<S: ArtifactStore + ?Sized>(
        &mut self,
        store: &mut S,
        id: &ArtifactId,
        delta_source: Option<&ArtifactId>,
        payload: Bytes,
    ) -> Result<Accepted> {
        if store.is_shunned(id) {
            tracing::debug!("discarding shunned artifact {}", id);
            return Ok(Accepted::Shunned);
        }
        if let Some(source) = delta_source.filter(|source| store.is_shunned(source)) {
            tracing::debug!("discarding {}: delta source {} is shunned", id, source);
            return Ok(Accepted::Shunned);
        }
        self.note_remote_has(id);

        let content = match delta_source {
            Some(source) if !store.is_available(source) => {
                if store.new_phantom(source) {
                    self.stats.new_phantoms += 1;
                }
                if store.new_phantom(id) {
                    self.stats.new_phantoms += 1;
                }
                self.send_gimme(&*store, source);
                self.stats.dangling += 1;
                tracing::debug!("{} is a delta of missing {}; requested it", id, source);
                return Ok(Accepted::Dangling {
                    source: source.clone(),
                });
            }
            Some(source) => {
                let base = store
                    .get(source)?
                    .ok_or_else(|| SyncError::Store(format!("{} vanished", source)))?;
                let content = delta::apply(&base, &payload).map_err(|_| SyncError::Integrity {
                    claimed: id.to_string(),
                    actual: "undecodable delta".to_string(),
                })?;
                verify(id, &content)?;
                if !store.is_available(id) {
                    store.put_delta(id, source, payload, Origin::Received)?;
                }
                self.stats.deltas_received += 1;
                content
            }
            None => {
                verify(id, &payload)?;
                store.put(payload.clone(), Origin::Received)?;
                self.stats.files_received += 1;
                payload
            }
        };

        self.stats.new_phantoms += cluster::crosslink(store, &content) as u64;
        Ok(Accepted::Stored(id.clone()))
    }
}

fn verify(id: &ArtifactId, content: &[u8]) -> Result<()> {
    if id.verify(content) {
        return Ok(());
    }
    let actual = ArtifactId::of(content);
    tracing::warn!("content for {} hashes to {}", id, actual);
    Err(SyncError::Integrity {
        claimed: id.to_string(),
        actual: actual.to_string(),
    })
}

//! Choose how an artifact goes on the wire.
//!
//! First success wins:
//! 1. the delta the store already holds, if its source is available;
//! 2. a fresh delta against a structural ancestor, if it saves more than
//!    `margin` bytes over the full content;
//! 3. the full content.

use crate::error::Result;
use crate::hash::ArtifactId;
use crate::store::{delta, ArtifactStore};
use bytes::Bytes;

/// Encoding chosen for one outgoing artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoding {
    NativeDelta { source: ArtifactId, payload: Bytes },
    AncestorDelta { source: ArtifactId, payload: Bytes },
    Full { payload: Bytes },
}

impl Encoding {
    pub fn source(&self) -> Option<&ArtifactId> {
        match self {
            Encoding::NativeDelta { source, .. } | Encoding::AncestorDelta { source, .. } => {
                Some(source)
            }
            Encoding::Full { .. } => None,
        }
    }

    pub fn payload(&self) -> &Bytes {
        match self {
            Encoding::NativeDelta { payload, .. }
            | Encoding::AncestorDelta { payload, .. }
            | Encoding::Full { payload } => payload,
        }
    }

    pub fn is_delta(&self) -> bool {
        self.source().is_some()
    }
}

/// Knobs for [`select`].
#[derive(Debug, Clone, Copy)]
pub struct DeltaPolicy {
    /// Only reuse stored deltas; never compute new ones (clone)
    pub native_only: bool,
    /// Bytes an ancestor delta must save over the full content
    pub margin: usize,
}

/// Pick the encoding for `id`, whose full content is `content`.
pub fn select<S: ArtifactStore + ?Sized>(
    store: &S,
    id: &ArtifactId,
    content: &Bytes,
    policy: DeltaPolicy,
) -> Result<Encoding> {
    if let Some((source, payload)) = store.stored_delta(id) {
        if store.is_available(&source) && !store.is_shunned(&source) {
            return Ok(Encoding::NativeDelta { source, payload });
        }
    }

    if !policy.native_only {
        if let Some(source) = ancestor_candidate(store, id) {
            if let Some(base) = store.get(&source)? {
                let payload = delta::create(&base, content);
                if payload.len() < content.len().saturating_sub(policy.margin) {
                    return Ok(Encoding::AncestorDelta { source, payload });
                }
                tracing::trace!(
                    "delta of {} against {} saves too little ({} of {} bytes)",
                    id,
                    source,
                    payload.len(),
                    content.len()
                );
            }
        }
    }

    Ok(Encoding::Full {
        payload: content.clone(),
    })
}

/// First ancestor that is fully available and not itself a delta of `id`.
fn ancestor_candidate<S: ArtifactStore + ?Sized>(store: &S, id: &ArtifactId) -> Option<ArtifactId> {
    store.ancestors(id).into_iter().find(|candidate| {
        candidate != id
            && !store.is_phantom(candidate)
            && !store.is_shunned(candidate)
            && store.is_available(candidate)
            && store
                .stored_delta(candidate)
                .map_or(true, |(source, _)| &source != id)
    })
}

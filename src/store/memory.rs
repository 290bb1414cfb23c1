//! In-memory artifact store.

use crate::error::{Result, SyncError};
use crate::hash::ArtifactId;
use crate::store::{delta, mint_code, ArtifactStore, Origin};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Longest delta chain `get` will follow
const MAX_CHAIN_DEPTH: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum Blob {
    Full(Vec<u8>),
    Delta { source: ArtifactId, delta: Vec<u8> },
    Phantom,
}

/// Every table of the store. Serialized as-is by `snapshot`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct StoreState {
    pub server_code: String,
    pub project_code: String,
    pub blobs: BTreeMap<ArtifactId, Blob>,
    pub ancestors: BTreeMap<ArtifactId, Vec<ArtifactId>>,
    pub unclustered: BTreeSet<ArtifactId>,
    pub unsent: BTreeSet<ArtifactId>,
    pub shunned: BTreeSet<ArtifactId>,
}

/// Reference [`ArtifactStore`] keeping all state in memory.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: StoreState,
    savepoint: Option<StoreState>,
}

impl MemoryStore {
    /// Create an empty repository for `project_code` with a fresh server code.
    pub fn new(project_code: impl Into<String>) -> Self {
        Self::from_state(StoreState {
            server_code: mint_code(),
            project_code: project_code.into(),
            ..Default::default()
        })
    }

    /// Create an empty repository for a brand-new project.
    pub fn new_project() -> Self {
        Self::new(mint_code())
    }

    pub(crate) fn from_state(state: StoreState) -> Self {
        Self {
            state,
            savepoint: None,
        }
    }

    pub(crate) fn state(&self) -> &StoreState {
        &self.state
    }

    /// Record `ancestor` as a structural ancestor of `id`.
    pub fn link_ancestor(&mut self, id: &ArtifactId, ancestor: &ArtifactId) {
        let list = self.state.ancestors.entry(id.clone()).or_default();
        if !list.contains(ancestor) {
            list.push(ancestor.clone());
        }
    }

    /// Add `id` to the shun list, dropping any content held for it.
    pub fn shun(&mut self, id: &ArtifactId) {
        self.state.shunned.insert(id.clone());
        self.state.blobs.remove(id);
        self.state.unclustered.remove(id);
        self.state.unsent.remove(id);
    }

    /// Number of artifacts with content (phantoms excluded).
    pub fn artifact_count(&self) -> usize {
        self.state
            .blobs
            .values()
            .filter(|b| !matches!(b, Blob::Phantom))
            .count()
    }

    /// `None` if unknown, otherwise whether the id is only a phantom.
    fn known_as_phantom(&self, id: &ArtifactId) -> Option<bool> {
        self.state
            .blobs
            .get(id)
            .map(|blob| matches!(blob, Blob::Phantom))
    }

    fn insert_new(&mut self, id: &ArtifactId, blob: Blob, origin: Origin) {
        self.state.blobs.insert(id.clone(), blob);
        self.state.unclustered.insert(id.clone());
        if origin == Origin::Local {
            self.state.unsent.insert(id.clone());
        }
    }
}

impl ArtifactStore for MemoryStore {
    fn server_code(&self) -> &str {
        &self.state.server_code
    }

    fn project_code(&self) -> &str {
        &self.state.project_code
    }

    fn set_project_code(&mut self, code: &str) {
        self.state.project_code = code.to_string();
    }

    fn contains(&self, id: &ArtifactId) -> bool {
        self.state.blobs.contains_key(id)
    }

    fn is_phantom(&self, id: &ArtifactId) -> bool {
        matches!(self.state.blobs.get(id), Some(Blob::Phantom))
    }

    fn is_available(&self, id: &ArtifactId) -> bool {
        let mut current = id;
        for _ in 0..MAX_CHAIN_DEPTH {
            match self.state.blobs.get(current) {
                Some(Blob::Full(_)) => return true,
                Some(Blob::Delta { source, .. }) => current = source,
                Some(Blob::Phantom) | None => return false,
            }
        }
        false
    }

    fn get(&self, id: &ArtifactId) -> Result<Option<Bytes>> {
        let mut chain: Vec<&[u8]> = Vec::new();
        let mut current = id;
        let base = loop {
            if chain.len() > MAX_CHAIN_DEPTH {
                return Err(SyncError::Store(format!("delta chain too deep at {}", id)));
            }
            match self.state.blobs.get(current) {
                Some(Blob::Full(content)) => break content.as_slice(),
                Some(Blob::Delta { source, delta }) => {
                    chain.push(delta);
                    current = source;
                }
                Some(Blob::Phantom) | None => return Ok(None),
            }
        };

        let mut content = Bytes::copy_from_slice(base);
        for d in chain.iter().rev() {
            content = delta::apply(&content, d)?;
        }
        Ok(Some(content))
    }

    fn put(&mut self, content: Bytes, origin: Origin) -> Result<ArtifactId> {
        let id = ArtifactId::of(&content);
        match self.known_as_phantom(&id) {
            Some(true) => {
                self.state.blobs.insert(id.clone(), Blob::Full(content.to_vec()));
                self.state.unclustered.insert(id.clone());
            }
            Some(false) => {}
            None => self.insert_new(&id, Blob::Full(content.to_vec()), origin),
        }
        Ok(id)
    }

    fn put_delta(
        &mut self,
        id: &ArtifactId,
        source: &ArtifactId,
        delta: Bytes,
        origin: Origin,
    ) -> Result<()> {
        if id == source {
            return Err(SyncError::Store(format!("{} cannot be a delta of itself", id)));
        }
        let blob = Blob::Delta {
            source: source.clone(),
            delta: delta.to_vec(),
        };
        match self.known_as_phantom(id) {
            Some(true) => {
                self.state.blobs.insert(id.clone(), blob);
                self.state.unclustered.insert(id.clone());
            }
            Some(false) => {}
            None => self.insert_new(id, blob, origin),
        }
        Ok(())
    }

    fn stored_delta(&self, id: &ArtifactId) -> Option<(ArtifactId, Bytes)> {
        match self.state.blobs.get(id) {
            Some(Blob::Delta { source, delta }) => {
                Some((source.clone(), Bytes::copy_from_slice(delta)))
            }
            _ => None,
        }
    }

    fn ancestors(&self, id: &ArtifactId) -> Vec<ArtifactId> {
        self.state.ancestors.get(id).cloned().unwrap_or_default()
    }

    fn new_phantom(&mut self, id: &ArtifactId) -> bool {
        if self.state.blobs.contains_key(id) || self.state.shunned.contains(id) {
            return false;
        }
        self.state.blobs.insert(id.clone(), Blob::Phantom);
        self.state.unclustered.insert(id.clone());
        true
    }

    fn phantoms(&self) -> Vec<ArtifactId> {
        self.state
            .blobs
            .iter()
            .filter(|(_, b)| matches!(b, Blob::Phantom))
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn unclustered(&self) -> Vec<ArtifactId> {
        self.state.unclustered.iter().cloned().collect()
    }

    fn remove_unclustered(&mut self, ids: &[ArtifactId]) {
        for id in ids {
            self.state.unclustered.remove(id);
        }
    }

    fn unsent(&self) -> Vec<ArtifactId> {
        self.state.unsent.iter().cloned().collect()
    }

    fn mark_sent(&mut self, id: &ArtifactId) {
        self.state.unsent.remove(id);
    }

    fn is_shunned(&self, id: &ArtifactId) -> bool {
        self.state.shunned.contains(id)
    }

    fn begin(&mut self) {
        self.savepoint = Some(self.state.clone());
    }

    fn commit(&mut self) {
        self.savepoint = None;
    }

    fn rollback(&mut self) {
        if let Some(saved) = self.savepoint.take() {
            self.state = saved;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_get() {
        let mut store = MemoryStore::new_project();
        let id = store.put(Bytes::from("hello"), Origin::Local).unwrap();

        assert_eq!(id, ArtifactId::of(b"hello"));
        assert!(store.is_available(&id));
        assert_eq!(store.get(&id).unwrap().unwrap().as_ref(), b"hello");
        assert_eq!(store.unsent(), vec![id.clone()]);
        assert_eq!(store.unclustered(), vec![id]);
    }

    #[test]
    fn test_received_content_is_not_unsent() {
        let mut store = MemoryStore::new_project();
        store.put(Bytes::from("from peer"), Origin::Received).unwrap();
        assert!(store.unsent().is_empty());
        assert_eq!(store.unclustered().len(), 1);
    }

    #[test]
    fn test_phantom_promotion() {
        let mut store = MemoryStore::new_project();
        let id = ArtifactId::of(b"later");

        assert!(store.new_phantom(&id));
        assert!(!store.new_phantom(&id));
        assert!(store.is_phantom(&id));
        assert!(!store.is_available(&id));
        assert_eq!(store.get(&id).unwrap(), None);

        store.put(Bytes::from("later"), Origin::Received).unwrap();
        assert!(!store.is_phantom(&id));
        assert!(store.phantoms().is_empty());
    }

    #[test]
    fn test_delta_chain_expands() {
        let mut store = MemoryStore::new_project();
        let base = b"The quick brown fox jumps over the lazy dog, again and again.".to_vec();
        let mut next = base.clone();
        next.extend_from_slice(b" And once more.");

        let base_id = store.put(Bytes::from(base.clone()), Origin::Local).unwrap();
        let next_id = ArtifactId::of(&next);
        store
            .put_delta(&next_id, &base_id, delta::create(&base, &next), Origin::Local)
            .unwrap();

        assert!(store.is_available(&next_id));
        assert_eq!(store.get(&next_id).unwrap().unwrap().as_ref(), next.as_slice());
        assert_eq!(store.stored_delta(&next_id).unwrap().0, base_id);
    }

    #[test]
    fn test_shunned_never_becomes_phantom() {
        let mut store = MemoryStore::new_project();
        let id = ArtifactId::of(b"banned");
        store.shun(&id);
        assert!(!store.new_phantom(&id));
        assert!(!store.contains(&id));
    }

    #[test]
    fn test_rollback_restores_state() {
        let mut store = MemoryStore::new_project();
        store.begin();
        store.put(Bytes::from("discard me"), Origin::Local).unwrap();
        store.rollback();
        assert_eq!(store.artifact_count(), 0);

        store.begin();
        store.put(Bytes::from("keep me"), Origin::Local).unwrap();
        store.commit();
        store.rollback();
        assert_eq!(store.artifact_count(), 1);
    }
}

//! Cluster manifests.
//!
//! Once enough artifacts are unclustered, they are bundled into one cluster
//! artifact:
//!
//! ```text
//! M <id>        one line per member, sorted
//! ...
//! Z <md5>       md5 of every preceding byte
//! ```
//!
//! The cluster is stored like any local artifact, so it becomes the single
//! unclustered entry that gets advertised in place of its members. A peer
//! that receives a cluster learns every member id from it.

use crate::error::Result;
use crate::hash::ArtifactId;
use crate::store::{ArtifactStore, Origin};
use bytes::{BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};

/// Build a cluster if at least `threshold` unclustered artifacts have
/// content. Returns the new cluster's id.
pub fn maybe_create<S: ArtifactStore + ?Sized>(
    store: &mut S,
    threshold: usize,
) -> Result<Option<ArtifactId>> {
    let mut members: Vec<ArtifactId> = store
        .unclustered()
        .into_iter()
        .filter(|id| !store.is_phantom(id) && !store.is_shunned(id))
        .collect();
    if members.len() < threshold {
        return Ok(None);
    }
    members.sort();

    let body = render(&members);
    store.remove_unclustered(&members);
    let id = store.put(body, Origin::Local)?;
    tracing::info!("created cluster {} with {} members", id, members.len());
    Ok(Some(id))
}

/// Serialize a member list (already sorted) into a cluster body.
pub fn render(members: &[ArtifactId]) -> Bytes {
    let mut body = BytesMut::with_capacity(members.len() * 43 + 35);
    for id in members {
        body.put_slice(b"M ");
        body.put_slice(id.as_str().as_bytes());
        body.put_u8(b'\n');
    }
    let checksum = md5_hex(&body);
    body.put_slice(b"Z ");
    body.put_slice(checksum.as_bytes());
    body.put_u8(b'\n');
    body.freeze()
}

/// Member ids if `content` is a well-formed cluster.
pub fn parse(content: &[u8]) -> Option<Vec<ArtifactId>> {
    let text = std::str::from_utf8(content).ok()?;
    let body = text.strip_suffix('\n')?;
    let (members_part, trailer) = match body.rfind('\n') {
        Some(n) => (&text[..n + 1], &body[n + 1..]),
        None => return None,
    };

    let checksum = trailer.strip_prefix("Z ")?;
    if checksum != md5_hex(members_part.as_bytes()) {
        return None;
    }

    members_part
        .lines()
        .map(|line| line.strip_prefix("M ").and_then(ArtifactId::parse))
        .collect()
}

/// If `content` is a cluster, create phantoms for every member not yet
/// known. Returns how many phantoms were created.
pub fn crosslink<S: ArtifactStore + ?Sized>(store: &mut S, content: &[u8]) -> usize {
    let Some(members) = parse(content) else {
        return 0;
    };
    let created = members
        .iter()
        .filter(|id| store.new_phantom(id))
        .count();
    if created > 0 {
        tracing::debug!("cluster listed {} unknown artifacts", created);
    }
    created
}

fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn fill(store: &mut MemoryStore, n: usize) -> Vec<ArtifactId> {
        (0..n)
            .map(|i| {
                store
                    .put(Bytes::from(format!("artifact {}", i)), Origin::Local)
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_below_threshold_no_cluster() {
        let mut store = MemoryStore::new_project();
        fill(&mut store, 99);
        assert_eq!(maybe_create(&mut store, 100).unwrap(), None);
        assert_eq!(store.unclustered().len(), 99);
    }

    #[test]
    fn test_at_threshold_one_cluster() {
        let mut store = MemoryStore::new_project();
        let mut members = fill(&mut store, 100);
        let phantom = ArtifactId::of(b"not yet fetched");
        store.new_phantom(&phantom);

        let cluster = maybe_create(&mut store, 100).unwrap().unwrap();

        // Every member left the unclustered set; only the new cluster itself
        // and the phantom remain.
        let mut expected = vec![cluster.clone(), phantom];
        expected.sort();
        assert_eq!(store.unclustered(), expected);
        assert_eq!(maybe_create(&mut store, 100).unwrap(), None);

        members.sort();
        let body = store.get(&cluster).unwrap().unwrap();
        assert_eq!(parse(&body).unwrap(), members);
    }

    #[test]
    fn test_parse_rejects_bad_checksum() {
        let ids = vec![ArtifactId::of(b"one"), ArtifactId::of(b"two")];
        let body = render(&ids);
        let mut tampered = body.to_vec();
        tampered[2] = if tampered[2] == b'0' { b'1' } else { b'0' };
        assert!(parse(&tampered).is_none());
        assert!(parse(b"just some file\n").is_none());
        assert!(parse(b"").is_none());
    }

    #[test]
    fn test_crosslink_creates_phantoms() {
        let mut store = MemoryStore::new_project();
        let known = store.put(Bytes::from("known"), Origin::Local).unwrap();
        let unknown = ArtifactId::of(b"unknown");
        let mut ids = vec![known, unknown.clone()];
        ids.sort();

        assert_eq!(crosslink(&mut store, &render(&ids)), 1);
        assert!(store.is_phantom(&unknown));
        assert_eq!(crosslink(&mut store, &render(&ids)), 0);
    }
}

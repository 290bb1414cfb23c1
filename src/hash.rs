//! Artifact identity.
//!
//! Every artifact is named by the SHA1 of its content, rendered as 40
//! lowercase hex digits on the wire and in snapshots.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;

/// Length of a hex-encoded SHA1 id
pub const ID_HEX_LEN: usize = 40;

/// Content hash identifying an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactId(String);

impl ArtifactId {
    /// Hash `content` and return its id.
    pub fn of(content: &[u8]) -> Self {
        Self(sha1_hex(content))
    }

    /// Parse a wire token. Accepts exactly 40 hex digits in either case.
    pub fn parse(token: &str) -> Option<Self> {
        if token.len() != ID_HEX_LEN || !token.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self(token.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `content` hashes to this id.
    pub fn verify(&self, content: &[u8]) -> bool {
        sha1_hex(content) == self.0
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase hex SHA1 of `data`.
pub fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

//! Sync configuration.
//!
//! Loaded from TOML. Every field has a default, so an empty file (or no
//! file at all) yields a working configuration:
//!
//! ```toml
//! max-upload = 250000
//! max-download = 5000000
//!
//! [[users]]
//! name = "nobody"
//! password = ""
//! caps = "og"
//! ```

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Client send budget per round (bytes)
pub const DEFAULT_MAX_UPLOAD: usize = 250_000;

/// Server send budget per reply (bytes)
pub const DEFAULT_MAX_DOWNLOAD: usize = 5_000_000;

/// An ancestor delta must save at least this many bytes over a full copy
pub const DEFAULT_DELTA_MARGIN: usize = 50;

/// Unclustered non-phantom count that triggers a new cluster
pub const DEFAULT_CLUSTER_THRESHOLD: usize = 100;

/// Lower bound for the client's per-round phantom requests
pub const DEFAULT_PHANTOM_REQUEST_FLOOR: usize = 200;

/// Phantoms the server requests at the end of a push batch
pub const DEFAULT_SERVER_PHANTOM_LIMIT: usize = 500;

/// Rounds after which a client sync is abandoned
pub const DEFAULT_MAX_ROUNDS: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SyncConfig {
    pub max_upload: usize,
    pub max_download: usize,
    pub delta_margin: usize,
    pub cluster_threshold: usize,
    pub phantom_request_floor: usize,
    pub server_phantom_limit: usize,
    pub max_rounds: usize,
    pub users: Vec<UserConfig>,
}

/// One entry of the `[[users]]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub name: String,
    #[serde(default)]
    pub password: String,
    /// Capability letters: `o` read, `i` write, `g` clone
    #[serde(default)]
    pub caps: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_upload: DEFAULT_MAX_UPLOAD,
            max_download: DEFAULT_MAX_DOWNLOAD,
            delta_margin: DEFAULT_DELTA_MARGIN,
            cluster_threshold: DEFAULT_CLUSTER_THRESHOLD,
            phantom_request_floor: DEFAULT_PHANTOM_REQUEST_FLOOR,
            server_phantom_limit: DEFAULT_SERVER_PHANTOM_LIMIT,
            max_rounds: DEFAULT_MAX_ROUNDS,
            users: Vec::new(),
        }
    }
}

impl SyncConfig {
    /// Parse configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    /// Load from the default location, falling back to defaults when absent.
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// `~/.config/artsync/config.toml` (platform equivalent)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("artsync").join("config.toml"))
    }

    fn validate(&self) -> Result<()> {
        if self.max_upload == 0 || self.max_download == 0 {
            return Err(SyncError::Config(
                "max-upload and max-download must be positive".to_string(),
            ));
        }
        if self.cluster_threshold == 0 {
            return Err(SyncError::Config(
                "cluster-threshold must be positive".to_string(),
            ));
        }
        if self.max_rounds == 0 {
            return Err(SyncError::Config("max-rounds must be positive".to_string()));
        }
        Ok(())
    }
}

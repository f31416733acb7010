//! Persisted peer address cache.
//!
//! A small JSON file (`.cache/SyncHandler/p2p-cache.json` by default) holding
//! `{name, address}` pairs learned at runtime, so a restarted node can dial
//! peers it met after its static configuration was written. The cache is
//! advisory and strictly best-effort: read errors behave like an empty cache,
//! write errors are logged and forgotten. Writes go through a temp file and
//! an atomic rename so a crash never leaves a torn file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One cached peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedPeer {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    peers: Vec<CachedPeer>,
}

/// Handle to the on-disk cache. Cheap to clone; writers are fire-and-forget.
#[derive(Debug, Clone)]
pub struct AddrCache {
    path: PathBuf,
}

impl AddrCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        AddrCache { path: path.into() }
    }

    /// The conventional location relative to the working directory.
    pub fn default_path() -> PathBuf {
        PathBuf::from(".cache/SyncHandler/p2p-cache.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all cached peers. Missing file is normal (first boot); anything
    /// else is logged and treated as empty.
    pub fn load(&self) -> Vec<CachedPeer> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                tracing::error!(path = %self.path.display(), "failed to read peer address cache: {e}");
                return Vec::new();
            }
        };
        match serde_json::from_str::<CacheFile>(&raw) {
            Ok(file) => file.peers,
            Err(e) => {
                tracing::error!(path = %self.path.display(), "peer address cache is corrupt, ignoring: {e}");
                Vec::new()
            }
        }
    }

    /// Replace the cache contents. Write-then-rename so a concurrent crash
    /// leaves either the old file or the new one, never a fragment.
    pub fn store(&self, peers: &[(String, String)]) {
        if let Err(e) = self.try_store(peers) {
            tracing::error!(path = %self.path.display(), "failed to write peer address cache: {e}");
        }
    }

    fn try_store(&self, peers: &[(String, String)]) -> io::Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = CacheFile {
            peers: peers
                .iter()
                .map(|(name, address)| CachedPeer {
                    name: name.clone(),
                    address: address.clone(),
                })
                .collect(),
        };
        let body = serde_json::to_string_pretty(&file)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

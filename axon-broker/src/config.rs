//! Broker configuration, loaded from `axon.toml` when present.

use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Where the broker listens; stale files are removed at startup.
    pub socket_path: PathBuf,
    /// Attached client processes, at most.
    pub max_connections: usize,
    /// Handle-table entries per process.
    pub max_handles: usize,
    /// Live objects, all types together.
    pub max_objects: usize,
    /// Pipe buffer size used when a creation request passes zero.
    pub pipe_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/axon-broker.sock"),
            max_connections: 64,
            max_handles: 4096,
            max_objects: 65536,
            pipe_capacity: 64 * 1024,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> std::io::Result<Config> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }
}

//! Sender configuration, loaded from TOML.
//!
//! ```toml
//! mnt_pt = "/mnt2/"
//! diff_tool = "/sbin/btrfs"
//! ack_timeout_secs = 60
//! trail_path = "/var/lib/snapsend/trails.json"
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ReplError, Result};
use crate::streaming::protocol::MAX_CHUNK_SIZE;
use crate::trail::FileTrailStore;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Mount point prefix for pools, concatenated as-is
    pub mnt_pt: String,
    /// Snapshot diff tool, invoked as `<diff_tool> send [-p <parent>] <snapshot>`
    pub diff_tool: PathBuf,
    /// btrfs binary used to create snapshots
    pub btrfs: PathBuf,
    pub ack_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Upper bound on one stdout read of the diff tool
    pub read_poll_ms: u64,
    /// Maximum bytes per data frame
    pub chunk_size: usize,
    /// Trail store document; defaults to the user data directory
    pub trail_path: Option<PathBuf>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mnt_pt: "/mnt2/".to_string(),
            diff_tool: PathBuf::from("/sbin/btrfs"),
            btrfs: PathBuf::from("/sbin/btrfs"),
            ack_timeout_secs: 60,
            connect_timeout_secs: 10,
            read_poll_ms: 100,
            chunk_size: 1024 * 1024,
            trail_path: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load `path`, or the default config file if it exists, or defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_path().filter(|p| p.exists()),
        };

        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(&path)?;
                Self::from_toml(&text).map_err(|source| ReplError::Toml { path, source })?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// ~/.config/snapsend/config.toml
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("snapsend").join("config.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.ack_timeout_secs == 0 {
            return Err(ReplError::Config("ack_timeout_secs must be > 0".to_string()));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ReplError::Config(
                "connect_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.read_poll_ms == 0 {
            return Err(ReplError::Config("read_poll_ms must be > 0".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(ReplError::Config("chunk_size must be > 0".to_string()));
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ReplError::Config(format!(
                "chunk_size must be <= {}",
                MAX_CHUNK_SIZE
            )));
        }
        Ok(())
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_poll_interval(&self) -> Duration {
        Duration::from_millis(self.read_poll_ms)
    }

    pub fn trail_path(&self) -> Result<PathBuf> {
        match &self.trail_path {
            Some(p) => Ok(p.clone()),
            None => FileTrailStore::default_path(),
        }
    }
}

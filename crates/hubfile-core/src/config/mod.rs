//! Configuration management for Hubfile.
//!
//! The engine reads a [`FileConfig`] snapshot; hosts usually load it from a
//! TOML file with a `[file]` table.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/hubfile/config.toml` |
//! | macOS | `~/Library/Application Support/Hubfile/config.toml` |
//! | Windows | `%APPDATA%\Hubfile\config.toml` |
//!
//! ## Example
//!
//! ```toml
//! [file]
//! base_dir = "/srv/shared"
//! max_concurrent = 8
//! incomplete_ttl = "30m"
//! auto_accept = true
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Largest accepted chunk size (16 MB).
pub const MAX_CHUNK_BYTES: usize = 16 * 1024 * 1024;

/// Default cursor advance that forces an ack (512 KB).
pub const DEFAULT_ACK_EVERY_BYTES: u64 = 512 * 1024;

/// Default time between acks.
pub const DEFAULT_ACK_EVERY: Duration = Duration::from_millis(500);

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// File transfer settings
    pub file: FileConfig,
}

/// File transfer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Root for served files and downloads
    pub base_dir: PathBuf,
    /// Largest accepted file, `0` for unlimited
    pub max_size_bytes: u64,
    /// Limit on send plus receive sessions
    pub max_concurrent: usize,
    /// Data frame body size
    pub chunk_bytes: usize,
    /// Age after which orphaned `.part` files are removed
    #[serde(with = "humantime_serde")]
    pub incomplete_ttl: Duration,
    /// Compute digests for pulls when the request does not say
    pub want_sha256: bool,
    /// Accept incoming offers without asking
    pub auto_accept: bool,
    /// Cursor advance that forces an ack
    #[serde(skip)]
    pub ack_every_bytes: u64,
    /// Time between acks
    #[serde(skip)]
    pub ack_every: Duration,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from(crate::DEFAULT_BASE_DIR),
            max_size_bytes: 0,
            max_concurrent: 4,
            chunk_bytes: crate::DEFAULT_CHUNK_BYTES,
            incomplete_ttl: Duration::from_secs(3600),
            want_sha256: true,
            auto_accept: false,
            ack_every_bytes: DEFAULT_ACK_EVERY_BYTES,
            ack_every: DEFAULT_ACK_EVERY,
        }
    }
}

impl FileConfig {
    /// Replace zero and blank values with their defaults.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.base_dir.as_os_str().to_string_lossy().trim().is_empty() {
            self.base_dir = defaults.base_dir;
        }
        if self.max_concurrent == 0 {
            self.max_concurrent = defaults.max_concurrent;
        }
        if self.chunk_bytes == 0 {
            self.chunk_bytes = defaults.chunk_bytes;
        }
        if self.incomplete_ttl.is_zero() {
            self.incomplete_ttl = defaults.incomplete_ttl;
        }
        if self.ack_every_bytes == 0 {
            self.ack_every_bytes = defaults.ack_every_bytes;
        }
        if self.ack_every.is_zero() {
            self.ack_every = defaults.ack_every;
        }
        self
    }

    /// Check values that cannot be fixed by normalization.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when `chunk_bytes` is above
    /// [`MAX_CHUNK_BYTES`].
    pub fn validate(&self) -> Result<()> {
        if self.chunk_bytes > MAX_CHUNK_BYTES {
            return Err(Error::InvalidConfig {
                key: "file.chunk_bytes".to_string(),
                reason: format!("must be at most {MAX_CHUNK_BYTES}"),
            });
        }
        Ok(())
    }

    /// Reorder buffer budget for one receive session.
    pub fn max_pending_bytes(&self) -> u64 {
        self.chunk_bytes as u64 * 8
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to defaults when absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read config: {e}")))?;

        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text and normalize it.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid configuration.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config: {e}")))?;
        config.file = config.file.normalized();
        config.file.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!("Failed to create config directory: {e}"))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| Error::ConfigError(format!("Failed to write config: {e}")))
    }

    /// Get the default configuration directory path.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "hubfile", "Hubfile")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the full path to the configuration file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        Self::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let s = s.trim();
        let (digits, scale) = if let Some(h) = s.strip_suffix('h') {
            (h, 3600)
        } else if let Some(m) = s.strip_suffix('m') {
            (m, 60)
        } else if let Some(secs) = s.strip_suffix('s') {
            (secs, 1)
        } else {
            return Err(serde::de::Error::custom("invalid duration format"));
        };
        let n = digits
            .trim()
            .parse::<u64>()
            .map_err(serde::de::Error::custom)?;
        n.checked_mul(scale)
            .map(Duration::from_secs)
            .ok_or_else(|| serde::de::Error::custom("duration out of range"))
    }
}

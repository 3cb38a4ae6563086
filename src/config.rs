//! Configuration for the proxy
//!
//! Every tunable has a default, so a missing file or a partial JSON document
//! is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::arena::{DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE};

/// Proxy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Setup arena sizing
    pub arena: ArenaConfig,
    /// Output pump buffers and shutdown
    pub pump: PumpConfig,
    /// Input write coalescing
    pub coalescer: CoalescerConfig,
    /// Shell used to run the command line (`<shell> -c <command>`)
    pub shell: String,
    /// Value of `TERM` in the child's environment
    pub term: String,
    /// Directory holding control sockets; `None` means `$XDG_RUNTIME_DIR` or the temp dir
    pub runtime_dir: Option<PathBuf>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            arena: ArenaConfig::default(),
            pump: PumpConfig::default(),
            coalescer: CoalescerConfig::default(),
            shell: "/bin/sh".to_string(),
            term: "xterm-256color".to_string(),
            runtime_dir: None,
        }
    }
}

/// Arena configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    /// Size of the first block in bytes
    pub initial_block_size: usize,
    /// Cap on grown blocks in bytes
    pub max_block_size: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            initial_block_size: DEFAULT_BLOCK_SIZE,
            max_block_size: MAX_BLOCK_SIZE,
        }
    }
}

/// Output pump configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpConfig {
    /// Size of each of the two read buffers
    pub buffer_size: usize,
    /// Bytes the in-process pending region holds before the pump waits
    pub pending_capacity: usize,
    /// Bound on waiting for the pump thread during teardown
    pub join_timeout_ms: u64,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            buffer_size: 128 * 1024,
            pending_capacity: 256 * 1024,
            join_timeout_ms: 2000,
        }
    }
}

impl PumpConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

/// Write coalescer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoalescerConfig {
    /// Ring buffer capacity (holds one byte less)
    pub capacity: usize,
    /// Buffered bytes that trigger an immediate flush
    pub flush_threshold: usize,
    /// Longest time a byte waits in the buffer
    pub flush_interval_ms: u64,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            capacity: 8 * 1024,
            flush_threshold: 4 * 1024,
            flush_interval_ms: 5,
        }
    }
}

impl CoalescerConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl ProxyConfig {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ProxyConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration from the default location or return the defaults
    pub fn load_or_default() -> Self {
        if let Some(config_dir) = dirs_config_path() {
            let config_path = config_dir.join("config.json");
            if config_path.exists() {
                match Self::load(&config_path) {
                    Ok(config) => return config,
                    Err(e) => tracing::warn!(path = %config_path.display(), "ignoring config: {}", e),
                }
            }
        }
        Self::default()
    }

    /// Check that sizes are usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.arena.initial_block_size == 0 || self.arena.max_block_size == 0 {
            return Err(ConfigError::Invalid("arena block sizes must be non-zero".into()));
        }
        if self.arena.initial_block_size > self.arena.max_block_size {
            return Err(ConfigError::Invalid(
                "arena.initial_block_size exceeds arena.max_block_size".into(),
            ));
        }
        if self.pump.buffer_size == 0 || self.pump.pending_capacity == 0 {
            return Err(ConfigError::Invalid("pump buffer sizes must be non-zero".into()));
        }
        if self.coalescer.capacity < 2 {
            return Err(ConfigError::Invalid("coalescer.capacity must be at least 2".into()));
        }
        if self.coalescer.flush_threshold == 0
            || self.coalescer.flush_threshold >= self.coalescer.capacity
        {
            return Err(ConfigError::Invalid(
                "coalescer.flush_threshold must be in 1..capacity".into(),
            ));
        }
        if self.shell.is_empty() {
            return Err(ConfigError::Invalid("shell must not be empty".into()));
        }
        Ok(())
    }

    /// Directory where control sockets live
    pub fn runtime_dir(&self) -> PathBuf {
        if let Some(dir) = &self.runtime_dir {
            return dir.clone();
        }
        std::env::var_os("XDG_RUNTIME_DIR")
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir)
    }
}

/// Get the configuration directory path
fn dirs_config_path() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".config").join("ptyproxy"))
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

//! Runtime configuration
//!
//! Every section has defaults, so an empty TOML document is a valid
//! configuration:
//!
//! ```toml
//! [broker]
//! keep_alive_interval_ms = 30000
//! sweep_interval_ms = 1000
//!
//! [cache]
//! page_size = 32768
//! page_pool_bytes = 4194304
//! ```

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub broker: BrokerConfig,
    pub cache: CacheConfig,
    pub http: HttpConfig,
    pub network: NetworkConfig,
    pub archive: ArchiveConfig,
}

/// Session broker timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Idle time after which a session is probed. 0 disables probing.
    pub keep_alive_interval_ms: u64,
    /// Period of the background sweep thread
    pub sweep_interval_ms: u64,
    /// Minimum spacing between two rate-limited sweeps
    pub min_service_interval_ms: u64,
    /// Start the background sweep thread on `init`
    pub background_sweep: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval_ms: 30_000,
            sweep_interval_ms: 1_000,
            min_service_interval_ms: 1_000,
            background_sweep: true,
        }
    }
}

impl BrokerConfig {
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn min_service_interval(&self) -> Duration {
        Duration::from_millis(self.min_service_interval_ms)
    }
}

/// Cached buffer tiers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Bytes per page on the paged tier
    pub page_size: usize,
    /// Entries larger than this try the paged tier first
    pub paged_threshold: u64,
    /// Capacity of the built-in page pool. 0 disables the paged tier.
    pub page_pool_bytes: u64,
    /// Attempts for a single page map before giving up
    pub map_retries: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            page_size: 32 * 1024,
            paged_threshold: 64 * 1024,
            page_pool_bytes: 0,
            map_retries: 3,
        }
    }
}

/// HTTP and WebDAV client settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_ms: u64,
    pub max_redirects: usize,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_redirects: 10,
            user_agent: format!("relayfs/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Socket-level timeouts shared by the hand-written protocol clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
    /// Datagram retries before a TNFS request fails
    pub tnfs_retries: u32,
    /// How long a pub/sub read waits for a message before returning empty
    pub poll_wait_ms: u64,
    /// How long one DNS-SD browse collects answers
    pub mdns_browse_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            io_timeout_ms: 10_000,
            tnfs_retries: 5,
            poll_wait_ms: 100,
            mdns_browse_ms: 1_500,
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn poll_wait(&self) -> Duration {
        Duration::from_millis(self.poll_wait_ms)
    }

    pub fn mdns_browse(&self) -> Duration {
        Duration::from_millis(self.mdns_browse_ms)
    }
}

/// Archive adapter settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Size of the read callback scratch buffer
    pub scratch_size: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self { scratch_size: 4096 }
    }
}

impl RelayConfig {
    /// Parse a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: RelayConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: RelayConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file, choosing the parser by extension (`.json` or TOML)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if is_json {
            Self::from_json_str(&text)
        } else {
            Self::from_toml_str(&text)
        }
    }

    /// Serialize as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }

    /// Reject settings that would make a component unusable
    pub fn validate(&self) -> Result<()> {
        if self.cache.page_size == 0 {
            return Err(RelayError::Config("cache.page_size must be non-zero".into()));
        }
        if self.archive.scratch_size == 0 {
            return Err(RelayError::Config(
                "archive.scratch_size must be non-zero".into(),
            ));
        }
        if self.broker.background_sweep && self.broker.sweep_interval_ms == 0 {
            return Err(RelayError::Config(
                "broker.sweep_interval_ms must be non-zero when the sweep thread is enabled".into(),
            ));
        }
        Ok(())
    }
}

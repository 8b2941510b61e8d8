//! Configuration for mailsync

use crate::types::{CheckpointMode, IdentityScheme, TraversalOrder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Synchronization switches shared by every channel
    #[serde(default)]
    pub sync: SyncOptions,

    /// Stores by name
    #[serde(default)]
    pub stores: BTreeMap<String, StoreConfig>,

    /// Channels by name
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// Synchronization switches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Expunge both sides after applying removals
    #[serde(default = "default_true")]
    pub expunge: bool,

    /// Flag duplicate messages within a mailbox for removal
    #[serde(default = "default_true")]
    pub expunge_duplicates: bool,

    /// Classify and report without mutating anything
    #[serde(default)]
    pub simulate: bool,

    /// Delete mailboxes left without messages
    #[serde(default)]
    pub delete_empty_mailboxes: bool,

    /// Copy messages already flagged deleted
    #[serde(default)]
    pub copy_deleted_messages: bool,

    /// Log every repair made to a malformed Message-ID
    #[serde(default)]
    pub report_malformed_ids: bool,

    /// Print one line per message
    #[serde(default)]
    pub show_messages: bool,

    /// Include the identity in per-message lines
    #[serde(default)]
    pub show_message_ids: bool,

    /// Mailbox traversal order
    #[serde(default)]
    pub traversal: TraversalOrder,

    /// When the checkpoint is rewritten
    #[serde(default)]
    pub checkpoint_mode: CheckpointMode,

    /// Upper bound for a single store call, in seconds
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            expunge: true,
            expunge_duplicates: true,
            simulate: false,
            delete_empty_mailboxes: false,
            copy_deleted_messages: false,
            report_malformed_ids: false,
            show_messages: false,
            show_message_ids: false,
            traversal: TraversalOrder::default(),
            checkpoint_mode: CheckpointMode::default(),
            call_timeout_secs: default_call_timeout(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_call_timeout() -> u64 {
    120
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Driver: "local" or "imap"
    #[serde(default = "default_store_driver")]
    pub driver: String,

    /// Root directory (local driver)
    pub path: Option<PathBuf>,

    /// Server address; its presence marks the store as network-reached
    pub server: Option<String>,

    /// Namespace prefix prepended to every mailbox name
    #[serde(default)]
    pub prefix: String,

    /// Reference name used when listing
    #[serde(default)]
    pub reference: String,

    /// Pattern selecting the mailbox subset
    #[serde(default = "default_store_pattern")]
    pub pattern: String,

    /// Native hierarchy delimiter (local driver)
    pub delimiter: Option<char>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            driver: default_store_driver(),
            path: None,
            server: None,
            prefix: String::new(),
            reference: String::new(),
            pattern: default_store_pattern(),
            delimiter: None,
        }
    }
}

impl StoreConfig {
    /// Whether the store is reached over a network connection
    pub fn is_remote(&self) -> bool {
        self.server.is_some()
    }
}

fn default_store_driver() -> String {
    "local".to_string()
}

fn default_store_pattern() -> String {
    "*".to_string()
}

/// Channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub store_a: String,
    pub store_b: String,

    /// Where the checkpoint records live
    pub checkpoint: CheckpointConfig,

    /// Messages larger than this many bytes are skipped
    pub size_limit: Option<u64>,

    /// Identity scheme
    #[serde(default)]
    pub identity: IdentityScheme,
}

/// Checkpoint location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Store holding the checkpoint mailbox
    pub store: String,

    /// Checkpoint mailbox name
    #[serde(default = "default_checkpoint_mailbox")]
    pub mailbox: String,
}

fn default_checkpoint_mailbox() -> String {
    "msinfo".to_string()
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default locations
    pub fn load() -> crate::Result<Self> {
        let mut paths = vec![PathBuf::from("./mailsync.toml")];
        if let Some(home) = std::env::var_os("HOME") {
            paths.push(PathBuf::from(home).join(".config/mailsync/config.toml"));
        }
        paths.push(PathBuf::from("/etc/mailsync/config.toml"));

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Err(crate::Error::Config(
            "No configuration file found".to_string(),
        ))
    }

    /// Check that every channel references declared stores
    pub fn validate(&self) -> crate::Result<()> {
        for (name, channel) in &self.channels {
            for store in [&channel.store_a, &channel.store_b, &channel.checkpoint.store] {
                if !self.stores.contains_key(store) {
                    return Err(crate::Error::Config(format!(
                        "Channel {} references unknown store {}",
                        name, store
                    )));
                }
            }
            if channel.store_a == channel.store_b {
                return Err(crate::Error::Config(format!(
                    "Channel {} pairs store {} with itself",
                    name, channel.store_a
                )));
            }
        }
        for (name, store) in &self.stores {
            if store.driver == "local" && store.path.is_none() {
                return Err(crate::Error::Config(format!(
                    "Store {} uses the local driver but has no path",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Look up a channel by name
    pub fn channel(&self, name: &str) -> Option<&ChannelConfig> {
        self.channels.get(name)
    }

    /// Look up a store by name
    pub fn store(&self, name: &str) -> Option<&StoreConfig> {
        self.stores.get(name)
    }
}

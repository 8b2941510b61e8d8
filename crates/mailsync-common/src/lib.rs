//! mailsync common - Shared types and utilities
//!
//! This crate provides the configuration model, the error taxonomy and
//! the value types shared across all mailsync components.

pub mod config;
pub mod error;
pub mod types;

pub use config::{ChannelConfig, CheckpointConfig, Config, StoreConfig, SyncOptions};
pub use error::{Error, Result, Severity};

//! mailsync storage - Mail store abstraction
//!
//! This crate defines the contract every replica implements and provides
//! the local directory-backed driver.

pub mod local;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod message;
pub mod store;

pub use local::LocalStore;
pub use message::MessageMetadata;
pub use store::{create_store, ListedMailbox, MailStore, MailboxHandle, OpenMode, Position};

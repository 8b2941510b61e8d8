//! Mail store abstraction
//!
//! A [`MailStore`] is one replica of a channel. Backends speak in native
//! mailbox names (prefix included, native hierarchy delimiter); the
//! canonical naming layer lives above this trait.
//!
//! Messages are addressed by [`Position`]s handed out by an open
//! [`MailboxHandle`]. A position carries the generation of the mailbox it
//! was taken from, and every backend refuses positions from an older
//! generation with [`Error::StalePosition`] once an expunge renumbered the
//! mailbox.

use crate::message::MessageMetadata;
use async_trait::async_trait;
use mailsync_common::types::{MailboxAttributes, MessageFlags, Timestamp};
use mailsync_common::{Error, Result, StoreConfig};

/// How a mailbox is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// A mailbox as reported by a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedMailbox {
    /// Native full name
    pub name: String,
    /// Native hierarchy delimiter, `None` for a flat namespace
    pub delimiter: Option<char>,
    pub attributes: MailboxAttributes,
}

/// Message position, valid only within one mailbox generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Position {
    generation: u64,
    seq: u32,
}

impl Position {
    /// 1-based sequence number
    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.seq)
    }
}

/// An open mailbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxHandle {
    id: u64,
    mailbox: String,
    mode: OpenMode,
    generation: u64,
    exists: u32,
}

impl MailboxHandle {
    /// Create a handle; called by backends when a mailbox is opened
    pub fn new(id: u64, mailbox: &str, mode: OpenMode, generation: u64, exists: u32) -> Self {
        Self {
            id,
            mailbox: mailbox.to_string(),
            mode,
            generation,
            exists,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Native mailbox name
    pub fn mailbox(&self) -> &str {
        &self.mailbox
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of messages when the handle was opened or last expunged
    pub fn exists(&self) -> u32 {
        self.exists
    }

    /// Position for a 1-based sequence number
    pub fn position(&self, seq: u32) -> Option<Position> {
        if seq == 0 || seq > self.exists {
            return None;
        }
        Some(Position {
            generation: self.generation,
            seq,
        })
    }

    /// All positions in store order
    pub fn positions(&self) -> impl Iterator<Item = Position> + '_ {
        (1..=self.exists).map(move |seq| Position {
            generation: self.generation,
            seq,
        })
    }

    /// Record a renumbering; every earlier position becomes stale
    pub fn renumber(&mut self, generation: u64, exists: u32) {
        self.generation = generation;
        self.exists = exists;
    }

    /// Validate a position against this handle and the mailbox's current generation
    pub fn check(&self, position: Position, current_generation: u64) -> Result<()> {
        if position.generation != self.generation || self.generation != current_generation {
            return Err(Error::StalePosition(format!(
                "{} position {} belongs to generation {}, mailbox is at {}",
                self.mailbox, position.seq, position.generation, current_generation
            )));
        }
        if position.seq == 0 || position.seq > self.exists {
            return Err(Error::NotFound(format!(
                "{} has no message {}",
                self.mailbox, position.seq
            )));
        }
        Ok(())
    }
}

/// One replica
#[async_trait]
pub trait MailStore: Send + Sync {
    /// Store name
    fn name(&self) -> &str;

    /// Whether the store is reached over a network connection
    fn is_remote(&self) -> bool;

    /// Establish the connection
    async fn connect(&self) -> Result<()>;

    /// List mailboxes matching an IMAP-style pattern under a reference
    async fn list_mailboxes(&self, reference: &str, pattern: &str) -> Result<Vec<ListedMailbox>>;

    /// Discover the native hierarchy delimiter; `None` for a flat namespace
    async fn resolve_delimiter(&self) -> Result<Option<char>>;

    /// Open a mailbox
    async fn open_mailbox(&self, mailbox: &str, mode: OpenMode) -> Result<MailboxHandle>;

    /// Keep the connection but deselect any mailbox; open handles become unusable
    async fn open_half(&self) -> Result<()>;

    /// Create a mailbox; succeeds when it already exists
    async fn create_mailbox(&self, mailbox: &str) -> Result<bool>;

    /// Delete a mailbox
    async fn delete_mailbox(&self, mailbox: &str) -> Result<bool>;

    /// Fetch header metadata, size and flags
    async fn fetch_metadata(
        &self,
        handle: &MailboxHandle,
        position: Position,
    ) -> Result<MessageMetadata>;

    /// Fetch the full message
    async fn fetch_raw(&self, handle: &MailboxHandle, position: Position) -> Result<Vec<u8>>;

    /// Append a message to a mailbox addressed by name
    async fn append_message(
        &self,
        mailbox: &str,
        flags: MessageFlags,
        internal_date: Option<Timestamp>,
        raw: &[u8],
    ) -> Result<bool>;

    /// Set the deleted flag
    async fn flag_deleted(&self, handle: &MailboxHandle, position: Position) -> Result<bool>;

    /// Remove deleted messages; renumbers the handle
    async fn expunge(&self, handle: &mut MailboxHandle) -> Result<u32>;

    /// Close a handle
    async fn close(&self, handle: MailboxHandle) -> Result<()>;
}

/// Create a store backend from configuration
pub fn create_store(name: &str, config: &StoreConfig) -> Result<Box<dyn MailStore>> {
    match config.driver.as_str() {
        "local" => Ok(Box::new(crate::local::LocalStore::new(name, config)?)),
        "imap" => {
            // The protocol client is supplied by an external crate
            Err(Error::Config(format!(
                "Store {}: the imap driver needs an external protocol client",
                name
            )))
        }
        other => Err(Error::Config(format!(
            "Unsupported store driver: {}",
            other
        ))),
    }
}

/// Translate an IMAP list pattern into an anchored regex
pub fn pattern_regex(pattern: &str, delimiter: Option<char>) -> Result<regex::Regex> {
    let mut expr = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '%' => match delimiter {
                Some(d) => {
                    expr.push_str("[^");
                    expr.push_str(&regex::escape(&d.to_string()));
                    expr.push_str("]*");
                }
                None => expr.push_str(".*"),
            },
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    regex::Regex::new(&expr)
        .map_err(|e| Error::Protocol(format!("Invalid mailbox pattern {}: {}", pattern, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_positions() {
        let handle = MailboxHandle::new(1, "INBOX", OpenMode::ReadOnly, 3, 4);
        let seqs: Vec<u32> = handle.positions().map(|p| p.seq()).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
        assert!(handle.position(0).is_none());
        assert!(handle.position(5).is_none());
        assert_eq!(handle.position(2).unwrap().generation(), 3);
    }

    #[test]
    fn test_stale_position_after_renumber() {
        let mut handle = MailboxHandle::new(1, "INBOX", OpenMode::ReadWrite, 0, 3);
        let pos = handle.position(2).unwrap();
        assert!(handle.check(pos, 0).is_ok());

        handle.renumber(1, 2);
        assert!(matches!(handle.check(pos, 1), Err(Error::StalePosition(_))));
        assert!(handle.check(handle.position(2).unwrap(), 1).is_ok());
    }

    #[test]
    fn test_stale_when_mailbox_moved_on() {
        let handle = MailboxHandle::new(1, "INBOX", OpenMode::ReadOnly, 0, 3);
        let pos = handle.position(1).unwrap();
        // another handle expunged the mailbox
        assert!(matches!(handle.check(pos, 1), Err(Error::StalePosition(_))));
    }

    #[test]
    fn test_pattern_regex() {
        let re = pattern_regex("*", Some('.')).unwrap();
        assert!(re.is_match("INBOX.Sent"));

        let re = pattern_regex("INBOX.%", Some('.')).unwrap();
        assert!(re.is_match("INBOX.Sent"));
        assert!(!re.is_match("INBOX.Sent.2024"));
        assert!(!re.is_match("INBOXxSent"));

        let re = pattern_regex("work", None).unwrap();
        assert!(re.is_match("work"));
        assert!(!re.is_match("work2"));
    }

    #[test]
    fn test_create_store_drivers() {
        let config = StoreConfig {
            driver: "imap".to_string(),
            ..Default::default()
        };
        assert!(matches!(create_store("r", &config), Err(Error::Config(_))));

        let config = StoreConfig {
            driver: "maildir".to_string(),
            ..Default::default()
        };
        let err = create_store("r", &config).err().unwrap();
        assert!(err.to_string().contains("Unsupported store driver"));
    }
}

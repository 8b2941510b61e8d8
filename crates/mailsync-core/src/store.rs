//! Store wrapper
//!
//! Wraps a [`MailStore`] backend with the per-store naming rules: mailbox
//! names inside the engine are canonical (hierarchy delimiter `/`, no
//! prefix) and are translated to native full names at this boundary.
//! Every backend call is bounded by the configured call timeout.

use mailsync_common::types::{MailboxAttributes, MessageFlags, Timestamp, DEFAULT_DELIMITER};
use mailsync_common::{Error, Result, StoreConfig};
use mailsync_storage::{create_store, MailStore, MailboxHandle, MessageMetadata, OpenMode, Position};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Native hierarchy delimiter of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HierarchyDelimiter {
    /// Not probed yet
    Unresolved,
    /// The store has no hierarchy
    Flat,
    Char(char),
}

/// A configured replica
pub struct Store {
    name: String,
    prefix: String,
    reference: String,
    pattern: String,
    remote: bool,
    delimiter: HierarchyDelimiter,
    mailboxes: BTreeMap<String, MailboxAttributes>,
    backend: Box<dyn MailStore>,
    call_timeout: Duration,
}

impl Store {
    /// Wrap an existing backend
    pub fn new(
        name: &str,
        config: &StoreConfig,
        backend: Box<dyn MailStore>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            name: name.to_string(),
            prefix: config.prefix.clone(),
            reference: config.reference.clone(),
            pattern: config.pattern.clone(),
            remote: config.is_remote() || backend.is_remote(),
            delimiter: HierarchyDelimiter::Unresolved,
            mailboxes: BTreeMap::new(),
            backend,
            call_timeout,
        }
    }

    /// Build the backend from configuration
    pub fn from_config(name: &str, config: &StoreConfig, call_timeout: Duration) -> Result<Self> {
        let backend = create_store(name, config)?;
        Ok(Self::new(name, config, backend, call_timeout))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the store is reached over a network connection
    pub fn is_remote(&self) -> bool {
        self.remote
    }

    pub fn delimiter(&self) -> HierarchyDelimiter {
        self.delimiter
    }

    /// Mailboxes found by the last listing, by canonical name
    pub fn mailboxes(&self) -> &BTreeMap<String, MailboxAttributes> {
        &self.mailboxes
    }

    pub fn contains(&self, mailbox: &str) -> bool {
        self.mailboxes.contains_key(mailbox)
    }

    /// Forget a mailbox from the listing
    pub fn forget(&mut self, mailbox: &str) {
        self.mailboxes.remove(mailbox);
    }

    async fn bounded<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "{}: {} did not complete within {}s",
                self.name,
                op,
                self.call_timeout.as_secs()
            ))),
        }
    }

    /// Open the connection
    pub async fn connect(&self) -> Result<()> {
        debug!(store = %self.name, "connect");
        self.bounded("connect", self.backend.connect())
            .await
            .map_err(|e| match e {
                Error::Timeout(msg) => Error::Connection(msg),
                other => other,
            })
    }

    /// Probe the native delimiter once per run
    pub async fn resolve_delimiter(&mut self) -> Result<HierarchyDelimiter> {
        if self.delimiter == HierarchyDelimiter::Unresolved {
            let probed = self
                .bounded("resolve delimiter", self.backend.resolve_delimiter())
                .await?;
            self.delimiter = match probed {
                Some(c) => HierarchyDelimiter::Char(c),
                None => HierarchyDelimiter::Flat,
            };
            debug!(store = %self.name, delimiter = ?self.delimiter, "Resolved hierarchy delimiter");
        }
        Ok(self.delimiter)
    }

    /// List the store's mailboxes and remember them by canonical name
    pub async fn acquire_mailbox_list(&mut self) -> Result<&BTreeMap<String, MailboxAttributes>> {
        self.resolve_delimiter().await?;

        let pattern = format!("{}{}", self.prefix, self.pattern);
        let listed = self
            .bounded(
                "list",
                self.backend.list_mailboxes(&self.reference, &pattern),
            )
            .await?;

        self.mailboxes.clear();
        for mailbox in listed {
            if let Some(name) = self.canonical_name(&mailbox.name) {
                self.mailboxes.insert(name, mailbox.attributes);
            }
        }
        debug!(store = %self.name, count = self.mailboxes.len(), "Acquired mailbox list");
        Ok(&self.mailboxes)
    }

    /// Native full name for a canonical name
    pub fn full_mailbox_name(&self, mailbox: &str) -> String {
        let native = match self.delimiter {
            HierarchyDelimiter::Char(c) if c != DEFAULT_DELIMITER => {
                mailbox.replace(DEFAULT_DELIMITER, &c.to_string())
            }
            _ => mailbox.to_string(),
        };
        format!("{}{}", self.prefix, native)
    }

    /// Canonical name for a listed native name; `None` when it cannot be represented
    pub fn canonical_name(&self, native: &str) -> Option<String> {
        let mut name = native;
        if name.starts_with('{') {
            if let Some(end) = name.find('}') {
                name = &name[end + 1..];
            }
        }
        name = name.strip_prefix(self.prefix.as_str()).unwrap_or(name);

        let canonical = match self.delimiter {
            HierarchyDelimiter::Char(DEFAULT_DELIMITER) => name.to_string(),
            HierarchyDelimiter::Char(c) => {
                if name.contains(DEFAULT_DELIMITER) {
                    warn!(
                        "{}: mailbox {} contains '{}' which is not the store's delimiter, skipping",
                        self.name, native, DEFAULT_DELIMITER
                    );
                    return None;
                }
                name.replace(c, &DEFAULT_DELIMITER.to_string())
            }
            HierarchyDelimiter::Flat | HierarchyDelimiter::Unresolved => {
                if name.contains(DEFAULT_DELIMITER) {
                    warn!(
                        "{}: mailbox {} contains '{}' in a flat namespace, skipping",
                        self.name, native, DEFAULT_DELIMITER
                    );
                    return None;
                }
                name.to_string()
            }
        };

        if canonical.starts_with('<') {
            warn!("{}: mailbox {} starts with '<', skipping", self.name, native);
            return None;
        }
        Some(canonical)
    }

    pub async fn open(&self, mailbox: &str, mode: OpenMode) -> Result<MailboxHandle> {
        let native = self.full_mailbox_name(mailbox);
        debug!(store = %self.name, mailbox = %native, ?mode, "open");
        self.bounded("open", self.backend.open_mailbox(&native, mode))
            .await
    }

    /// Deselect the current mailbox, keeping the connection
    pub async fn open_half(&self) -> Result<()> {
        debug!(store = %self.name, "open half");
        self.bounded("open half", self.backend.open_half()).await
    }

    /// Create a mailbox and add it to the listing
    pub async fn create(&mut self, mailbox: &str) -> Result<bool> {
        let native = self.full_mailbox_name(mailbox);
        let created = self
            .bounded("create", self.backend.create_mailbox(&native))
            .await?;
        if created {
            self.mailboxes
                .insert(mailbox.to_string(), MailboxAttributes::default());
        }
        Ok(created)
    }

    /// Delete a mailbox and drop it from the listing
    pub async fn delete(&mut self, mailbox: &str) -> Result<bool> {
        let native = self.full_mailbox_name(mailbox);
        let deleted = self
            .bounded("delete", self.backend.delete_mailbox(&native))
            .await?;
        if deleted {
            self.mailboxes.remove(mailbox);
        }
        Ok(deleted)
    }

    pub async fn fetch_metadata(
        &self,
        handle: &MailboxHandle,
        position: Position,
    ) -> Result<MessageMetadata> {
        self.bounded("fetch", self.backend.fetch_metadata(handle, position))
            .await
    }

    pub async fn fetch_raw(&self, handle: &MailboxHandle, position: Position) -> Result<Vec<u8>> {
        self.bounded("fetch body", self.backend.fetch_raw(handle, position))
            .await
    }

    /// Append to a mailbox addressed by canonical name
    pub async fn append(
        &self,
        mailbox: &str,
        flags: MessageFlags,
        internal_date: Option<Timestamp>,
        raw: &[u8],
    ) -> Result<bool> {
        let native = self.full_mailbox_name(mailbox);
        self.bounded(
            "append",
            self.backend
                .append_message(&native, flags, internal_date, raw),
        )
        .await
    }

    pub async fn flag_deleted(&self, handle: &MailboxHandle, position: Position) -> Result<bool> {
        self.bounded("flag deleted", self.backend.flag_deleted(handle, position))
            .await
    }

    pub async fn expunge(&self, handle: &mut MailboxHandle) -> Result<u32> {
        self.bounded("expunge", self.backend.expunge(handle)).await
    }

    pub async fn close(&self, handle: MailboxHandle) -> Result<()> {
        self.bounded("close", self.backend.close(handle)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailsync_storage::memory::MemoryStore;
    use pretty_assertions::assert_eq;

    fn wrap(backend: MemoryStore, prefix: &str) -> Store {
        let config = StoreConfig {
            prefix: prefix.to_string(),
            ..Default::default()
        };
        Store::new("test", &config, Box::new(backend), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_name_translation() {
        let backend = MemoryStore::new("m").with_delimiter(Some('.'));
        let mut store = wrap(backend, "INBOX.");
        store.resolve_delimiter().await.unwrap();

        assert_eq!(store.full_mailbox_name("work/2024"), "INBOX.work.2024");
        assert_eq!(store.full_mailbox_name(""), "INBOX.");
        assert_eq!(
            store.canonical_name("{imap.example.org}INBOX.work.2024").as_deref(),
            Some("work/2024")
        );
        assert_eq!(store.canonical_name("INBOX.a/b"), None);
        assert_eq!(store.canonical_name("INBOX.<odd"), None);
    }

    #[tokio::test]
    async fn test_flat_namespace() {
        let backend = MemoryStore::new("m").with_delimiter(None);
        let mut store = wrap(backend, "");
        assert_eq!(
            store.resolve_delimiter().await.unwrap(),
            HierarchyDelimiter::Flat
        );
        assert_eq!(store.full_mailbox_name("work"), "work");
        assert_eq!(store.canonical_name("a/b"), None);
    }

    #[tokio::test]
    async fn test_acquire_mailbox_list() {
        let backend = MemoryStore::new("m");
        backend.add_mailbox("INBOX.Sent");
        backend.add_mailbox("INBOX.Sent.2024");
        backend.add_noselect_mailbox("INBOX.Folders");
        backend.add_mailbox("Other");
        let mut store = wrap(backend, "INBOX.");
        store.connect().await.unwrap();

        let names: Vec<String> = store
            .acquire_mailbox_list()
            .await
            .unwrap()
            .keys()
            .cloned()
            .collect();
        assert_eq!(names, vec!["Folders", "Sent", "Sent/2024"]);
        assert!(store.mailboxes()["Folders"].no_select);
    }

    #[tokio::test]
    async fn test_create_registers_mailbox() {
        let backend = MemoryStore::new("m");
        let mut store = wrap(backend.clone(), "");
        store.connect().await.unwrap();
        store.resolve_delimiter().await.unwrap();

        assert!(store.create("a/b").await.unwrap());
        assert!(store.contains("a/b"));
        assert_eq!(backend.mailbox_names(), vec!["a.b"]);
    }
}

//! Local directory-backed mail store
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/<native mailbox name>/index.json   order, flags, internal dates
//! <root>/<native mailbox name>/<uuid>.eml   one file per message
//! <root>/<native mailbox name>/.noselect    marks a non-selectable mailbox
//! ```
//!
//! The hierarchy is flat on disk: `INBOX.Sent` is a sibling directory of
//! `INBOX`, the delimiter only lives in the name.

use crate::message::MessageMetadata;
use crate::store::{pattern_regex, ListedMailbox, MailStore, MailboxHandle, OpenMode, Position};
use async_trait::async_trait;
use mailsync_common::types::{MailboxAttributes, MessageFlags, Timestamp};
use mailsync_common::{Error, Result, StoreConfig};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

const INDEX_FILE: &str = "index.json";
const NOSELECT_MARKER: &str = ".noselect";

/// Default native delimiter of the local driver
pub const LOCAL_DELIMITER: char = '.';

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    file: String,
    #[serde(default)]
    flags: MessageFlags,
    internal_date: Option<Timestamp>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MailboxIndex {
    entries: Vec<IndexEntry>,
}

#[derive(Debug, Default)]
struct LocalState {
    connected: bool,
    next_handle: u64,
    generations: HashMap<String, u64>,
    open: HashSet<u64>,
}

/// Local filesystem store
pub struct LocalStore {
    name: String,
    root: PathBuf,
    delimiter: char,
    remote: bool,
    state: Mutex<LocalState>,
}

impl LocalStore {
    /// Create a local store from configuration
    pub fn new(name: &str, config: &StoreConfig) -> Result<Self> {
        let root = config.path.as_ref().ok_or_else(|| {
            Error::Config(format!("Store {}: local driver requires a path", name))
        })?;
        let mut store = Self::from_path(name, root)?;
        if let Some(delimiter) = config.delimiter {
            if delimiter == '/' || delimiter == '\\' {
                return Err(Error::Config(format!(
                    "Store {}: '{}' cannot be used as a local delimiter",
                    name, delimiter
                )));
            }
            store.delimiter = delimiter;
        }
        store.remote = config.is_remote();
        Ok(store)
    }

    /// Create a local store rooted at a path
    pub fn from_path(name: &str, path: &Path) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            root: path.to_path_buf(),
            delimiter: LOCAL_DELIMITER,
            remote: false,
            state: Mutex::new(LocalState::default()),
        })
    }

    /// Directory for a native mailbox name, with path traversal protection
    fn mailbox_dir(&self, mailbox: &str) -> Result<PathBuf> {
        if mailbox.is_empty() {
            return Err(Error::NotFound("Empty mailbox name".to_string()));
        }
        if mailbox.contains("..") {
            return Err(Error::Storage(
                "Path traversal detected: '..' is not allowed".to_string(),
            ));
        }
        if mailbox.contains('/') || mailbox.contains('\\') {
            return Err(Error::Storage(format!(
                "Mailbox name {} contains a path separator",
                mailbox
            )));
        }
        if mailbox.starts_with('.') {
            return Err(Error::Storage(format!(
                "Mailbox name {} must not start with '.'",
                mailbox
            )));
        }
        Ok(self.root.join(mailbox))
    }

    async fn load_index(dir: &Path) -> Result<MailboxIndex> {
        let path = dir.join(INDEX_FILE);
        match fs::read(&path).await {
            Ok(data) => serde_json::from_slice(&data)
                .map_err(|e| Error::Storage(format!("Failed to parse {}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(MailboxIndex::default()),
            Err(e) => Err(Error::Storage(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn save_index(dir: &Path, index: &MailboxIndex) -> Result<()> {
        let data = serde_json::to_vec_pretty(index)
            .map_err(|e| Error::Storage(format!("Failed to serialize index: {}", e)))?;
        let tmp = dir.join(format!("{}.tmp", INDEX_FILE));
        fs::write(&tmp, data)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write index: {}", e)))?;
        fs::rename(&tmp, dir.join(INDEX_FILE))
            .await
            .map_err(|e| Error::Storage(format!("Failed to replace index: {}", e)))?;
        Ok(())
    }

    fn ensure_connected(&self, state: &LocalState) -> Result<()> {
        if !state.connected {
            return Err(Error::Connection(format!("Store {} is not connected", self.name)));
        }
        Ok(())
    }

    /// Validate a handle and position; returns the mailbox directory
    fn check_position(
        &self,
        state: &LocalState,
        handle: &MailboxHandle,
        position: Position,
    ) -> Result<PathBuf> {
        if !state.open.contains(&handle.id()) {
            return Err(Error::StalePosition(format!(
                "{} handle {} is closed",
                handle.mailbox(),
                handle.id()
            )));
        }
        let generation = state
            .generations
            .get(handle.mailbox())
            .copied()
            .unwrap_or_default();
        handle.check(position, generation)?;
        self.mailbox_dir(handle.mailbox())
    }

    /// Mark a mailbox as non-selectable
    pub async fn mark_noselect(&self, mailbox: &str) -> Result<()> {
        let dir = self.mailbox_dir(mailbox)?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Storage(format!("Failed to create directory: {}", e)))?;
        fs::write(dir.join(NOSELECT_MARKER), b"")
            .await
            .map_err(|e| Error::Storage(format!("Failed to write marker: {}", e)))
    }
}

#[async_trait]
impl MailStore for LocalStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_remote(&self) -> bool {
        self.remote
    }

    async fn connect(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await.map_err(|e| {
            Error::Connection(format!(
                "Failed to open store directory {}: {}",
                self.root.display(),
                e
            ))
        })?;
        let mut state = self.state.lock().await;
        state.connected = true;
        info!(store = %self.name, path = %self.root.display(), "Opened local store");
        Ok(())
    }

    async fn list_mailboxes(&self, reference: &str, pattern: &str) -> Result<Vec<ListedMailbox>> {
        {
            let state = self.state.lock().await;
            self.ensure_connected(&state)?;
        }
        let matcher = pattern_regex(&format!("{}{}", reference, pattern), Some(self.delimiter))?;

        let mut dir = fs::read_dir(&self.root)
            .await
            .map_err(|e| Error::Storage(format!("Failed to read store directory: {}", e)))?;
        let mut listed = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| Error::Storage(format!("Failed to read store directory: {}", e)))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if !is_dir {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') || !matcher.is_match(&name) {
                continue;
            }
            let no_select = fs::try_exists(entry.path().join(NOSELECT_MARKER))
                .await
                .unwrap_or(false);
            listed.push(ListedMailbox {
                name,
                delimiter: Some(self.delimiter),
                attributes: MailboxAttributes {
                    no_select,
                    no_inferiors: false,
                },
            });
        }
        listed.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(store = %self.name, pattern = %pattern, count = listed.len(), "Listed mailboxes");
        Ok(listed)
    }

    async fn resolve_delimiter(&self) -> Result<Option<char>> {
        Ok(Some(self.delimiter))
    }

    async fn open_mailbox(&self, mailbox: &str, mode: OpenMode) -> Result<MailboxHandle> {
        let dir = self.mailbox_dir(mailbox)?;
        let mut state = self.state.lock().await;
        self.ensure_connected(&state)?;

        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(Error::NotFound(format!("Mailbox {} does not exist", mailbox)));
        }
        if fs::try_exists(dir.join(NOSELECT_MARKER)).await.unwrap_or(false) {
            return Err(Error::NotFound(format!("Mailbox {} is not selectable", mailbox)));
        }

        let index = Self::load_index(&dir).await?;
        state.next_handle += 1;
        let id = state.next_handle;
        state.open.insert(id);
        let generation = state.generations.get(mailbox).copied().unwrap_or_default();

        debug!(store = %self.name, mailbox = %mailbox, ?mode, exists = index.entries.len(), "Opened mailbox");
        Ok(MailboxHandle::new(
            id,
            mailbox,
            mode,
            generation,
            index.entries.len() as u32,
        ))
    }

    async fn open_half(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_connected(&state)?;
        state.open.clear();
        Ok(())
    }

    async fn create_mailbox(&self, mailbox: &str) -> Result<bool> {
        let dir = self.mailbox_dir(mailbox)?;
        {
            let state = self.state.lock().await;
            self.ensure_connected(&state)?;
        }
        if fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(true);
        }
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Storage(format!("Failed to create mailbox {}: {}", mailbox, e)))?;
        Self::save_index(&dir, &MailboxIndex::default()).await?;
        info!(store = %self.name, mailbox = %mailbox, "Created mailbox");
        Ok(true)
    }

    async fn delete_mailbox(&self, mailbox: &str) -> Result<bool> {
        let dir = self.mailbox_dir(mailbox)?;
        let mut state = self.state.lock().await;
        self.ensure_connected(&state)?;
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(false);
        }
        fs::remove_dir_all(&dir)
            .await
            .map_err(|e| Error::Storage(format!("Failed to delete mailbox {}: {}", mailbox, e)))?;
        state.generations.remove(mailbox);
        info!(store = %self.name, mailbox = %mailbox, "Deleted mailbox");
        Ok(true)
    }

    async fn fetch_metadata(
        &self,
        handle: &MailboxHandle,
        position: Position,
    ) -> Result<MessageMetadata> {
        let state = self.state.lock().await;
        let dir = self.check_position(&state, handle, position)?;
        let index = Self::load_index(&dir).await?;
        let entry = index
            .entries
            .get(position.seq() as usize - 1)
            .ok_or_else(|| {
                Error::NotFound(format!("{} has no message {}", handle.mailbox(), position))
            })?;
        let raw = fs::read(dir.join(&entry.file))
            .await
            .map_err(|e| Error::Storage(format!("Failed to read message: {}", e)))?;
        Ok(MessageMetadata::parse(&raw, entry.flags, entry.internal_date))
    }

    async fn fetch_raw(&self, handle: &MailboxHandle, position: Position) -> Result<Vec<u8>> {
        let state = self.state.lock().await;
        let dir = self.check_position(&state, handle, position)?;
        let index = Self::load_index(&dir).await?;
        let entry = index
            .entries
            .get(position.seq() as usize - 1)
            .ok_or_else(|| {
                Error::NotFound(format!("{} has no message {}", handle.mailbox(), position))
            })?;
        fs::read(dir.join(&entry.file))
            .await
            .map_err(|e| Error::Storage(format!("Failed to read message: {}", e)))
    }

    async fn append_message(
        &self,
        mailbox: &str,
        flags: MessageFlags,
        internal_date: Option<Timestamp>,
        raw: &[u8],
    ) -> Result<bool> {
        let dir = self.mailbox_dir(mailbox)?;
        let _state = self.state.lock().await;
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(Error::NotFound(format!("Mailbox {} does not exist", mailbox)));
        }

        let file = format!("{}.eml", uuid::Uuid::now_v7());
        fs::write(dir.join(&file), raw)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write message: {}", e)))?;

        let mut index = Self::load_index(&dir).await?;
        index.entries.push(IndexEntry {
            file,
            flags,
            internal_date,
        });
        Self::save_index(&dir, &index).await?;

        debug!(store = %self.name, mailbox = %mailbox, size = raw.len(), "Appended message");
        Ok(true)
    }

    async fn flag_deleted(&self, handle: &MailboxHandle, position: Position) -> Result<bool> {
        if handle.mode() != OpenMode::ReadWrite {
            return Err(Error::Protocol(format!(
                "{} is open read-only",
                handle.mailbox()
            )));
        }
        let state = self.state.lock().await;
        let dir = self.check_position(&state, handle, position)?;
        let mut index = Self::load_index(&dir).await?;
        let entry = index
            .entries
            .get_mut(position.seq() as usize - 1)
            .ok_or_else(|| {
                Error::NotFound(format!("{} has no message {}", handle.mailbox(), position))
            })?;
        entry.flags.deleted = true;
        Self::save_index(&dir, &index).await?;
        Ok(true)
    }

    async fn expunge(&self, handle: &mut MailboxHandle) -> Result<u32> {
        if handle.mode() != OpenMode::ReadWrite {
            return Err(Error::Protocol(format!(
                "{} is open read-only",
                handle.mailbox()
            )));
        }
        let mut state = self.state.lock().await;
        if !state.open.contains(&handle.id()) {
            return Err(Error::StalePosition(format!(
                "{} handle {} is closed",
                handle.mailbox(),
                handle.id()
            )));
        }
        let dir = self.mailbox_dir(handle.mailbox())?;
        let index = Self::load_index(&dir).await?;

        let (removed, kept): (Vec<_>, Vec<_>) =
            index.entries.into_iter().partition(|e| e.flags.deleted);
        for entry in &removed {
            fs::remove_file(dir.join(&entry.file))
                .await
                .map_err(|e| Error::Storage(format!("Failed to remove message: {}", e)))?;
        }
        let remaining = kept.len() as u32;
        Self::save_index(&dir, &MailboxIndex { entries: kept }).await?;

        let generation = state
            .generations
            .entry(handle.mailbox().to_string())
            .or_default();
        *generation += 1;
        handle.renumber(*generation, remaining);

        debug!(store = %self.name, mailbox = %handle.mailbox(), removed = removed.len(), "Expunged mailbox");
        Ok(removed.len() as u32)
    }

    async fn close(&self, handle: MailboxHandle) -> Result<()> {
        let mut state = self.state.lock().await;
        state.open.remove(&handle.id());
        Ok(())
    }
}

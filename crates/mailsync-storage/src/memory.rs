//! In-memory mail store for tests
//!
//! Clones share state, so a test can keep one clone for inspection while
//! the synchronizer owns another. Every trait call is recorded in order.
//!
//! Appending to a mailbox that is currently open read-write marks the new
//! message `\Seen`, the side effect a selected IMAP mailbox has on freshly
//! delivered mail.

use crate::message::MessageMetadata;
use crate::store::{pattern_regex, ListedMailbox, MailStore, MailboxHandle, OpenMode, Position};
use async_trait::async_trait;
use mailsync_common::types::{MailboxAttributes, MessageFlags, Timestamp};
use mailsync_common::{Error, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// A recorded store call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Connect,
    List(String),
    Open(String, OpenMode),
    OpenHalf,
    Create(String),
    Delete(String),
    FetchMetadata(String, u32),
    FetchRaw(String, u32),
    Append(String),
    FlagDeleted(String, u32),
    Expunge(String),
    Close(String),
}

/// A stored message
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub raw: Vec<u8>,
    pub flags: MessageFlags,
    pub internal_date: Option<Timestamp>,
}

#[derive(Debug, Default)]
struct MemoryMailbox {
    messages: Vec<StoredMessage>,
    generation: u64,
    no_select: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    connected: bool,
    mailboxes: BTreeMap<String, MemoryMailbox>,
    next_handle: u64,
    open: HashMap<u64, (String, OpenMode)>,
    calls: Vec<StoreCall>,
    fail_connect: bool,
    fail_open: HashSet<String>,
    fail_fetch: HashSet<(String, u32)>,
    fail_append: HashSet<String>,
}

/// In-memory store
#[derive(Debug, Clone)]
pub struct MemoryStore {
    name: String,
    remote: bool,
    delimiter: Option<char>,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    /// Create an empty local store with `.` as delimiter
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            remote: false,
            delimiter: Some('.'),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    /// Mark the store as network-reached
    pub fn remote(mut self, remote: bool) -> Self {
        self.remote = remote;
        self
    }

    /// Set the native delimiter; `None` for a flat namespace
    pub fn with_delimiter(mut self, delimiter: Option<char>) -> Self {
        self.delimiter = delimiter;
        self
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a mailbox directly
    pub fn add_mailbox(&self, mailbox: &str) {
        self.state().mailboxes.entry(mailbox.to_string()).or_default();
    }

    /// Create a non-selectable mailbox directly
    pub fn add_noselect_mailbox(&self, mailbox: &str) {
        self.state()
            .mailboxes
            .entry(mailbox.to_string())
            .or_default()
            .no_select = true;
    }

    /// Add a message directly, creating the mailbox when needed
    pub fn add_message(&self, mailbox: &str, raw: &[u8], flags: MessageFlags) {
        self.state()
            .mailboxes
            .entry(mailbox.to_string())
            .or_default()
            .messages
            .push(StoredMessage {
                raw: raw.to_vec(),
                flags,
                internal_date: None,
            });
    }

    /// Remove every message with this Message-ID directly; returns how many went
    pub fn remove_message(&self, mailbox: &str, message_id: &str) -> usize {
        let mut state = self.state();
        let Some(target) = state.mailboxes.get_mut(mailbox) else {
            return 0;
        };
        let before = target.messages.len();
        target.messages.retain(|m| {
            MessageMetadata::parse(&m.raw, m.flags, None).message_id.as_deref() != Some(message_id)
        });
        target.generation += 1;
        before - target.messages.len()
    }

    /// Messages of a mailbox in store order
    pub fn messages(&self, mailbox: &str) -> Vec<StoredMessage> {
        self.state()
            .mailboxes
            .get(mailbox)
            .map(|m| m.messages.clone())
            .unwrap_or_default()
    }

    /// Raw Message-ID values of a mailbox in store order
    pub fn message_ids(&self, mailbox: &str) -> Vec<String> {
        self.messages(mailbox)
            .iter()
            .filter_map(|m| MessageMetadata::parse(&m.raw, m.flags, None).message_id)
            .collect()
    }

    /// Names of all mailboxes
    pub fn mailbox_names(&self) -> Vec<String> {
        self.state().mailboxes.keys().cloned().collect()
    }

    /// Recorded calls
    pub fn calls(&self) -> Vec<StoreCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Make `connect` fail
    pub fn fail_connect(&self) {
        self.state().fail_connect = true;
    }

    /// Make opening a mailbox fail
    pub fn fail_open_of(&self, mailbox: &str) {
        self.state().fail_open.insert(mailbox.to_string());
    }

    /// Make fetching the message at a sequence number fail
    pub fn fail_fetch_at(&self, mailbox: &str, seq: u32) {
        self.state().fail_fetch.insert((mailbox.to_string(), seq));
    }

    /// Make appending any message containing this text fail
    pub fn fail_append_of(&self, needle: &str) {
        self.state().fail_append.insert(needle.to_string());
    }

    /// Lift every injected fault
    pub fn clear_faults(&self) {
        let mut state = self.state();
        state.fail_connect = false;
        state.fail_open.clear();
        state.fail_fetch.clear();
        state.fail_append.clear();
    }

    fn message_at<'a>(
        state: &'a mut MemoryState,
        handle: &MailboxHandle,
        position: Position,
    ) -> Result<&'a mut StoredMessage> {
        if !state.open.contains_key(&handle.id()) {
            return Err(Error::StalePosition(format!(
                "{} handle {} is closed",
                handle.mailbox(),
                handle.id()
            )));
        }
        let mailbox = state.mailboxes.get_mut(handle.mailbox()).ok_or_else(|| {
            Error::NotFound(format!("Mailbox {} does not exist", handle.mailbox()))
        })?;
        handle.check(position, mailbox.generation)?;
        mailbox
            .messages
            .get_mut(position.seq() as usize - 1)
            .ok_or_else(|| {
                Error::NotFound(format!("{} has no message {}", handle.mailbox(), position))
            })
    }
}

#[async_trait]
impl MailStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_remote(&self) -> bool {
        self.remote
    }

    async fn connect(&self) -> Result<()> {
        let mut state = self.state();
        state.calls.push(StoreCall::Connect);
        if state.fail_connect {
            return Err(Error::Connection(format!("{}: connection refused", self.name)));
        }
        state.connected = true;
        Ok(())
    }

    async fn list_mailboxes(&self, reference: &str, pattern: &str) -> Result<Vec<ListedMailbox>> {
        let full = format!("{}{}", reference, pattern);
        let matcher = pattern_regex(&full, self.delimiter)?;
        let mut state = self.state();
        state.calls.push(StoreCall::List(full));
        if !state.connected {
            return Err(Error::Connection(format!("{} is not connected", self.name)));
        }
        Ok(state
            .mailboxes
            .iter()
            .filter(|(name, _)| matcher.is_match(name))
            .map(|(name, mailbox)| ListedMailbox {
                name: name.clone(),
                delimiter: self.delimiter,
                attributes: MailboxAttributes {
                    no_select: mailbox.no_select,
                    no_inferiors: false,
                },
            })
            .collect())
    }

    async fn resolve_delimiter(&self) -> Result<Option<char>> {
        Ok(self.delimiter)
    }

    async fn open_mailbox(&self, mailbox: &str, mode: OpenMode) -> Result<MailboxHandle> {
        let mut state = self.state();
        state.calls.push(StoreCall::Open(mailbox.to_string(), mode));
        if state.fail_open.contains(mailbox) {
            return Err(Error::NotFound(format!("{}: cannot open {}", self.name, mailbox)));
        }
        let (generation, exists) = match state.mailboxes.get(mailbox) {
            Some(m) if !m.no_select => (m.generation, m.messages.len() as u32),
            Some(_) => {
                return Err(Error::NotFound(format!("Mailbox {} is not selectable", mailbox)))
            }
            None => return Err(Error::NotFound(format!("Mailbox {} does not exist", mailbox))),
        };
        state.next_handle += 1;
        let id = state.next_handle;
        state.open.insert(id, (mailbox.to_string(), mode));
        Ok(MailboxHandle::new(id, mailbox, mode, generation, exists))
    }

    async fn open_half(&self) -> Result<()> {
        let mut state = self.state();
        state.calls.push(StoreCall::OpenHalf);
        state.open.clear();
        Ok(())
    }

    async fn create_mailbox(&self, mailbox: &str) -> Result<bool> {
        let mut state = self.state();
        state.calls.push(StoreCall::Create(mailbox.to_string()));
        state.mailboxes.entry(mailbox.to_string()).or_default();
        Ok(true)
    }

    async fn delete_mailbox(&self, mailbox: &str) -> Result<bool> {
        let mut state = self.state();
        state.calls.push(StoreCall::Delete(mailbox.to_string()));
        Ok(state.mailboxes.remove(mailbox).is_some())
    }

    async fn fetch_metadata(
        &self,
        handle: &MailboxHandle,
        position: Position,
    ) -> Result<MessageMetadata> {
        let mut state = self.state();
        state.calls.push(StoreCall::FetchMetadata(
            handle.mailbox().to_string(),
            position.seq(),
        ));
        if state
            .fail_fetch
            .contains(&(handle.mailbox().to_string(), position.seq()))
        {
            return Err(Error::Protocol(format!(
                "{}: fetch of {} failed",
                handle.mailbox(),
                position
            )));
        }
        let message = Self::message_at(&mut state, handle, position)?;
        Ok(MessageMetadata::parse(
            &message.raw,
            message.flags,
            message.internal_date,
        ))
    }

    async fn fetch_raw(&self, handle: &MailboxHandle, position: Position) -> Result<Vec<u8>> {
        let mut state = self.state();
        state
            .calls
            .push(StoreCall::FetchRaw(handle.mailbox().to_string(), position.seq()));
        Ok(Self::message_at(&mut state, handle, position)?.raw.clone())
    }

    async fn append_message(
        &self,
        mailbox: &str,
        flags: MessageFlags,
        internal_date: Option<Timestamp>,
        raw: &[u8],
    ) -> Result<bool> {
        let mut state = self.state();
        state.calls.push(StoreCall::Append(mailbox.to_string()));

        let text = String::from_utf8_lossy(raw);
        if state.fail_append.iter().any(|needle| text.contains(needle.as_str())) {
            return Err(Error::Storage(format!("{}: append to {} failed", self.name, mailbox)));
        }

        let selected_rw = state
            .open
            .values()
            .any(|(name, mode)| name == mailbox && *mode == OpenMode::ReadWrite);
        let mut flags = flags;
        if selected_rw {
            flags.seen = true;
        }

        let target = state
            .mailboxes
            .get_mut(mailbox)
            .ok_or_else(|| Error::NotFound(format!("Mailbox {} does not exist", mailbox)))?;
        target.messages.push(StoredMessage {
            raw: raw.to_vec(),
            flags,
            internal_date,
        });
        Ok(true)
    }

    async fn flag_deleted(&self, handle: &MailboxHandle, position: Position) -> Result<bool> {
        let mut state = self.state();
        state.calls.push(StoreCall::FlagDeleted(
            handle.mailbox().to_string(),
            position.seq(),
        ));
        if handle.mode() != OpenMode::ReadWrite {
            return Err(Error::Protocol(format!("{} is open read-only", handle.mailbox())));
        }
        Self::message_at(&mut state, handle, position)?.flags.deleted = true;
        Ok(true)
    }

    async fn expunge(&self, handle: &mut MailboxHandle) -> Result<u32> {
        let mut state = self.state();
        state.calls.push(StoreCall::Expunge(handle.mailbox().to_string()));
        if handle.mode() != OpenMode::ReadWrite {
            return Err(Error::Protocol(format!("{} is open read-only", handle.mailbox())));
        }
        if !state.open.contains_key(&handle.id()) {
            return Err(Error::StalePosition(format!(
                "{} handle {} is closed",
                handle.mailbox(),
                handle.id()
            )));
        }
        let mailbox = state.mailboxes.get_mut(handle.mailbox()).ok_or_else(|| {
            Error::NotFound(format!("Mailbox {} does not exist", handle.mailbox()))
        })?;
        let before = mailbox.messages.len();
        mailbox.messages.retain(|m| !m.flags.deleted);
        mailbox.generation += 1;
        let removed = (before - mailbox.messages.len()) as u32;
        handle.renumber(mailbox.generation, mailbox.messages.len() as u32);
        Ok(removed)
    }

    async fn close(&self, handle: MailboxHandle) -> Result<()> {
        let mut state = self.state();
        state.calls.push(StoreCall::Close(handle.mailbox().to_string()));
        state.open.remove(&handle.id());
        Ok(())
    }
}

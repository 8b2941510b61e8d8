//! Checkpoint store
//!
//! The state of a channel after its last run is kept as a message in a
//! dedicated mailbox: `From: mailsync`, `Subject: <channel>`, and a text
//! body listing every mailbox name followed by the identities seen in it.
//!
//! ```text
//! INBOX
//! <a1@example.org>
//! <b2@example.org>
//! work/2024
//! <c3@example.org>
//! ```
//!
//! Identity lines start with `<`; every other line, the empty line
//! included, names a mailbox.
//!
//! A new record is appended before older ones are flagged and expunged,
//! and reading picks the last matching record, so an interrupted write
//! leaves either the old or the new state readable.

use crate::identity::MessageIdentity;
use crate::store::Store;
use mail_builder::MessageBuilder;
use mail_parser::MessageParser;
use mailsync_common::types::{IdentityScheme, MessageFlags};
use mailsync_common::{Error, Result};
use mailsync_storage::{MailboxHandle, OpenMode, Position};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Sender of checkpoint records
pub const RECORD_SENDER: (&str, &str) = ("mailsync", "mailsync@localhost");

/// Identity sets by canonical mailbox name
pub type MailboxState = BTreeMap<String, BTreeSet<MessageIdentity>>;

/// State read back from the checkpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LastKnown {
    /// Last-known identities of mailboxes that still exist on a side
    pub by_mailbox: MailboxState,
    /// Recorded mailboxes that neither side enumerates any more
    pub deleted_mailboxes: BTreeSet<String>,
}

impl LastKnown {
    /// Last-known identities of one mailbox, empty when never recorded
    pub fn mailbox(&self, name: &str) -> BTreeSet<MessageIdentity> {
        self.by_mailbox.get(name).cloned().unwrap_or_default()
    }
}

/// Render the record body
pub fn render_body(state: &MailboxState, deleted: &BTreeSet<String>) -> String {
    let mut body = String::new();
    for (mailbox, ids) in state {
        if deleted.contains(mailbox) {
            continue;
        }
        body.push_str(mailbox);
        body.push('\n');
        for id in ids {
            body.push_str(&id.to_checkpoint_line());
            body.push('\n');
        }
    }
    body
}

/// Parse a record body; returns the state and the number of identities
/// dropped for belonging to another scheme
pub fn parse_body(body: &str, scheme: IdentityScheme) -> (MailboxState, usize) {
    let mut state = MailboxState::new();
    let mut dropped = 0;
    let mut current: Option<String> = None;

    for line in body.split_terminator('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if !line.starts_with('<') {
            state.entry(line.to_string()).or_default();
            current = Some(line.to_string());
            continue;
        }
        let Some(mailbox) = current.as_ref() else {
            warn!("Checkpoint identity {} precedes any mailbox name, ignoring", line);
            continue;
        };
        match MessageIdentity::from_checkpoint_line(line) {
            Some(id) if id.scheme() == scheme => {
                state.entry(mailbox.clone()).or_default().insert(id);
            }
            Some(_) => dropped += 1,
            None => debug!("Ignoring unreadable checkpoint line {:?}", line),
        }
    }
    (state, dropped)
}

/// Reads and writes the checkpoint records of channels
pub struct CheckpointStore {
    store: Store,
    mailbox: String,
    scheme: IdentityScheme,
}

impl CheckpointStore {
    pub fn new(store: Store, mailbox: &str, scheme: IdentityScheme) -> Self {
        Self {
            store,
            mailbox: mailbox.to_string(),
            scheme,
        }
    }

    /// Checkpoint mailbox, by canonical name
    pub fn mailbox(&self) -> &str {
        &self.mailbox
    }

    pub fn store_name(&self) -> &str {
        self.store.name()
    }

    /// Connect to the checkpoint store
    pub async fn connect(&mut self) -> Result<()> {
        self.store
            .connect()
            .await
            .map_err(|e| Error::Checkpoint(format!("Failed to open checkpoint store: {}", e)))?;
        self.store
            .resolve_delimiter()
            .await
            .map_err(|e| Error::Checkpoint(format!("Failed to open checkpoint store: {}", e)))?;
        Ok(())
    }

    /// Read the last record of a channel
    pub async fn read(
        &mut self,
        channel: &str,
        known_mailboxes: &BTreeSet<String>,
        simulate: bool,
    ) -> Result<LastKnown> {
        if !simulate {
            self.store.create(&self.mailbox).await.map_err(|e| {
                Error::Checkpoint(format!(
                    "Failed to create checkpoint mailbox {}: {}",
                    self.mailbox, e
                ))
            })?;
        }

        let handle = match self.store.open(&self.mailbox, OpenMode::ReadOnly).await {
            Ok(handle) => handle,
            Err(Error::NotFound(_)) if simulate => {
                info!("No checkpoint mailbox yet, treating {} as a first run", channel);
                return Ok(LastKnown::default());
            }
            Err(e) => {
                return Err(Error::Checkpoint(format!(
                    "Failed to open checkpoint mailbox {}: {}",
                    self.mailbox, e
                )))
            }
        };

        let body = self.read_record(&handle, channel).await;
        if let Err(e) = self.store.close(handle).await {
            debug!("Closing checkpoint mailbox failed: {}", e);
        }
        let Some(body) = body? else {
            info!("No checkpoint record for channel {}, first run", channel);
            return Ok(LastKnown::default());
        };

        let (state, dropped) = parse_body(&body, self.scheme);
        if dropped > 0 {
            warn!(
                "Dropped {} checkpoint identities of channel {} recorded under another identity scheme",
                dropped, channel
            );
        }

        let mut last = LastKnown::default();
        for (mailbox, ids) in state {
            if known_mailboxes.contains(&mailbox) {
                last.by_mailbox.insert(mailbox, ids);
            } else {
                last.deleted_mailboxes.insert(mailbox);
            }
        }
        debug!(
            channel = %channel,
            mailboxes = last.by_mailbox.len(),
            deleted = last.deleted_mailboxes.len(),
            "Read checkpoint"
        );
        Ok(last)
    }

    /// Positions of every record belonging to a channel
    async fn records(&self, handle: &MailboxHandle, channel: &str) -> Result<Vec<Position>> {
        let mut found = Vec::new();
        for position in handle.positions() {
            let metadata = self.store.fetch_metadata(handle, position).await.map_err(|e| {
                Error::Checkpoint(format!("Failed to scan checkpoint records: {}", e))
            })?;
            let from_us = metadata
                .from
                .first()
                .is_some_and(|addr| addr.eq_ignore_ascii_case(RECORD_SENDER.1));
            if from_us && metadata.subject.as_deref() == Some(channel) {
                found.push(position);
            }
        }
        Ok(found)
    }

    async fn read_record(&self, handle: &MailboxHandle, channel: &str) -> Result<Option<String>> {
        let Some(last) = self.records(handle, channel).await?.pop() else {
            return Ok(None);
        };
        let raw = self.store.fetch_raw(handle, last).await.map_err(|e| {
            Error::Checkpoint(format!("Failed to fetch checkpoint record: {}", e))
        })?;
        let message = MessageParser::default()
            .parse(&raw)
            .ok_or_else(|| Error::Checkpoint("Failed to parse checkpoint record".to_string()))?;
        Ok(Some(
            message
                .body_text(0)
                .map(|body| body.to_string())
                .unwrap_or_default(),
        ))
    }

    /// Replace the record of a channel
    pub async fn write(
        &mut self,
        channel: &str,
        state: &MailboxState,
        deleted: &BTreeSet<String>,
    ) -> Result<()> {
        let body = render_body(state, deleted);
        let raw = MessageBuilder::new()
            .from(RECORD_SENDER)
            .subject(channel)
            .text_body(body)
            .write_to_vec()
            .map_err(|e| Error::Checkpoint(format!("Failed to build checkpoint record: {}", e)))?;

        self.store.create(&self.mailbox).await.map_err(|e| {
            Error::Checkpoint(format!(
                "Failed to create checkpoint mailbox {}: {}",
                self.mailbox, e
            ))
        })?;
        let mut handle = self
            .store
            .open(&self.mailbox, OpenMode::ReadWrite)
            .await
            .map_err(|e| {
                Error::Checkpoint(format!(
                    "Failed to open checkpoint mailbox {}: {}",
                    self.mailbox, e
                ))
            })?;

        let result = self.replace(&mut handle, channel, &raw).await;
        if let Err(e) = self.store.close(handle).await {
            debug!("Closing checkpoint mailbox failed: {}", e);
        }
        result
    }

    async fn replace(&self, handle: &mut MailboxHandle, channel: &str, raw: &[u8]) -> Result<()> {
        let old = self.records(handle, channel).await?;

        let seen = MessageFlags {
            seen: true,
            ..Default::default()
        };
        let appended = self
            .store
            .append(&self.mailbox, seen, Some(chrono::Utc::now()), raw)
            .await
            .map_err(|e| Error::Checkpoint(format!("Failed to store checkpoint record: {}", e)))?;
        if !appended {
            return Err(Error::Checkpoint(format!(
                "{} refused the checkpoint record",
                self.store.name()
            )));
        }

        // the new record is committed; leftovers only cost space
        for position in old {
            if let Err(e) = self.store.flag_deleted(handle, position).await {
                warn!("Failed to flag old checkpoint record {}: {}", position, e);
            }
        }
        match self.store.expunge(handle).await {
            Ok(removed) => debug!(channel = %channel, removed, "Replaced checkpoint record"),
            Err(e) => warn!("Failed to expunge old checkpoint records: {}", e),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailsync_common::StoreConfig;
    use mailsync_storage::memory::MemoryStore;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn ids(list: &[&str]) -> BTreeSet<MessageIdentity> {
        list.iter().map(|s| MessageIdentity::header(s)).collect()
    }

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn checkpoint(backend: &MemoryStore) -> CheckpointStore {
        let store = Store::new(
            "state",
            &StoreConfig::default(),
            Box::new(backend.clone()),
            Duration::from_secs(5),
        );
        CheckpointStore::new(store, "msinfo", IdentityScheme::Header)
    }

    #[test]
    fn test_render_and_parse_body() {
        let mut state = MailboxState::new();
        state.insert("INBOX".to_string(), ids(&["<a@x>", "<b@x>"]));
        state.insert(String::new(), ids(&["<c@x>"]));
        state.insert("empty".to_string(), BTreeSet::new());
        state.insert("old/box".to_string(), ids(&["<d@x>"]));

        let body = render_body(&state, &names(&["old/box"]));
        assert_eq!(body, "\n<c@x>\nINBOX\n<a@x>\n<b@x>\nempty\n");

        let (parsed, dropped) = parse_body(&body.replace('\n', "\r\n"), IdentityScheme::Header);
        assert_eq!(dropped, 0);
        state.remove("old/box");
        assert_eq!(parsed, state);
    }

    #[test]
    fn test_parse_drops_foreign_scheme() {
        let digest = format!("<>, digest: <{}>", "a".repeat(64));
        let body = format!("INBOX\n<a@x>\n{}\n", digest);

        let (header, dropped) = parse_body(&body, IdentityScheme::Header);
        assert_eq!(header["INBOX"], ids(&["<a@x>"]));
        assert_eq!(dropped, 1);

        let (digests, dropped) = parse_body(&body, IdentityScheme::Digest);
        assert_eq!(digests["INBOX"].len(), 1);
        assert_eq!(dropped, 1);
    }

    #[test]
    fn test_parse_repeated_mailbox_merges() {
        let (parsed, _) = parse_body("INBOX\n<a@x>\nINBOX\n", IdentityScheme::Header);
        assert_eq!(parsed["INBOX"], ids(&["<a@x>"]));
    }

    #[tokio::test]
    async fn test_first_run_creates_mailbox() {
        let backend = MemoryStore::new("state");
        let mut cp = checkpoint(&backend);
        cp.connect().await.unwrap();

        let last = cp.read("work", &names(&["INBOX"]), false).await.unwrap();
        assert_eq!(last, LastKnown::default());
        assert_eq!(backend.mailbox_names(), vec!["msinfo"]);
    }

    #[tokio::test]
    async fn test_simulate_does_not_create_mailbox() {
        let backend = MemoryStore::new("state");
        let mut cp = checkpoint(&backend);
        cp.connect().await.unwrap();

        let last = cp.read("work", &names(&["INBOX"]), true).await.unwrap();
        assert_eq!(last, LastKnown::default());
        assert!(backend.mailbox_names().is_empty());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let backend = MemoryStore::new("state");
        let mut cp = checkpoint(&backend);
        cp.connect().await.unwrap();

        let mut state = MailboxState::new();
        state.insert("INBOX".to_string(), ids(&["<a@x>"]));
        state.insert("old/box".to_string(), ids(&["<b@x>"]));
        cp.write("work", &state, &BTreeSet::new()).await.unwrap();

        // a second channel shares the mailbox
        let mut other = MailboxState::new();
        other.insert("INBOX".to_string(), ids(&["<z@x>"]));
        cp.write("home", &other, &BTreeSet::new()).await.unwrap();

        let last = cp.read("work", &names(&["INBOX"]), false).await.unwrap();
        assert_eq!(last.by_mailbox["INBOX"], ids(&["<a@x>"]));
        assert_eq!(last.deleted_mailboxes, names(&["old/box"]));

        // rewriting replaces the old record and omits deleted mailboxes
        cp.write("work", &last.by_mailbox, &last.deleted_mailboxes)
            .await
            .unwrap();
        assert_eq!(backend.messages("msinfo").len(), 2);

        let again = cp.read("work", &names(&["INBOX"]), false).await.unwrap();
        assert!(again.deleted_mailboxes.is_empty());
        assert_eq!(again.mailbox("INBOX"), ids(&["<a@x>"]));
    }

    #[tokio::test]
    async fn test_read_picks_last_record() {
        let backend = MemoryStore::new("state");
        let record = |body: &str| {
            MessageBuilder::new()
                .from(RECORD_SENDER)
                .subject("work")
                .text_body(body.to_string())
                .write_to_vec()
                .unwrap()
        };
        backend.add_message("msinfo", &record("INBOX\n<old@x>\n"), MessageFlags::default());
        backend.add_message(
            "msinfo",
            b"From: someone@else\r\nSubject: work\r\n\r\nINBOX\r\n<foreign@x>\r\n",
            MessageFlags::default(),
        );
        backend.add_message("msinfo", &record("INBOX\n<new@x>\n"), MessageFlags::default());

        let mut cp = checkpoint(&backend);
        cp.connect().await.unwrap();
        let last = cp.read("work", &names(&["INBOX"]), false).await.unwrap();
        assert_eq!(last.mailbox("INBOX"), ids(&["<new@x>"]));
    }

    #[tokio::test]
    async fn test_read_ignores_lookalike_sender() {
        let backend = MemoryStore::new("state");
        let record = |from: (&str, &str), body: &str| {
            MessageBuilder::new()
                .from(from)
                .subject("work")
                .text_body(body.to_string())
                .write_to_vec()
                .unwrap()
        };
        backend.add_message(
            "msinfo",
            &record(RECORD_SENDER, "INBOX\n<ours@x>\n"),
            MessageFlags::default(),
        );
        backend.add_message(
            "msinfo",
            &record(("other", "mailsyncer@localhost"), "INBOX\n<theirs@x>\n"),
            MessageFlags::default(),
        );

        let mut cp = checkpoint(&backend);
        cp.connect().await.unwrap();
        let last = cp.read("work", &names(&["INBOX"]), false).await.unwrap();
        assert_eq!(last.mailbox("INBOX"), ids(&["<ours@x>"]));
    }

    #[tokio::test]
    async fn test_failed_append_keeps_old_record() {
        let backend = MemoryStore::new("state");
        let mut cp = checkpoint(&backend);
        cp.connect().await.unwrap();

        let mut state = MailboxState::new();
        state.insert("INBOX".to_string(), ids(&["<a@x>"]));
        cp.write("work", &state, &BTreeSet::new()).await.unwrap();

        backend.fail_append_of("<b@x>");
        state.insert("INBOX".to_string(), ids(&["<b@x>"]));
        let err = cp.write("work", &state, &BTreeSet::new()).await.unwrap_err();
        assert!(matches!(err, Error::Checkpoint(_)));

        backend.clear_faults();
        let last = cp.read("work", &names(&["INBOX"]), false).await.unwrap();
        assert_eq!(last.mailbox("INBOX"), ids(&["<a@x>"]));
    }
}

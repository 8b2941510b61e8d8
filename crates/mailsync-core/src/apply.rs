//! Apply engine
//!
//! Executes the action sets of one mailbox in a fixed order:
//!
//! 1. flag removals on A, then on B, then in-mailbox duplicates
//! 2. copy A to B
//! 3. copy B to A
//! 4. expunge both sides
//!
//! Removals come first because opening a mailbox read-write clears the
//! recent state of its messages; copies are appended to a destination
//! that is half-open (remote) or closed (local) so that nothing freshly
//! appended is marked seen. Expunge comes last because it renumbers the
//! positions every earlier step relies on.

use crate::identity::{IdentityDeriver, MessageIdentity};
use crate::reconcile::Classification;
use crate::report::MailboxReport;
use crate::snapshot::MailboxSnapshot;
use crate::store::Store;
use mailsync_common::types::Direction;
use mailsync_common::{Error, Result, Severity};
use mailsync_storage::{MailboxHandle, OpenMode, Position};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Switches that affect the apply phase
#[derive(Debug, Clone, Copy)]
pub struct ApplyOptions {
    pub expunge: bool,
    pub expunge_duplicates: bool,
    pub simulate: bool,
    pub copy_deleted: bool,
    pub size_limit: Option<u64>,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            expunge: true,
            expunge_duplicates: true,
            simulate: false,
            copy_deleted: false,
            size_limit: None,
        }
    }
}

/// One replica's view of the mailbox being applied
pub struct Side<'a> {
    pub store: &'a Store,
    pub handle: Option<MailboxHandle>,
    pub snapshot: MailboxSnapshot,
}

impl<'a> Side<'a> {
    pub fn new(store: &'a Store, handle: MailboxHandle, snapshot: MailboxSnapshot) -> Self {
        Self {
            store,
            handle: Some(handle),
            snapshot,
        }
    }

    /// Close the handle if one is open
    pub async fn close(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => self.store.close(handle).await,
            None => Ok(()),
        }
    }
}

/// Per-message outcome of a store call
enum Attempt<T> {
    Done(T),
    Failed(Error),
}

/// Split message-level failures from errors that must propagate
fn attempt<T>(result: Result<T>) -> Result<Attempt<T>> {
    match result {
        Ok(value) => Ok(Attempt::Done(value)),
        Err(e) if e.severity() == Severity::Message => Ok(Attempt::Failed(e)),
        Err(e) => Err(e),
    }
}

/// Applies a classification to both sides of one mailbox
pub struct ApplyEngine<'a> {
    deriver: &'a IdentityDeriver,
    options: ApplyOptions,
}

impl<'a> ApplyEngine<'a> {
    pub fn new(deriver: &'a IdentityDeriver, options: ApplyOptions) -> Self {
        Self { deriver, options }
    }

    /// Apply the plan; returns the identities present on both sides afterwards
    pub async fn apply(
        &self,
        mailbox: &str,
        a: &mut Side<'_>,
        b: &mut Side<'_>,
        plan: &Classification,
        report: &mut MailboxReport,
    ) -> Result<BTreeSet<MessageIdentity>> {
        report.duplicates_a = a.snapshot.duplicates.len() as u32;
        report.duplicates_b = b.snapshot.duplicates.len() as u32;
        report.absent_a = a.snapshot.absent;
        report.absent_b = b.snapshot.absent;

        report.removed_a = self.remove_all(mailbox, a, &plan.remove_a, report).await?;
        report.removed_b = self.remove_all(mailbox, b, &plan.remove_b, report).await?;
        if self.options.expunge_duplicates {
            self.remove_duplicates(mailbox, a, report).await?;
            self.remove_duplicates(mailbox, b, report).await?;
        }

        let mut now = plan.keep.clone();
        let copied = self
            .copy_all(mailbox, a, b, &plan.copy_a_to_b, Direction::AToB, report)
            .await?;
        report.copied_a_to_b = copied.len() as u32;
        now.extend(copied);

        let copied = self
            .copy_all(mailbox, b, a, &plan.copy_b_to_a, Direction::BToA, report)
            .await?;
        report.copied_b_to_a = copied.len() as u32;
        now.extend(copied);

        if self.options.expunge && !self.options.simulate {
            report.expunged_a = self.expunge(mailbox, a).await;
            report.expunged_b = self.expunge(mailbox, b).await;
        }

        report.remaining = now.len() as u32;
        Ok(now)
    }

    async fn remove_all(
        &self,
        mailbox: &str,
        side: &mut Side<'_>,
        ids: &BTreeSet<MessageIdentity>,
        report: &mut MailboxReport,
    ) -> Result<u32> {
        let mut removed = 0;
        for id in ids {
            let Some(position) = side.snapshot.position(id) else {
                return Err(Error::Invariant(format!(
                    "{} is scheduled for removal from {} but was never seen there",
                    id,
                    side.store.name()
                )));
            };
            if self.remove_verified(mailbox, side, id, position, report).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn remove_duplicates(
        &self,
        mailbox: &str,
        side: &mut Side<'_>,
        report: &mut MailboxReport,
    ) -> Result<()> {
        let duplicates = side.snapshot.duplicates.clone();
        for (id, position) in &duplicates {
            if self
                .remove_verified(mailbox, side, id, *position, report)
                .await?
            {
                debug!("{}: removed duplicate {} from {}", mailbox, id, side.store.name());
            }
        }
        Ok(())
    }

    /// Flag one message, after checking it still is the message we expect
    async fn remove_verified(
        &self,
        mailbox: &str,
        side: &mut Side<'_>,
        id: &MessageIdentity,
        position: Position,
        report: &mut MailboxReport,
    ) -> Result<bool> {
        if self.options.simulate {
            info!("{}: would remove {} from {}", mailbox, id, side.store.name());
            return Ok(true);
        }
        let handle = open_handle(side, mailbox)?;

        let metadata = match attempt(side.store.fetch_metadata(handle, position).await)? {
            Attempt::Done(metadata) => metadata,
            Attempt::Failed(e) => {
                warn!("{}: cannot verify {} before removal: {}", mailbox, id, e);
                report.failed_removals += 1;
                return Ok(false);
            }
        };
        if self.deriver.derive(&metadata).as_ref() != Some(id) {
            warn!(
                "{}: message {} on {} changed under us, not removing {}",
                mailbox,
                position,
                side.store.name(),
                id
            );
            report.failed_removals += 1;
            return Ok(false);
        }

        match attempt(side.store.flag_deleted(handle, position).await)? {
            Attempt::Done(true) => {
                debug!("{}: flagged {} deleted on {}", mailbox, id, side.store.name());
                Ok(true)
            }
            Attempt::Done(false) => {
                warn!("{}: {} refused to flag {}", mailbox, side.store.name(), id);
                report.failed_removals += 1;
                Ok(false)
            }
            Attempt::Failed(e) => {
                warn!("{}: failed to flag {} deleted: {}", mailbox, id, e);
                report.failed_removals += 1;
                Ok(false)
            }
        }
    }

    async fn copy_all(
        &self,
        mailbox: &str,
        source: &mut Side<'_>,
        dest: &mut Side<'_>,
        ids: &BTreeSet<MessageIdentity>,
        direction: Direction,
        report: &mut MailboxReport,
    ) -> Result<BTreeSet<MessageIdentity>> {
        let mut copied = BTreeSet::new();
        if ids.is_empty() {
            return Ok(copied);
        }

        // arrival order on the source side
        let mut ordered = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(position) = source.snapshot.position(id) else {
                return Err(Error::Invariant(format!(
                    "{} is scheduled for copying from {} but was never seen there",
                    id,
                    source.store.name()
                )));
            };
            ordered.push((position, id));
        }
        ordered.sort();

        self.prepare_source(mailbox, source).await?;
        if !self.options.simulate {
            self.prepare_destination(mailbox, dest).await?;
        }

        for (position, id) in ordered {
            if self
                .copy_one(mailbox, source, dest, id, position, direction, report)
                .await?
            {
                copied.insert(id.clone());
            }
        }
        Ok(copied)
    }

    /// Re-open the source read-only when its handle was closed
    async fn prepare_source(&self, mailbox: &str, source: &mut Side<'_>) -> Result<()> {
        if source.handle.is_some() {
            return Ok(());
        }
        let handle = source
            .store
            .open(mailbox, OpenMode::ReadOnly)
            .await
            .map_err(|e| {
                Error::Connection(format!(
                    "Failed to reopen {} on {} for copying: {}",
                    mailbox,
                    source.store.name(),
                    e
                ))
            })?;
        source.handle = Some(handle);
        Ok(())
    }

    /// Make appends to the destination leave existing messages untouched
    async fn prepare_destination(&self, mailbox: &str, dest: &mut Side<'_>) -> Result<()> {
        let prepared = if dest.store.is_remote() {
            // a half-open connection drops every selected handle
            dest.handle = None;
            dest.store.open_half().await
        } else {
            dest.close().await
        };
        prepared.map_err(|e| {
            Error::Connection(format!(
                "Failed to prepare {} on {} for copying: {}",
                mailbox,
                dest.store.name(),
                e
            ))
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn copy_one(
        &self,
        mailbox: &str,
        source: &mut Side<'_>,
        dest: &mut Side<'_>,
        id: &MessageIdentity,
        position: Position,
        direction: Direction,
        report: &mut MailboxReport,
    ) -> Result<bool> {
        let handle = open_handle(source, mailbox)?;

        let metadata = match attempt(source.store.fetch_metadata(handle, position).await)? {
            Attempt::Done(metadata) => metadata,
            Attempt::Failed(e) => {
                warn!("{}: cannot fetch {} from {}: {}", mailbox, id, source.store.name(), e);
                report.failed_copies += 1;
                return Ok(false);
            }
        };
        if self.deriver.derive(&metadata).as_ref() != Some(id) {
            warn!(
                "{}: message {} on {} no longer matches {}, copying anyway",
                mailbox,
                position,
                source.store.name(),
                id
            );
        }
        if metadata.flags.deleted && !self.options.copy_deleted {
            debug!("{}: not copying deleted message {}", mailbox, id);
            report.skipped_deleted += 1;
            return Ok(false);
        }
        if let Some(limit) = self.options.size_limit {
            if metadata.size > limit {
                info!(
                    "{}: {} is {} bytes, over the limit of {}, not copying",
                    mailbox, id, metadata.size, limit
                );
                report.too_big += 1;
                return Ok(false);
            }
        }

        if self.options.simulate {
            info!("{}: would copy {} {} {}", mailbox, id, direction.arrow(), dest.store.name());
            return Ok(true);
        }

        let raw = match attempt(source.store.fetch_raw(handle, position).await)? {
            Attempt::Done(raw) => raw,
            Attempt::Failed(e) => {
                warn!("{}: cannot fetch body of {}: {}", mailbox, id, e);
                report.failed_copies += 1;
                return Ok(false);
            }
        };
        let appended = dest
            .store
            .append(mailbox, metadata.flags, metadata.internal_date, &raw)
            .await;
        match attempt(appended)? {
            Attempt::Done(true) => {
                debug!("{} {} {}", id, direction.arrow(), mailbox);
                Ok(true)
            }
            Attempt::Done(false) => {
                warn!("{}: {} refused {}", mailbox, dest.store.name(), id);
                report.failed_copies += 1;
                Ok(false)
            }
            Attempt::Failed(e) => {
                warn!("{}: copying {} to {} failed: {}", mailbox, id, dest.store.name(), e);
                report.failed_copies += 1;
                Ok(false)
            }
        }
    }

    /// Expunge one side; failures only cost the count
    async fn expunge(&self, mailbox: &str, side: &mut Side<'_>) -> u32 {
        let reopen = !matches!(&side.handle, Some(h) if h.mode() == OpenMode::ReadWrite);
        if reopen {
            if let Err(e) = side.close().await {
                debug!("{}: closing before expunge failed: {}", mailbox, e);
            }
            match side.store.open(mailbox, OpenMode::ReadWrite).await {
                Ok(handle) => side.handle = Some(handle),
                Err(e) => {
                    warn!("{}: cannot reopen on {} to expunge: {}", mailbox, side.store.name(), e);
                    return 0;
                }
            }
        }
        let Some(handle) = side.handle.as_mut() else {
            return 0;
        };
        match side.store.expunge(handle).await {
            Ok(count) => count,
            Err(e) => {
                warn!("{}: expunge on {} failed: {}", mailbox, side.store.name(), e);
                0
            }
        }
    }
}

fn open_handle<'s>(side: &'s Side<'_>, mailbox: &str) -> Result<&'s MailboxHandle> {
    side.handle.as_ref().ok_or_else(|| {
        Error::StalePosition(format!(
            "{} is not open on {}",
            mailbox,
            side.store.name()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::classify;
    use crate::snapshot::{take_snapshot, ShowMessages};
    use mailsync_common::types::{IdentityScheme, MessageFlags};
    use mailsync_common::StoreConfig;
    use mailsync_storage::memory::{MemoryStore, StoreCall};
    use mailsync_storage::MailStore;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn raw(id: &str) -> Vec<u8> {
        format!("Message-ID: {}\r\nSubject: {}\r\n\r\nbody of {}\r\n", id, id, id).into_bytes()
    }

    fn wrap(backend: &MemoryStore) -> Store {
        Store::new(
            backend.name(),
            &StoreConfig::default(),
            Box::new(backend.clone()),
            Duration::from_secs(5),
        )
    }

    fn ids(list: &[&str]) -> BTreeSet<MessageIdentity> {
        list.iter().map(|s| MessageIdentity::header(s)).collect()
    }

    async fn side<'a>(store: &'a Store, deriver: &IdentityDeriver, mode: OpenMode) -> Side<'a> {
        let handle = store.open("INBOX", mode).await.unwrap();
        let snapshot = take_snapshot(store, &handle, deriver, ShowMessages::default())
            .await
            .unwrap();
        Side::new(store, handle, snapshot)
    }

    #[tokio::test]
    async fn test_removals_precede_copies_and_expunge_is_last() {
        let mem_a = MemoryStore::new("a");
        let mem_b = MemoryStore::new("b").remote(true);
        mem_a.add_message("INBOX", &raw("<new@a>"), MessageFlags::default());
        mem_a.add_message("INBOX", &raw("<old@x>"), MessageFlags::default());
        mem_b.add_mailbox("INBOX");

        let (a, b) = (wrap(&mem_a), wrap(&mem_b));
        a.connect().await.unwrap();
        b.connect().await.unwrap();
        let deriver = IdentityDeriver::new(IdentityScheme::Header, false);

        let mut side_a = side(&a, &deriver, OpenMode::ReadWrite).await;
        let mut side_b = side(&b, &deriver, OpenMode::ReadWrite).await;
        let plan = classify(
            &ids(&["<old@x>"]),
            &side_a.snapshot.identities(),
            &side_b.snapshot.identities(),
        );
        assert_eq!(plan.remove_a, ids(&["<old@x>"]));
        assert_eq!(plan.copy_a_to_b, ids(&["<new@a>"]));

        mem_a.clear_calls();
        mem_b.clear_calls();
        let engine = ApplyEngine::new(&deriver, ApplyOptions::default());
        let mut report = MailboxReport::new("INBOX");
        let now = engine
            .apply("INBOX", &mut side_a, &mut side_b, &plan, &mut report)
            .await
            .unwrap();

        assert_eq!(now, ids(&["<new@a>"]));
        assert_eq!(report.removed_a, 1);
        assert_eq!(report.copied_a_to_b, 1);
        assert_eq!(report.expunged_a, 1);

        let calls_a = mem_a.calls();
        let flagged = calls_a
            .iter()
            .position(|c| matches!(c, StoreCall::FlagDeleted(_, 2)))
            .unwrap();
        let fetched_body = calls_a
            .iter()
            .position(|c| matches!(c, StoreCall::FetchRaw(_, 1)))
            .unwrap();
        let expunged = calls_a
            .iter()
            .position(|c| matches!(c, StoreCall::Expunge(_)))
            .unwrap();
        assert!(flagged < fetched_body);
        assert!(fetched_body < expunged);

        // remote destination is half-open while appending
        let calls_b = mem_b.calls();
        let half = calls_b.iter().position(|c| *c == StoreCall::OpenHalf).unwrap();
        let append = calls_b
            .iter()
            .position(|c| matches!(c, StoreCall::Append(_)))
            .unwrap();
        assert!(half < append);
        assert!(!mem_b.messages("INBOX")[0].flags.seen);
        assert_eq!(mem_a.message_ids("INBOX"), vec!["<new@a>"]);
    }

    #[tokio::test]
    async fn test_local_destination_is_closed_before_append() {
        let mem_a = MemoryStore::new("a");
        let mem_b = MemoryStore::new("b");
        mem_a.add_message("INBOX", &raw("<m1@a>"), MessageFlags::default());
        mem_b.add_mailbox("INBOX");

        let (a, b) = (wrap(&mem_a), wrap(&mem_b));
        a.connect().await.unwrap();
        b.connect().await.unwrap();
        let deriver = IdentityDeriver::new(IdentityScheme::Header, false);
        let mut side_a = side(&a, &deriver, OpenMode::ReadWrite).await;
        let mut side_b = side(&b, &deriver, OpenMode::ReadWrite).await;
        let plan = classify(
            &BTreeSet::new(),
            &side_a.snapshot.identities(),
            &side_b.snapshot.identities(),
        );

        mem_b.clear_calls();
        let engine = ApplyEngine::new(&deriver, ApplyOptions::default());
        let mut report = MailboxReport::new("INBOX");
        engine
            .apply("INBOX", &mut side_a, &mut side_b, &plan, &mut report)
            .await
            .unwrap();

        let calls_b = mem_b.calls();
        assert_eq!(calls_b[0], StoreCall::Close("INBOX".to_string()));
        assert_eq!(calls_b[1], StoreCall::Append("INBOX".to_string()));
        // an appended message is not marked seen by a selected mailbox
        assert!(!mem_b.messages("INBOX")[0].flags.seen);
    }

    #[tokio::test]
    async fn test_failed_copy_is_excluded_from_now() {
        let mem_a = MemoryStore::new("a");
        let mem_b = MemoryStore::new("b");
        mem_a.add_message("INBOX", &raw("<ok@a>"), MessageFlags::default());
        mem_a.add_message("INBOX", &raw("<bad@a>"), MessageFlags::default());
        mem_b.add_mailbox("INBOX");
        mem_b.fail_append_of("<bad@a>");

        let (a, b) = (wrap(&mem_a), wrap(&mem_b));
        a.connect().await.unwrap();
        b.connect().await.unwrap();
        let deriver = IdentityDeriver::new(IdentityScheme::Header, false);
        let mut side_a = side(&a, &deriver, OpenMode::ReadWrite).await;
        let mut side_b = side(&b, &deriver, OpenMode::ReadWrite).await;
        let plan = classify(
            &BTreeSet::new(),
            &side_a.snapshot.identities(),
            &side_b.snapshot.identities(),
        );

        let engine = ApplyEngine::new(&deriver, ApplyOptions::default());
        let mut report = MailboxReport::new("INBOX");
        let now = engine
            .apply("INBOX", &mut side_a, &mut side_b, &plan, &mut report)
            .await
            .unwrap();

        assert_eq!(now, ids(&["<ok@a>"]));
        assert_eq!(report.failed_copies, 1);
        assert_eq!(report.copied_a_to_b, 1);
    }

    #[tokio::test]
    async fn test_size_limit_and_deleted_are_skipped() {
        let mem_a = MemoryStore::new("a");
        let mem_b = MemoryStore::new("b");
        let big = format!(
            "Message-ID: <big@a>\r\nSubject: big\r\n\r\n{}\r\n",
            "x".repeat(500)
        );
        mem_a.add_message("INBOX", big.as_bytes(), MessageFlags::default());
        let deleted = MessageFlags {
            deleted: true,
            ..Default::default()
        };
        mem_a.add_message("INBOX", &raw("<del@a>"), deleted);
        mem_b.add_mailbox("INBOX");

        let (a, b) = (wrap(&mem_a), wrap(&mem_b));
        a.connect().await.unwrap();
        b.connect().await.unwrap();
        let deriver = IdentityDeriver::new(IdentityScheme::Header, false);
        let mut side_a = side(&a, &deriver, OpenMode::ReadWrite).await;
        let mut side_b = side(&b, &deriver, OpenMode::ReadWrite).await;
        let plan = classify(
            &BTreeSet::new(),
            &side_a.snapshot.identities(),
            &side_b.snapshot.identities(),
        );

        let options = ApplyOptions {
            size_limit: Some(200),
            expunge: false,
            ..Default::default()
        };
        let engine = ApplyEngine::new(&deriver, options);
        let mut report = MailboxReport::new("INBOX");
        let now = engine
            .apply("INBOX", &mut side_a, &mut side_b, &plan, &mut report)
            .await
            .unwrap();

        assert!(now.is_empty());
        assert_eq!(report.too_big, 1);
        assert_eq!(report.skipped_deleted, 1);
        assert!(mem_b.messages("INBOX").is_empty());
    }

    #[tokio::test]
    async fn test_removal_aborted_on_concurrent_change() {
        let mem_a = MemoryStore::new("a");
        let mem_b = MemoryStore::new("b");
        mem_a.add_message("INBOX", &raw("<gone@x>"), MessageFlags::default());
        mem_b.add_mailbox("INBOX");

        let (a, b) = (wrap(&mem_a), wrap(&mem_b));
        a.connect().await.unwrap();
        b.connect().await.unwrap();
        let deriver = IdentityDeriver::new(IdentityScheme::Header, false);
        let mut side_a = side(&a, &deriver, OpenMode::ReadWrite).await;
        let mut side_b = side(&b, &deriver, OpenMode::ReadWrite).await;

        // the snapshot believes another message sits at position 1
        side_a.snapshot = MailboxSnapshot::from_entries(vec![(
            Some(MessageIdentity::header("<other@x>")),
            side_a.handle.as_ref().unwrap().position(1).unwrap(),
        )]);
        let plan = classify(
            &ids(&["<other@x>"]),
            &side_a.snapshot.identities(),
            &side_b.snapshot.identities(),
        );

        let engine = ApplyEngine::new(&deriver, ApplyOptions::default());
        let mut report = MailboxReport::new("INBOX");
        engine
            .apply("INBOX", &mut side_a, &mut side_b, &plan, &mut report)
            .await
            .unwrap();

        assert_eq!(report.removed_a, 0);
        assert_eq!(report.failed_removals, 1);
        assert_eq!(mem_a.message_ids("INBOX"), vec!["<gone@x>"]);
    }

    #[tokio::test]
    async fn test_simulate_mutates_nothing() {
        let mem_a = MemoryStore::new("a");
        let mem_b = MemoryStore::new("b");
        mem_a.add_message("INBOX", &raw("<m@a>"), MessageFlags::default());
        mem_b.add_message("INBOX", &raw("<old@x>"), MessageFlags::default());

        let (a, b) = (wrap(&mem_a), wrap(&mem_b));
        a.connect().await.unwrap();
        b.connect().await.unwrap();
        let deriver = IdentityDeriver::new(IdentityScheme::Header, false);
        let mut side_a = side(&a, &deriver, OpenMode::ReadOnly).await;
        let mut side_b = side(&b, &deriver, OpenMode::ReadOnly).await;
        let plan = classify(
            &ids(&["<old@x>"]),
            &side_a.snapshot.identities(),
            &side_b.snapshot.identities(),
        );

        mem_a.clear_calls();
        mem_b.clear_calls();
        let options = ApplyOptions {
            simulate: true,
            ..Default::default()
        };
        let engine = ApplyEngine::new(&deriver, options);
        let mut report = MailboxReport::new("INBOX");
        engine
            .apply("INBOX", &mut side_a, &mut side_b, &plan, &mut report)
            .await
            .unwrap();

        assert_eq!(report.copied_a_to_b, 1);
        assert_eq!(report.removed_b, 1);
        let mutating = |c: &StoreCall| {
            matches!(
                c,
                StoreCall::Append(_) | StoreCall::FlagDeleted(..) | StoreCall::Expunge(_)
            )
        };
        assert!(!mem_a.calls().iter().any(mutating));
        assert!(!mem_b.calls().iter().any(mutating));
        assert_eq!(mem_b.message_ids("INBOX"), vec!["<old@x>"]);
    }
}

//! Mailbox snapshot
//!
//! One scan of an open mailbox: identity to first position, in-mailbox
//! duplicates, and the count of messages without an identity.

use crate::identity::{IdentityDeriver, MessageIdentity};
use crate::report::message_line;
use crate::store::Store;
use mailsync_common::Result;
use mailsync_storage::{MailboxHandle, Position};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

/// Per-message display switches
#[derive(Debug, Clone, Copy, Default)]
pub struct ShowMessages {
    pub enabled: bool,
    pub with_ids: bool,
}

/// Identity positions of one mailbox at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailboxSnapshot {
    /// First position of every identity
    pub positions: BTreeMap<MessageIdentity, Position>,
    /// Later occurrences, in position order
    pub duplicates: Vec<(MessageIdentity, Position)>,
    /// Messages without a derivable identity
    pub absent: u32,
}

impl MailboxSnapshot {
    /// Build from identities in store order
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (Option<MessageIdentity>, Position)>,
    {
        let mut snapshot = Self::default();
        for (identity, position) in entries {
            snapshot.record(identity, position);
        }
        snapshot
    }

    /// Record one message; returns whether it was a duplicate
    fn record(&mut self, identity: Option<MessageIdentity>, position: Position) -> bool {
        let Some(identity) = identity else {
            self.absent += 1;
            return false;
        };
        if self.positions.contains_key(&identity) {
            self.duplicates.push((identity, position));
            true
        } else {
            self.positions.insert(identity, position);
            false
        }
    }

    /// Identities present now
    pub fn identities(&self) -> BTreeSet<MessageIdentity> {
        self.positions.keys().cloned().collect()
    }

    pub fn position(&self, identity: &MessageIdentity) -> Option<Position> {
        self.positions.get(identity).copied()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// Scan every message of an open mailbox
///
/// A failed fetch fails the whole snapshot; positions after it cannot be
/// trusted.
pub async fn take_snapshot(
    store: &Store,
    handle: &MailboxHandle,
    deriver: &IdentityDeriver,
    show: ShowMessages,
) -> Result<MailboxSnapshot> {
    let mut snapshot = MailboxSnapshot::default();
    for position in handle.positions() {
        let metadata = store.fetch_metadata(handle, position).await?;
        let identity = deriver.derive(&metadata);
        let shown = show.enabled.then(|| identity.clone());
        let duplicate = snapshot.record(identity, position);

        if let Some(identity) = shown {
            let marker = match (&identity, duplicate) {
                (None, _) => Some("no identity"),
                (Some(_), true) => Some("duplicate"),
                (Some(_), false) => None,
            };
            info!(
                target: "mailsync::message",
                "{}",
                message_line(position.seq(), identity.as_ref(), &metadata, show.with_ids, marker)
            );
        }
    }
    Ok(snapshot)
}

//! Channel runner
//!
//! Drives one invocation: a full synchronization of a channel, a
//! comparison of one store against the channel's checkpoint, or a listing
//! of one store.

use crate::apply::{ApplyEngine, ApplyOptions, Side};
use crate::checkpoint::{CheckpointStore, LastKnown, MailboxState};
use crate::identity::{IdentityDeriver, MessageIdentity};
use crate::reconcile::classify;
use crate::report::{
    DiffMailbox, DiffReport, ListReport, ListedEntry, MailboxReport, MailboxStatus, RunReport,
};
use crate::snapshot::{take_snapshot, MailboxSnapshot, ShowMessages};
use crate::store::Store;
use mailsync_common::types::{CheckpointMode, IdentityScheme};
use mailsync_common::{Config, Error, Result, SyncOptions};
use mailsync_storage::{MailboxHandle, OpenMode};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// What the given names ask for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Sync { channel: String },
    Diff { channel: String, store: String },
    List { store: String },
}

impl Invocation {
    /// Resolve command line names against the configuration
    pub fn resolve(config: &Config, names: &[String]) -> Result<Self> {
        match names {
            [name] if config.channel(name).is_some() => Ok(Invocation::Sync {
                channel: name.clone(),
            }),
            [name] if config.store(name).is_some() => Ok(Invocation::List {
                store: name.clone(),
            }),
            [name] => Err(Error::Config(format!(
                "{} is neither a channel nor a store",
                name
            ))),
            [channel, store] => {
                let config_channel = config
                    .channel(channel)
                    .ok_or_else(|| Error::Config(format!("Unknown channel {}", channel)))?;
                if config_channel.store_a != *store && config_channel.store_b != *store {
                    return Err(Error::Config(format!(
                        "Store {} is not part of channel {}",
                        store, channel
                    )));
                }
                Ok(Invocation::Diff {
                    channel: channel.clone(),
                    store: store.clone(),
                })
            }
            _ => Err(Error::Config(
                "Expected a channel, a channel and one of its stores, or a store".to_string(),
            )),
        }
    }
}

/// Result of an invocation
#[derive(Debug, Clone)]
pub enum Outcome {
    Sync(RunReport),
    Diff(DiffReport),
    List(ListReport),
}

/// Run an invocation
pub async fn run(config: &Config, invocation: &Invocation) -> Result<Outcome> {
    match invocation {
        Invocation::Sync { channel } => {
            let mut sync = Synchronizer::from_config(config, channel)?;
            Ok(Outcome::Sync(sync.sync().await?))
        }
        Invocation::Diff { channel, store } => {
            let mut sync = Synchronizer::from_config(config, channel)?;
            Ok(Outcome::Diff(sync.diff(store).await?))
        }
        Invocation::List { store } => {
            let store_config = config
                .store(store)
                .ok_or_else(|| Error::Config(format!("Unknown store {}", store)))?;
            let mut store = Store::from_config(
                store,
                store_config,
                Duration::from_secs(config.sync.call_timeout_secs),
            )?;
            let scheme = config
                .channels
                .values()
                .find(|c| c.store_a == store.name() || c.store_b == store.name())
                .map(|c| c.identity)
                .unwrap_or_default();
            let deriver = IdentityDeriver::new(scheme, config.sync.report_malformed_ids);
            Ok(Outcome::List(
                list_store(&mut store, &deriver, show_messages(&config.sync)).await?,
            ))
        }
    }
}

fn show_messages(options: &SyncOptions) -> ShowMessages {
    ShowMessages {
        enabled: options.show_messages || options.show_message_ids,
        with_ids: options.show_message_ids,
    }
}

async fn close_quietly(store: &Store, handle: MailboxHandle) {
    if let Err(e) = store.close(handle).await {
        debug!("{}: close failed: {}", store.name(), e);
    }
}

/// Connect a store and list its mailboxes; failures are fatal
async fn prepare_store(store: &mut Store) -> Result<()> {
    store.connect().await.map_err(|e| {
        if e.is_fatal() {
            e
        } else {
            Error::Connection(format!("Failed to connect to {}: {}", store.name(), e))
        }
    })?;
    if let Err(e) = store.acquire_mailbox_list().await {
        return Err(Error::Connection(format!(
            "Failed to list mailboxes on {}: {}",
            store.name(),
            e
        )));
    }
    Ok(())
}

/// Open a mailbox and snapshot it, closing the handle again on failure
async fn open_and_snapshot(
    store: &Store,
    mailbox: &str,
    mode: OpenMode,
    deriver: &IdentityDeriver,
    show: ShowMessages,
) -> Result<(MailboxHandle, MailboxSnapshot)> {
    let handle = store.open(mailbox, mode).await?;
    if show.enabled {
        info!(target: "mailsync::message", "{} on {}:", mailbox, store.name());
    }
    match take_snapshot(store, &handle, deriver, show).await {
        Ok(snapshot) => Ok((handle, snapshot)),
        Err(e) => {
            close_quietly(store, handle).await;
            Err(e)
        }
    }
}

/// Synchronizes one channel
pub struct Synchronizer {
    channel: String,
    a: Store,
    b: Store,
    checkpoint: CheckpointStore,
    deriver: IdentityDeriver,
    options: SyncOptions,
    size_limit: Option<u64>,
}

impl Synchronizer {
    pub fn new(
        channel: &str,
        a: Store,
        b: Store,
        checkpoint: CheckpointStore,
        scheme: IdentityScheme,
        options: SyncOptions,
        size_limit: Option<u64>,
    ) -> Self {
        Self {
            channel: channel.to_string(),
            a,
            b,
            checkpoint,
            deriver: IdentityDeriver::new(scheme, options.report_malformed_ids),
            options,
            size_limit,
        }
    }

    /// Build a synchronizer for a configured channel
    pub fn from_config(config: &Config, channel: &str) -> Result<Self> {
        let channel_config = config
            .channel(channel)
            .ok_or_else(|| Error::Config(format!("Unknown channel {}", channel)))?;
        let timeout = Duration::from_secs(config.sync.call_timeout_secs);
        let store = |name: &str| -> Result<Store> {
            let store_config = config
                .store(name)
                .ok_or_else(|| Error::Config(format!("Unknown store {}", name)))?;
            Store::from_config(name, store_config, timeout)
        };

        let a = store(&channel_config.store_a)?;
        let b = store(&channel_config.store_b)?;
        let checkpoint = CheckpointStore::new(
            store(&channel_config.checkpoint.store)?,
            &channel_config.checkpoint.mailbox,
            channel_config.identity,
        );
        Ok(Self::new(
            channel,
            a,
            b,
            checkpoint,
            channel_config.identity,
            config.sync.clone(),
            channel_config.size_limit,
        ))
    }

    fn apply_options(&self) -> ApplyOptions {
        ApplyOptions {
            expunge: self.options.expunge,
            expunge_duplicates: self.options.expunge_duplicates,
            simulate: self.options.simulate,
            copy_deleted: self.options.copy_deleted_messages,
            size_limit: self.size_limit,
        }
    }

    /// Keep the checkpoint mailbox itself out of the synchronized set
    fn hide_checkpoint_mailbox(&mut self) {
        let mailbox = self.checkpoint.mailbox().to_string();
        if self.checkpoint.store_name() == self.a.name() {
            self.a.forget(&mailbox);
        }
        if self.checkpoint.store_name() == self.b.name() {
            self.b.forget(&mailbox);
        }
    }

    /// Run one full synchronization pass
    pub async fn sync(&mut self) -> Result<RunReport> {
        let run_id = Uuid::now_v7();
        let span = info_span!("sync", channel = %self.channel, run = %run_id);
        self.sync_inner(run_id).instrument(span).await
    }

    async fn sync_inner(&mut self, run_id: Uuid) -> Result<RunReport> {
        let simulate = self.options.simulate;
        info!(
            "Synchronizing channel {} ({} <-> {}){}",
            self.channel,
            self.a.name(),
            self.b.name(),
            if simulate { ", simulating" } else { "" }
        );

        prepare_store(&mut self.a).await?;
        prepare_store(&mut self.b).await?;
        self.hide_checkpoint_mailbox();

        let known: BTreeSet<String> = self
            .a
            .mailboxes()
            .keys()
            .chain(self.b.mailboxes().keys())
            .cloned()
            .collect();

        self.checkpoint.connect().await?;
        let last = self.checkpoint.read(&self.channel, &known, simulate).await?;
        for mailbox in &last.deleted_mailboxes {
            info!("Mailbox {} no longer exists on either side, forgetting it", mailbox);
        }

        let mut order: Vec<String> = known.into_iter().collect();
        self.options.traversal.sort(&mut order);

        let mut report = RunReport {
            run_id: run_id.to_string(),
            channel: self.channel.clone(),
            simulate,
            deleted_mailboxes: last.deleted_mailboxes.iter().cloned().collect(),
            ..Default::default()
        };
        let mut state: MailboxState = last.by_mailbox.clone();

        for mailbox in &order {
            let previous = last.mailbox(mailbox);
            let mailbox_report = match self.sync_mailbox(mailbox, &previous).await {
                Ok((mailbox_report, Some(now))) => {
                    state.insert(mailbox.clone(), now);
                    mailbox_report
                }
                Ok((mailbox_report, None)) => mailbox_report,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Skipping mailbox {}: {}", mailbox, e);
                    MailboxReport::skipped(mailbox, MailboxStatus::Skipped, e.to_string())
                }
            };
            debug!("{}", mailbox_report.summary());
            report.mailboxes.push(mailbox_report);

            if self.options.checkpoint_mode == CheckpointMode::PerMailbox && !simulate {
                self.checkpoint
                    .write(&self.channel, &state, &last.deleted_mailboxes)
                    .await?;
            }
        }

        if self.options.delete_empty_mailboxes {
            self.delete_empty_mailboxes(&mut report, &mut state).await?;
        }

        if !simulate {
            self.checkpoint
                .write(&self.channel, &state, &last.deleted_mailboxes)
                .await?;
            report.checkpoint_written = true;
        }

        info!(
            "Channel {} done: {} copied, {} removed",
            self.channel,
            report.copied(),
            report.removed()
        );
        Ok(report)
    }

    /// Reconcile one mailbox; `None` keeps the previous state
    async fn sync_mailbox(
        &mut self,
        mailbox: &str,
        last: &BTreeSet<MessageIdentity>,
    ) -> Result<(MailboxReport, Option<BTreeSet<MessageIdentity>>)> {
        let simulate = self.options.simulate;
        let mut report = MailboxReport::new(mailbox);

        for (store, created) in [
            (&mut self.a, &mut report.created_a),
            (&mut self.b, &mut report.created_b),
        ] {
            if store.contains(mailbox) {
                continue;
            }
            if simulate {
                info!("Would create mailbox {} on {}", mailbox, store.name());
                *created = true;
                continue;
            }
            match store.create(mailbox).await {
                Ok(true) => {
                    info!("Created mailbox {} on {}", mailbox, store.name());
                    *created = true;
                }
                Ok(false) => {
                    let reason = format!("could not create it on {}", store.name());
                    return Ok((
                        MailboxReport::skipped(mailbox, MailboxStatus::Skipped, reason),
                        None,
                    ));
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    let reason = format!("could not create it on {}: {}", store.name(), e);
                    return Ok((
                        MailboxReport::skipped(mailbox, MailboxStatus::Skipped, reason),
                        None,
                    ));
                }
            }
        }

        let no_select = [&self.a, &self.b].iter().any(|store| {
            store
                .mailboxes()
                .get(mailbox)
                .map(|attributes| attributes.no_select)
                .unwrap_or(false)
        });
        if no_select {
            return Ok((
                MailboxReport::skipped(mailbox, MailboxStatus::NoSelect, "not selectable"),
                None,
            ));
        }

        let mode = if simulate {
            OpenMode::ReadOnly
        } else {
            OpenMode::ReadWrite
        };
        let show = show_messages(&self.options);
        let (a, b) = (&self.a, &self.b);

        // a mailbox that would be created in simulation is empty
        let mut side_a = if a.contains(mailbox) {
            let (handle, snapshot) =
                open_and_snapshot(a, mailbox, mode, &self.deriver, show).await?;
            Side::new(a, handle, snapshot)
        } else {
            Side {
                store: a,
                handle: None,
                snapshot: MailboxSnapshot::default(),
            }
        };
        let mut side_b = if b.contains(mailbox) {
            match open_and_snapshot(b, mailbox, mode, &self.deriver, show).await {
                Ok((handle, snapshot)) => Side::new(b, handle, snapshot),
                Err(e) => {
                    if let Err(close) = side_a.close().await {
                        debug!("{}: close failed on {}: {}", mailbox, a.name(), close);
                    }
                    return Err(e);
                }
            }
        } else {
            Side {
                store: b,
                handle: None,
                snapshot: MailboxSnapshot::default(),
            }
        };

        let plan = classify(
            last,
            &side_a.snapshot.identities(),
            &side_b.snapshot.identities(),
        );
        debug!(
            mailbox = %mailbox,
            copy_a_to_b = plan.copy_a_to_b.len(),
            copy_b_to_a = plan.copy_b_to_a.len(),
            remove_a = plan.remove_a.len(),
            remove_b = plan.remove_b.len(),
            "Classified mailbox"
        );

        let engine = ApplyEngine::new(&self.deriver, self.apply_options());
        let applied = engine
            .apply(mailbox, &mut side_a, &mut side_b, &plan, &mut report)
            .await;
        for side in [&mut side_a, &mut side_b] {
            if let Err(e) = side.close().await {
                debug!("{}: close failed on {}: {}", mailbox, side.store.name(), e);
            }
        }
        let now = applied?;
        Ok((report, Some(now)))
    }

    async fn delete_empty_mailboxes(
        &mut self,
        report: &mut RunReport,
        state: &mut MailboxState,
    ) -> Result<()> {
        for mailbox_report in report.mailboxes.iter_mut() {
            let mailbox = mailbox_report.mailbox.clone();
            let untouched = mailbox_report.status == MailboxStatus::Synced
                && mailbox_report.remaining == 0
                && mailbox_report.absent_a == 0
                && mailbox_report.absent_b == 0
                && mailbox_report.failed_copies == 0
                && mailbox_report.failed_removals == 0
                && mailbox_report.too_big == 0
                && mailbox_report.skipped_deleted == 0;
            if !untouched || mailbox.is_empty() || mailbox.eq_ignore_ascii_case("INBOX") {
                continue;
            }

            if self.options.simulate {
                info!("Would delete empty mailbox {}", mailbox);
                mailbox_report.status = MailboxStatus::Deleted;
                continue;
            }
            let mut deleted = true;
            for store in [&mut self.a, &mut self.b] {
                if !store.contains(&mailbox) {
                    continue;
                }
                match store.delete(&mailbox).await {
                    Ok(true) => info!("Deleted empty mailbox {} on {}", mailbox, store.name()),
                    Ok(false) => deleted = false,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!("Failed to delete {} on {}: {}", mailbox, store.name(), e);
                        deleted = false;
                    }
                }
            }
            if deleted {
                mailbox_report.status = MailboxStatus::Deleted;
                state.remove(&mailbox);
            }
        }
        Ok(())
    }

    /// Compare one store of the channel against the checkpoint
    pub async fn diff(&mut self, store: &str) -> Result<DiffReport> {
        let span = info_span!("diff", channel = %self.channel, store = %store);
        self.diff_inner(store).instrument(span).await
    }

    async fn diff_inner(&mut self, store_name: &str) -> Result<DiffReport> {
        let store = if self.a.name() == store_name {
            &mut self.a
        } else if self.b.name() == store_name {
            &mut self.b
        } else {
            return Err(Error::Config(format!(
                "Store {} is not part of channel {}",
                store_name, self.channel
            )));
        };

        prepare_store(store).await?;
        if self.checkpoint.store_name() == store.name() {
            store.forget(self.checkpoint.mailbox());
        }
        let known: BTreeSet<String> = store.mailboxes().keys().cloned().collect();

        self.checkpoint.connect().await?;
        let last: LastKnown = self.checkpoint.read(&self.channel, &known, true).await?;

        let mut order: Vec<String> = store
            .mailboxes()
            .iter()
            .filter(|(_, attributes)| !attributes.no_select)
            .map(|(name, _)| name.clone())
            .collect();
        self.options.traversal.sort(&mut order);

        let mut report = DiffReport {
            channel: self.channel.clone(),
            store: store_name.to_string(),
            ..Default::default()
        };
        let show = show_messages(&self.options);
        for mailbox in order {
            let (handle, snapshot) =
                match open_and_snapshot(store, &mailbox, OpenMode::ReadOnly, &self.deriver, show)
                    .await
                {
                    Ok(opened) => opened,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!("Skipping mailbox {}: {}", mailbox, e);
                        continue;
                    }
                };
            close_quietly(store, handle).await;

            let now = snapshot.identities();
            let previous = last.mailbox(&mailbox);
            let entry = DiffMailbox {
                new: now.difference(&previous).count() as u32,
                deleted: previous.difference(&now).count() as u32,
                current: now.intersection(&previous).count() as u32,
                mailbox,
            };
            debug!("{}", entry.summary());
            report.mailboxes.push(entry);
        }
        Ok(report)
    }
}

/// List the mailboxes of one store, and their messages when requested
pub async fn list_store(
    store: &mut Store,
    deriver: &IdentityDeriver,
    show: ShowMessages,
) -> Result<ListReport> {
    prepare_store(store).await?;

    let mut report = ListReport {
        store: store.name().to_string(),
        ..Default::default()
    };
    let listed: Vec<(String, _)> = store
        .mailboxes()
        .iter()
        .map(|(name, attributes)| (name.clone(), *attributes))
        .collect();

    for (mailbox, attributes) in listed {
        let mut entry = ListedEntry {
            mailbox: mailbox.clone(),
            no_select: attributes.no_select,
            no_inferiors: attributes.no_inferiors,
            ..Default::default()
        };
        if show.enabled && !attributes.no_select {
            match open_and_snapshot(store, &mailbox, OpenMode::ReadOnly, deriver, show).await {
                Ok((handle, snapshot)) => {
                    close_quietly(store, handle).await;
                    entry.messages = Some(
                        snapshot.len() as u32 + snapshot.duplicates.len() as u32 + snapshot.absent,
                    );
                    entry.duplicates = Some(snapshot.duplicates.len() as u32);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("Cannot read mailbox {}: {}", mailbox, e),
            }
        }
        debug!("{}", entry.summary());
        report.mailboxes.push(entry);
    }
    Ok(report)
}

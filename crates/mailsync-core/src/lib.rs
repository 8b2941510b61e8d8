//! Mailsync Core - three-way mailbox reconciliation
//!
//! This crate holds the synchronization engine: message identities, the
//! checkpoint of the last synchronized state, per-mailbox classification
//! and the application of the resulting actions to both stores.

pub mod apply;
pub mod checkpoint;
pub mod identity;
pub mod reconcile;
pub mod report;
pub mod runner;
pub mod snapshot;
pub mod store;

pub use apply::{ApplyEngine, ApplyOptions};
pub use checkpoint::{CheckpointStore, LastKnown, MailboxState};
pub use identity::{IdentityDeriver, MessageIdentity, SanitizeReport};
pub use reconcile::{classify, Classification};
pub use report::{DiffReport, ListReport, MailboxReport, MailboxStatus, RunReport};
pub use runner::{list_store, run, Invocation, Outcome, Synchronizer};
pub use snapshot::{take_snapshot, MailboxSnapshot, ShowMessages};
pub use store::{HierarchyDelimiter, Store};

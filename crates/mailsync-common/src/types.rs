//! Common types for mailsync

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Hierarchy delimiter used for canonical mailbox names
pub const DEFAULT_DELIMITER: char = '/';

/// Timestamp wrapper
pub type Timestamp = DateTime<Utc>;

/// Message flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MessageFlags {
    pub seen: bool,
    pub answered: bool,
    pub flagged: bool,
    pub deleted: bool,
    pub draft: bool,
}

impl MessageFlags {
    /// Render as an IMAP flag list, e.g. `\Seen \Flagged`
    pub fn to_imap_list(&self) -> String {
        let mut flags = Vec::new();
        if self.seen {
            flags.push("\\Seen");
        }
        if self.deleted {
            flags.push("\\Deleted");
        }
        if self.flagged {
            flags.push("\\Flagged");
        }
        if self.answered {
            flags.push("\\Answered");
        }
        if self.draft {
            flags.push("\\Draft");
        }
        flags.join(" ")
    }

    /// Parse an IMAP flag list; unknown keywords are ignored
    pub fn from_imap_list(list: &str) -> Self {
        let mut flags = Self::default();
        for flag in list
            .trim_matches(|c| c == '(' || c == ')')
            .split_whitespace()
        {
            match flag.to_ascii_lowercase().as_str() {
                "\\seen" => flags.seen = true,
                "\\answered" => flags.answered = true,
                "\\flagged" => flags.flagged = true,
                "\\deleted" => flags.deleted = true,
                "\\draft" => flags.draft = true,
                _ => {}
            }
        }
        flags
    }
}

/// Attributes reported when listing a mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MailboxAttributes {
    /// The mailbox cannot hold messages
    pub no_select: bool,
    /// The mailbox cannot have children
    pub no_inferiors: bool,
}

/// Copy direction between the two stores of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    AToB,
    BToA,
}

impl Direction {
    /// Arrow used in progress output
    pub fn arrow(&self) -> &'static str {
        match self {
            Direction::AToB => "->",
            Direction::BToA => "<-",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::AToB => write!(f, "a->b"),
            Direction::BToA => write!(f, "b->a"),
        }
    }
}

/// How message identities are derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IdentityScheme {
    /// The message's own Message-ID header
    #[default]
    Header,
    /// A digest over Date, Subject, Message-ID, From and To
    Digest,
}

impl std::fmt::Display for IdentityScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityScheme::Header => write!(f, "header"),
            IdentityScheme::Digest => write!(f, "digest"),
        }
    }
}

impl std::str::FromStr for IdentityScheme {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "header" | "msgid" => Ok(IdentityScheme::Header),
            "digest" | "md5" => Ok(IdentityScheme::Digest),
            other => Err(crate::Error::Config(format!(
                "Unknown message identity scheme: {}",
                other
            ))),
        }
    }
}

/// Order in which the mailboxes of a channel are traversed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TraversalOrder {
    /// Longest names first, ties broken lexically
    #[default]
    LongestFirst,
    /// Plain lexical order
    Lexical,
}

impl TraversalOrder {
    /// Sort mailbox names in place
    pub fn sort(&self, names: &mut [String]) {
        match self {
            TraversalOrder::LongestFirst => {
                names.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)))
            }
            TraversalOrder::Lexical => names.sort(),
        }
    }
}

/// When the checkpoint record is rewritten
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointMode {
    /// Once, after every mailbox has been processed
    #[default]
    EndOfRun,
    /// After each mailbox
    PerMailbox,
}

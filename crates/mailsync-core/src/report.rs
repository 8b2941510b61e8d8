//! Run reports

use crate::identity::MessageIdentity;
use mailsync_storage::MessageMetadata;
use serde::Serialize;

/// Outcome of one mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MailboxStatus {
    #[default]
    Synced,
    /// Not selectable on at least one side
    NoSelect,
    /// Skipped after a mailbox-level failure; previous state carried forward
    Skipped,
    /// Removed because it became empty
    Deleted,
}

/// Counts for one mailbox
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MailboxReport {
    pub mailbox: String,
    pub status: MailboxStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_a: bool,
    pub created_b: bool,
    pub copied_a_to_b: u32,
    pub copied_b_to_a: u32,
    pub removed_a: u32,
    pub removed_b: u32,
    pub failed_removals: u32,
    pub failed_copies: u32,
    pub too_big: u32,
    pub skipped_deleted: u32,
    pub duplicates_a: u32,
    pub duplicates_b: u32,
    pub absent_a: u32,
    pub absent_b: u32,
    pub expunged_a: u32,
    pub expunged_b: u32,
    pub remaining: u32,
}

impl MailboxReport {
    pub fn new(mailbox: &str) -> Self {
        Self {
            mailbox: mailbox.to_string(),
            ..Default::default()
        }
    }

    /// Report for a mailbox that was not processed
    pub fn skipped(mailbox: &str, status: MailboxStatus, reason: impl Into<String>) -> Self {
        Self {
            mailbox: mailbox.to_string(),
            status,
            reason: Some(reason.into()),
            ..Default::default()
        }
    }

    /// One-line summary
    pub fn summary(&self) -> String {
        let name = display_name(&self.mailbox);
        match self.status {
            MailboxStatus::Synced => {
                let mut line = format!(
                    "{}: {} a->b, {} b->a, {} removed a, {} removed b, {} remaining",
                    name,
                    self.copied_a_to_b,
                    self.copied_b_to_a,
                    self.removed_a,
                    self.removed_b,
                    self.remaining
                );
                let extras = [
                    (self.duplicates_a + self.duplicates_b, "duplicates"),
                    (self.failed_copies, "failed copies"),
                    (self.failed_removals, "failed removals"),
                    (self.too_big, "too big"),
                    (self.absent_a + self.absent_b, "without identity"),
                ];
                for (count, label) in extras {
                    if count > 0 {
                        line.push_str(&format!(", {} {}", count, label));
                    }
                }
                line
            }
            MailboxStatus::NoSelect => format!("{}: not selectable", name),
            MailboxStatus::Skipped => format!(
                "{}: skipped ({})",
                name,
                self.reason.as_deref().unwrap_or("unknown")
            ),
            MailboxStatus::Deleted => format!("{}: deleted (empty)", name),
        }
    }
}

/// Report of one synchronization run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub channel: String,
    pub simulate: bool,
    pub mailboxes: Vec<MailboxReport>,
    /// Mailboxes dropped from the checkpoint because neither side has them
    pub deleted_mailboxes: Vec<String>,
    pub checkpoint_written: bool,
}

impl RunReport {
    pub fn mailbox(&self, name: &str) -> Option<&MailboxReport> {
        self.mailboxes.iter().find(|m| m.mailbox == name)
    }

    /// Total messages transferred in both directions
    pub fn copied(&self) -> u32 {
        self.mailboxes
            .iter()
            .map(|m| m.copied_a_to_b + m.copied_b_to_a)
            .sum()
    }

    /// Total messages removed on both sides
    pub fn removed(&self) -> u32 {
        self.mailboxes.iter().map(|m| m.removed_a + m.removed_b).sum()
    }
}

/// Comparison of one mailbox against the checkpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffMailbox {
    pub mailbox: String,
    /// In the store, not in the checkpoint
    pub new: u32,
    /// In the checkpoint, not in the store
    pub deleted: u32,
    /// In both
    pub current: u32,
}

impl DiffMailbox {
    pub fn summary(&self) -> String {
        format!(
            "{}: {} new, {} deleted, {} current",
            display_name(&self.mailbox),
            self.new,
            self.deleted,
            self.current
        )
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiffReport {
    pub channel: String,
    pub store: String,
    pub mailboxes: Vec<DiffMailbox>,
}

/// One listed mailbox
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ListedEntry {
    pub mailbox: String,
    pub no_select: bool,
    pub no_inferiors: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicates: Option<u32>,
}

impl ListedEntry {
    pub fn summary(&self) -> String {
        let mut line = display_name(&self.mailbox).to_string();
        if self.no_select {
            line.push_str(" (no select)");
        }
        if self.no_inferiors {
            line.push_str(" (no inferiors)");
        }
        if let Some(messages) = self.messages {
            line.push_str(&format!(": {} messages", messages));
        }
        if let Some(duplicates) = self.duplicates.filter(|d| *d > 0) {
            line.push_str(&format!(", {} duplicates", duplicates));
        }
        line
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ListReport {
    pub store: String,
    pub mailboxes: Vec<ListedEntry>,
}

fn display_name(mailbox: &str) -> &str {
    if mailbox.is_empty() {
        "(root)"
    } else {
        mailbox
    }
}

/// One line describing a message
pub fn message_line(
    seq: u32,
    identity: Option<&MessageIdentity>,
    metadata: &MessageMetadata,
    with_id: bool,
    marker: Option<&str>,
) -> String {
    let mut line = format!(
        "{:>5} {} {} {}",
        seq,
        metadata.date.as_deref().unwrap_or("-"),
        metadata.first_from(),
        metadata.subject.as_deref().unwrap_or("")
    );
    if with_id {
        match identity {
            Some(identity) => line.push_str(&format!(" {}", identity)),
            None => line.push_str(" <>"),
        }
    }
    if let Some(marker) = marker {
        line.push_str(&format!(" ({})", marker));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_mailbox_summary() {
        let mut report = MailboxReport::new("work");
        report.copied_a_to_b = 2;
        report.removed_b = 1;
        report.remaining = 7;
        report.duplicates_a = 1;
        assert_eq!(
            report.summary(),
            "work: 2 a->b, 0 b->a, 0 removed a, 1 removed b, 7 remaining, 1 duplicates"
        );

        let skipped = MailboxReport::skipped("", MailboxStatus::Skipped, "open failed");
        assert_eq!(skipped.summary(), "(root): skipped (open failed)");
    }

    #[test]
    fn test_report_serializes() {
        let report = RunReport {
            channel: "c".to_string(),
            mailboxes: vec![MailboxReport::skipped("x", MailboxStatus::NoSelect, "a")],
            ..Default::default()
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["mailboxes"][0]["status"], "no_select");
        assert_eq!(json["checkpoint_written"], false);
    }

    #[test]
    fn test_message_line() {
        let metadata = MessageMetadata {
            date: Some("Tue, 1 Oct 2024".to_string()),
            subject: Some("hi".to_string()),
            from: vec!["a@b".to_string()],
            ..Default::default()
        };
        let id = MessageIdentity::header("<x@y>");
        assert_eq!(
            message_line(3, Some(&id), &metadata, true, Some("duplicate")),
            "    3 Tue, 1 Oct 2024 a@b hi <x@y> (duplicate)"
        );
        assert_eq!(
            message_line(12, None, &metadata, false, None),
            "   12 Tue, 1 Oct 2024 a@b hi"
        );
    }

    #[test]
    fn test_listed_entry_summary() {
        let entry = ListedEntry {
            mailbox: "a/b".to_string(),
            no_select: true,
            ..Default::default()
        };
        assert_eq!(entry.summary(), "a/b (no select)");
    }
}

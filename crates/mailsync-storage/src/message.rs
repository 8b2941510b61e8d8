//! Message metadata extraction

use mail_parser::MessageParser;
use mailsync_common::types::{MessageFlags, Timestamp};
use serde::{Deserialize, Serialize};

/// Header metadata, size and flags of one message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Raw Message-ID header value (unfolded, trimmed)
    pub message_id: Option<String>,
    /// Raw Date header value
    pub date: Option<String>,
    pub subject: Option<String>,
    /// From addresses
    pub from: Vec<String>,
    /// To addresses
    pub to: Vec<String>,
    /// Size in bytes
    pub size: u64,
    pub flags: MessageFlags,
    pub internal_date: Option<Timestamp>,
}

impl MessageMetadata {
    /// Extract metadata from a raw RFC 5322 message
    pub fn parse(raw: &[u8], flags: MessageFlags, internal_date: Option<Timestamp>) -> Self {
        let mut metadata = Self {
            size: raw.len() as u64,
            flags,
            internal_date,
            ..Default::default()
        };

        let Some(parsed) = MessageParser::default().parse(raw) else {
            return metadata;
        };

        for header in parsed.headers() {
            let slot = if header.name().eq_ignore_ascii_case("Message-ID") {
                &mut metadata.message_id
            } else if header.name().eq_ignore_ascii_case("Date") {
                &mut metadata.date
            } else {
                continue;
            };
            if slot.is_some() {
                continue;
            }
            let start = header.offset_start as usize;
            let end = header.offset_end as usize;
            if let Some(value) = raw.get(start..end) {
                *slot = Some(unfold(&String::from_utf8_lossy(value)));
            }
        }

        metadata.subject = parsed.subject().map(|s| s.to_string());
        metadata.from = parsed
            .from()
            .map(|list| {
                list.iter()
                    .filter_map(|a| a.address())
                    .map(|a| a.to_string())
                    .collect()
            })
            .unwrap_or_default();
        metadata.to = parsed
            .to()
            .map(|list| {
                list.iter()
                    .filter_map(|a| a.address())
                    .map(|a| a.to_string())
                    .collect()
            })
            .unwrap_or_default();

        metadata
    }

    /// First From address, or an empty string
    pub fn first_from(&self) -> &str {
        self.from.first().map(String::as_str).unwrap_or("")
    }
}

/// Join folded header lines and trim surrounding whitespace
fn unfold(value: &str) -> String {
    value
        .split(['\r', '\n'])
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("")
        .trim()
        .to_string()
}

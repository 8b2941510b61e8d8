//! Message identity derivation
//!
//! Two schemes are supported. The header scheme uses the message's own
//! Message-ID after sanitizing it into `<local@domain>` form. The digest
//! scheme hashes Date, Subject, Message-ID and the From/To address lists
//! with SHA-256.
//!
//! Identities are written to checkpoint records one per line. Header
//! identities are stored literally; digest identities are stored as
//! `<>, digest: <HEX>` so that they start with `<` like every identity
//! line yet can never collide with a real Message-ID.

use mailsync_common::types::IdentityScheme;
use mailsync_storage::MessageMetadata;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use tracing::warn;

/// Identity value of a message lacking a usable Message-ID
pub const PLACEHOLDER_ID: &str = "<>";

const DIGEST_PREFIX: &str = "<>, digest: <";

fn ip_literal() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9]{1,3}(\.[0-9]{1,3}){3}$").unwrap_or_else(|e| panic!("invalid regex: {e}"))
    })
}

/// Repairs made while sanitizing a Message-ID
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SanitizeReport {
    /// An opening or closing bracket was missing
    pub added_brackets: bool,
    /// Whitespace or control characters were replaced with `.`
    pub replaced_blanks: bool,
    /// Text after the closing bracket was dropped
    pub truncated: bool,
    /// A bare dotted-quad domain was wrapped in `[...]`
    pub wrapped_ip_literal: bool,
}

impl SanitizeReport {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }

    /// Human-readable list of repairs
    pub fn describe(&self) -> String {
        let mut repairs = Vec::new();
        if self.added_brackets {
            repairs.push("missing bracket");
        }
        if self.replaced_blanks {
            repairs.push("blank or control character");
        }
        if self.truncated {
            repairs.push("trailing text");
        }
        if self.wrapped_ip_literal {
            repairs.push("unbracketed IP literal");
        }
        repairs.join(", ")
    }
}

/// Canonicalize a raw Message-ID value
///
/// `sanitize_message_id(sanitize_message_id(x).0).0 == sanitize_message_id(x).0`
/// holds for every input.
pub fn sanitize_message_id(raw: &str) -> (String, SanitizeReport) {
    let mut report = SanitizeReport::default();
    let mut out = String::with_capacity(raw.len() + 2);

    if !raw.starts_with('<') {
        out.push('<');
        report.added_brackets = true;
    }

    let mut closed = false;
    for c in raw.chars() {
        if closed {
            report.truncated = true;
            break;
        }
        if c == '>' {
            out.push('>');
            closed = true;
        } else if c.is_whitespace() || c.is_control() {
            out.push('.');
            report.replaced_blanks = true;
        } else {
            out.push(c);
        }
    }
    if !closed {
        out.push('>');
        report.added_brackets = true;
    }

    // out is `<...>` here
    let inner = &out[1..out.len() - 1];
    if let Some(at) = inner.rfind('@') {
        let domain = &inner[at + 1..];
        if ip_literal().is_match(domain) {
            out = format!("<{}@[{}]>", &inner[..at], domain);
            report.wrapped_ip_literal = true;
        }
    }

    (out, report)
}

/// Canonical identity of one logical message
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MessageIdentity {
    scheme: IdentityScheme,
    value: String,
}

impl MessageIdentity {
    /// Identity from an already sanitized Message-ID
    pub fn header(value: &str) -> Self {
        Self {
            scheme: IdentityScheme::Header,
            value: value.to_string(),
        }
    }

    /// Identity from a lowercase hex digest
    pub fn digest(hex: &str) -> Self {
        Self {
            scheme: IdentityScheme::Digest,
            value: hex.to_string(),
        }
    }

    pub fn scheme(&self) -> IdentityScheme {
        self.scheme
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Render as a checkpoint line
    pub fn to_checkpoint_line(&self) -> String {
        match self.scheme {
            IdentityScheme::Header => self.value.clone(),
            IdentityScheme::Digest => format!("{}{}>", DIGEST_PREFIX, self.value),
        }
    }

    /// Parse a checkpoint line; `None` for lines that carry no identity
    pub fn from_checkpoint_line(line: &str) -> Option<Self> {
        if let Some(rest) = line.strip_prefix(DIGEST_PREFIX) {
            let hex = rest.strip_suffix('>')?;
            let valid = hex.len() == 64
                && hex
                    .chars()
                    .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
            return valid.then(|| Self::digest(hex));
        }
        if !line.starts_with('<') {
            return None;
        }
        let end = line.find('>')?;
        let value = &line[..=end];
        if value == PLACEHOLDER_ID {
            return None;
        }
        Some(Self::header(value))
    }
}

impl std::fmt::Display for MessageIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_checkpoint_line())
    }
}

/// Derives identities under one scheme
#[derive(Debug, Clone, Copy)]
pub struct IdentityDeriver {
    scheme: IdentityScheme,
    report_malformed: bool,
}

impl IdentityDeriver {
    pub fn new(scheme: IdentityScheme, report_malformed: bool) -> Self {
        Self {
            scheme,
            report_malformed,
        }
    }

    pub fn scheme(&self) -> IdentityScheme {
        self.scheme
    }

    /// Derive the identity of a message; `None` when it has no usable identity
    pub fn derive(&self, metadata: &MessageMetadata) -> Option<MessageIdentity> {
        match self.scheme {
            IdentityScheme::Header => self.derive_header(metadata),
            IdentityScheme::Digest => derive_digest(metadata),
        }
    }

    fn derive_header(&self, metadata: &MessageMetadata) -> Option<MessageIdentity> {
        let raw = metadata.message_id.as_deref().unwrap_or("");
        let (id, report) = sanitize_message_id(raw);

        if id == PLACEHOLDER_ID {
            warn!(
                "Message without Message-ID, From: {}, Subject: {}",
                metadata.first_from(),
                metadata.subject.as_deref().unwrap_or("")
            );
            return None;
        }
        if self.report_malformed && !report.is_clean() {
            warn!("Malformed Message-ID {:?} ({}), using {}", raw, report.describe(), id);
        }
        Some(MessageIdentity::header(&id))
    }
}

fn derive_digest(metadata: &MessageMetadata) -> Option<MessageIdentity> {
    let mut input = String::new();
    input.push_str(metadata.date.as_deref().unwrap_or(""));
    input.push_str(metadata.subject.as_deref().unwrap_or(""));
    input.push_str(metadata.message_id.as_deref().unwrap_or(""));
    for address in metadata.from.iter().chain(metadata.to.iter()) {
        input.push_str(&address.to_ascii_lowercase());
    }
    if input.is_empty() {
        return None;
    }

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    Some(MessageIdentity::digest(&hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn meta(message_id: Option<&str>) -> MessageMetadata {
        MessageMetadata {
            message_id: message_id.map(|s| s.to_string()),
            date: Some("Tue, 1 Oct 2024 10:00:00 +0000".to_string()),
            subject: Some("hello".to_string()),
            from: vec!["alice@example.org".to_string()],
            to: vec!["bob@example.net".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_sanitize_clean() {
        let (id, report) = sanitize_message_id("<abc@example.org>");
        assert_eq!(id, "<abc@example.org>");
        assert!(report.is_clean());
    }

    #[test]
    fn test_sanitize_repairs() {
        let (id, report) = sanitize_message_id("abc@example.org");
        assert_eq!(id, "<abc@example.org>");
        assert!(report.added_brackets);

        let (id, report) = sanitize_message_id("<a b\tc@x>");
        assert_eq!(id, "<a.b.c@x>");
        assert!(report.replaced_blanks);

        let (id, report) = sanitize_message_id("<abc@x> (added by relay)");
        assert_eq!(id, "<abc@x>");
        assert!(report.truncated);

        let (id, report) = sanitize_message_id("<abc@192.168.0.1>");
        assert_eq!(id, "<abc@[192.168.0.1]>");
        assert!(report.wrapped_ip_literal);
        assert_eq!(report.describe(), "unbracketed IP literal");
    }

    #[test]
    fn test_sanitize_ip_literal_edge_cases() {
        assert_eq!(sanitize_message_id("<a@[10.0.0.1]>").0, "<a@[10.0.0.1]>");
        assert_eq!(sanitize_message_id("<a@10..0.1>").0, "<a@10..0.1>");
        assert_eq!(sanitize_message_id("<a@1.2.3.4.5>").0, "<a@1.2.3.4.5>");
        assert_eq!(sanitize_message_id("<a@1234.2.3.4>").0, "<a@1234.2.3.4>");
        // only the last '@' counts
        assert_eq!(sanitize_message_id("<a@b@1.2.3.4>").0, "<a@b@[1.2.3.4]>");
    }

    #[test]
    fn test_sanitize_is_fixed_point() {
        let inputs = [
            "",
            "<",
            ">",
            "<>",
            "plain",
            "<a b@c> trailing",
            " <x@1.2.3.4",
            "<<nested>@host>",
            "a\u{7}b@10.0.0.255> junk",
            "<ü@例え.jp>",
        ];
        for input in inputs {
            let (once, _) = sanitize_message_id(input);
            let (twice, report) = sanitize_message_id(&once);
            assert_eq!(twice, once, "input {:?}", input);
            assert!(report.is_clean(), "input {:?}", input);
        }
    }

    #[test]
    fn test_derive_header() {
        let deriver = IdentityDeriver::new(IdentityScheme::Header, true);
        let id = deriver.derive(&meta(Some("abc@example.org"))).unwrap();
        assert_eq!(id, MessageIdentity::header("<abc@example.org>"));

        // textually different raw ids that canonicalize alike are one message
        let other = deriver.derive(&meta(Some("<abc@example.org>"))).unwrap();
        assert_eq!(id, other);
    }

    #[test]
    fn test_derive_header_missing() {
        let deriver = IdentityDeriver::new(IdentityScheme::Header, false);
        assert!(deriver.derive(&meta(None)).is_none());
        assert!(deriver.derive(&meta(Some(""))).is_none());
        assert!(deriver.derive(&meta(Some("<>"))).is_none());
    }

    #[test]
    fn test_derive_digest() {
        let deriver = IdentityDeriver::new(IdentityScheme::Digest, false);
        let a = deriver.derive(&meta(Some("<abc@example.org>"))).unwrap();
        let b = deriver.derive(&meta(Some("<abc@example.org>"))).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.scheme(), IdentityScheme::Digest);
        assert_eq!(a.value().len(), 64);

        // the digest covers the headers, not only the Message-ID
        let mut changed = meta(Some("<abc@example.org>"));
        changed.subject = Some("other".to_string());
        assert_ne!(deriver.derive(&changed).unwrap(), a);

        assert!(deriver.derive(&MessageMetadata::default()).is_none());
    }

    #[test]
    fn test_checkpoint_line_round_trip() {
        let header = IdentityDeriver::new(IdentityScheme::Header, false)
            .derive(&meta(Some("<x y@1.2.3.4>")))
            .unwrap();
        let digest = IdentityDeriver::new(IdentityScheme::Digest, false)
            .derive(&meta(Some("<x@y>")))
            .unwrap();

        for id in [header, digest] {
            let line = id.to_checkpoint_line();
            assert!(line.starts_with('<'));
            assert_eq!(MessageIdentity::from_checkpoint_line(&line), Some(id));
        }
    }

    #[test]
    fn test_checkpoint_line_rejects() {
        assert!(MessageIdentity::from_checkpoint_line("INBOX").is_none());
        assert!(MessageIdentity::from_checkpoint_line("<>").is_none());
        assert!(MessageIdentity::from_checkpoint_line("<unterminated").is_none());
        assert!(MessageIdentity::from_checkpoint_line("<>, digest: <abc>").is_none());

        let digest_line = format!("<>, digest: <{}>", "0".repeat(64));
        let id = MessageIdentity::from_checkpoint_line(&digest_line).unwrap();
        assert_eq!(id.scheme(), IdentityScheme::Digest);
    }
}

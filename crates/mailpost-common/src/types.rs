//! Common types for mailpost

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Email address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    pub local: String,
    pub domain: String,
}

impl EmailAddress {
    /// Create a new email address
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into(),
        }
    }

    /// Parse an email address from a string
    pub fn parse(s: &str) -> Option<Self> {
        let (local, domain) = s.rsplit_once('@')?;
        if local.is_empty() || domain.is_empty() {
            return None;
        }
        Some(Self::new(local, domain))
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

/// Outcome of a single DKIM or SPF check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Failed,
}

impl Verdict {
    /// Value used in the webhook payload
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Pass => "pass",
            Verdict::Failed => "failed",
        }
    }
}

impl From<bool> for Verdict {
    fn from(passed: bool) -> Self {
        if passed {
            Verdict::Pass
        } else {
            Verdict::Failed
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A header value; repeated headers keep every occurrence in order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    One(String),
    Many(Vec<String>),
}

impl HeaderValue {
    /// Append another occurrence of the same header
    pub fn push(&mut self, value: String) {
        match self {
            HeaderValue::One(first) => {
                let first = std::mem::take(first);
                *self = HeaderValue::Many(vec![first, value]);
            }
            HeaderValue::Many(values) => values.push(value),
        }
    }
}

/// Headers keyed by lower-cased name
pub type Headers = BTreeMap<String, HeaderValue>;

/// Attachment metadata carried in the envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentInfo {
    pub file_name: Option<String>,
    pub content_type: String,
    pub content_id: Option<String>,
    pub size: usize,
    /// Hex-encoded SHA-256 of the decoded content
    pub checksum: String,
}

/// Normalized message ready for delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailEnvelope {
    /// Staging identifier of the message
    pub id: String,
    pub headers: Headers,
    pub subject: Option<String>,
    pub from: Vec<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub date: Option<String>,
    pub message_id: Option<String>,
    pub text: String,
    pub html: String,
    pub attachments: Vec<AttachmentInfo>,
    pub dkim: Verdict,
    pub spf: Verdict,
    pub language: String,
    pub envelope_from: Option<String>,
    pub envelope_to: Vec<String>,
    pub remote_address: String,
    pub remote_host: String,
    pub helo: Option<String>,
    pub received_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_address_parse() {
        assert_eq!(
            EmailAddress::parse("user@example.com"),
            Some(EmailAddress::new("user", "example.com"))
        );
        assert_eq!(EmailAddress::parse("@example.com"), None);
        assert_eq!(EmailAddress::parse("user@"), None);
        assert_eq!(EmailAddress::parse("no-at-sign"), None);
        assert_eq!(
            EmailAddress::new("a.b", "mail.example.org").to_string(),
            "a.b@mail.example.org"
        );
    }

    #[test]
    fn test_verdict_serialization() {
        assert_eq!(serde_json::to_string(&Verdict::Pass).unwrap(), "\"pass\"");
        assert_eq!(
            serde_json::to_string(&Verdict::Failed).unwrap(),
            "\"failed\""
        );
        assert_eq!(Verdict::from(true), Verdict::Pass);
        assert_eq!(Verdict::from(false), Verdict::Failed);
    }

    #[test]
    fn test_header_value_push() {
        let mut value = HeaderValue::One("from a".to_string());
        value.push("from b".to_string());
        assert_eq!(
            value,
            HeaderValue::Many(vec!["from a".to_string(), "from b".to_string()])
        );
        assert_eq!(
            serde_json::to_value(&value).unwrap(),
            serde_json::json!(["from a", "from b"])
        );
    }
}

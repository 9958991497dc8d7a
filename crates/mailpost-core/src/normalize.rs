//! Mail normalization
//!
//! Decodes MIME with `mail-parser` and applies the body-completion policy:
//! every normalized message carries both a text and an HTML body.

use mail_parser::{Address, MessageParser, MessagePart, MimeHeaders, PartType};
use mailpost_common::types::{AttachmentInfo, HeaderValue, Headers};
use mailpost_common::{Error, Result};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

/// HTML used when a message has neither a text nor an HTML body
pub const EMPTY_HTML: &str = "<div></div>";

const LINE_BREAK: &str = "<br>";

/// Structured content of one message
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedMail {
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
}

/// MIME decoder plus local body policy
#[derive(Debug, Clone, Default)]
pub struct MailNormalizer;

impl MailNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// Decode a raw RFC 5322 message
    pub fn normalize(&self, raw: &[u8]) -> Result<NormalizedMail> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Err(Error::Parse("Message is empty".to_string()));
        }

        let message = MessageParser::default()
            .parse(raw)
            .ok_or_else(|| Error::Parse("Failed to parse message".to_string()))?;

        let text = join_bodies(message.text_body.iter().filter_map(|id| {
            match message.parts.get(*id).map(|part| &part.body) {
                Some(PartType::Text(text)) => Some(text.as_ref()),
                _ => None,
            }
        }));
        let html = join_bodies(message.html_body.iter().filter_map(|id| {
            match message.parts.get(*id).map(|part| &part.body) {
                Some(PartType::Html(html)) => Some(html.as_ref()),
                _ => None,
            }
        }));

        let (text, html) = complete_bodies(text, html);

        let mut headers = Headers::new();
        for header in message.headers() {
            let start = header.offset_start as usize;
            let end = header.offset_end as usize;
            let value = unfold(raw.get(start..end).unwrap_or_default());
            let name = header.name.as_str().to_ascii_lowercase();

            match headers.get_mut(&name) {
                Some(existing) => existing.push(value),
                None => {
                    headers.insert(name, HeaderValue::One(value));
                }
            }
        }

        Ok(NormalizedMail {
            headers,
            subject: message.subject().map(str::to_string),
            from: addresses(message.from()),
            to: addresses(message.to()),
            cc: addresses(message.cc()),
            date: message.date().map(|d| d.to_rfc3339()),
            message_id: message.message_id().map(str::to_string),
            text,
            html,
            attachments: message.attachments().map(attachment_info).collect(),
        })
    }
}

/// Guarantee both bodies are present.
///
/// Bodies that are empty or only whitespace count as missing. With neither
/// body the text is empty and the HTML is [`EMPTY_HTML`].
pub fn complete_bodies(text: Option<String>, html: Option<String>) -> (String, String) {
    let text = text.filter(|t| !t.trim().is_empty());
    let html = html.filter(|h| !h.trim().is_empty());

    match (text, html) {
        (Some(text), Some(html)) => (text, html),
        (Some(text), None) => {
            let html = text_to_html(&text);
            (text, html)
        }
        (None, Some(html)) => (html_to_text(&html), html),
        (None, None) => (String::new(), EMPTY_HTML.to_string()),
    }
}

/// Replace line breaks with `<br>` and drop break runs at both ends.
/// Blank space is only dropped when it sits on an otherwise empty line.
pub fn text_to_html(text: &str) -> String {
    static NEWLINES: OnceLock<Regex> = OnceLock::new();
    static LEADING: OnceLock<Regex> = OnceLock::new();
    static TRAILING: OnceLock<Regex> = OnceLock::new();

    let newlines = NEWLINES.get_or_init(|| Regex::new(r"\r\n|\n\r|\r|\n").expect("valid regex"));
    let leading = LEADING.get_or_init(|| Regex::new(r"^(?:[ \t]*<br>)+").expect("valid regex"));
    let trailing = TRAILING.get_or_init(|| Regex::new(r"(?:<br>[ \t]*)+$").expect("valid regex"));

    let html = newlines.replace_all(text, LINE_BREAK);
    let html = leading.replace(&html, "");
    trailing.replace(&html, "").into_owned()
}

/// Remove every markup tag
pub fn html_to_text(html: &str) -> String {
    static TAGS: OnceLock<Regex> = OnceLock::new();

    let tags = TAGS.get_or_init(|| Regex::new(r"<[^>]*>").expect("valid regex"));
    tags.replace_all(html, "").into_owned()
}

fn join_bodies<'a>(bodies: impl Iterator<Item = &'a str>) -> Option<String> {
    let parts: Vec<&str> = bodies.filter(|b| !b.is_empty()).collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

fn addresses(address: Option<&Address<'_>>) -> Vec<String> {
    address
        .map(|list| {
            list.iter()
                .filter_map(|addr| addr.address().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn unfold(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .replace("\r\n", "")
        .replace('\n', "")
        .trim()
        .to_string()
}

fn attachment_info(part: &MessagePart<'_>) -> AttachmentInfo {
    let content_type = part
        .content_type()
        .map(|ct| match ct.subtype() {
            Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
            None => ct.ctype().to_string(),
        })
        .unwrap_or_else(|| "application/octet-stream".to_string());

    let contents = part.contents();

    AttachmentInfo {
        file_name: part.attachment_name().map(str::to_string),
        content_type,
        content_id: part.content_id().map(str::to_string),
        size: contents.len(),
        checksum: hex::encode(Sha256::digest(contents)),
    }
}

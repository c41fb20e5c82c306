//! MIME parsing: raw RFC 5322 bytes to [`IncomingEmail`].
//!
//! Pure functions, no I/O. The entity tree is walked depth-first in document
//! order; the first `text/plain` and the first `text/html` leaf win and later
//! parts of the same type are ignored.

use chrono::{DateTime, Utc};
use mail_parser::{HeaderValue, Message, MessageParser, MessagePart, MimeHeaders, PartType};

use crate::error::ParseError;
use crate::mail::types::{IncomingEmail, strip_html};

/// Body candidates collected while walking the entity tree.
#[derive(Debug, Default)]
struct BodyCandidates {
    plain: Option<String>,
    html: Option<String>,
}

/// Parse one raw message.
///
/// `received_at` is the server's arrival time when known; otherwise the
/// `Date` header is used, then the current time. Missing headers leave their
/// fields empty. Only input that cannot be read as a message at all fails.
pub fn parse_email(
    raw: &[u8],
    received_at: Option<DateTime<Utc>>,
) -> Result<IncomingEmail, ParseError> {
    if raw.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ParseError::Empty);
    }

    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or(ParseError::Unreadable)?;

    let mut candidates = BodyCandidates::default();
    if !parsed.parts.is_empty() {
        collect_bodies(&parsed, 0, &mut candidates);
    }

    let body = select_body(&candidates);
    let received_at = received_at
        .or_else(|| header_date(&parsed))
        .unwrap_or_else(Utc::now);

    Ok(IncomingEmail {
        from: first_address(parsed.from()),
        to: first_address(parsed.to()),
        subject: parsed.subject().unwrap_or_default().trim().to_string(),
        body,
        plain_body: candidates.plain,
        html_body: candidates.html,
        message_id: parsed.message_id().map(bracket_id),
        in_reply_to: join_ids(parsed.in_reply_to()),
        references: join_ids(parsed.references()),
        received_at,
    })
}

/// Depth-first walk from `part_id`, recording the first plain and html leaves.
fn collect_bodies(message: &Message<'_>, part_id: usize, out: &mut BodyCandidates) {
    let Some(part) = message.parts.get(part_id) else {
        return;
    };

    match &part.body {
        PartType::Multipart(children) => {
            for child in children {
                collect_bodies(message, *child as usize, out);
            }
        }
        PartType::Text(text) | PartType::Html(text) => match leaf_kind(part) {
            Some(LeafKind::Plain) if out.plain.is_none() => out.plain = Some(text.to_string()),
            Some(LeafKind::Html) if out.html.is_none() => out.html = Some(text.to_string()),
            _ => {}
        },
        _ => {}
    }
}

enum LeafKind {
    Plain,
    Html,
}

/// Classify a text leaf by its declared content type.
///
/// A part without a `Content-Type` header defaults to `text/plain`.
fn leaf_kind(part: &MessagePart<'_>) -> Option<LeafKind> {
    let Some(ct) = MimeHeaders::content_type(part) else {
        return match part.body {
            PartType::Html(_) => Some(LeafKind::Html),
            _ => Some(LeafKind::Plain),
        };
    };
    if !ct.ctype().eq_ignore_ascii_case("text") {
        return None;
    }
    match ct.subtype() {
        Some(sub) if sub.eq_ignore_ascii_case("plain") => Some(LeafKind::Plain),
        Some(sub) if sub.eq_ignore_ascii_case("html") => Some(LeafKind::Html),
        None => Some(LeafKind::Plain),
        _ => None,
    }
}

/// Plain text when present, otherwise the tag-stripped HTML candidate.
fn select_body(candidates: &BodyCandidates) -> String {
    if let Some(plain) = candidates.plain.as_deref()
        && !plain.trim().is_empty()
    {
        return plain.trim().to_string();
    }
    candidates
        .html
        .as_deref()
        .map(strip_html)
        .unwrap_or_default()
}

fn first_address(addr: Option<&mail_parser::Address<'_>>) -> String {
    addr.and_then(|a| a.first())
        .and_then(|a| a.address())
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

fn header_date(parsed: &Message<'_>) -> Option<DateTime<Utc>> {
    parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
}

/// Message ids come back from the parser without angle brackets.
fn bracket_id(id: &str) -> String {
    let id = id.trim().trim_start_matches('<').trim_end_matches('>');
    format!("<{id}>")
}

/// Render an id-list header as space-separated bracketed ids.
fn join_ids(value: &HeaderValue<'_>) -> Option<String> {
    let ids: Vec<String> = match value {
        HeaderValue::Text(id) => vec![bracket_id(id)],
        HeaderValue::TextList(ids) => ids.iter().map(|id| bracket_id(id)).collect(),
        _ => Vec::new(),
    };
    let ids: Vec<String> = ids.into_iter().filter(|id| id != "<>").collect();
    if ids.is_empty() {
        None
    } else {
        Some(ids.join(" "))
    }
}

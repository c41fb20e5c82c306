//! Email value types shared by the fetcher, parser, orchestrator and sender.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One fetched and parsed inbound email.
///
/// Built once per fetched message and dropped once the poll is done with it.
#[derive(Debug, Clone, Serialize)]
pub struct IncomingEmail {
    /// Sender address (bare, no display name).
    pub from: String,
    /// First recipient address.
    pub to: String,
    pub subject: String,
    /// Primary body: the plain part, or the tag-stripped HTML part.
    pub body: String,
    /// First `text/plain` part, verbatim.
    pub plain_body: Option<String>,
    /// First `text/html` part, verbatim.
    pub html_body: Option<String>,
    /// `Message-Id` header as sent, angle brackets included.
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    /// Space-separated ancestor ids.
    pub references: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl IncomingEmail {
    /// Text to store as a reply: plain body, falling back to the HTML candidate.
    pub fn reply_body(&self) -> String {
        match self.plain_body.as_deref() {
            Some(plain) if !plain.trim().is_empty() => plain.to_string(),
            _ => self.html_body.as_deref().map(strip_html).unwrap_or_default(),
        }
    }
}

/// Threading identifiers of the email being answered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadRef {
    pub message_id: String,
    pub references: Option<String>,
}

impl ThreadRef {
    pub fn from_incoming(email: &IncomingEmail) -> Option<Self> {
        email.message_id.as_ref().map(|id| Self {
            message_id: id.clone(),
            references: email.references.clone(),
        })
    }
}

/// An operator-composed reply to send over SMTP.
#[derive(Debug, Clone, Default)]
pub struct OutboundReply {
    pub to: String,
    pub subject: String,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub reply_to: Option<String>,
    /// Present when answering a specific inbound email.
    pub thread: Option<ThreadRef>,
}

impl OutboundReply {
    /// Text persisted alongside the conversation once the reply has gone out.
    pub fn stored_text(&self) -> String {
        match (&self.text_body, &self.html_body) {
            (Some(text), _) if !text.trim().is_empty() => text.clone(),
            (_, Some(html)) => strip_html(html),
            _ => String::new(),
        }
    }
}

/// Who wrote a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SentBy {
    Admin,
    Customer,
}

impl SentBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Customer => "customer",
        }
    }
}

impl std::str::FromStr for SentBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "customer" => Ok(Self::Customer),
            other => Err(format!("unknown sender role '{other}'")),
        }
    }
}

/// Lowercase and trim an address for matching.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

/// Strip HTML tags from content (basic).
///
/// Drops every `<...>` span left to right and trims the result. Entities such
/// as `&amp;` are left as they are.
pub fn strip_html(html: &str) -> String {
    let mut result = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.trim().to_string()
}

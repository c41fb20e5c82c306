//! SMTP reply sender: threaded outbound replies via lettre.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use secrecy::ExposeSecret;
use tracing::info;

use crate::config::SmtpConfig;
use crate::error::SendError;
use crate::mail::types::{OutboundReply, ThreadRef};

/// Boundary used for every `multipart/alternative` reply.
pub const ALTERNATIVE_BOUNDARY: &str = "replydesk-alternative-0001";

/// Anything that can deliver an [`OutboundReply`].
#[async_trait]
pub trait ReplySender: Send + Sync {
    async fn send(&self, reply: &OutboundReply) -> Result<(), SendError>;
}

/// Sends replies through a tenant's SMTP server.
#[derive(Debug, Clone)]
pub struct SmtpReplySender {
    config: SmtpConfig,
    timeout: Duration,
}

impl SmtpReplySender {
    pub fn new(config: SmtpConfig, timeout: Duration) -> Self {
        Self { config, timeout }
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, SendError> {
        let builder = if self.config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&self.config.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.config.host)
        }
        .map_err(|e| SendError::Transport(format!("SMTP relay error: {e}")))?;

        Ok(builder
            .port(self.config.port)
            .credentials(Credentials::new(
                self.config.username.clone(),
                self.config.password.expose_secret().to_string(),
            ))
            .timeout(Some(self.timeout))
            .build())
    }
}

#[async_trait]
impl ReplySender for SmtpReplySender {
    async fn send(&self, reply: &OutboundReply) -> Result<(), SendError> {
        let message = compose(self.config.sender(), reply)?;
        let transport = self.transport()?;

        transport
            .send(message)
            .await
            .map_err(|e| SendError::Transport(format!("SMTP send failed: {e}")))?;

        info!(to = %reply.to, host = %self.config.host, "Reply sent");
        Ok(())
    }
}

/// Build the outbound message with threading headers and body parts.
pub fn compose(from: &str, reply: &OutboundReply) -> Result<Message, SendError> {
    let mut builder = Message::builder()
        .from(parse_mailbox("from", from)?)
        .to(parse_mailbox("to", &reply.to)?)
        .subject(reply_subject(&reply.subject));

    if let Some(reply_to) = reply.reply_to.as_deref()
        && !reply_to.trim().is_empty()
    {
        builder = builder.reply_to(parse_mailbox("reply-to", reply_to)?);
    }

    if let Some(thread) = &reply.thread {
        let (in_reply_to, references) = thread_headers(thread);
        builder = builder.in_reply_to(in_reply_to).references(references);
    }

    let text = reply.text_body.as_deref().filter(|t| !t.is_empty());
    let html = reply.html_body.as_deref().filter(|h| !h.is_empty());

    let built = match (text, html) {
        (Some(text), Some(html)) => builder.multipart(
            MultiPart::alternative()
                .boundary(ALTERNATIVE_BOUNDARY)
                .singlepart(SinglePart::plain(text.to_string()))
                .singlepart(SinglePart::html(html.to_string())),
        ),
        (None, Some(html)) => builder.singlepart(SinglePart::html(html.to_string())),
        (text, None) => builder.singlepart(SinglePart::plain(text.unwrap_or_default().to_string())),
    };

    built.map_err(|e| SendError::Build(e.to_string()))
}

/// `In-Reply-To` and `References` for a reply to `original`.
///
/// References is the original chain with the original id appended, or just
/// the original id when it had no chain.
pub fn thread_headers(original: &ThreadRef) -> (String, String) {
    let id = original.message_id.trim().to_string();
    let references = match original.references.as_deref().map(str::trim) {
        Some(chain) if !chain.is_empty() => format!("{chain} {id}"),
        _ => id.clone(),
    };
    (id, references)
}

/// Prefix `Re: ` unless the subject already carries it (any case).
pub fn reply_subject(subject: &str) -> String {
    let subject = subject.trim();
    let has_prefix = subject
        .get(..4)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("re: "));
    if has_prefix {
        subject.to_string()
    } else {
        format!("Re: {subject}")
    }
}

fn parse_mailbox(field: &'static str, value: &str) -> Result<Mailbox, SendError> {
    value.trim().parse().map_err(|e| SendError::Address {
        field,
        value: value.to_string(),
        reason: format!("{e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(text: Option<&str>, html: Option<&str>, thread: Option<ThreadRef>) -> OutboundReply {
        OutboundReply {
            to: "alice@example.com".into(),
            subject: "Your order".into(),
            text_body: text.map(String::from),
            html_body: html.map(String::from),
            reply_to: None,
            thread,
        }
    }

    fn formatted(message: &Message) -> String {
        String::from_utf8_lossy(&message.formatted()).to_string()
    }

    // ── Subject ─────────────────────────────────────────────────────

    #[test]
    fn reply_subject_prepends_re() {
        assert_eq!(reply_subject("Meeting tomorrow"), "Re: Meeting tomorrow");
    }

    #[test]
    fn reply_subject_no_double_re() {
        assert_eq!(reply_subject("Re: Meeting tomorrow"), "Re: Meeting tomorrow");
        assert_eq!(reply_subject("RE: Meeting tomorrow"), "RE: Meeting tomorrow");
        assert_eq!(reply_subject("re: Meeting tomorrow"), "re: Meeting tomorrow");
    }

    #[test]
    fn reply_subject_is_idempotent() {
        let once = reply_subject("Order #12");
        assert_eq!(reply_subject(&once), once);
    }

    #[test]
    fn reply_subject_handles_short_and_multibyte() {
        assert_eq!(reply_subject(""), "Re: ");
        assert_eq!(reply_subject("Ré"), "Re: Ré");
        assert_eq!(reply_subject("Réponse"), "Re: Réponse");
    }

    // ── Threading ───────────────────────────────────────────────────

    #[test]
    fn references_extend_existing_chain() {
        let (in_reply_to, references) = thread_headers(&ThreadRef {
            message_id: "<A>".into(),
            references: Some("<X> <Y>".into()),
        });
        assert_eq!(in_reply_to, "<A>");
        assert_eq!(references, "<X> <Y> <A>");
    }

    #[test]
    fn references_start_from_original_id() {
        let (in_reply_to, references) = thread_headers(&ThreadRef {
            message_id: "<A>".into(),
            references: None,
        });
        assert_eq!(in_reply_to, "<A>");
        assert_eq!(references, "<A>");

        let (_, references) = thread_headers(&ThreadRef {
            message_id: "<A>".into(),
            references: Some("   ".into()),
        });
        assert_eq!(references, "<A>");
    }

    // ── Composition ─────────────────────────────────────────────────

    #[test]
    fn compose_sets_threading_headers() {
        let thread = ThreadRef {
            message_id: "<A>".into(),
            references: Some("<X> <Y>".into()),
        };
        let message = compose("shop@example.com", &reply(Some("Thanks!"), None, Some(thread))).unwrap();
        let raw = formatted(&message);
        assert!(raw.contains("In-Reply-To: <A>"), "{raw}");
        assert!(raw.contains("References: <X> <Y> <A>"), "{raw}");
        assert!(raw.contains("Subject: Re: Your order"));
        assert!(raw.contains("MIME-Version: 1.0"));
        assert!(raw.contains("text/plain"));
        assert!(!raw.contains("multipart/alternative"));
    }

    #[test]
    fn compose_without_thread_has_no_threading_headers() {
        let message = compose("shop@example.com", &reply(Some("Hello"), None, None)).unwrap();
        let raw = formatted(&message);
        assert!(!raw.contains("In-Reply-To"));
        assert!(!raw.contains("References"));
    }

    #[test]
    fn compose_both_bodies_is_alternative_plain_first() {
        let message = compose(
            "shop@example.com",
            &reply(Some("plain version"), Some("<p>html version</p>"), None),
        )
        .unwrap();
        let raw = formatted(&message);
        assert!(raw.contains("multipart/alternative"));
        assert!(raw.contains(ALTERNATIVE_BOUNDARY));
        let plain_at = raw.find("text/plain").unwrap();
        let html_at = raw.find("text/html").unwrap();
        assert!(plain_at < html_at);
    }

    #[test]
    fn compose_html_only_is_single_part() {
        let message = compose("shop@example.com", &reply(None, Some("<p>hi</p>"), None)).unwrap();
        let raw = formatted(&message);
        assert!(raw.contains("text/html"));
        assert!(!raw.contains("multipart"));
    }

    #[test]
    fn compose_sets_reply_to() {
        let mut r = reply(Some("x"), None, None);
        r.reply_to = Some("support@example.com".into());
        let raw = formatted(&compose("shop@example.com", &r).unwrap());
        assert!(raw.contains("Reply-To: support@example.com"));
    }

    #[test]
    fn compose_rejects_bad_recipient() {
        let mut r = reply(Some("x"), None, None);
        r.to = "not an address".into();
        let err = compose("shop@example.com", &r).unwrap_err();
        assert!(matches!(err, SendError::Address { field: "to", .. }));
    }
}

//! Poll orchestrator: one fetch/match/persist/mark-read pass for one tenant.
//!
//! 1. Fetch unseen mail (fatal on connection failure)
//! 2. Match each sender against existing conversations
//! 3. Append a customer reply to the newest match
//! 4. Mark only the persisted emails as read, in one batch
//!
//! Everything after the fetch is non-fatal and lands in [`PollResult::errors`].

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ImapConfig;
use crate::error::{PollError, PollIssue};
use crate::mail::imap::{ImapMailbox, Mailbox};
use crate::mail::types::{IncomingEmail, SentBy, normalize_address};
use crate::store::traits::MessageMatcher;

/// Summary of one poll for one tenant. Not persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResult {
    /// Every fetched message, including ones that failed to parse.
    pub emails_checked: usize,
    pub replies_added: usize,
    /// Per-email problems in the order they occurred.
    pub errors: Vec<PollIssue>,
}

impl PollResult {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Compact JSON summary for logs.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
    }
}

/// Run one poll against `mailbox`, persisting matched replies through `matcher`.
pub async fn poll(
    mailbox: &dyn Mailbox,
    matcher: &dyn MessageMatcher,
) -> Result<PollResult, PollError> {
    let batch = mailbox.fetch_unseen().await?;

    let mut result = PollResult {
        emails_checked: batch.fetched(),
        ..PollResult::default()
    };

    for failure in &batch.failures {
        warn!(error = %failure, "Skipping unparseable email");
        result.errors.push(PollIssue::Parse {
            reason: failure.to_string(),
        });
    }

    let mut processed: Vec<String> = Vec::new();

    for email in &batch.emails {
        let Some(message_id) = email.message_id.clone() else {
            warn!(from = %email.from, "Email has no Message-Id, leaving it unseen");
            result.errors.push(PollIssue::MissingMessageId {
                from: email.from.clone(),
            });
            continue;
        };

        let sender = normalize_address(&email.from);
        let candidates = match matcher.find_conversations_by_sender(&sender).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(message_id = %message_id, error = %e, "Conversation lookup failed");
                result.errors.push(PollIssue::Match {
                    message_id,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        // Newest conversation wins.
        let Some(&conversation_id) = candidates.first() else {
            info!(from = %sender, message_id = %message_id, "No conversation for sender");
            continue;
        };

        let text = reply_text(email);
        match matcher
            .create_reply(conversation_id, &text, SentBy::Customer)
            .await
        {
            Ok(()) => {
                debug!(conversation_id, message_id = %message_id, "Reply persisted");
                result.replies_added += 1;
                processed.push(message_id);
            }
            Err(e) => {
                warn!(conversation_id, message_id = %message_id, error = %e, "Failed to persist reply");
                result.errors.push(PollIssue::Persist {
                    message_id,
                    conversation_id,
                    reason: e.to_string(),
                });
            }
        }
    }

    if !processed.is_empty()
        && let Err(e) = mailbox.mark_seen(&processed).await
    {
        warn!(count = processed.len(), error = %e, "Failed to mark emails as read");
        result.errors.push(PollIssue::MarkRead {
            reason: e.to_string(),
        });
    }

    Ok(result)
}

/// Poll a tenant's IMAP inbox directly.
pub async fn poll_imap(
    config: &ImapConfig,
    matcher: &dyn MessageMatcher,
    timeout: Duration,
) -> Result<PollResult, PollError> {
    let mailbox = ImapMailbox::new(config.clone(), timeout);
    poll(&mailbox, matcher).await
}

/// Stored text for an inbound reply: a received-at marker, then the body.
pub fn reply_text(email: &IncomingEmail) -> String {
    format!(
        "[Received via email {}]\n\n{}",
        email.received_at.format("%Y-%m-%d %H:%M UTC"),
        email.reply_body()
    )
}

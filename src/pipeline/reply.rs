//! Operator reply flow: send over SMTP, then record it on the conversation.

use tracing::{info, warn};

use crate::error::ReplyError;
use crate::mail::smtp::ReplySender;
use crate::mail::types::{OutboundReply, SentBy};
use crate::store::traits::MessageMatcher;

/// Send `reply` and, only once it has gone out, append it to
/// `conversation_id` as an admin reply.
///
/// A send failure persists nothing. A persist failure after a successful send
/// is returned as [`ReplyError::Persist`]; the email is not recalled.
pub async fn send_operator_reply(
    sender: &dyn ReplySender,
    matcher: &dyn MessageMatcher,
    conversation_id: i64,
    reply: &OutboundReply,
) -> Result<(), ReplyError> {
    sender.send(reply).await?;

    if let Err(e) = matcher
        .create_reply(conversation_id, &reply.stored_text(), SentBy::Admin)
        .await
    {
        warn!(conversation_id, error = %e, "Reply sent but not recorded");
        return Err(e.into());
    }

    info!(conversation_id, to = %reply.to, "Operator reply sent and recorded");
    Ok(())
}

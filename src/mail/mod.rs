//! Inbound and outbound mail handling.

pub mod imap;
pub mod parser;
pub mod smtp;
pub mod types;

pub use imap::{FetchBatch, ImapMailbox, Mailbox};
pub use parser::parse_email;
pub use smtp::{ReplySender, SmtpReplySender};
pub use types::{IncomingEmail, OutboundReply, SentBy, ThreadRef};

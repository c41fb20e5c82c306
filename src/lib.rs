//! Replydesk: customer email replies threaded back into contact-form conversations.

pub mod config;
pub mod error;
pub mod mail;
pub mod pipeline;
pub mod store;

//! Store contracts consumed by the pipeline.
//!
//! The pipeline needs exactly two things from a tenant's message store
//! ([`MessageMatcher`]) and one thing from tenant configuration storage
//! ([`TenantDirectory`]). Concrete backends live next to this module.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::Tenant;
use crate::error::DatabaseError;
use crate::mail::imap::{ImapMailbox, Mailbox};
use crate::mail::types::SentBy;

/// A contact-form submission that replies attach to.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub subject: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Fields for a new contact-form submission.
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub name: String,
    pub email: String,
    pub subject: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl NewConversation {
    pub fn new(
        name: impl Into<String>,
        email: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            subject: subject.into(),
            body: body.into(),
            created_at: Utc::now(),
        }
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }
}

/// One appended entry in a conversation.
#[derive(Debug, Clone)]
pub struct Reply {
    pub id: i64,
    pub conversation_id: i64,
    pub reply_text: String,
    pub sent_at: DateTime<Utc>,
    pub sent_by: SentBy,
}

/// Sender lookup and reply persistence for one tenant.
#[async_trait]
pub trait MessageMatcher: Send + Sync {
    /// Conversation ids whose stored sender equals `address` (case and
    /// surrounding whitespace ignored), newest conversation first.
    async fn find_conversations_by_sender(&self, address: &str)
    -> Result<Vec<i64>, DatabaseError>;

    /// Append a reply stamped with the current time.
    async fn create_reply(
        &self,
        conversation_id: i64,
        text: &str,
        sent_by: SentBy,
    ) -> Result<(), DatabaseError>;
}

/// Read-only view of tenant configuration, consulted every polling cycle.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn list_tenants(&self) -> Result<Vec<Tenant>, DatabaseError>;

    /// Open an independent store handle for one poll of `tenant`.
    async fn open_store(&self, tenant: &Tenant) -> Result<Arc<dyn MessageMatcher>, DatabaseError>;

    /// Mailbox for `tenant`. Defaults to the tenant's IMAP server.
    fn open_mailbox(&self, tenant: &Tenant, timeout: Duration) -> Arc<dyn Mailbox> {
        Arc::new(ImapMailbox::new(tenant.mail.imap.clone(), timeout))
    }
}

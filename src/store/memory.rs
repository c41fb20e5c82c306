//! In-memory stores for tests and embedding.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::config::Tenant;
use crate::error::DatabaseError;
use crate::mail::imap::Mailbox;
use crate::mail::types::{SentBy, normalize_address};
use crate::store::traits::{Conversation, MessageMatcher, NewConversation, Reply, TenantDirectory};

#[derive(Default)]
struct MemoryState {
    conversations: Vec<Conversation>,
    replies: Vec<Reply>,
}

/// Message store held entirely in memory. Same matching rules as the libSQL store.
#[derive(Default)]
pub struct MemoryMessageStore {
    state: RwLock<MemoryState>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_conversation(&self, new: &NewConversation) -> i64 {
        let mut state = self.state.write().await;
        let id = state.conversations.len() as i64 + 1;
        state.conversations.push(Conversation {
            id,
            name: new.name.clone(),
            email: new.email.clone(),
            subject: new.subject.clone(),
            body: new.body.clone(),
            created_at: new.created_at,
        });
        id
    }

    /// Replies of one conversation, oldest first.
    pub async fn list_replies(&self, conversation_id: i64) -> Vec<Reply> {
        let state = self.state.read().await;
        state
            .replies
            .iter()
            .filter(|r| r.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    pub async fn reply_count(&self) -> usize {
        self.state.read().await.replies.len()
    }
}

#[async_trait]
impl MessageMatcher for MemoryMessageStore {
    async fn find_conversations_by_sender(
        &self,
        address: &str,
    ) -> Result<Vec<i64>, DatabaseError> {
        let needle = normalize_address(address);
        if needle.is_empty() {
            return Ok(Vec::new());
        }

        let state = self.state.read().await;
        let mut matches: Vec<&Conversation> = state
            .conversations
            .iter()
            .filter(|c| normalize_address(&c.email) == needle)
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(matches.into_iter().map(|c| c.id).collect())
    }

    async fn create_reply(
        &self,
        conversation_id: i64,
        text: &str,
        sent_by: SentBy,
    ) -> Result<(), DatabaseError> {
        let mut state = self.state.write().await;
        if !state.conversations.iter().any(|c| c.id == conversation_id) {
            return Err(DatabaseError::NotFound {
                entity: "conversation".into(),
                id: conversation_id.to_string(),
            });
        }
        let id = state.replies.len() as i64 + 1;
        state.replies.push(Reply {
            id,
            conversation_id,
            reply_text: text.to_string(),
            sent_at: Utc::now(),
            sent_by,
        });
        Ok(())
    }
}

/// Fixed tenant list with pre-built stores and optional mailbox overrides.
///
/// Tenants without a registered mailbox fall back to IMAP.
#[derive(Default)]
pub struct StaticTenantDirectory {
    tenants: RwLock<Vec<Tenant>>,
    stores: RwLock<HashMap<i64, Arc<dyn MessageMatcher>>>,
    mailboxes: std::sync::RwLock<HashMap<i64, Arc<dyn Mailbox>>>,
}

impl StaticTenantDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a tenant together with its store.
    pub async fn insert(&self, tenant: Tenant, store: Arc<dyn MessageMatcher>) {
        self.stores.write().await.insert(tenant.id, store);
        let mut tenants = self.tenants.write().await;
        tenants.retain(|t| t.id != tenant.id);
        tenants.push(tenant);
    }

    pub fn set_mailbox(&self, tenant_id: i64, mailbox: Arc<dyn Mailbox>) {
        if let Ok(mut mailboxes) = self.mailboxes.write() {
            mailboxes.insert(tenant_id, mailbox);
        }
    }

    pub async fn remove(&self, tenant_id: i64) {
        self.tenants.write().await.retain(|t| t.id != tenant_id);
        self.stores.write().await.remove(&tenant_id);
    }
}

#[async_trait]
impl TenantDirectory for StaticTenantDirectory {
    async fn list_tenants(&self) -> Result<Vec<Tenant>, DatabaseError> {
        Ok(self.tenants.read().await.clone())
    }

    async fn open_store(&self, tenant: &Tenant) -> Result<Arc<dyn MessageMatcher>, DatabaseError> {
        self.stores
            .read()
            .await
            .get(&tenant.id)
            .cloned()
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "tenant store".into(),
                id: tenant.id.to_string(),
            })
    }

    fn open_mailbox(&self, tenant: &Tenant, timeout: Duration) -> Arc<dyn Mailbox> {
        let registered = self
            .mailboxes
            .read()
            .ok()
            .and_then(|m| m.get(&tenant.id).cloned());
        match registered {
            Some(mailbox) => mailbox,
            None => Arc::new(crate::mail::imap::ImapMailbox::new(
                tenant.mail.imap.clone(),
                timeout,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    #[tokio::test]
    async fn matches_like_the_database_store() {
        let store = MemoryMessageStore::new();
        let now = Utc::now();
        let older = store
            .create_conversation(
                &NewConversation::new("A", "Alice@Example.com", "s", "b")
                    .created_at(now - ChronoDuration::days(2)),
            )
            .await;
        let newer = store
            .create_conversation(&NewConversation::new("A", " alice@example.com", "s", "b"))
            .await;
        store
            .create_conversation(&NewConversation::new("B", "bob@example.com", "s", "b"))
            .await;

        let found = store
            .find_conversations_by_sender("ALICE@example.com ")
            .await
            .unwrap();
        assert_eq!(found, vec![newer, older]);
    }

    #[tokio::test]
    async fn reply_to_unknown_conversation_fails() {
        let store = MemoryMessageStore::new();
        let err = store.create_reply(7, "x", SentBy::Admin).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
        assert_eq!(store.reply_count().await, 0);
    }

    #[tokio::test]
    async fn replies_keep_insertion_order() {
        let store = MemoryMessageStore::new();
        let id = store
            .create_conversation(&NewConversation::new("A", "a@x.com", "s", "b"))
            .await;
        store.create_reply(id, "one", SentBy::Customer).await.unwrap();
        store.create_reply(id, "two", SentBy::Admin).await.unwrap();

        let texts: Vec<_> = store
            .list_replies(id)
            .await
            .into_iter()
            .map(|r| r.reply_text)
            .collect();
        assert_eq!(texts, vec!["one", "two"]);
    }
}

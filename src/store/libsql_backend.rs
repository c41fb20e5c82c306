//! libSQL message store: one database file per tenant.
//!
//! Holds contact-form submissions (`messages`) and the replies appended to
//! them (`message_replies`). Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::mail::types::{SentBy, normalize_address};
use crate::store::migrations::{self, MESSAGE_MIGRATIONS};
use crate::store::traits::{Conversation, MessageMatcher, NewConversation, Reply};

/// libSQL-backed message store for a single tenant.
///
/// `libsql::Connection` is `Send + Sync`; one connection serves every call.
pub struct LibSqlMessageStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlMessageStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        debug!(path = %path.display(), "Message store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn, MESSAGE_MIGRATIONS).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Record a contact-form submission. Returns its conversation id.
    pub async fn create_conversation(&self, new: &NewConversation) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO messages (name, email, subject, body, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 RETURNING id",
                params![
                    new.name.as_str(),
                    new.email.as_str(),
                    new.subject.as_str(),
                    new.body.as_str(),
                    timestamp(new.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_conversation: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("create_conversation: {e}")))?
            .ok_or_else(|| DatabaseError::Query("create_conversation: no id returned".into()))?;
        let id: i64 = row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("create_conversation row parse: {e}")))?;

        info!(conversation_id = id, email = %new.email, "Conversation created");
        Ok(id)
    }

    pub async fn get_conversation(&self, id: i64) -> Result<Option<Conversation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, name, email, subject, body, created_at FROM messages WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_conversation: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let conversation = row_to_conversation(&row)
                    .map_err(|e| DatabaseError::Query(format!("get_conversation row parse: {e}")))?;
                Ok(Some(conversation))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_conversation: {e}"))),
        }
    }

    /// Replies of one conversation, oldest first.
    pub async fn list_replies(&self, conversation_id: i64) -> Result<Vec<Reply>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, message_id, reply_text, sent_at, sent_by
                 FROM message_replies
                 WHERE message_id = ?1
                 ORDER BY sent_at ASC, id ASC",
                params![conversation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_replies: {e}")))?;

        let mut replies = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_replies: {e}")))?
        {
            replies.push(row_to_reply(&row)?);
        }
        Ok(replies)
    }
}

#[async_trait]
impl MessageMatcher for LibSqlMessageStore {
    async fn find_conversations_by_sender(
        &self,
        address: &str,
    ) -> Result<Vec<i64>, DatabaseError> {
        let needle = normalize_address(address);
        if needle.is_empty() {
            return Ok(Vec::new());
        }

        // SQLite's TRIM and LOWER only cover spaces and ASCII, so addresses
        // are compared with `normalize_address` here instead.
        let mut rows = self
            .conn()
            .query("SELECT id, email, created_at FROM messages", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("find_conversations_by_sender: {e}")))?;

        let mut matches = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("find_conversations_by_sender: {e}")))?
        {
            let parse_err = |e: libsql::Error| {
                DatabaseError::Query(format!("find_conversations_by_sender row parse: {e}"))
            };
            let email: String = row.get(1).map_err(parse_err)?;
            if normalize_address(&email) != needle {
                continue;
            }
            let id: i64 = row.get(0).map_err(parse_err)?;
            let created_str: String = row.get(2).map_err(parse_err)?;
            matches.push((parse_datetime(&created_str), id));
        }

        // Newest first by actual time, whatever format the row was written in.
        matches.sort_by(|a, b| b.cmp(a));
        Ok(matches.into_iter().map(|(_, id)| id).collect())
    }

    async fn create_reply(
        &self,
        conversation_id: i64,
        text: &str,
        sent_by: SentBy,
    ) -> Result<(), DatabaseError> {
        let now = timestamp(Utc::now());
        let inserted = self
            .conn()
            .execute(
                "INSERT INTO message_replies (message_id, reply_text, sent_at, sent_by)
                 SELECT ?1, ?2, ?3, ?4
                 WHERE EXISTS (SELECT 1 FROM messages WHERE id = ?1)",
                params![conversation_id, text, now, sent_by.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_reply: {e}")))?;

        if inserted == 0 {
            return Err(DatabaseError::NotFound {
                entity: "conversation".into(),
                id: conversation_id.to_string(),
            });
        }

        debug!(conversation_id, sent_by = sent_by.as_str(), "Reply stored");
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width UTC timestamps so text ordering matches time ordering.
pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn row_to_conversation(row: &libsql::Row) -> Result<Conversation, libsql::Error> {
    let created_str: String = row.get(5)?;
    Ok(Conversation {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        subject: row.get(3)?,
        body: row.get(4)?,
        created_at: parse_datetime(&created_str),
    })
}

fn row_to_reply(row: &libsql::Row) -> Result<Reply, DatabaseError> {
    let parse_err = |e: libsql::Error| DatabaseError::Query(format!("list_replies row parse: {e}"));
    let sent_str: String = row.get(3).map_err(parse_err)?;
    let sent_by_str: String = row.get(4).map_err(parse_err)?;
    let sent_by = sent_by_str
        .parse::<SentBy>()
        .map_err(|e| DatabaseError::Query(format!("list_replies row parse: {e}")))?;
    Ok(Reply {
        id: row.get(0).map_err(parse_err)?,
        conversation_id: row.get(1).map_err(parse_err)?,
        reply_text: row.get(2).map_err(parse_err)?,
        sent_at: parse_datetime(&sent_str),
        sent_by,
    })
}

//! Version-tracked schema migrations for the libSQL stores.
//!
//! Each schema is a list of numbered steps. `run_migrations()` checks the
//! current version recorded in `_migrations` and applies only newer steps.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

/// Per-tenant message store: contact submissions and their replies.
pub static MESSAGE_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "messages_and_replies",
        sql: r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL DEFAULT '',
                email TEXT NOT NULL,
                subject TEXT NOT NULL DEFAULT '',
                body TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_email ON messages(email);
            CREATE INDEX IF NOT EXISTS idx_messages_created ON messages(created_at);

            CREATE TABLE IF NOT EXISTS message_replies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                reply_text TEXT NOT NULL,
                sent_at TEXT NOT NULL,
                sent_by TEXT NOT NULL CHECK (sent_by IN ('admin', 'customer'))
            );
            CREATE INDEX IF NOT EXISTS idx_message_replies_message
                ON message_replies(message_id);
        "#,
    },
    Migration {
        version: 2,
        name: "normalized_sender_index",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_messages_email_normalized
                ON messages(LOWER(TRIM(email)));
        "#,
    },
];

/// Control database: one row per website with its mail settings.
pub static TENANT_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "websites",
    sql: r#"
        CREATE TABLE IF NOT EXISTS websites (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            db_path TEXT NOT NULL,
            imap_server TEXT NOT NULL DEFAULT '',
            imap_port INTEGER NOT NULL DEFAULT 0,
            imap_username TEXT NOT NULL DEFAULT '',
            imap_password TEXT NOT NULL DEFAULT '',
            imap_use_tls INTEGER NOT NULL DEFAULT 1,
            smtp_server TEXT NOT NULL DEFAULT '',
            smtp_port INTEGER NOT NULL DEFAULT 0,
            smtp_username TEXT NOT NULL DEFAULT '',
            smtp_password TEXT NOT NULL DEFAULT '',
            smtp_use_tls INTEGER NOT NULL DEFAULT 0,
            smtp_from TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
    "#,
}];

/// Run all pending migrations of `schema` against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection, schema: &[Migration]) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in schema {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            record_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn record_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    async fn table_exists(conn: &Connection, table: &str) -> bool {
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                libsql::params![table],
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let count: i64 = row.get(0).unwrap();
        count == 1
    }

    #[tokio::test]
    async fn message_schema_creates_tables() {
        let conn = test_conn().await;
        run_migrations(&conn, MESSAGE_MIGRATIONS).await.unwrap();
        for table in ["messages", "message_replies", "_migrations"] {
            assert!(table_exists(&conn, table).await, "Table '{table}' should exist");
        }
    }

    #[tokio::test]
    async fn tenant_schema_creates_websites() {
        let conn = test_conn().await;
        run_migrations(&conn, TENANT_MIGRATIONS).await.unwrap();
        assert!(table_exists(&conn, "websites").await);
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn, MESSAGE_MIGRATIONS).await.unwrap();
        run_migrations(&conn, MESSAGE_MIGRATIONS).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn run_migrations_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}
        let conn = test_conn().await;
        let fut = run_migrations(&conn, MESSAGE_MIGRATIONS);
        assert_send(&fut);
        fut.await.unwrap();
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn, MESSAGE_MIGRATIONS).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let row1 = rows.next().await.unwrap().unwrap();
        assert_eq!(row1.get::<i64>(0).unwrap(), 1);
        assert_eq!(row1.get::<String>(1).unwrap(), "messages_and_replies");

        let row2 = rows.next().await.unwrap().unwrap();
        assert_eq!(row2.get::<i64>(0).unwrap(), 2);
        assert_eq!(row2.get::<String>(1).unwrap(), "normalized_sender_index");
    }

    #[tokio::test]
    async fn sent_by_is_constrained() {
        let conn = test_conn().await;
        run_migrations(&conn, MESSAGE_MIGRATIONS).await.unwrap();
        conn.execute(
            "INSERT INTO messages (email, created_at) VALUES ('a@x', '2026-01-01T00:00:00+00:00')",
            (),
        )
        .await
        .unwrap();
        let bad = conn
            .execute(
                "INSERT INTO message_replies (message_id, reply_text, sent_at, sent_by)
                 VALUES (1, 'x', '2026-01-01T00:00:00+00:00', 'robot')",
                (),
            )
            .await;
        assert!(bad.is_err());
    }
}

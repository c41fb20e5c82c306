//! Tenant directory backed by the control database's `websites` table.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};

use crate::config::{ImapConfig, MailConfig, SmtpConfig, Tenant};
use crate::error::DatabaseError;
use crate::store::libsql_backend::LibSqlMessageStore;
use crate::store::migrations::{self, TENANT_MIGRATIONS};
use crate::store::traits::{MessageMatcher, TenantDirectory};

const WEBSITE_COLUMNS: &str = "id, name, db_path, \
    imap_server, imap_port, imap_username, imap_password, imap_use_tls, \
    smtp_server, smtp_port, smtp_username, smtp_password, smtp_use_tls, smtp_from";

/// Reads tenants from the `websites` table and opens each tenant's
/// message store from its `db_path`.
pub struct LibSqlTenantDirectory {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlTenantDirectory {
    /// Open (or create) the control database and run migrations.
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
        let directory = Self::from_database(db).await?;
        info!(path = %path.display(), "Tenant directory opened");
        Ok(directory)
    }

    /// Create an in-memory control database (for tests).
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
        migrations::run_migrations(&conn, TENANT_MIGRATIONS).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Register a website. The tenant's `id` is ignored; the assigned id is returned.
    pub async fn insert_tenant(&self, tenant: &Tenant) -> Result<i64, DatabaseError> {
        let imap = &tenant.mail.imap;
        let smtp = &tenant.mail.smtp;
        let mut rows = self
            .conn
            .query(
                "INSERT INTO websites (name, db_path,
                    imap_server, imap_port, imap_username, imap_password, imap_use_tls,
                    smtp_server, smtp_port, smtp_username, smtp_password, smtp_use_tls, smtp_from)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 RETURNING id",
                params![
                    tenant.name.as_str(),
                    tenant.db_path.to_string_lossy().to_string(),
                    imap.host.as_str(),
                    i64::from(imap.port),
                    imap.username.as_str(),
                    imap.password.expose_secret(),
                    imap.use_tls as i64,
                    smtp.host.as_str(),
                    i64::from(smtp.port),
                    smtp.username.as_str(),
                    smtp.password.expose_secret(),
                    smtp.use_tls as i64,
                    smtp.from_address.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_tenant: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_tenant: {e}")))?
            .ok_or_else(|| DatabaseError::Query("insert_tenant: no id returned".into()))?;
        row.get(0)
            .map_err(|e| DatabaseError::Query(format!("insert_tenant row parse: {e}")))
    }
}

#[async_trait]
impl TenantDirectory for LibSqlTenantDirectory {
    async fn list_tenants(&self) -> Result<Vec<Tenant>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {WEBSITE_COLUMNS} FROM websites ORDER BY id"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tenants: {e}")))?;

        let mut tenants = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tenants: {e}")))?
        {
            match row_to_tenant(&row) {
                Ok(tenant) => tenants.push(tenant),
                // One bad row must not hide every other tenant.
                Err(e) => warn!(error = %e, "Skipping unreadable website row"),
            }
        }
        Ok(tenants)
    }

    async fn open_store(&self, tenant: &Tenant) -> Result<Arc<dyn MessageMatcher>, DatabaseError> {
        let store = LibSqlMessageStore::new_local(&tenant.db_path).await?;
        Ok(Arc::new(store))
    }
}

fn row_to_tenant(row: &libsql::Row) -> Result<Tenant, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("website row parse: {e}"));
    let id: i64 = row.get(0).map_err(parse)?;
    let port = |idx: i32| -> Result<u16, DatabaseError> {
        let raw: i64 = row.get(idx).map_err(parse)?;
        u16::try_from(raw).map_err(|_| {
            DatabaseError::Query(format!("website {id}: port {raw} out of range"))
        })
    };

    let imap = ImapConfig {
        host: row.get(3).map_err(parse)?,
        port: port(4)?,
        username: row.get(5).map_err(parse)?,
        password: SecretString::from(row.get::<String>(6).map_err(parse)?),
        use_tls: row.get::<i64>(7).map_err(parse)? != 0,
    };
    let smtp = SmtpConfig {
        host: row.get(8).map_err(parse)?,
        port: port(9)?,
        username: row.get(10).map_err(parse)?,
        password: SecretString::from(row.get::<String>(11).map_err(parse)?),
        use_tls: row.get::<i64>(12).map_err(parse)? != 0,
        from_address: row.get(13).map_err(parse)?,
    };

    Ok(Tenant {
        id,
        name: row.get(1).map_err(parse)?,
        mail: MailConfig { imap, smtp },
        db_path: PathBuf::from(row.get::<String>(2).map_err(parse)?),
    })
}

use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;

use replydesk::config::HostConfig;
use replydesk::pipeline::TenantScheduler;
use replydesk::store::{LibSqlTenantDirectory, TenantDirectory};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = HostConfig::from_env().context("Invalid configuration")?;

    eprintln!("📬 Replydesk v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!(
        "   Polling every {}s (network timeout {}s)\n",
        config.scheduler.poll_interval.as_secs(),
        config.scheduler.network_timeout.as_secs()
    );

    // ── Tenants ──────────────────────────────────────────────────────────
    let directory: Arc<dyn TenantDirectory> = Arc::new(
        LibSqlTenantDirectory::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );

    // ── Scheduler ────────────────────────────────────────────────────────
    let scheduler = Arc::new(TenantScheduler::new(directory, config.scheduler.clone()));
    let (handle, shutdown) = scheduler.spawn();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    eprintln!("\nShutting down…");
    shutdown.store(true, Ordering::Relaxed);
    // Don't wait out the current interval.
    handle.abort();

    Ok(())
}

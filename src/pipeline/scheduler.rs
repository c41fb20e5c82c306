//! Tenant scheduler: fans one poll per configured tenant out on every tick.
//!
//! Tenant configuration is re-read from the [`TenantDirectory`] each cycle,
//! so edits apply within one interval. Tenants without an IMAP host and port
//! are skipped. A tenant whose previous poll is still running is skipped
//! until it finishes.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{error, info, trace, warn};

use crate::config::{SchedulerConfig, Tenant};
use crate::error::Error;
use crate::pipeline::poller::{PollResult, poll};
use crate::store::traits::TenantDirectory;

/// Outcome of one tenant's poll task.
pub type TenantPoll = JoinHandle<Result<PollResult, Error>>;

pub struct TenantScheduler {
    directory: Arc<dyn TenantDirectory>,
    config: SchedulerConfig,
    in_flight: Arc<Mutex<HashSet<i64>>>,
}

impl TenantScheduler {
    pub fn new(directory: Arc<dyn TenantDirectory>, config: SchedulerConfig) -> Self {
        Self {
            directory,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Start one poll task per eligible tenant and return without waiting.
    pub async fn run_cycle(&self) -> Vec<(i64, TenantPoll)> {
        let tenants = match self.directory.list_tenants().await {
            Ok(tenants) => tenants,
            Err(e) => {
                error!(error = %e, "Failed to load tenants, skipping cycle");
                return Vec::new();
            }
        };

        let mut started = Vec::new();
        for tenant in tenants {
            if !tenant.mail.imap.is_configured() {
                trace!(tenant = %tenant.name, "No IMAP configured");
                continue;
            }

            let Some(guard) = InFlight::claim(&self.in_flight, tenant.id) else {
                warn!(tenant = %tenant.name, "Previous poll still running, skipping");
                continue;
            };

            let id = tenant.id;
            let directory = Arc::clone(&self.directory);
            let timeout = self.config.network_timeout;
            let handle = tokio::spawn(async move {
                let _guard = guard;
                let outcome = poll_tenant(directory.as_ref(), &tenant, timeout).await;
                log_outcome(&tenant, &outcome);
                outcome
            });
            started.push((id, handle));
        }
        started
    }

    /// Run cycles forever on the configured interval. The first cycle starts
    /// immediately.
    ///
    /// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop after
    /// the current tick.
    pub fn spawn(self: Arc<Self>) -> (JoinHandle<()>, Arc<AtomicBool>) {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);

        let handle = tokio::spawn(async move {
            info!(
                "Tenant scheduler started — polling every {}s",
                self.config.poll_interval.as_secs()
            );

            let mut tick = tokio::time::interval(self.config.poll_interval);

            loop {
                tick.tick().await;

                if shutdown.load(Ordering::Relaxed) {
                    info!("Tenant scheduler shutting down");
                    return;
                }

                let started = self.run_cycle().await;
                trace!(tenants = started.len(), "Cycle dispatched");
            }
        });

        (handle, shutdown_flag)
    }
}

async fn poll_tenant(
    directory: &dyn TenantDirectory,
    tenant: &Tenant,
    timeout: std::time::Duration,
) -> Result<PollResult, Error> {
    let store = directory.open_store(tenant).await?;
    let mailbox = directory.open_mailbox(tenant, timeout);
    Ok(poll(mailbox.as_ref(), store.as_ref()).await?)
}

fn log_outcome(tenant: &Tenant, outcome: &Result<PollResult, Error>) {
    match outcome {
        Ok(result) if result.is_clean() => info!(
            tenant = %tenant.name,
            emails_checked = result.emails_checked,
            replies_added = result.replies_added,
            "Poll complete"
        ),
        Ok(result) => {
            info!(
                tenant = %tenant.name,
                emails_checked = result.emails_checked,
                replies_added = result.replies_added,
                errors = result.errors.len(),
                summary = %result.to_json(),
                "Poll complete with errors"
            );
            for issue in &result.errors {
                warn!(tenant = %tenant.name, %issue, "Poll issue");
            }
        }
        Err(e) => error!(tenant = %tenant.name, error = %e, "Poll failed"),
    }
}

/// Membership in the in-flight set, released on drop.
struct InFlight {
    set: Arc<Mutex<HashSet<i64>>>,
    tenant_id: i64,
}

impl InFlight {
    fn claim(set: &Arc<Mutex<HashSet<i64>>>, tenant_id: i64) -> Option<Self> {
        let mut running = set.lock().unwrap_or_else(|e| e.into_inner());
        if !running.insert(tenant_id) {
            return None;
        }
        Some(Self {
            set: Arc::clone(set),
            tenant_id,
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut running = self.set.lock().unwrap_or_else(|e| e.into_inner());
        running.remove(&self.tenant_id);
    }
}

use std::time::Duration;

use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use tenant_router_storage::ScopedStoreFactory;

use crate::background::{BackgroundExecutor, JobError, SweepReport};
use crate::directory::TenantDirectory;

pub const HEALTH_JOB: &str = "tenant.health";

/// Periodic housekeeping: drops expired directory entries and probes every
/// active tenant store.
#[derive(Clone)]
pub struct TenantMaintenanceWorker {
    directory: TenantDirectory,
    executor: BackgroundExecutor,
    stores: ScopedStoreFactory,
    interval: Duration,
}

#[derive(Debug)]
pub struct MaintenanceReport {
    pub purged: usize,
    pub health: SweepReport,
}

impl TenantMaintenanceWorker {
    pub fn new(
        directory: TenantDirectory,
        executor: BackgroundExecutor,
        stores: ScopedStoreFactory,
        interval: Duration,
    ) -> Self {
        Self {
            directory,
            executor,
            stores,
            interval,
        }
    }

    /// Runs the worker loop in the background.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once().await {
                error!(stage = "job", error = %err, "maintenance run failed");
            }
        }
    }

    /// Executes one maintenance cycle (purge + health sweep).
    pub async fn run_once(&self) -> Result<MaintenanceReport, MaintenanceError> {
        let purged = self.directory.purge_expired();
        info!(stage = "directory", purged, remaining = self.directory.len(), "expired directory entries purged");

        let stores = self.stores.clone();
        let health = self
            .executor
            .sweep(HEALTH_JOB, move |_tenant| {
                let stores = stores.clone();
                async move {
                    let store = stores.tenant_store()?;
                    let result = store.ping().await;
                    store.close().await;
                    result
                }
            })
            .await?;

        if !health.is_clean() {
            for failure in &health.failed {
                warn!(stage = "job", tenant = %failure.slug, error = %failure.error, "tenant store unhealthy");
            }
        }
        Ok(MaintenanceReport { purged, health })
    }
}

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("tenant health sweep failed: {0}")]
    Sweep(#[from] JobError),
}

//! Runs jobs on behalf of tenants outside of any request.
//!
//! A job resolves its tenant by id, establishes the context inside a freshly
//! spawned task and never inherits the context of whoever triggered it.

use std::{fmt, future::Future, sync::Arc, time::Instant};

use metrics::{counter, histogram};
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::Semaphore,
    task::{AbortHandle, JoinSet},
};
use tracing::{error, info, info_span, warn, Instrument};

use tenant_router_core::{context, ContextError, TenantContext, TenantId, TenantSlug};
use tenant_router_storage::RegistryError;

use crate::directory::{LookupKey, ResolveError, TenantDirectory};

#[derive(Clone)]
pub struct BackgroundExecutor {
    directory: TenantDirectory,
    concurrency: usize,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("failed to list active tenants: {0}")]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error("job failed: {0}")]
    Failed(String),
    #[error("job panicked")]
    Panicked,
    #[error("job was cancelled")]
    Cancelled,
}

/// Outcome of one job fanned out over every active tenant.
#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub job: &'static str,
    pub succeeded: Vec<TenantSlug>,
    pub failed: Vec<SweepFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepFailure {
    pub tenant_id: TenantId,
    pub slug: TenantSlug,
    pub error: String,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl BackgroundExecutor {
    pub fn new(directory: TenantDirectory, concurrency: usize) -> Self {
        Self {
            directory,
            concurrency: concurrency.max(1),
        }
    }

    /// Runs `work` for one tenant in its own task with that tenant's context.
    ///
    /// Inactive or unknown tenants fail before `work` starts. A panicking job
    /// is reported as [`JobError::Panicked`]; dropping the returned future
    /// aborts the job.
    pub async fn run_for_tenant<F, Fut, T, E>(
        &self,
        job: &'static str,
        tenant_id: TenantId,
        work: F,
    ) -> Result<T, JobError>
    where
        F: FnOnce(TenantContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let outcome = self.execute(job, tenant_id, work).await;
        let result = if outcome.is_ok() { "ok" } else { "error" };
        counter!("tenant_job_runs_total", "job" => job, "result" => result).increment(1);
        outcome
    }

    async fn execute<F, Fut, T, E>(
        &self,
        job: &'static str,
        tenant_id: TenantId,
        work: F,
    ) -> Result<T, JobError>
    where
        F: FnOnce(TenantContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let tenant = self.directory.resolve(&LookupKey::Id(tenant_id)).await?;
        let span = info_span!("tenant_job", job, tenant = %tenant.slug(), scope_id = %tenant.scope_id());
        let for_work = tenant.clone();
        let handle = tokio::spawn(
            context::establish(tenant, async move { work(for_work).await }).instrument(span),
        );
        let _guard = AbortOnDrop(handle.abort_handle());

        match handle.await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(err))) => Err(JobError::Failed(err.to_string())),
            Ok(Err(err)) => Err(JobError::Context(err)),
            Err(err) if err.is_panic() => {
                error!(stage = "job", job, tenant_id = %tenant_id, "tenant job panicked");
                Err(JobError::Panicked)
            }
            Err(_) => Err(JobError::Cancelled),
        }
    }

    /// Runs `work` once per active tenant, at most `concurrency` at a time.
    ///
    /// A failing tenant is logged and recorded; the sweep carries on.
    pub async fn sweep<F, Fut, E>(&self, job: &'static str, work: F) -> Result<SweepReport, JobError>
    where
        F: Fn(TenantContext) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let started = Instant::now();
        let tenants = self.directory.registry().list_active().await?;
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for record in tenants {
            let executor = self.clone();
            let work = work.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let outcome = executor.run_for_tenant(job, record.id, work).await;
                (record, outcome)
            });
        }

        let mut report = SweepReport {
            job,
            succeeded: Vec::new(),
            failed: Vec::new(),
        };
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((record, Ok(()))) => report.succeeded.push(record.slug),
                Ok((record, Err(err))) => {
                    warn!(stage = "job", job, tenant = %record.slug, error = %err, "tenant job failed, continuing sweep");
                    report.failed.push(SweepFailure {
                        tenant_id: record.id,
                        slug: record.slug,
                        error: err.to_string(),
                    });
                }
                Err(err) => error!(stage = "job", job, error = %err, "sweep task did not complete"),
            }
        }
        report.succeeded.sort();
        report.failed.sort_by(|a, b| a.slug.cmp(&b.slug));

        let elapsed = started.elapsed().as_secs_f64();
        histogram!("tenant_sweep_seconds", "job" => job).record(elapsed);
        info!(
            stage = "job",
            job,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            duration_secs = elapsed,
            "tenant sweep completed"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use tenant_router_storage::{InventoryStore, ModuleStore};

    use crate::test_support::harness;

    #[tokio::test]
    async fn job_runs_with_the_requested_tenant_only() {
        let h = harness().await;
        let acme = h.register("acme").await;
        h.register("globex").await;

        let seen = h
            .executor
            .run_for_tenant("probe", acme.id, |context| async move {
                let current = context::require().map_err(|err| err.to_string())?;
                assert_eq!(current, context);
                Ok::<_, String>(current.slug().to_string())
            })
            .await
            .expect("job");
        assert_eq!(seen, "acme");
        assert!(context::current().is_none());
    }

    #[tokio::test]
    async fn job_does_not_inherit_the_callers_context() {
        let h = harness().await;
        let acme = h.register("acme").await;
        let globex = h.register("globex").await;
        let globex_context = h
            .directory
            .resolve(&LookupKey::Id(globex.id))
            .await
            .expect("resolve");

        let executor = h.executor.clone();
        let seen = context::establish(globex_context, async move {
            executor
                .run_for_tenant("probe", acme.id, |_| async {
                    Ok::<_, String>(context::require().map_err(|err| err.to_string())?.tenant_id())
                })
                .await
        })
        .await
        .expect("establish")
        .expect("job");
        assert_eq!(seen, acme.id);
    }

    #[tokio::test]
    async fn inactive_tenant_job_never_starts() {
        let h = harness().await;
        let acme = h.register("acme").await;
        h.admin.set_active(&acme.id, false).await.expect("deactivate");
        let started = Arc::new(AtomicUsize::new(0));

        let counter = started.clone();
        let err = h
            .executor
            .run_for_tenant("probe", acme.id, move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Resolve(ResolveError::TenantInactive(_))));
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_job_is_reported_and_leaves_no_context() {
        let h = harness().await;
        let acme = h.register("acme").await;

        let err = h
            .executor
            .run_for_tenant("explode", acme.id, |_| async {
                if context::current().is_some() {
                    panic!("job failure");
                }
                Ok::<(), String>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Panicked));
        assert!(context::current().is_none());
    }

    #[tokio::test]
    async fn dropping_the_job_future_aborts_the_task() {
        let h = harness().await;
        let acme = h.register("acme").await;
        let finished = Arc::new(AtomicUsize::new(0));

        let flag = finished.clone();
        let run = h.executor.run_for_tenant("slow", acme.id, move |_| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            flag.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(())
        });
        assert!(tokio::time::timeout(Duration::from_millis(20), run)
            .await
            .is_err());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn sweep_survives_a_panicking_tenant() {
        let h = harness().await;
        h.register("acme").await;
        h.register("globex").await;
        h.register("initech").await;

        let report = h
            .executor
            .sweep("explode", |context| async move {
                if context.slug().as_str() == "globex" {
                    panic!("globex exploded");
                }
                Ok::<(), String>(())
            })
            .await
            .expect("sweep");

        assert_eq!(report.succeeded.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].slug.as_str(), "globex");
        assert_eq!(report.failed[0].error, "job panicked");
    }

    #[tokio::test]
    async fn sweep_continues_past_a_failing_tenant() {
        let h = harness().await;
        h.register("acme").await;
        h.register("globex").await;
        h.register("initech").await;
        let factory = h.stores.clone();

        let report = h
            .executor
            .sweep("inventory.touch", move |context| {
                let factory = factory.clone();
                async move {
                    if context.slug().as_str() == "globex" {
                        return Err("globex is broken".to_string());
                    }
                    let store = factory
                        .create::<InventoryStore>()
                        .map_err(|err| err.to_string())?;
                    let result = store
                        .records()
                        .upsert("last-sweep", &serde_json::json!({ "ok": true }))
                        .await
                        .map_err(|err| err.to_string());
                    store.close().await;
                    result
                }
            })
            .await
            .expect("sweep");

        let succeeded: Vec<_> = report.succeeded.iter().map(|slug| slug.as_str()).collect();
        assert_eq!(succeeded, ["acme", "initech"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].slug.as_str(), "globex");
        assert!(report.failed[0].error.contains("globex is broken"));
        assert!(!report.is_clean());
    }
}

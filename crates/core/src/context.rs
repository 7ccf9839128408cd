//! Flow-scoped tenant context.
//!
//! The current tenant is stored in a tokio task-local, so it follows one
//! logical flow across every `.await` of that flow and is invisible to any
//! other task scheduled on the same worker thread. A binding only exists for
//! the duration of [`establish`]; leaving the scope, including through a
//! panic or by dropping the future, removes it.

use std::{future::Future, sync::Arc};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::target::DataStoreTarget;
use crate::types::{TenantId, TenantRecord, TenantSlug};

tokio::task_local! {
    static CURRENT_TENANT: TenantContext;
}

/// Tenant resolved for one request or one job execution. Immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    inner: Arc<ContextInner>,
}

#[derive(Debug, PartialEq, Eq)]
struct ContextInner {
    scope_id: Uuid,
    tenant_id: TenantId,
    slug: TenantSlug,
    target: DataStoreTarget,
    record_version: u64,
    established_at: DateTime<Utc>,
}

impl TenantContext {
    /// Builds a context for a freshly resolved tenant. Every call yields a new scope id.
    pub fn new(record: &TenantRecord, target: DataStoreTarget) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                scope_id: Uuid::new_v4(),
                tenant_id: record.id,
                slug: record.slug.clone(),
                target,
                record_version: record.version,
                established_at: Utc::now(),
            }),
        }
    }

    pub fn scope_id(&self) -> Uuid {
        self.inner.scope_id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.inner.tenant_id
    }

    pub fn slug(&self) -> &TenantSlug {
        &self.inner.slug
    }

    pub fn target(&self) -> &DataStoreTarget {
        &self.inner.target
    }

    /// Registry version of the record this context was derived from.
    pub fn record_version(&self) -> u64 {
        self.inner.record_version
    }

    pub fn established_at(&self) -> DateTime<Utc> {
        self.inner.established_at
    }
}

/// Errors raised by the context carrier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("no tenant context is established for the current flow")]
    NoTenantContext,
    #[error("flow is bound to tenant {bound}, refusing to switch to {requested}")]
    TenantSwitch {
        bound: TenantSlug,
        requested: TenantSlug,
    },
}

/// Returns the tenant bound to the calling flow, or `None` outside any scope.
pub fn current() -> Option<TenantContext> {
    CURRENT_TENANT.try_with(TenantContext::clone).ok()
}

/// Like [`current`], but an unset context is an error.
pub fn require() -> Result<TenantContext, ContextError> {
    current().ok_or(ContextError::NoTenantContext)
}

/// Runs `work` with `context` bound to the calling flow.
///
/// Nested establishment for the same tenant runs `work` inside the existing
/// scope; a different tenant is rejected with [`ContextError::TenantSwitch`].
pub async fn establish<F>(context: TenantContext, work: F) -> Result<F::Output, ContextError>
where
    F: Future,
{
    match current() {
        Some(outer) if outer.tenant_id() == context.tenant_id() => Ok(work.await),
        Some(outer) => Err(switch_error(&outer, &context)),
        None => Ok(CURRENT_TENANT.scope(context, work).await),
    }
}

/// Synchronous counterpart of [`establish`].
pub fn establish_blocking<F, R>(context: TenantContext, work: F) -> Result<R, ContextError>
where
    F: FnOnce() -> R,
{
    match current() {
        Some(outer) if outer.tenant_id() == context.tenant_id() => Ok(work()),
        Some(outer) => Err(switch_error(&outer, &context)),
        None => Ok(CURRENT_TENANT.sync_scope(context, work)),
    }
}

/// Spawns `work` on the runtime with the caller's context re-established.
///
/// Plain `tokio::spawn` starts a new flow without any tenant.
pub fn spawn_scoped<F>(work: F) -> Result<JoinHandle<F::Output>, ContextError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let context = require()?;
    Ok(tokio::spawn(CURRENT_TENANT.scope(context, work)))
}

fn switch_error(outer: &TenantContext, requested: &TenantContext) -> ContextError {
    ContextError::TenantSwitch {
        bound: outer.slug().clone(),
        requested: requested.slug().clone(),
    }
}

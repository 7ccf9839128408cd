use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    middleware::from_fn_with_state,
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;

use tenant_router_storage::ScopedStoreFactory;

use crate::admin::{self, TenantAdmin};
use crate::directory::TenantDirectory;
use crate::identity::{self, TenantClaimsValidator};
use crate::{api, telemetry};

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    directory: TenantDirectory,
    stores: ScopedStoreFactory,
    admin: TenantAdmin,
    claims: Option<TenantClaimsValidator>,
    admin_token: Option<Arc<str>>,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        directory: TenantDirectory,
        stores: ScopedStoreFactory,
        admin: TenantAdmin,
        jwt_secret: Option<&str>,
        admin_token: Option<&str>,
    ) -> Self {
        Self {
            metrics,
            directory,
            stores,
            admin,
            claims: jwt_secret.map(|secret| TenantClaimsValidator::new(secret.as_bytes())),
            admin_token: admin_token.map(Arc::from),
            clock: Arc::new(Utc::now),
        }
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn directory(&self) -> &TenantDirectory {
        &self.directory
    }

    pub fn stores(&self) -> &ScopedStoreFactory {
        &self.stores
    }

    pub fn admin(&self) -> &TenantAdmin {
        &self.admin
    }

    pub fn claims(&self) -> Option<&TenantClaimsValidator> {
        self.claims.as_ref()
    }

    pub fn admin_token(&self) -> Option<&str> {
        self.admin_token.as_deref()
    }

    /// Replaces the clock bearer tokens are validated against.
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

pub fn app_router(state: AppState) -> Router {
    let api = api::routes().layer(from_fn_with_state(state.clone(), identity::tenant_scope));
    let admin = admin::routes().layer(from_fn_with_state(state.clone(), admin::require_admin));
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .nest("/api", api)
        .nest("/admin", admin)
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

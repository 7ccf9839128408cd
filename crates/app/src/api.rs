use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use metrics::counter;
use serde::Serialize;
use serde_json::Value;

use tenant_router_core::context;
use tenant_router_storage::{
    CmsStore, CrmStore, HrStore, InventoryStore, ManufacturingStore, ModuleRecord, ModuleStore,
    SalesStore, ScopedStoreFactory,
};

use crate::problem::ProblemResponse;
use crate::router::AppState;

/// Tenant-scoped routes. Mounted behind the identity middleware, so every
/// handler runs inside an established tenant context.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/tenant", get(current_tenant))
        .route("/modules/:module/records", get(list_records))
        .route(
            "/modules/:module/records/:key",
            get(get_record).put(put_record),
        )
}

#[derive(Debug, Serialize)]
struct TenantView {
    tenant_id: String,
    slug: String,
    database: String,
    scope_id: String,
    record_version: u64,
    established_at: String,
}

#[derive(Debug, Serialize)]
struct RecordView {
    key: String,
    payload: Value,
    updated_at: String,
}

impl From<ModuleRecord> for RecordView {
    fn from(record: ModuleRecord) -> Self {
        Self {
            key: record.key,
            payload: record.payload,
            updated_at: record.updated_at.to_rfc3339(),
        }
    }
}

async fn current_tenant() -> Result<Json<TenantView>, ProblemResponse> {
    let tenant = context::require()?;
    Ok(Json(TenantView {
        tenant_id: tenant.tenant_id().to_string(),
        slug: tenant.slug().to_string(),
        database: tenant.target().database().to_string(),
        scope_id: tenant.scope_id().to_string(),
        record_version: tenant.record_version(),
        established_at: tenant.established_at().to_rfc3339(),
    }))
}

/// Expands `$body` once per known module with `$store` naming that module's
/// store type; unknown names become an `unknown_module` problem.
macro_rules! with_module_store {
    ($module:expr, $store:ident => $body:expr) => {
        match $module {
            m if m == InventoryStore::MODULE => {
                type $store = InventoryStore;
                $body
            }
            m if m == CrmStore::MODULE => {
                type $store = CrmStore;
                $body
            }
            m if m == HrStore::MODULE => {
                type $store = HrStore;
                $body
            }
            m if m == ManufacturingStore::MODULE => {
                type $store = ManufacturingStore;
                $body
            }
            m if m == SalesStore::MODULE => {
                type $store = SalesStore;
                $body
            }
            m if m == CmsStore::MODULE => {
                type $store = CmsStore;
                $body
            }
            other => Err(ProblemResponse::new(
                StatusCode::NOT_FOUND,
                "unknown_module",
                format!("module {other:?} does not exist"),
            )),
        }
    };
}

fn open_store<S: ModuleStore>(factory: &ScopedStoreFactory) -> Result<S, ProblemResponse> {
    let store = factory.create::<S>()?;
    counter!("tenant_store_opened_total", "module" => S::MODULE).increment(1);
    Ok(store)
}

async fn list_records(
    State(state): State<AppState>,
    Path(module): Path<String>,
) -> Result<Json<Vec<RecordView>>, ProblemResponse> {
    with_module_store!(module.as_str(), S => list::<S>(state.stores()).await)
}

async fn get_record(
    State(state): State<AppState>,
    Path((module, key)): Path<(String, String)>,
) -> Result<Json<RecordView>, ProblemResponse> {
    with_module_store!(module.as_str(), S => fetch::<S>(state.stores(), &key).await)
}

async fn put_record(
    State(state): State<AppState>,
    Path((module, key)): Path<(String, String)>,
    Json(payload): Json<Value>,
) -> Result<StatusCode, ProblemResponse> {
    with_module_store!(module.as_str(), S => upsert::<S>(state.stores(), &key, &payload).await)
}

async fn list<S: ModuleStore + Sync>(
    factory: &ScopedStoreFactory,
) -> Result<Json<Vec<RecordView>>, ProblemResponse> {
    let store = open_store::<S>(factory)?;
    let result = store.records().list().await;
    store.close().await;
    Ok(Json(result?.into_iter().map(RecordView::from).collect()))
}

async fn fetch<S: ModuleStore + Sync>(
    factory: &ScopedStoreFactory,
    key: &str,
) -> Result<Json<RecordView>, ProblemResponse> {
    let store = open_store::<S>(factory)?;
    let result = store.records().fetch(key).await;
    store.close().await;
    match result? {
        Some(record) => Ok(Json(record.into())),
        None => Err(ProblemResponse::new(
            StatusCode::NOT_FOUND,
            "record_not_found",
            format!("{} record {key:?} does not exist", S::MODULE),
        )),
    }
}

async fn upsert<S: ModuleStore + Sync>(
    factory: &ScopedStoreFactory,
    key: &str,
    payload: &Value,
) -> Result<StatusCode, ProblemResponse> {
    let store = open_store::<S>(factory)?;
    let result = store.records().upsert(key, payload).await;
    store.close().await;
    result?;
    Ok(StatusCode::NO_CONTENT)
}

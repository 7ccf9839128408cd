mod admin;
mod api;
mod background;
mod directory;
mod identity;
mod maintenance;
mod problem;
mod router;
mod telemetry;
#[cfg(test)]
mod test_support;

use std::net::SocketAddr;

use tracing::{info, warn};

use tenant_router_core::TargetTemplate;
use tenant_router_storage::{Database, ScopedStoreFactory, TenantConnector};
use tenant_router_util::{load_env_file, AppConfig};

use crate::directory::{DirectoryConfig, TenantDirectory};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.master_database_url).await?;
    database.run_migrations().await?;
    info!(stage = "app", url = %config.master_database_url, "tenant registry ready");

    let template = TargetTemplate::new(
        config.tenant_template.prefix.as_str(),
        config.tenant_template.suffix.as_str(),
        config.tenant_template.connection_pattern.as_str(),
    )?;
    let directory = TenantDirectory::new(
        database.tenants(),
        template,
        DirectoryConfig::from_settings(&config.directory, config.base_domain.clone()),
    );

    let connector = TenantConnector::default();
    let stores = ScopedStoreFactory::new(connector.clone());
    let admin = admin::TenantAdmin::new(directory.clone(), connector);
    let executor = background::BackgroundExecutor::new(directory.clone(), config.sweep_concurrency);

    maintenance::TenantMaintenanceWorker::new(
        directory.clone(),
        executor,
        stores.clone(),
        config.sweep_interval,
    )
    .spawn();

    if config.admin_token.is_none() {
        warn!(stage = "app", "APP_ADMIN_TOKEN is not set; admin routes are unauthenticated");
    }
    let state = router::AppState::new(
        metrics,
        directory,
        stores,
        admin,
        config.jwt_secret.as_deref(),
        config.admin_token.as_deref(),
    );

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}

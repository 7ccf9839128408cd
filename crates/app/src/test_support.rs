use std::{
    borrow::Cow,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tempfile::TempDir;

use tenant_router_core::{TargetTemplate, TenantId, TenantRecord, TenantSlug};
use tenant_router_storage::{
    sqlite_file_url, Database, NewTenant, ScopedStoreFactory, TenantConnector,
};

use crate::admin::{Registration, TenantAdmin};
use crate::background::BackgroundExecutor;
use crate::directory::{DirectoryConfig, TenantDirectory};

pub const BASE_DOMAIN: &str = "example.com";

#[derive(Clone)]
pub struct TestClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl TestClock {
    fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Utc::now())),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock poisoned")
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock poisoned");
        *now += ChronoDuration::from_std(by).expect("duration");
    }
}

/// Master database, directory and stores rooted in one temporary directory.
pub struct Harness {
    pub dir: TempDir,
    pub database: Database,
    pub directory: TenantDirectory,
    pub admin: TenantAdmin,
    pub stores: ScopedStoreFactory,
    pub executor: BackgroundExecutor,
    pub clock: TestClock,
}

impl Harness {
    /// Registers an active tenant through the admin path.
    pub async fn register(&self, slug: &str) -> TenantRecord {
        self.admin
            .register(Registration {
                slug: slug.to_string(),
                name: slug.to_uppercase(),
                custom_domain: None,
                connection_override: None,
            })
            .await
            .expect("register tenant")
    }

    /// Writes and provisions a tenant behind the directory's back.
    pub async fn register_without_invalidation(&self, value: &str) -> TenantRecord {
        let slug = slug(value);
        let record = self
            .database
            .tenants()
            .insert(
                &NewTenant {
                    id: TenantId::generate(),
                    slug: &slug,
                    name: Cow::Borrowed(value),
                    custom_domain: None,
                    connection_override: None,
                    is_active: true,
                },
                Utc::now(),
            )
            .await
            .expect("insert tenant");
        TenantConnector::default()
            .provision(record.id, &self.directory.template().derive(&record))
            .await
            .expect("provision");
        record
    }

    pub fn store_url(&self, name: &str) -> String {
        sqlite_file_url(self.dir.path(), &format!("{name}.db"))
    }
}

pub fn slug(value: &str) -> TenantSlug {
    TenantSlug::parse(value).expect("slug")
}

pub fn directory_config() -> DirectoryConfig {
    DirectoryConfig {
        ttl: Duration::from_secs(60),
        negative_ttl: Duration::from_secs(5),
        retry_attempts: 2,
        retry_backoff: Duration::from_millis(1),
        lookup_timeout: Duration::from_secs(2),
        capacity: 1_000,
        base_domain: Some(BASE_DOMAIN.to_string()),
    }
}

pub async fn harness() -> Harness {
    harness_with(directory_config()).await
}

pub async fn harness_with(config: DirectoryConfig) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let database = Database::connect(&sqlite_file_url(dir.path(), "master.db"))
        .await
        .expect("connect master");
    database.run_migrations().await.expect("migrations");

    let pattern = format!("sqlite://{}/{{database}}.db", dir.path().display());
    let template = TargetTemplate::new("db", "", pattern).expect("template");
    let clock = TestClock::new();
    let clock_fn = clock.clone();
    let directory = TenantDirectory::with_clock(
        database.tenants(),
        template,
        config,
        Arc::new(move || clock_fn.now()),
    );

    let connector = TenantConnector::default();
    Harness {
        admin: TenantAdmin::new(directory.clone(), connector.clone()),
        stores: ScopedStoreFactory::new(connector),
        executor: BackgroundExecutor::new(directory.clone(), 2),
        directory,
        database,
        dir,
        clock,
    }
}

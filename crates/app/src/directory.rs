//! Read-through cache of tenant registry lookups.
//!
//! The whole map is an immutable snapshot behind an [`ArcSwap`]. Readers load
//! the current snapshot without locking; writers build a new map and publish
//! it with a compare-and-swap, so a reader holds either the old snapshot or
//! the new one, never a mix, and never waits for a writer.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::counter;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use tenant_router_core::{
    normalize_host, DataStoreTarget, TargetTemplate, TenantContext, TenantId, TenantRecord,
    TenantSlug,
};
use tenant_router_storage::{RegistryError, TenantRegistryRepository};
use tenant_router_util::DirectorySettings;

const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Identity a tenant is looked up by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LookupKey {
    Id(TenantId),
    Slug(TenantSlug),
    /// Normalized request host: custom domain first, then subdomain slug.
    Host(String),
}

impl LookupKey {
    pub fn host(raw: &str) -> Self {
        Self::Host(normalize_host(raw))
    }
}

impl fmt::Display for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id:{id}"),
            Self::Slug(slug) => write!(f, "slug:{slug}"),
            Self::Host(host) => write!(f, "host:{host}"),
        }
    }
}

/// What a tenant mutation invalidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    Id(TenantId),
    Slug(TenantSlug),
    Host(String),
}

impl fmt::Display for Invalidation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id:{id}"),
            Self::Slug(slug) => write!(f, "slug:{slug}"),
            Self::Host(host) => write!(f, "host:{host}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// Upper bound on how long a changed record can go unnoticed without invalidation.
    pub ttl: Duration,
    pub negative_ttl: Duration,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    pub lookup_timeout: Duration,
    /// Maximum number of cached keys, positive and negative together.
    pub capacity: usize,
    pub base_domain: Option<String>,
}

impl DirectoryConfig {
    pub fn from_settings(settings: &DirectorySettings, base_domain: Option<String>) -> Self {
        Self {
            ttl: settings.ttl,
            negative_ttl: settings.negative_ttl,
            retry_attempts: settings.retry_attempts,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            lookup_timeout: settings.lookup_timeout,
            capacity: settings.capacity,
            base_domain,
        }
    }
}

/// Registry record together with its derived data-store target.
#[derive(Debug, Clone)]
pub struct ResolvedTenant {
    pub record: Arc<TenantRecord>,
    pub target: DataStoreTarget,
}

#[derive(Debug)]
struct CacheEntry {
    tenant: Option<ResolvedTenant>,
    expires_at: DateTime<Utc>,
}

impl CacheEntry {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    fn affected_by(&self, key: &LookupKey, invalidation: &Invalidation) -> bool {
        // Negative entries are cheap to rebuild; any mutation may have created
        // the tenant they were missing.
        let Some(tenant) = &self.tenant else {
            return true;
        };
        match invalidation {
            Invalidation::Id(id) => tenant.record.id == *id,
            Invalidation::Slug(slug) => {
                tenant.record.slug == *slug || matches!(key, LookupKey::Slug(cached) if cached == slug)
            }
            Invalidation::Host(host) => matches!(key, LookupKey::Host(cached) if *cached == normalize_host(host)),
        }
    }
}

/// Errors surfaced while resolving a tenant.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unknown tenant ({0})")]
    TenantNotFound(String),
    #[error("tenant {0} is inactive")]
    TenantInactive(TenantSlug),
    #[error("tenant registry unavailable after {attempts} attempt(s): {reason}")]
    RegistryUnavailable { attempts: u32, reason: String },
    #[error("tenant registry error: {0}")]
    Registry(#[source] RegistryError),
}

impl ResolveError {
    /// Label used for metrics and logs.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::TenantNotFound(_) => "not_found",
            Self::TenantInactive(_) => "inactive",
            Self::RegistryUnavailable { .. } => "registry_unavailable",
            Self::Registry(_) => "registry_error",
        }
    }
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;
type EntryMap = HashMap<LookupKey, Arc<CacheEntry>>;

/// Tenant directory shared by request handling and background jobs.
#[derive(Clone)]
pub struct TenantDirectory {
    inner: Arc<DirectoryInner>,
}

struct DirectoryInner {
    registry: TenantRegistryRepository,
    template: TargetTemplate,
    config: DirectoryConfig,
    entries: ArcSwap<EntryMap>,
    /// Bumped by every invalidation before it publishes.
    generation: AtomicU64,
    clock: Clock,
}

impl TenantDirectory {
    pub fn new(
        registry: TenantRegistryRepository,
        template: TargetTemplate,
        config: DirectoryConfig,
    ) -> Self {
        Self::with_clock(registry, template, config, Arc::new(Utc::now))
    }

    pub(crate) fn with_clock(
        registry: TenantRegistryRepository,
        template: TargetTemplate,
        config: DirectoryConfig,
        clock: Clock,
    ) -> Self {
        Self {
            inner: Arc::new(DirectoryInner {
                registry,
                template,
                config,
                entries: ArcSwap::from_pointee(HashMap::new()),
                generation: AtomicU64::new(0),
                clock,
            }),
        }
    }

    pub fn registry(&self) -> &TenantRegistryRepository {
        &self.inner.registry
    }

    pub fn template(&self) -> &TargetTemplate {
        &self.inner.template
    }

    fn now(&self) -> DateTime<Utc> {
        (self.inner.clock)()
    }

    /// Returns the tenant for `key`, whatever its activation state.
    ///
    /// Serves fresh cache entries, otherwise reads the registry and caches the
    /// outcome; a missing tenant is cached as a negative entry with the
    /// shorter negative TTL.
    pub async fn get(&self, key: &LookupKey) -> Result<ResolvedTenant, ResolveError> {
        if let Some(entry) = self.cached(key) {
            return match &entry.tenant {
                Some(tenant) => {
                    counter!("tenant_directory_lookups_total", "result" => "hit").increment(1);
                    Ok(tenant.clone())
                }
                None => {
                    counter!("tenant_directory_lookups_total", "result" => "negative_hit")
                        .increment(1);
                    Err(ResolveError::TenantNotFound(key.to_string()))
                }
            };
        }

        counter!("tenant_directory_lookups_total", "result" => "miss").increment(1);
        let generation = self.inner.generation.load(Ordering::Acquire);
        let tenant = self.load(key).await?.map(|record| ResolvedTenant {
            target: self.inner.template.derive(&record),
            record: Arc::new(record),
        });

        let ttl = if tenant.is_some() {
            self.inner.config.ttl
        } else {
            self.inner.config.negative_ttl
        };
        let entry = Arc::new(CacheEntry {
            tenant: tenant.clone(),
            expires_at: expiry(self.now(), ttl),
        });
        self.fill(key, entry, generation);

        tenant.ok_or_else(|| ResolveError::TenantNotFound(key.to_string()))
    }

    /// Resolves `key` into a fresh [`TenantContext`], refusing inactive tenants.
    pub async fn resolve(&self, key: &LookupKey) -> Result<TenantContext, ResolveError> {
        let outcome = match self.get(key).await {
            Ok(tenant) if !tenant.record.is_active => {
                Err(ResolveError::TenantInactive(tenant.record.slug.clone()))
            }
            Ok(tenant) => Ok(TenantContext::new(&tenant.record, tenant.target)),
            Err(err) => Err(err),
        };
        if let Err(err) = &outcome {
            counter!("tenant_resolution_failures_total", "reason" => err.reason()).increment(1);
        }
        outcome
    }

    /// Drops every entry the invalidation touches. Lookups that start after
    /// this returns never observe the dropped snapshots.
    pub fn invalidate(&self, invalidation: &Invalidation) -> usize {
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        let mut removed = 0;
        self.inner.entries.rcu(|current| {
            let next: EntryMap = current
                .iter()
                .filter(|(key, entry)| !entry.affected_by(key, invalidation))
                .map(|(key, entry)| (key.clone(), Arc::clone(entry)))
                .collect();
            removed = current.len() - next.len();
            next
        });

        counter!("tenant_directory_invalidations_total").increment(1);
        info!(stage = "directory", invalidation = %invalidation, removed, "tenant directory invalidated");
        removed
    }

    /// Removes expired entries, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.now();
        let mut purged = 0;
        self.inner.entries.rcu(|current| {
            let next = fresh_entries(current, now);
            purged = current.len() - next.len();
            next
        });
        purged
    }

    pub fn len(&self) -> usize {
        self.inner.entries.load().len()
    }

    fn cached(&self, key: &LookupKey) -> Option<Arc<CacheEntry>> {
        let now = self.now();
        self.inner
            .entries
            .load()
            .get(key)
            .filter(|entry| entry.is_fresh(now))
            .cloned()
    }

    /// Publishes `entry` unless an invalidation ran since `generation` was
    /// read. A full map first sheds expired entries, then negative ones; if
    /// it is still full the lookup is served uncached.
    fn fill(&self, key: &LookupKey, entry: Arc<CacheEntry>, generation: u64) {
        let now = self.now();
        let capacity = self.inner.config.capacity;
        let mut outcome = FillOutcome::Stored;
        self.inner.entries.rcu(|current| {
            if self.inner.generation.load(Ordering::Acquire) != generation {
                outcome = FillOutcome::Raced;
                return Arc::clone(current);
            }

            let mut next: EntryMap = if current.len() >= capacity && !current.contains_key(key) {
                let mut fresh = fresh_entries(current, now);
                if fresh.len() >= capacity {
                    fresh.retain(|_, cached| cached.tenant.is_some());
                }
                fresh
            } else {
                (**current).clone()
            };
            if next.len() >= capacity && !next.contains_key(key) {
                outcome = FillOutcome::Full;
                return Arc::new(next);
            }
            next.insert(key.clone(), Arc::clone(&entry));
            outcome = FillOutcome::Stored;
            Arc::new(next)
        });

        match outcome {
            FillOutcome::Stored => {}
            FillOutcome::Raced => {
                debug!(stage = "directory", key = %key, "discarding lookup raced by invalidation");
            }
            FillOutcome::Full => {
                counter!("tenant_directory_fills_skipped_total").increment(1);
                debug!(stage = "directory", key = %key, capacity, "tenant directory full, lookup not cached");
            }
        }
    }

    async fn load(&self, key: &LookupKey) -> Result<Option<TenantRecord>, ResolveError> {
        let config = &self.inner.config;
        let attempts = config.retry_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let failure = match timeout(config.lookup_timeout, self.query(key)).await {
                Ok(Ok(found)) => return Ok(found),
                Ok(Err(err)) if err.is_transient() => err.to_string(),
                Ok(Err(err)) => return Err(ResolveError::Registry(err)),
                Err(_) => format!("lookup timed out after {:?}", config.lookup_timeout),
            };

            if attempt >= attempts {
                warn!(stage = "directory", key = %key, attempts, error = %failure, "tenant registry unavailable");
                return Err(ResolveError::RegistryUnavailable {
                    attempts,
                    reason: failure,
                });
            }

            counter!("tenant_registry_retries_total").increment(1);
            warn!(stage = "directory", key = %key, attempt, error = %failure, "tenant registry lookup failed, retrying");
            sleep(config.retry_backoff * attempt).await;
        }
    }

    async fn query(&self, key: &LookupKey) -> Result<Option<TenantRecord>, RegistryError> {
        let registry = &self.inner.registry;
        match key {
            LookupKey::Id(id) => registry.find_by_id(id).await,
            LookupKey::Slug(slug) => registry.find_by_slug(slug).await,
            LookupKey::Host(host) => {
                registry
                    .find_by_host(host, self.inner.config.base_domain.as_deref())
                    .await
            }
        }
    }
}

enum FillOutcome {
    Stored,
    Raced,
    Full,
}

fn fresh_entries(entries: &EntryMap, now: DateTime<Utc>) -> EntryMap {
    entries
        .iter()
        .filter(|(_, entry)| entry.is_fresh(now))
        .map(|(key, entry)| (key.clone(), Arc::clone(entry)))
        .collect()
}

/// Expiry of an entry filled at `now`. TTLs beyond chrono's range never expire.
fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{directory_config, harness, harness_with, slug};

    #[tokio::test]
    async fn resolves_slug_to_template_target() {
        let h = harness().await;
        let acme = h.register("acme").await;

        let context = h
            .directory
            .resolve(&LookupKey::Slug(slug("ACME")))
            .await
            .expect("resolve");
        assert_eq!(context.tenant_id(), acme.id);
        assert_eq!(context.target().database(), "db_acme");
    }

    #[tokio::test]
    async fn cache_hit_does_not_reach_registry() {
        let h = harness().await;
        h.register("acme").await;
        let key = LookupKey::Slug(slug("acme"));
        h.directory.get(&key).await.expect("first lookup");

        h.database.pool().close().await;
        let cached = h.directory.get(&key).await.expect("served from cache");
        assert_eq!(cached.record.slug.as_str(), "acme");
    }

    #[tokio::test]
    async fn get_after_invalidate_never_returns_old_snapshot() {
        let h = harness().await;
        let acme = h.register("acme").await;
        let key = LookupKey::Slug(slug("acme"));
        let before = h.directory.get(&key).await.expect("lookup");
        assert!(before.record.connection_override.is_none());

        let override_url = h.store_url("acme-moved");
        h.database
            .tenants()
            .set_connection_override(&acme.id, Some(&override_url), Utc::now())
            .await
            .expect("update");
        h.directory.invalidate(&Invalidation::Slug(slug("acme")));

        let after = h.directory.get(&key).await.expect("lookup");
        assert_eq!(after.target.connection(), override_url);
        assert!(after.record.version > before.record.version);
    }

    #[tokio::test]
    async fn changed_target_is_observed_within_one_ttl() {
        let h = harness().await;
        let acme = h.register("acme").await;
        let key = LookupKey::Slug(slug("acme"));
        let original = h.directory.get(&key).await.expect("lookup").target;

        let override_url = h.store_url("elsewhere");
        h.database
            .tenants()
            .set_connection_override(&acme.id, Some(&override_url), Utc::now())
            .await
            .expect("update without invalidation");

        h.clock.advance(Duration::from_secs(30));
        assert_eq!(h.directory.get(&key).await.expect("lookup").target, original);

        h.clock.advance(Duration::from_secs(31));
        let refreshed = h.directory.get(&key).await.expect("lookup");
        assert_eq!(refreshed.target.connection(), override_url);
    }

    #[tokio::test]
    async fn missing_tenant_is_negatively_cached_until_invalidated() {
        let h = harness().await;
        let key = LookupKey::Slug(slug("initech"));
        assert!(matches!(
            h.directory.get(&key).await,
            Err(ResolveError::TenantNotFound(_))
        ));
        assert_eq!(h.directory.len(), 1);

        h.register_without_invalidation("initech").await;
        assert!(matches!(
            h.directory.get(&key).await,
            Err(ResolveError::TenantNotFound(_))
        ));

        h.clock.advance(Duration::from_secs(6));
        assert!(h.directory.get(&key).await.is_ok());
    }

    #[tokio::test]
    async fn invalidation_clears_negative_entries() {
        let h = harness().await;
        let key = LookupKey::Slug(slug("initech"));
        assert!(h.directory.get(&key).await.is_err());

        h.register("initech").await;
        assert!(h.directory.get(&key).await.is_ok());
    }

    #[tokio::test]
    async fn invalidating_by_id_drops_every_key_of_the_tenant() {
        let h = harness().await;
        let acme = h.register("acme").await;
        let globex = h.register("globex").await;
        h.directory.get(&LookupKey::Id(acme.id)).await.expect("id");
        h.directory.get(&LookupKey::Slug(slug("acme"))).await.expect("slug");
        h.directory
            .get(&LookupKey::host("acme.example.com"))
            .await
            .expect("host");
        h.directory.get(&LookupKey::Id(globex.id)).await.expect("other");
        assert_eq!(h.directory.len(), 4);

        let removed = h.directory.invalidate(&Invalidation::Id(acme.id));
        assert_eq!(removed, 3);
        assert_eq!(h.directory.len(), 1);
    }

    #[tokio::test]
    async fn inactive_tenant_is_refused() {
        let h = harness().await;
        let acme = h.register("acme").await;
        h.database
            .tenants()
            .set_active(&acme.id, false, Utc::now())
            .await
            .expect("deactivate");
        h.directory.invalidate(&Invalidation::Id(acme.id));

        let err = h
            .directory
            .resolve(&LookupKey::Slug(slug("acme")))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::TenantInactive(ref s) if s.as_str() == "acme"));
        assert!(h.directory.get(&LookupKey::Slug(slug("acme"))).await.is_ok());
    }

    #[tokio::test]
    async fn registry_outage_is_retried_then_reported() {
        let h = harness().await;
        h.database.pool().close().await;

        let err = h
            .directory
            .resolve(&LookupKey::Slug(slug("acme")))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ResolveError::RegistryUnavailable { attempts: 2, .. }
        ));
        assert_eq!(h.directory.len(), 0, "failures are not cached");
    }

    #[tokio::test]
    async fn fill_started_before_invalidation_is_discarded() {
        let h = harness().await;
        let acme = h.register("acme").await;
        let key = LookupKey::Id(acme.id);

        let generation = h.directory.inner.generation.load(Ordering::Acquire);
        let stale = h.directory.get(&key).await.expect("lookup");
        h.directory.invalidate(&Invalidation::Id(acme.id));
        h.directory.fill(
            &key,
            Arc::new(CacheEntry {
                tenant: Some(stale),
                expires_at: h.clock.now() + ChronoDuration::hours(1),
            }),
            generation,
        );
        assert_eq!(h.directory.len(), 0);
    }

    #[tokio::test]
    async fn purge_drops_only_expired_entries() {
        let h = harness().await;
        h.register("acme").await;
        h.directory
            .get(&LookupKey::Slug(slug("acme")))
            .await
            .expect("positive");
        let _ = h.directory.get(&LookupKey::Slug(slug("ghost"))).await;
        assert_eq!(h.directory.len(), 2);

        h.clock.advance(Duration::from_secs(10));
        assert_eq!(h.directory.purge_expired(), 1);
        assert_eq!(h.directory.len(), 1);
    }

    #[tokio::test]
    async fn readers_never_wait_for_a_publishing_writer() {
        let h = harness().await;
        let acme = h.register("acme").await;
        let key = LookupKey::Id(acme.id);
        h.directory.get(&key).await.expect("lookup");

        // The closure runs while the writer is mid-publish.
        let mut seen = None;
        h.directory.inner.entries.rcu(|current| {
            seen = h.directory.cached(&key).map(|entry| entry.tenant.is_some());
            Arc::clone(current)
        });
        assert_eq!(seen, Some(true));
    }

    #[tokio::test]
    async fn oversized_ttl_is_cached_without_overflowing() {
        let h = harness_with(DirectoryConfig {
            ttl: Duration::from_secs(10_000_000_000_000),
            ..directory_config()
        })
        .await;
        h.register("acme").await;
        let key = LookupKey::Slug(slug("acme"));
        h.directory.get(&key).await.expect("lookup");

        h.database.pool().close().await;
        h.clock.advance(Duration::from_secs(365 * 24 * 3600));
        assert!(h.directory.get(&key).await.is_ok(), "entry never expires");
    }

    #[tokio::test]
    async fn unknown_hosts_cannot_grow_the_cache_past_capacity() {
        let h = harness_with(DirectoryConfig {
            capacity: 8,
            ..directory_config()
        })
        .await;
        let acme = h.register("acme").await;
        h.directory.get(&LookupKey::Id(acme.id)).await.expect("positive");

        for i in 0..50 {
            let _ = h
                .directory
                .get(&LookupKey::host(&format!("nobody-{i}.example.com")))
                .await;
            assert!(h.directory.len() <= 8);
        }
        assert!(
            h.directory.cached(&LookupKey::Id(acme.id)).is_some(),
            "negative entries are shed before positive ones"
        );
    }
}

// Copyright 2023 Xayn AG
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! The public surface over the tenant pool cache.

pub(crate) mod cache;
pub(crate) mod coalesce;

use std::{
    fmt::{self, Display},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
    },
    time::{Duration, Instant},
};

use serde::Serialize;
use sqlx::{Pool, Postgres};
use tokio::{task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use xayn_silo_shared::{
    postgres::{is_transient_error, QuotedIdentifier},
    retry::ExponentialJitterRetryPolicy,
    serde::serde_duration_as_millis,
    tenant::TenantId,
};

pub use self::cache::PoolState;
use self::{cache::PoolCache, coalesce::Coalescer};
use crate::{
    config::{ProbeConfig, SiloConfig},
    error::SiloError,
    migration::batch::{BatchExecutor, BatchOptions, TenantOperationResult},
    schema::SchemaManager,
};

#[derive(Clone, PartialEq, Eq, Hash)]
enum ProbeKey {
    Tenant(TenantId),
    Shared,
}

struct SharedSlot {
    pool: Pool<Postgres>,
    schema: QuotedIdentifier,
    state: PoolState,
}

/// Caches one lazily connecting pool per recently used tenant, plus a
/// single slot for the shared schema.
///
/// `db` hands out a pool without any round-trip; `db_validated` probes
/// the pool first, coalescing concurrent probes per tenant.
pub struct PoolManager {
    config: Arc<SiloConfig>,
    schema_manager: Arc<SchemaManager>,
    cache: PoolCache,
    shared: Mutex<Option<SharedSlot>>,
    coalescer: Coalescer<ProbeKey, Pool<Postgres>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl PoolManager {
    /// Builds the manager and starts the TTL sweeper.
    ///
    /// Must be called inside a tokio runtime.
    pub(crate) fn new(config: Arc<SiloConfig>, schema_manager: Arc<SchemaManager>) -> Arc<Self> {
        let manager = Arc::new(Self {
            cache: PoolCache::new(config.pool_cache.clone(), config.hooks.clone()),
            shared: Mutex::new(None),
            coalescer: Coalescer::new(),
            sweeper: Mutex::new(None),
            disposed: AtomicBool::new(false),
            schema_manager,
            config,
        });

        let weak = Arc::downgrade(&manager);
        let period = (manager.config.pool_cache.pool_ttl / 2).max(Duration::from_secs(1));
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.cache.sweep(Instant::now());
            }
        });
        *lock(&manager.sweeper) = Some(sweeper);

        manager
    }

    fn ensure_not_disposed(&self) -> Result<(), SiloError> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(SiloError::Disposed)
        } else {
            Ok(())
        }
    }

    /// The tenant's pool, cached or freshly created, without a round-trip.
    pub fn db(&self, tenant_id: &TenantId) -> Result<Pool<Postgres>, SiloError> {
        self.ensure_not_disposed()?;
        let schema = self.config.schema_for(tenant_id)?;
        self.cache.get_or_create(tenant_id, &schema, || {
            self.schema_manager.schema_pool(
                &schema,
                u32::from(self.config.postgres.max_pool_size),
                u32::from(self.config.postgres.min_pool_size),
            )
        })
    }

    /// Like [`db`] but only returns once a `SELECT 1` probe succeeded.
    ///
    /// Transient probe failures are retried with backoff; concurrent
    /// callers for the same tenant share a single probe.
    ///
    /// [`db`]: Self::db
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn db_validated(&self, tenant_id: &TenantId) -> Result<Pool<Postgres>, SiloError> {
        let pool = self.db(tenant_id)?;

        let probe = {
            let pool = pool.clone();
            let config = self.config.probe.clone();
            move || probe_pool(pool, config)
        };
        match self
            .coalescer
            .run(ProbeKey::Tenant(tenant_id.clone()), probe)
            .await
        {
            Ok(pool) => {
                self.cache.set_state(tenant_id, PoolState::Ready);
                Ok(pool)
            }
            Err(error) => {
                self.cache.set_state(tenant_id, PoolState::Errored);
                let error = SiloError::PoolUnavailable {
                    tenant_id: tenant_id.clone(),
                    reason: error.to_string(),
                };
                self.config.hooks.fire_pool_error(Some(tenant_id), &error);
                Err(error)
            }
        }
    }

    /// The shared schema's pool; a single slot without LRU pressure.
    pub fn shared_db(&self) -> Result<Pool<Postgres>, SiloError> {
        self.ensure_not_disposed()?;
        let mut shared = lock(&self.shared);
        if let Some(slot) = &*shared {
            return Ok(slot.pool.clone());
        }
        let schema = self.config.shared_schema()?;
        let pool = self.schema_manager.schema_pool(
            &schema,
            u32::from(self.config.postgres.max_pool_size),
            u32::from(self.config.postgres.min_pool_size),
        )?;
        *shared = Some(SharedSlot {
            pool: pool.clone(),
            schema,
            state: PoolState::Initializing,
        });
        Ok(pool)
    }

    pub async fn shared_db_validated(&self) -> Result<Pool<Postgres>, SiloError> {
        let pool = self.shared_db()?;
        let probe = {
            let pool = pool.clone();
            let config = self.config.probe.clone();
            move || probe_pool(pool, config)
        };
        match self.coalescer.run(ProbeKey::Shared, probe).await {
            Ok(pool) => {
                self.set_shared_state(PoolState::Ready);
                Ok(pool)
            }
            Err(error) => {
                self.set_shared_state(PoolState::Errored);
                let error = SiloError::PoolUnavailable {
                    tenant_id: TenantId::try_parse_ascii(b"shared").unwrap(/* valid id */),
                    reason: error.to_string(),
                };
                self.config.hooks.fire_pool_error(None, &error);
                Err(error)
            }
        }
    }

    fn set_shared_state(&self, state: PoolState) {
        if let Some(slot) = &mut *lock(&self.shared) {
            slot.state = state;
        }
    }

    /// Establishes pools for the given tenants in parallel.
    ///
    /// Tenants whose pool is already cached are reported `already_warm`
    /// without re-probing.
    #[instrument(skip_all)]
    pub async fn warmup(
        &self,
        tenant_ids: &[TenantId],
        options: &WarmupOptions,
    ) -> Vec<WarmupResult> {
        let batch = BatchExecutor::new(self.config.batch.concurrency);
        let batch_options = BatchOptions {
            concurrency: options.concurrency,
            cancel: options.cancel.clone(),
            ..BatchOptions::default()
        };
        let summary = batch
            .run(tenant_ids, &batch_options, |tenant_id| async move {
                let start = Instant::now();
                if self.cache.contains(&tenant_id) {
                    self.cache.touch(&tenant_id);
                    return Ok(WarmupResult {
                        tenant_id,
                        ok: true,
                        already_warm: true,
                        skipped: false,
                        duration: start.elapsed(),
                        error: None,
                    });
                }
                let outcome = self.db_validated(&tenant_id).await;
                Ok(WarmupResult {
                    ok: outcome.is_ok(),
                    already_warm: false,
                    skipped: false,
                    duration: start.elapsed(),
                    error: outcome.err().map(|error| error.to_string()),
                    tenant_id,
                })
            })
            .await;
        info!(
            { warmed = summary.succeeded, failed = summary.failed },
            "pool warmup finished",
        );
        summary.details
    }

    /// Reports per pool connection counts and, if asked for, probe latency.
    #[instrument(skip_all)]
    pub async fn health_check(
        &self,
        options: &HealthCheckOptions,
    ) -> Result<HealthReport, SiloError> {
        self.ensure_not_disposed()?;
        let start = Instant::now();

        let mut targets = Vec::new();
        if let Some(tenant_ids) = &options.tenant_ids {
            for tenant_id in tenant_ids {
                let pool = self.db(tenant_id)?;
                let schema = self.config.schema_for(tenant_id)?;
                let state = self
                    .cache
                    .snapshot()
                    .into_iter()
                    .find(|snapshot| &snapshot.tenant_id == tenant_id)
                    .map_or(PoolState::Initializing, |snapshot| snapshot.state);
                targets.push((Some(tenant_id.clone()), schema, pool, state));
            }
        } else {
            for snapshot in self.cache.snapshot() {
                targets.push((
                    Some(snapshot.tenant_id),
                    snapshot.schema,
                    snapshot.pool,
                    snapshot.state,
                ));
            }
        }
        if options.include_shared {
            let pool = self.shared_db()?;
            let (schema, state) = {
                let shared = lock(&self.shared);
                let slot = shared.as_ref().unwrap(/* shared_db just filled the slot */);
                (slot.schema.clone(), slot.state)
            };
            targets.push((None, schema, pool, state));
        }

        let mut pools = Vec::with_capacity(targets.len());
        for (tenant_id, schema, pool, state) in targets {
            let connections = pool.size();
            let idle = pool.num_idle();
            let (ping_millis, error) = if options.ping {
                let started = Instant::now();
                match timeout(
                    self.config.probe.timeout,
                    sqlx::query("SELECT 1;").execute(&pool),
                )
                .await
                {
                    Ok(Ok(_)) => (Some(started.elapsed().as_millis() as u64), None),
                    Ok(Err(error)) => (None, Some(error.to_string())),
                    Err(_) => (None, Some("liveness probe timed out".into())),
                }
            } else {
                (None, None)
            };

            pools.push(PoolHealth {
                tenant_id,
                schema: schema.as_unquoted_str().into(),
                state,
                connections,
                idle,
                in_use: connections.saturating_sub(idle as u32),
                ping_millis,
                ok: error.is_none(),
                error,
            });
        }

        let status = if pools.iter().all(|pool| pool.ok) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        Ok(HealthReport {
            status,
            pools,
            duration: start.elapsed(),
        })
    }

    /// Removes and closes the tenant's cached pool; no-op if absent.
    pub fn evict(&self, tenant_id: &TenantId) -> bool {
        self.cache.evict(tenant_id)
    }

    pub fn count(&self) -> usize {
        self.cache.count()
    }

    pub fn active_ids(&self) -> Vec<TenantId> {
        self.cache.active_ids()
    }

    /// Stops the sweeper and closes every pool. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(sweeper) = lock(&self.sweeper).take() {
            sweeper.abort();
        }
        self.cache.dispose();
        let shared = lock(&self.shared).take();
        if let Some(slot) = shared {
            slot.pool.close().await;
        }
        info!("pool manager disposed");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn probe_pool(pool: Pool<Postgres>, config: ProbeConfig) -> Result<Pool<Postgres>, SiloError> {
    let policy = ExponentialJitterRetryPolicy::new(config.retry.clone())
        .with_retry_filter(ProbeError::is_transient);
    policy
        .retry(|| {
            let pool = pool.clone();
            let probe_timeout = config.timeout;
            async move {
                match timeout(probe_timeout, sqlx::query("SELECT 1;").execute(&pool)).await {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err(error)) => Err(ProbeError::Sql(error)),
                    Err(_) => Err(ProbeError::Timeout),
                }
            }
        })
        .await?;
    Ok(pool)
}

#[derive(Debug)]
enum ProbeError {
    Timeout,
    Sql(sqlx::Error),
}

impl ProbeError {
    fn is_transient(&self) -> bool {
        match self {
            ProbeError::Timeout => true,
            ProbeError::Sql(error) => is_transient_error(error),
        }
    }
}

impl Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::Timeout => f.write_str("liveness probe timed out"),
            ProbeError::Sql(error) => write!(f, "liveness probe failed: {error}"),
        }
    }
}

impl From<ProbeError> for SiloError {
    fn from(error: ProbeError) -> Self {
        match error {
            ProbeError::Timeout => SiloError::Other(anyhow::anyhow!("liveness probe timed out")),
            ProbeError::Sql(error) => SiloError::Database(error),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct WarmupOptions {
    /// Parallelism bound, the configured batch default if unset.
    pub concurrency: Option<usize>,
    pub cancel: CancellationToken,
}

#[derive(Clone, Debug, Serialize)]
pub struct WarmupResult {
    pub tenant_id: TenantId,
    pub ok: bool,
    pub already_warm: bool,
    pub skipped: bool,
    #[serde(with = "serde_duration_as_millis")]
    pub duration: Duration,
    pub error: Option<String>,
}

impl TenantOperationResult for WarmupResult {
    fn is_success(&self) -> bool {
        self.ok
    }

    fn is_skipped(&self) -> bool {
        self.skipped
    }

    fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn from_error(tenant_id: TenantId, error: &SiloError) -> Self {
        Self {
            tenant_id,
            ok: false,
            already_warm: false,
            skipped: false,
            duration: Duration::ZERO,
            error: Some(error.to_string()),
        }
    }

    fn from_skipped(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            ok: false,
            already_warm: false,
            skipped: true,
            duration: Duration::ZERO,
            error: None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct HealthCheckOptions {
    /// Restrict the check to these tenants, all cached pools if unset.
    pub tenant_ids: Option<Vec<TenantId>>,
    /// Issue a timed `SELECT 1` per pool.
    pub ping: bool,
    pub include_shared: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Clone, Debug, Serialize)]
pub struct PoolHealth {
    /// `None` for the shared pool.
    pub tenant_id: Option<TenantId>,
    pub schema: String,
    pub state: PoolState,
    pub connections: u32,
    pub idle: usize,
    pub in_use: u32,
    pub ping_millis: Option<u64>,
    pub ok: bool,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub pools: Vec<PoolHealth>,
    #[serde(with = "serde_duration_as_millis")]
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use crate::config::SiloConfig;

    use super::*;

    fn manager() -> Arc<PoolManager> {
        let config = Arc::new(SiloConfig::default());
        let schema_manager = Arc::new(SchemaManager::new(config.clone()));
        PoolManager::new(config, schema_manager)
    }

    #[tokio::test]
    async fn test_db_is_synchronous_and_cached() {
        let manager = manager();
        let tenant_id = "a".parse().unwrap();

        manager.db(&tenant_id).unwrap();
        manager.db(&tenant_id).unwrap();

        assert_eq!(manager.count(), 1);
        assert_eq!(manager.active_ids(), [tenant_id]);
    }

    #[tokio::test]
    async fn test_dispose_rejects_use() {
        let manager = manager();
        manager.db(&"a".parse().unwrap()).unwrap();

        manager.dispose().await;
        manager.dispose().await;

        assert!(matches!(
            manager.db(&"b".parse().unwrap()),
            Err(SiloError::Disposed)
        ));
        assert!(matches!(manager.shared_db(), Err(SiloError::Disposed)));
    }

    #[tokio::test]
    async fn test_shared_pool_is_a_single_slot() {
        let manager = manager();
        manager.shared_db().unwrap();
        manager.shared_db().unwrap();
        // the shared slot does not occupy the tenant cache
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn test_health_check_reports_cached_pools_without_ping() {
        let manager = manager();
        manager.db(&"a".parse().unwrap()).unwrap();
        manager.db(&"b".parse().unwrap()).unwrap();

        let report = manager
            .health_check(&HealthCheckOptions::default())
            .await
            .unwrap();

        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.pools.len(), 2);
        assert!(report.pools.iter().all(|pool| {
            pool.state == PoolState::Initializing && pool.ping_millis.is_none() && pool.ok
        }));
    }
}

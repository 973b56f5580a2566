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

//! Multi-tenant database operations for schema-isolated PostgreSQL.
//!
//! Tenants are isolated by dedicated schemas; this crate owns the two
//! correctness-critical subsystems around that isolation primitive:
//!
//! * a bounded, LRU evicted cache of per-tenant connection pools, each
//!   bound to its tenant's `search_path`, with warmup, health probing
//!   and concurrent-request coalescing, and
//! * a parallel, resumable applier of ordered SQL migrations across all
//!   tenant schemas plus the shared one, including bookkeeping format
//!   auto-detection, dry-run, tracking-only sync, structural drift
//!   detection and schema cloning.
//!
//! Everything is consumed through [`Silo`], built once from a
//! [`SiloConfig`] and disposed through [`Silo::dispose`].

pub mod clone;
pub mod config;
pub mod drift;
pub mod error;
pub mod hooks;
pub mod migration;
pub mod pool;
pub mod schema;
pub mod seed;
pub mod sync;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use itertools::Itertools;
use sqlx::{Pool, Postgres};
use tracing::instrument;
pub use xayn_silo_shared::{
    postgres::QuotedIdentifier,
    tenant::{InvalidTenantId, TenantId},
};

pub use crate::{
    clone::{CloneOptions, ClonePhase, CloneResult},
    config::{SiloConfig, TenantDiscovery},
    drift::{DriftOptions, SchemaDriftStatus, TenantDriftReport},
    error::{ErrorKind, SiloError},
    migration::{
        BatchOptions,
        BatchSummary,
        MigrateOptions,
        MigrationStatus,
        SharedAndTenantsResult,
        SharedMigrationResult,
        SharedStatus,
        TenantMigrationResult,
        TenantStatus,
    },
    pool::{HealthCheckOptions, HealthReport, WarmupOptions, WarmupResult},
    seed::{SeedFn, SeedResult, SharedAndTenantSeeds, SharedSeedFn, SharedSeedResult},
    sync::{SyncActionOptions, SyncActionResult, SyncStatus, TenantSyncStatus},
};
use crate::{
    clone::Cloner,
    drift::{DriftDetector, SchemaIntrospection},
    migration::{
        batch::{BatchExecutor, TenantOperationResult},
        executor::MigrationExecutor,
        shared::SharedExecutor,
        TenantState,
    },
    pool::PoolManager,
    schema::SchemaManager,
    seed::Seeder,
    sync::SyncManager,
};

/// The toolkit's facade: validates the configuration once, wires every
/// component and exposes the whole operation surface.
///
/// All state lives on the instance, there are no process globals; embedders
/// tear down cleanly through [`dispose`](Self::dispose).
pub struct Silo {
    config: Arc<SiloConfig>,
    schema_manager: Arc<SchemaManager>,
    pools: Arc<PoolManager>,
    executor: MigrationExecutor,
    shared_executor: SharedExecutor,
    sync: SyncManager,
    drift: DriftDetector,
    cloner: Cloner,
    seeder: Seeder,
    batch: BatchExecutor,
    disposed: AtomicBool,
}

impl Silo {
    /// Validates the configuration and wires the components.
    ///
    /// Must be called inside a tokio runtime (the pool TTL sweeper is
    /// spawned here).
    pub fn new(config: SiloConfig) -> Result<Self, SiloError> {
        config.validate()?;
        let config = Arc::new(config);
        let schema_manager = Arc::new(SchemaManager::new(config.clone()));
        let pools = PoolManager::new(config.clone(), schema_manager.clone());

        Ok(Self {
            executor: MigrationExecutor::new(config.clone(), schema_manager.clone()),
            shared_executor: SharedExecutor::new(config.clone(), schema_manager.clone()),
            sync: SyncManager::new(config.clone(), schema_manager.clone()),
            drift: DriftDetector::new(config.clone(), schema_manager.clone()),
            cloner: Cloner::new(config.clone(), schema_manager.clone()),
            seeder: Seeder::new(config.clone(), schema_manager.clone()),
            batch: BatchExecutor::new(config.batch.concurrency),
            schema_manager,
            pools,
            config,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &SiloConfig {
        &self.config
    }

    pub fn schema_manager(&self) -> &SchemaManager {
        &self.schema_manager
    }

    fn guard(&self) -> Result<(), SiloError> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(SiloError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Resolves the tenant set through the configured discovery source.
    #[instrument(skip(self), err)]
    pub async fn discover_tenants(&self) -> Result<Vec<TenantId>, SiloError> {
        self.guard()?;
        match &self.config.discovery {
            TenantDiscovery::Static { tenants } => Ok(tenants.iter().cloned().unique().collect()),
            TenantDiscovery::Callback(discover) => {
                Ok(discover().await.map_err(SiloError::Other)?.into_iter().unique().collect())
            }
            TenantDiscovery::SchemaScan => {
                let Some(prefix) = self.config.isolation.schema_template.prefix() else {
                    return Err(SiloError::ConfigInvalid(
                        "schema_scan discovery requires the prefix schema template".into(),
                    ));
                };
                let pattern = format!("{}%", escape_like(prefix));
                let schemas = self.schema_manager.list_schemas(Some(&pattern)).await?;
                Ok(schemas
                    .iter()
                    .filter_map(|schema| schema.strip_prefix(prefix))
                    .filter_map(|tenant_id| tenant_id.parse().ok())
                    .collect())
            }
        }
    }

    // ---- pool surface ----

    /// The tenant's database handle, without any validation round-trip.
    pub fn db(&self, tenant_id: &TenantId) -> Result<Pool<Postgres>, SiloError> {
        self.pools.db(tenant_id)
    }

    /// The tenant's database handle after a successful liveness probe.
    pub async fn db_validated(&self, tenant_id: &TenantId) -> Result<Pool<Postgres>, SiloError> {
        self.pools.db_validated(tenant_id).await
    }

    pub fn shared_db(&self) -> Result<Pool<Postgres>, SiloError> {
        self.pools.shared_db()
    }

    pub async fn shared_db_validated(&self) -> Result<Pool<Postgres>, SiloError> {
        self.pools.shared_db_validated().await
    }

    pub async fn warmup(
        &self,
        tenant_ids: &[TenantId],
        options: &WarmupOptions,
    ) -> Vec<WarmupResult> {
        self.pools.warmup(tenant_ids, options).await
    }

    pub async fn health_check(
        &self,
        options: &HealthCheckOptions,
    ) -> Result<HealthReport, SiloError> {
        self.pools.health_check(options).await
    }

    /// Removes and closes the tenant's cached pool; no-op if absent.
    pub fn evict(&self, tenant_id: &TenantId) -> bool {
        self.pools.evict(tenant_id)
    }

    pub fn pool_count(&self) -> usize {
        self.pools.count()
    }

    pub fn active_tenant_ids(&self) -> Vec<TenantId> {
        self.pools.active_ids()
    }

    // ---- tenant lifecycle ----

    /// Creates the tenant's schema and, unless disabled, migrates it.
    #[instrument(skip(self, options), fields(tenant_id = %tenant_id), err)]
    pub async fn create_tenant(
        &self,
        tenant_id: &TenantId,
        options: &CreateTenantOptions,
    ) -> Result<CreateTenantReport, SiloError> {
        self.guard()?;
        if self.schema_manager.schema_exists(tenant_id).await? {
            return Err(SiloError::TenantAlreadyExists {
                tenant_id: tenant_id.clone(),
            });
        }
        let schema = self.schema_manager.create_schema(tenant_id).await?;

        let migration = if options.migrate {
            Some(
                self.executor
                    .migrate_tenant(tenant_id, &options.migrate_options)
                    .await,
            )
        } else {
            None
        };
        Ok(CreateTenantReport {
            tenant_id: tenant_id.clone(),
            schema: schema.as_unquoted_str().into(),
            migration,
        })
    }

    /// Evicts the tenant's pool and drops its schema.
    #[instrument(skip(self, options), fields(tenant_id = %tenant_id), err)]
    pub async fn drop_tenant(
        &self,
        tenant_id: &TenantId,
        options: &DropTenantOptions,
    ) -> Result<(), SiloError> {
        self.guard()?;
        if !self.schema_manager.schema_exists(tenant_id).await? {
            return Err(SiloError::TenantNotFound {
                tenant_id: tenant_id.clone(),
            });
        }
        self.pools.evict(tenant_id);
        self.schema_manager
            .drop_schema(tenant_id, options.cascade)
            .await
    }

    pub async fn tenant_exists(&self, tenant_id: &TenantId) -> Result<bool, SiloError> {
        self.guard()?;
        self.schema_manager.schema_exists(tenant_id).await
    }

    /// Clones `source`'s schema (and optionally data) into a fresh
    /// schema for `target`.
    pub async fn clone_tenant(
        &self,
        source: &TenantId,
        target: &TenantId,
        options: &CloneOptions,
    ) -> CloneResult {
        if let Err(error) = self.guard() {
            return CloneResult::failure(source.clone(), target.clone(), &error);
        }
        self.cloner.clone_tenant(source, target, options).await
    }

    // ---- migration ----

    pub async fn migrate_tenant(
        &self,
        tenant_id: &TenantId,
        options: &MigrateOptions,
    ) -> TenantMigrationResult {
        if let Err(error) = self.guard() {
            return TenantMigrationResult::failure(tenant_id.clone(), String::new(), &error);
        }
        self.executor.migrate_tenant(tenant_id, options).await
    }

    pub async fn migrate_tenants(
        &self,
        tenant_ids: &[TenantId],
        options: &MigrateOptions,
        batch: &BatchOptions,
    ) -> Result<BatchSummary<TenantMigrationResult>, SiloError> {
        self.guard()?;
        Ok(self
            .batch
            .run(tenant_ids, batch, |tenant_id| async move {
                Ok(self.executor.migrate_tenant(&tenant_id, options).await)
            })
            .await)
    }

    /// Migrates every discovered tenant.
    pub async fn migrate_all(
        &self,
        options: &MigrateOptions,
        batch: &BatchOptions,
    ) -> Result<BatchSummary<TenantMigrationResult>, SiloError> {
        let tenant_ids = self.discover_tenants().await?;
        self.migrate_tenants(&tenant_ids, options, batch).await
    }

    /// Records every pending migration as applied without running SQL.
    pub async fn mark_as_applied(
        &self,
        tenant_id: &TenantId,
        options: &MigrateOptions,
    ) -> TenantMigrationResult {
        if let Err(error) = self.guard() {
            return TenantMigrationResult::failure(tenant_id.clone(), String::new(), &error);
        }
        self.executor.mark_tenant_applied(tenant_id, options).await
    }

    pub async fn mark_all_as_applied(
        &self,
        options: &MigrateOptions,
        batch: &BatchOptions,
    ) -> Result<BatchSummary<TenantMigrationResult>, SiloError> {
        let tenant_ids = self.discover_tenants().await?;
        self.guard()?;
        Ok(self
            .batch
            .run(&tenant_ids, batch, |tenant_id| async move {
                Ok(self.executor.mark_tenant_applied(&tenant_id, options).await)
            })
            .await)
    }

    pub async fn tenant_status(&self, tenant_id: &TenantId) -> TenantStatus {
        if let Err(error) = self.guard() {
            return TenantStatus::from_error(tenant_id.clone(), &error);
        }
        self.executor.tenant_status(tenant_id).await
    }

    /// Migration state of every discovered tenant.
    pub async fn status(&self, batch: &BatchOptions) -> Result<MigrationStatus, SiloError> {
        let tenant_ids = self.discover_tenants().await?;
        let summary = self
            .batch
            .run(&tenant_ids, batch, |tenant_id| async move {
                Ok(self.executor.tenant_status(&tenant_id).await)
            })
            .await;

        let ok = count_state(&summary.details, TenantState::Ok);
        let behind = count_state(&summary.details, TenantState::Behind);
        Ok(MigrationStatus {
            total: summary.total,
            ok,
            behind,
            error: summary.total - ok - behind,
            tenants: summary.details,
            duration: summary.duration,
        })
    }

    // ---- shared schema ----

    pub async fn migrate_shared(&self, options: &MigrateOptions) -> SharedMigrationResult {
        if let Err(error) = self.guard() {
            return SharedMigrationResult::failure(String::new(), options.dry_run, &error);
        }
        self.shared_executor.migrate_shared(options).await
    }

    pub async fn shared_status(&self) -> SharedStatus {
        self.shared_executor.shared_status().await
    }

    pub async fn mark_shared_as_applied(&self, options: &MigrateOptions) -> SharedMigrationResult {
        if let Err(error) = self.guard() {
            return SharedMigrationResult::failure(String::new(), options.dry_run, &error);
        }
        self.shared_executor.mark_shared_applied(options).await
    }

    /// Migrates the shared schema, then all tenants.
    ///
    /// A failed shared migration does not abort the tenant run; both
    /// results are returned and the caller decides.
    pub async fn migrate_all_with_shared(
        &self,
        options: &MigrateOptions,
        batch: &BatchOptions,
    ) -> Result<SharedAndTenantsResult, SiloError> {
        self.guard()?;
        let shared = self.migrate_shared(options).await;
        let tenants = self.migrate_all(options, batch).await?;
        Ok(SharedAndTenantsResult { shared, tenants })
    }

    // ---- sync ----

    pub async fn tenant_sync_status(&self, tenant_id: &TenantId) -> TenantSyncStatus {
        if let Err(error) = self.guard() {
            return TenantSyncStatus::from_error(tenant_id.clone(), &error);
        }
        self.sync.tenant_sync_status(tenant_id).await
    }

    pub async fn sync_status(&self, batch: &BatchOptions) -> Result<SyncStatus, SiloError> {
        let tenant_ids = self.discover_tenants().await?;
        let summary = self
            .batch
            .run(&tenant_ids, batch, |tenant_id| async move {
                Ok(self.sync.tenant_sync_status(&tenant_id).await)
            })
            .await;

        let in_sync = summary
            .details
            .iter()
            .filter(|status| status.error.is_none() && status.in_sync)
            .count();
        let error = summary
            .details
            .iter()
            .filter(|status| status.error.is_some())
            .count();
        Ok(SyncStatus {
            total: summary.total,
            in_sync,
            out_of_sync: summary.total - in_sync - error,
            error,
            details: summary.details,
            duration: summary.duration,
        })
    }

    pub async fn mark_missing(
        &self,
        tenant_id: &TenantId,
        options: &SyncActionOptions,
    ) -> SyncActionResult {
        if let Err(error) = self.guard() {
            return SyncActionResult::failure(tenant_id.clone(), String::new(), options.dry_run, &error);
        }
        self.sync.mark_missing(tenant_id, options).await
    }

    pub async fn mark_all_missing(
        &self,
        options: &SyncActionOptions,
        batch: &BatchOptions,
    ) -> Result<BatchSummary<SyncActionResult>, SiloError> {
        let tenant_ids = self.discover_tenants().await?;
        Ok(self
            .batch
            .run(&tenant_ids, batch, |tenant_id| async move {
                Ok(self.sync.mark_missing(&tenant_id, options).await)
            })
            .await)
    }

    pub async fn clean_orphans(
        &self,
        tenant_id: &TenantId,
        options: &SyncActionOptions,
    ) -> SyncActionResult {
        if let Err(error) = self.guard() {
            return SyncActionResult::failure(tenant_id.clone(), String::new(), options.dry_run, &error);
        }
        self.sync.clean_orphans(tenant_id, options).await
    }

    pub async fn clean_all_orphans(
        &self,
        options: &SyncActionOptions,
        batch: &BatchOptions,
    ) -> Result<BatchSummary<SyncActionResult>, SiloError> {
        let tenant_ids = self.discover_tenants().await?;
        Ok(self
            .batch
            .run(&tenant_ids, batch, |tenant_id| async move {
                Ok(self.sync.clean_orphans(&tenant_id, options).await)
            })
            .await)
    }

    // ---- drift ----

    /// Compares every tenant's structure against a reference tenant.
    pub async fn schema_drift(&self, options: &DriftOptions) -> Result<SchemaDriftStatus, SiloError> {
        self.guard()?;
        let tenant_ids = match &options.tenant_ids {
            Some(tenant_ids) => tenant_ids.clone(),
            None => self.discover_tenants().await?,
        };
        self.drift.schema_drift(&tenant_ids, options).await
    }

    pub async fn tenant_schema_drift(
        &self,
        tenant_id: &TenantId,
        reference_id: &TenantId,
        options: &DriftOptions,
    ) -> TenantDriftReport {
        if let Err(error) = self.guard() {
            return TenantDriftReport::from_error(tenant_id.clone(), &error);
        }
        self.drift.tenant_drift(tenant_id, reference_id, options).await
    }

    pub async fn introspect_tenant_schema(
        &self,
        tenant_id: &TenantId,
        options: &DriftOptions,
    ) -> Result<SchemaIntrospection, SiloError> {
        self.guard()?;
        self.drift.introspect_tenant(tenant_id, options).await
    }

    // ---- seeding ----

    pub async fn seed_tenant(&self, tenant_id: &TenantId, seed: &SeedFn) -> SeedResult {
        if let Err(error) = self.guard() {
            return SeedResult::failure(tenant_id.clone(), String::new(), &error);
        }
        self.seeder.seed_tenant(tenant_id, seed).await
    }

    pub async fn seed_tenants(
        &self,
        tenant_ids: &[TenantId],
        seed: &SeedFn,
        batch: &BatchOptions,
    ) -> Result<BatchSummary<SeedResult>, SiloError> {
        self.guard()?;
        Ok(self
            .batch
            .run(tenant_ids, batch, |tenant_id| async move {
                Ok(self.seeder.seed_tenant(&tenant_id, seed).await)
            })
            .await)
    }

    pub async fn seed_all(
        &self,
        seed: &SeedFn,
        batch: &BatchOptions,
    ) -> Result<BatchSummary<SeedResult>, SiloError> {
        let tenant_ids = self.discover_tenants().await?;
        self.seed_tenants(&tenant_ids, seed, batch).await
    }

    pub async fn seed_shared(&self, seed: &SharedSeedFn) -> SharedSeedResult {
        self.seeder.seed_shared(seed).await
    }

    /// Seeds the shared schema first, then all tenants.
    pub async fn seed_all_with_shared(
        &self,
        shared_seed: &SharedSeedFn,
        seed: &SeedFn,
        batch: &BatchOptions,
    ) -> Result<SharedAndTenantSeeds, SiloError> {
        self.guard()?;
        let shared = self.seed_shared(shared_seed).await;
        let tenants = self.seed_all(seed, batch).await?;
        Ok(SharedAndTenantSeeds { shared, tenants })
    }

    // ---- teardown ----

    /// Stops the TTL sweeper and closes every cached pool. Idempotent;
    /// any use afterwards fails with [`SiloError::Disposed`].
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pools.dispose().await;
    }
}

#[derive(Clone, Debug)]
pub struct CreateTenantOptions {
    /// Run pending migrations right after creating the schema.
    pub migrate: bool,
    pub migrate_options: MigrateOptions,
}

impl Default for CreateTenantOptions {
    fn default() -> Self {
        Self {
            migrate: true,
            migrate_options: MigrateOptions::default(),
        }
    }
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct CreateTenantReport {
    pub tenant_id: TenantId,
    pub schema: String,
    pub migration: Option<TenantMigrationResult>,
}

#[derive(Clone, Debug)]
pub struct DropTenantOptions {
    pub cascade: bool,
}

impl Default for DropTenantOptions {
    fn default() -> Self {
        Self { cascade: true }
    }
}

fn count_state(statuses: &[TenantStatus], state: TenantState) -> usize {
    statuses.iter().filter(|status| status.state == state).count()
}

/// Escapes `LIKE` metacharacters so a prefix matches literally.
fn escape_like(prefix: &str) -> String {
    prefix
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("tenant_"), "tenant\\_");
        assert_eq!(escape_like("a%b\\c"), "a\\%b\\\\c");
    }

    #[tokio::test]
    async fn test_new_validates_config() {
        let mut config = SiloConfig::default();
        config.batch.concurrency = 0;
        assert!(matches!(
            Silo::new(config),
            Err(SiloError::ConfigInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_db_is_cached_per_tenant() {
        let silo = Silo::new(SiloConfig::default()).unwrap();
        let tenant_id = "acme".parse().unwrap();

        silo.db(&tenant_id).unwrap();
        silo.db(&tenant_id).unwrap();

        assert_eq!(silo.pool_count(), 1);
        assert_eq!(silo.active_tenant_ids(), [tenant_id]);
        silo.dispose().await;
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_final() {
        let silo = Silo::new(SiloConfig::default()).unwrap();
        silo.dispose().await;
        silo.dispose().await;

        let tenant_id = "acme".parse().unwrap();
        assert!(matches!(silo.db(&tenant_id), Err(SiloError::Disposed)));
        let result = silo.migrate_tenant(&tenant_id, &MigrateOptions::default()).await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Disposed));
    }

    #[tokio::test]
    async fn test_static_discovery_deduplicates() {
        let mut config = SiloConfig::default();
        config.discovery = TenantDiscovery::Static {
            tenants: ["a", "b", "a"].iter().map(|id| id.parse().unwrap()).collect(),
        };
        let silo = Silo::new(config).unwrap();

        let tenants = silo.discover_tenants().await.unwrap();
        assert_eq!(tenants.len(), 2);
        silo.dispose().await;
    }

    #[tokio::test]
    async fn test_callback_discovery() {
        use futures_util::FutureExt;

        let discover: config::DiscoveryFn = Arc::new(|| {
            async { Ok(vec!["x".parse().unwrap(), "y".parse().unwrap()]) }.boxed()
        });
        let mut config = SiloConfig::default();
        config.discovery = TenantDiscovery::Callback(discover);
        let silo = Silo::new(config).unwrap();

        let tenants = silo.discover_tenants().await.unwrap();
        assert_eq!(tenants.len(), 2);
        silo.dispose().await;
    }
}

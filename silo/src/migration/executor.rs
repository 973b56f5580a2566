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

//! Applying and tracking migrations for one schema at a time.

use std::{
    collections::HashSet,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, TimeZone, Utc};
use futures_util::{future, TryStreamExt};
use sqlx::{Executor, Pool, Postgres};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use xayn_silo_shared::{
    postgres::{lock_id_until_end_of_transaction, schema_lock_id, QuotedIdentifier},
    tenant::TenantId,
};

use crate::{
    config::SiloConfig,
    error::{ErrorKind, SiloError},
    hooks::Hooks,
    migration::{
        format::{detect_format, resolve_format, FormatPolicy, TableFormat},
        loader::load_migrations,
        AppliedMigration,
        MigrationFile,
        TenantMigrationResult,
        TenantState,
        TenantStatus,
    },
    schema::{ensure_bookkeeping, schema_exists_on, SchemaManager},
};

#[derive(Clone, Debug, Default)]
pub struct MigrateOptions {
    /// Compute and report pending migrations without mutating anything.
    pub dry_run: bool,
    pub cancel: CancellationToken,
}

/// Whether migration SQL actually runs or only the tracking row is written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Mode {
    Apply,
    RecordOnly,
}

/// Everything needed to migrate one schema, independent of whether it is
/// a tenant schema or the shared one.
pub(crate) struct SchemaPlan<'a> {
    pub(crate) folder: &'a Path,
    pub(crate) table: QuotedIdentifier,
    pub(crate) policy: FormatPolicy,
    pub(crate) default_format: TableFormat,
}

/// Result of migrating one schema.
#[derive(Clone, Debug)]
pub(crate) struct SchemaOutcome {
    pub(crate) success: bool,
    pub(crate) dry_run: bool,
    pub(crate) format: Option<TableFormat>,
    pub(crate) applied: Vec<String>,
    pub(crate) pending: Vec<String>,
    pub(crate) failed_migration: Option<String>,
    pub(crate) error: Option<String>,
    pub(crate) error_kind: Option<ErrorKind>,
}

impl SchemaOutcome {
    fn failed_setup(error: &SiloError, dry_run: bool) -> Self {
        Self {
            success: false,
            dry_run,
            format: None,
            applied: Vec::new(),
            pending: Vec::new(),
            failed_migration: None,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
        }
    }

    pub(crate) fn into_tenant_result(
        self,
        tenant_id: TenantId,
        schema: &QuotedIdentifier,
        duration: Duration,
    ) -> TenantMigrationResult {
        TenantMigrationResult {
            tenant_id,
            schema: schema.as_unquoted_str().into(),
            success: self.success,
            skipped: false,
            dry_run: self.dry_run,
            format: self.format,
            applied: self.applied,
            pending: self.pending,
            failed_migration: self.failed_migration,
            error: self.error,
            error_kind: self.error_kind,
            duration,
        }
    }
}

/// Migration state of one schema, computed without mutating anything.
#[derive(Clone, Debug)]
pub(crate) struct SchemaStatusView {
    pub(crate) format: Option<TableFormat>,
    pub(crate) applied_count: usize,
    pub(crate) pending: Vec<String>,
    pub(crate) state: TenantState,
    pub(crate) error: Option<String>,
}

/// Applies (or records) every pending migration of one schema, in
/// sequence order, each in its own transaction.
///
/// A failure stops the run; previously committed migrations stay
/// committed, which is what makes a partially failed batch resumable.
#[instrument(skip_all, fields(schema = %schema))]
pub(crate) async fn migrate_schema(
    pool: &Pool<Postgres>,
    schema: &QuotedIdentifier,
    plan: &SchemaPlan<'_>,
    mode: Mode,
    dry_run: bool,
    cancel: &CancellationToken,
    hooks: Option<(&Hooks, &TenantId)>,
) -> SchemaOutcome {
    let setup = async {
        let detected = detect_format(pool, schema, &plan.table).await?;
        let format = resolve_format(plan.policy, detected, plan.default_format, schema);
        ensure_bookkeeping(pool, schema, &plan.table, format).await?;
        let migrations = load_migrations(plan.folder)?;
        let applied = applied_identifiers(pool, schema, &plan.table, format).await?;
        Ok::<_, SiloError>((format, migrations, applied))
    }
    .await;

    let (format, migrations, applied) = match setup {
        Ok(setup) => setup,
        Err(error) => return SchemaOutcome::failed_setup(&error, dry_run),
    };

    let pending = migrations
        .iter()
        .filter(|migration| !format.is_applied(migration, &applied))
        .collect::<Vec<_>>();
    let pending_names = pending
        .iter()
        .map(|migration| migration.name.clone())
        .collect::<Vec<_>>();

    let mut outcome = SchemaOutcome {
        success: true,
        dry_run,
        format: Some(format),
        applied: Vec::new(),
        pending: pending_names,
        failed_migration: None,
        error: None,
        error_kind: None,
    };
    if dry_run {
        return outcome;
    }

    // never run a migration older than one that is already recorded;
    // such stragglers are sync territory (mark-missing), not apply
    let newest_applied = migrations
        .iter()
        .filter(|migration| format.is_applied(migration, &applied))
        .map(|migration| migration.sequence)
        .max();

    for migration in pending {
        if newest_applied.map_or(false, |newest| migration.sequence < newest) {
            warn!(
                { migration = %migration.name },
                "skipping out-of-order migration, track it with mark-missing",
            );
            continue;
        }
        if let Some((hooks, tenant_id)) = hooks {
            hooks.fire_before_migration(tenant_id, &migration.name);
        }

        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SiloError::Cancelled),
            result = run_one(pool, schema, &plan.table, format, migration, mode) => result,
        };

        match result {
            Ok(()) => {
                let elapsed = started.elapsed();
                info!(
                    { migration = %migration.name, millis = elapsed.as_millis() as u64 },
                    "migration applied",
                );
                if let Some((hooks, tenant_id)) = hooks {
                    hooks.fire_after_migration(tenant_id, &migration.name, elapsed);
                }
                outcome.applied.push(migration.name.clone());
            }
            Err(error) => {
                outcome.success = false;
                outcome.failed_migration = Some(migration.name.clone());
                outcome.error = Some(error.to_string());
                outcome.error_kind = Some(error.kind());
                return outcome;
            }
        }
    }

    outcome
}

async fn run_one(
    pool: &Pool<Postgres>,
    schema: &QuotedIdentifier,
    table: &QuotedIdentifier,
    format: TableFormat,
    migration: &MigrationFile,
    mode: Mode,
) -> Result<(), SiloError> {
    match mode {
        Mode::Apply => apply_migration(pool, schema, table, format, migration).await,
        Mode::RecordOnly => record_migration(pool, schema, table, format, migration)
            .await
            .map_err(|source| SiloError::SqlFailure {
                migration: migration.name.clone(),
                source,
            }),
    }
}

/// Runs `BEGIN; <sql>; INSERT INTO bookkeeping ...; COMMIT` on one
/// connection, holding a per-schema advisory xact lock so concurrent
/// migrators of the same schema serialize.
async fn apply_migration(
    pool: &Pool<Postgres>,
    schema: &QuotedIdentifier,
    table: &QuotedIdentifier,
    format: TableFormat,
    migration: &MigrationFile,
) -> Result<(), SiloError> {
    let mut tx = pool.begin().await?;
    lock_id_until_end_of_transaction(&mut tx, schema_lock_id(schema)).await?;

    tx.execute_many(migration.sql.as_str())
        .try_for_each(|_| future::ready(Ok(())))
        .await
        .map_err(|source| SiloError::SqlFailure {
            migration: migration.name.clone(),
            source,
        })?;

    record_migration(&mut tx, schema, table, format, migration)
        .await
        .map_err(|source| SiloError::SqlFailure {
            migration: migration.name.clone(),
            source,
        })?;

    tx.commit().await?;
    Ok(())
}

/// Inserts the tracking row for a migration, without running its SQL.
pub(crate) async fn record_migration<'e, E>(
    executor: E,
    schema: &QuotedIdentifier,
    table: &QuotedIdentifier,
    format: TableFormat,
    migration: &MigrationFile,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    //Hint: $ binds won't work for identifiers (e.g. schema names)
    match format {
        TableFormat::Name => {
            let query = format!("INSERT INTO {schema}.{table} (name, applied_at) VALUES ($1, NOW());");
            sqlx::query(&query).bind(&migration.name).execute(executor).await?;
        }
        TableFormat::Hash => {
            let query = format!("INSERT INTO {schema}.{table} (hash, applied_at) VALUES ($1, NOW());");
            sqlx::query(&query).bind(&migration.hash).execute(executor).await?;
        }
        TableFormat::DrizzleKit => {
            let query = format!("INSERT INTO {schema}.{table} (hash, created_at) VALUES ($1, $2);");
            sqlx::query(&query)
                .bind(&migration.hash)
                .bind(Utc::now().timestamp_millis())
                .execute(executor)
                .await?;
        }
    }
    Ok(())
}

/// All tracking rows of a schema, ordered by insertion (`id`).
pub(crate) async fn applied_rows(
    pool: &Pool<Postgres>,
    schema: &QuotedIdentifier,
    table: &QuotedIdentifier,
    format: TableFormat,
) -> Result<Vec<AppliedMigration>, SiloError> {
    let rows = match format {
        TableFormat::Name | TableFormat::Hash => {
            let column = format.identifier_column();
            let query = format!("SELECT id, {column}, applied_at FROM {schema}.{table} ORDER BY id;");
            // externally created tables may track rows without a timestamp
            sqlx::query_as::<_, (i32, String, Option<DateTime<Utc>>)>(&query)
                .fetch_all(pool)
                .await?
                .into_iter()
                .map(|(id, identifier, applied_at)| AppliedMigration {
                    id,
                    identifier,
                    applied_at,
                })
                .collect()
        }
        TableFormat::DrizzleKit => {
            let query = format!("SELECT id, hash, created_at FROM {schema}.{table} ORDER BY id;");
            sqlx::query_as::<_, (i32, String, Option<i64>)>(&query)
                .fetch_all(pool)
                .await?
                .into_iter()
                .map(|(id, identifier, millis)| AppliedMigration {
                    id,
                    identifier,
                    applied_at: millis
                        .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
                })
                .collect()
        }
    };
    Ok(rows)
}

pub(crate) async fn applied_identifiers(
    pool: &Pool<Postgres>,
    schema: &QuotedIdentifier,
    table: &QuotedIdentifier,
    format: TableFormat,
) -> Result<HashSet<String>, SiloError> {
    Ok(applied_rows(pool, schema, table, format)
        .await?
        .into_iter()
        .map(|row| row.identifier)
        .collect())
}

/// Computes [`SchemaStatusView`] without creating or mutating anything.
pub(crate) async fn schema_status(
    pool: &Pool<Postgres>,
    schema: &QuotedIdentifier,
    plan: &SchemaPlan<'_>,
) -> SchemaStatusView {
    let status = async {
        let migrations = load_migrations(plan.folder)?;
        let Some(format) = detect_format(pool, schema, &plan.table).await? else {
            let pending = migrations
                .iter()
                .map(|migration| migration.name.clone())
                .collect::<Vec<_>>();
            let state = if pending.is_empty() {
                TenantState::Ok
            } else {
                TenantState::Behind
            };
            return Ok::<_, SiloError>(SchemaStatusView {
                format: None,
                applied_count: 0,
                pending,
                state,
                error: None,
            });
        };

        let rows = applied_rows(pool, schema, &plan.table, format).await?;
        let applied = rows
            .iter()
            .map(|row| row.identifier.clone())
            .collect::<HashSet<_>>();
        let pending = migrations
            .iter()
            .filter(|migration| !format.is_applied(migration, &applied))
            .map(|migration| migration.name.clone())
            .collect::<Vec<_>>();
        let state = if pending.is_empty() {
            TenantState::Ok
        } else {
            TenantState::Behind
        };
        Ok(SchemaStatusView {
            format: Some(format),
            applied_count: rows.len(),
            pending,
            state,
            error: None,
        })
    }
    .await;

    status.unwrap_or_else(|error| SchemaStatusView {
        format: None,
        applied_count: 0,
        pending: Vec::new(),
        state: TenantState::Error,
        error: Some(error.to_string()),
    })
}

/// Tenant level migration operations.
///
/// Uses a fresh schema bound pool per operation, independent of the
/// long lived pool cache, closed once the operation is done.
pub(crate) struct MigrationExecutor {
    config: Arc<SiloConfig>,
    schema_manager: Arc<SchemaManager>,
}

impl MigrationExecutor {
    pub(crate) fn new(config: Arc<SiloConfig>, schema_manager: Arc<SchemaManager>) -> Self {
        Self {
            config,
            schema_manager,
        }
    }

    fn plan(&self) -> Result<SchemaPlan<'_>, SiloError> {
        Ok(SchemaPlan {
            folder: &self.config.migrations.folder,
            table: self.config.migrations_table()?,
            policy: self.config.migrations.format,
            default_format: self.config.migrations.default_format,
        })
    }

    pub(crate) async fn migrate_tenant(
        &self,
        tenant_id: &TenantId,
        options: &MigrateOptions,
    ) -> TenantMigrationResult {
        self.run(tenant_id, options, Mode::Apply).await
    }

    pub(crate) async fn mark_tenant_applied(
        &self,
        tenant_id: &TenantId,
        options: &MigrateOptions,
    ) -> TenantMigrationResult {
        self.run(tenant_id, options, Mode::RecordOnly).await
    }

    #[instrument(skip(self, options), fields(tenant_id = %tenant_id))]
    async fn run(
        &self,
        tenant_id: &TenantId,
        options: &MigrateOptions,
        mode: Mode,
    ) -> TenantMigrationResult {
        let start = Instant::now();
        let hooks = &self.config.hooks;

        let prepared = self.prepare(tenant_id).await;
        let (schema, pool) = match prepared {
            Ok(prepared) => prepared,
            Err(error) => {
                return TenantMigrationResult::failure(tenant_id.clone(), String::new(), &error)
            }
        };

        hooks.fire_before_tenant(tenant_id);

        let outcome = match self.plan() {
            Ok(plan) => {
                migrate_schema(
                    &pool,
                    &schema,
                    &plan,
                    mode,
                    options.dry_run,
                    &options.cancel,
                    Some((hooks, tenant_id)),
                )
                .await
            }
            Err(error) => SchemaOutcome::failed_setup(&error, options.dry_run),
        };
        pool.close().await;

        let result = outcome.into_tenant_result(tenant_id.clone(), &schema, start.elapsed());
        hooks.fire_after_tenant(&result);
        result
    }

    async fn prepare(
        &self,
        tenant_id: &TenantId,
    ) -> Result<(QuotedIdentifier, Pool<Postgres>), SiloError> {
        let schema = self.config.schema_for(tenant_id)?;
        let pool = self.schema_manager.operation_pool(&schema)?;
        match schema_exists_on(&pool, &schema).await {
            Ok(true) => Ok((schema, pool)),
            Ok(false) => {
                pool.close().await;
                Err(SiloError::TenantNotFound {
                    tenant_id: tenant_id.clone(),
                })
            }
            Err(error) => {
                pool.close().await;
                Err(error)
            }
        }
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub(crate) async fn tenant_status(&self, tenant_id: &TenantId) -> TenantStatus {
        let error_status = |schema: String, error: &SiloError| TenantStatus {
            tenant_id: tenant_id.clone(),
            schema,
            format: None,
            applied_count: 0,
            pending_count: 0,
            pending: Vec::new(),
            state: TenantState::Error,
            error: Some(error.to_string()),
        };

        let schema = match self.config.schema_for(tenant_id) {
            Ok(schema) => schema,
            Err(error) => return error_status(String::new(), &error),
        };
        let (pool, plan) = match self
            .schema_manager
            .operation_pool(&schema)
            .and_then(|pool| Ok((pool, self.plan()?)))
        {
            Ok(prepared) => prepared,
            Err(error) => return error_status(schema.as_unquoted_str().into(), &error),
        };

        let view = schema_status(&pool, &schema, &plan).await;
        pool.close().await;

        TenantStatus {
            tenant_id: tenant_id.clone(),
            schema: schema.as_unquoted_str().into(),
            format: view.format,
            applied_count: view.applied_count,
            pending_count: view.pending.len(),
            pending: view.pending,
            state: view.state,
            error: view.error,
        }
    }
}

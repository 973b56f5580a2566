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

//! Reconciling disk migrations with bookkeeping rows.
//!
//! `missing` are migrations on disk the bookkeeping table doesn't know,
//! `orphans` are tracked identifiers no disk file produces anymore.
//! The fixes are surgical tracking edits: they never touch tenant data.

use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};

use serde::Serialize;
use sqlx::{Pool, Postgres};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use xayn_silo_shared::{
    postgres::QuotedIdentifier,
    serde::serde_duration_as_millis,
    tenant::TenantId,
};

use crate::{
    config::SiloConfig,
    error::{ErrorKind, SiloError},
    migration::{
        batch::TenantOperationResult,
        executor::{applied_rows, record_migration, SchemaPlan},
        format::{detect_format, resolve_format, TableFormat},
        loader::load_migrations,
        AppliedMigration,
        MigrationFile,
    },
    schema::{ensure_bookkeeping, schema_exists_on, SchemaManager},
};

/// Disk/DB divergence of one tenant.
#[derive(Clone, Debug, Serialize)]
pub struct TenantSyncStatus {
    pub tenant_id: TenantId,
    pub schema: String,
    /// `None` iff the bookkeeping table does not exist.
    pub format: Option<TableFormat>,
    /// On disk but untracked, in disk order.
    pub missing: Vec<String>,
    /// Tracked but produced by no disk file, in `id` order.
    pub orphans: Vec<String>,
    pub in_sync: bool,
    pub error: Option<String>,
}

impl TenantOperationResult for TenantSyncStatus {
    fn is_success(&self) -> bool {
        self.error.is_none()
    }

    fn is_skipped(&self) -> bool {
        false
    }

    fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn from_error(tenant_id: TenantId, error: &SiloError) -> Self {
        Self {
            tenant_id,
            schema: String::new(),
            format: None,
            missing: Vec::new(),
            orphans: Vec::new(),
            in_sync: false,
            error: Some(error.to_string()),
        }
    }

    fn from_skipped(tenant_id: TenantId) -> Self {
        Self::from_error(tenant_id, &SiloError::Cancelled)
    }
}

/// What `mark_missing` / `clean_orphans` changed for one tenant.
#[derive(Clone, Debug, Serialize)]
pub struct SyncActionResult {
    pub tenant_id: TenantId,
    pub schema: String,
    pub success: bool,
    pub skipped: bool,
    pub dry_run: bool,
    /// Identifiers inserted respectively deleted (or that would be).
    pub changed: Vec<String>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    #[serde(with = "serde_duration_as_millis")]
    pub duration: Duration,
}

impl SyncActionResult {
    pub(crate) fn failure(
        tenant_id: TenantId,
        schema: String,
        dry_run: bool,
        error: &SiloError,
    ) -> Self {
        Self {
            tenant_id,
            schema,
            success: false,
            skipped: false,
            dry_run,
            changed: Vec::new(),
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            duration: Duration::ZERO,
        }
    }
}

impl TenantOperationResult for SyncActionResult {
    fn is_success(&self) -> bool {
        self.success
    }

    fn is_skipped(&self) -> bool {
        self.skipped
    }

    fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn from_error(tenant_id: TenantId, error: &SiloError) -> Self {
        Self::failure(tenant_id, String::new(), false, error)
    }

    fn from_skipped(tenant_id: TenantId) -> Self {
        Self {
            skipped: true,
            ..Self::failure(tenant_id, String::new(), false, &SiloError::Cancelled)
        }
    }
}

/// Aggregated [`TenantSyncStatus`] over a tenant set.
#[derive(Clone, Debug, Serialize)]
pub struct SyncStatus {
    pub total: usize,
    pub in_sync: usize,
    pub out_of_sync: usize,
    pub error: usize,
    pub details: Vec<TenantSyncStatus>,
    #[serde(with = "serde_duration_as_millis")]
    pub duration: Duration,
}

#[derive(Clone, Debug, Default)]
pub struct SyncActionOptions {
    /// Report what would change without changing it.
    pub dry_run: bool,
    pub cancel: CancellationToken,
}

struct SyncAnalysis {
    detected: Option<TableFormat>,
    resolved: TableFormat,
    missing: Vec<MigrationFile>,
    orphans: Vec<String>,
}

pub(crate) struct SyncManager {
    config: Arc<SiloConfig>,
    schema_manager: Arc<SchemaManager>,
}

impl SyncManager {
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

    async fn analyze(
        &self,
        pool: &Pool<Postgres>,
        schema: &QuotedIdentifier,
    ) -> Result<SyncAnalysis, SiloError> {
        let plan = self.plan()?;
        let migrations = load_migrations(plan.folder)?;
        let detected = detect_format(pool, schema, &plan.table).await?;
        let resolved = resolve_format(plan.policy, detected, plan.default_format, schema);

        let Some(format) = detected else {
            return Ok(SyncAnalysis {
                detected: None,
                resolved,
                missing: migrations,
                orphans: Vec::new(),
            });
        };

        let rows = applied_rows(pool, schema, &plan.table, format).await?;
        let applied = rows
            .iter()
            .map(|row| row.identifier.clone())
            .collect::<HashSet<_>>();

        Ok(SyncAnalysis {
            detected: Some(format),
            resolved,
            missing: compute_missing(&migrations, format, &applied),
            orphans: compute_orphans(&rows, &migrations, format),
        })
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
    pub(crate) async fn tenant_sync_status(&self, tenant_id: &TenantId) -> TenantSyncStatus {
        let (schema, pool) = match self.prepare(tenant_id).await {
            Ok(prepared) => prepared,
            Err(error) => return TenantSyncStatus::from_error(tenant_id.clone(), &error),
        };

        let analysis = self.analyze(&pool, &schema).await;
        pool.close().await;

        match analysis {
            Ok(analysis) => {
                let missing = analysis
                    .missing
                    .iter()
                    .map(|migration| migration.name.clone())
                    .collect::<Vec<_>>();
                TenantSyncStatus {
                    tenant_id: tenant_id.clone(),
                    schema: schema.as_unquoted_str().into(),
                    format: analysis.detected,
                    in_sync: missing.is_empty() && analysis.orphans.is_empty(),
                    missing,
                    orphans: analysis.orphans,
                    error: None,
                }
            }
            Err(error) => TenantSyncStatus {
                schema: schema.as_unquoted_str().into(),
                ..TenantSyncStatus::from_error(tenant_id.clone(), &error)
            },
        }
    }

    /// Inserts tracking rows for every missing migration, oldest first,
    /// without running any SQL.
    #[instrument(skip(self, options), fields(tenant_id = %tenant_id))]
    pub(crate) async fn mark_missing(
        &self,
        tenant_id: &TenantId,
        options: &SyncActionOptions,
    ) -> SyncActionResult {
        let start = Instant::now();
        let (schema, pool) = match self.prepare(tenant_id).await {
            Ok(prepared) => prepared,
            Err(error) => {
                return SyncActionResult::failure(
                    tenant_id.clone(),
                    String::new(),
                    options.dry_run,
                    &error,
                )
            }
        };

        let outcome = async {
            let analysis = self.analyze(&pool, &schema).await?;
            let changed = analysis
                .missing
                .iter()
                .map(|migration| migration.name.clone())
                .collect::<Vec<_>>();
            if options.dry_run {
                return Ok(changed);
            }

            let table = self.config.migrations_table()?;
            ensure_bookkeeping(&pool, &schema, &table, analysis.resolved).await?;
            for migration in &analysis.missing {
                if options.cancel.is_cancelled() {
                    return Err(SiloError::Cancelled);
                }
                record_migration(&pool, &schema, &table, analysis.resolved, migration).await?;
            }
            info!({ marked = changed.len() }, "marked missing migrations as applied");
            Ok(changed)
        }
        .await;
        pool.close().await;

        self.action_result(tenant_id, &schema, options.dry_run, outcome, start)
    }

    /// Deletes tracking rows no disk file produces anymore.
    #[instrument(skip(self, options), fields(tenant_id = %tenant_id))]
    pub(crate) async fn clean_orphans(
        &self,
        tenant_id: &TenantId,
        options: &SyncActionOptions,
    ) -> SyncActionResult {
        let start = Instant::now();
        let (schema, pool) = match self.prepare(tenant_id).await {
            Ok(prepared) => prepared,
            Err(error) => {
                return SyncActionResult::failure(
                    tenant_id.clone(),
                    String::new(),
                    options.dry_run,
                    &error,
                )
            }
        };

        let outcome = async {
            let analysis = self.analyze(&pool, &schema).await?;
            if options.dry_run || analysis.orphans.is_empty() {
                return Ok(analysis.orphans);
            }
            let Some(format) = analysis.detected else {
                // no table, nothing tracked, nothing to clean
                return Ok(Vec::new());
            };

            let table = self.config.migrations_table()?;
            let column = format.identifier_column();
            let query =
                format!("DELETE FROM {schema}.{table} WHERE {column} = ANY($1::text[]);");
            sqlx::query(&query)
                .bind(&analysis.orphans)
                .execute(&pool)
                .await?;
            info!({ cleaned = analysis.orphans.len() }, "cleaned orphaned tracking rows");
            Ok(analysis.orphans)
        }
        .await;
        pool.close().await;

        self.action_result(tenant_id, &schema, options.dry_run, outcome, start)
    }

    fn action_result(
        &self,
        tenant_id: &TenantId,
        schema: &QuotedIdentifier,
        dry_run: bool,
        outcome: Result<Vec<String>, SiloError>,
        start: Instant,
    ) -> SyncActionResult {
        match outcome {
            Ok(changed) => SyncActionResult {
                tenant_id: tenant_id.clone(),
                schema: schema.as_unquoted_str().into(),
                success: true,
                skipped: false,
                dry_run,
                changed,
                error: None,
                error_kind: None,
                duration: start.elapsed(),
            },
            Err(error) => SyncActionResult {
                duration: start.elapsed(),
                ..SyncActionResult::failure(
                    tenant_id.clone(),
                    schema.as_unquoted_str().into(),
                    dry_run,
                    &error,
                )
            },
        }
    }
}

/// Disk migrations not tracked yet, in disk order.
fn compute_missing(
    migrations: &[MigrationFile],
    format: TableFormat,
    applied: &HashSet<String>,
) -> Vec<MigrationFile> {
    migrations
        .iter()
        .filter(|migration| !format.is_applied(migration, applied))
        .cloned()
        .collect()
}

/// Tracked identifiers no disk file matches, in `id` order.
///
/// Matching is format aware: name keyed rows are accepted in hash keyed
/// tables, so a legacy row only becomes an orphan once its file is gone.
fn compute_orphans(
    rows: &[AppliedMigration],
    migrations: &[MigrationFile],
    format: TableFormat,
) -> Vec<String> {
    let names = migrations
        .iter()
        .map(|migration| migration.name.as_str())
        .collect::<HashSet<_>>();
    let hashes = migrations
        .iter()
        .map(|migration| migration.hash.as_str())
        .collect::<HashSet<_>>();

    let mut seen = HashSet::new();
    rows.iter()
        .filter(|row| {
            let identifier = row.identifier.as_str();
            let matched = match format {
                TableFormat::Name => names.contains(identifier),
                TableFormat::Hash | TableFormat::DrizzleKit => {
                    hashes.contains(identifier) || names.contains(identifier)
                }
            };
            !matched && seen.insert(identifier.to_owned())
        })
        .map(|row| row.identifier.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migration(name: &str, hash: &str) -> MigrationFile {
        MigrationFile {
            name: name.into(),
            path: format!("{name}.sql").into(),
            sql: String::new(),
            sequence: 0,
            hash: hash.into(),
        }
    }

    fn row(id: i32, identifier: &str) -> AppliedMigration {
        AppliedMigration {
            id,
            identifier: identifier.into(),
            applied_at: None,
        }
    }

    #[test]
    fn test_missing_and_orphans_for_name_format() {
        let migrations = [
            migration("0001_init", "h1"),
            migration("0002_add", "h2"),
            migration("0003_new", "h3"),
        ];
        let rows = [
            row(1, "0001_init"),
            row(2, "0002_add"),
            row(3, "0099_deleted"),
        ];
        let applied = rows
            .iter()
            .map(|row| row.identifier.clone())
            .collect::<HashSet<_>>();

        let missing = compute_missing(&migrations, TableFormat::Name, &applied);
        assert_eq!(
            missing.iter().map(|m| m.name.as_str()).collect::<Vec<_>>(),
            ["0003_new"]
        );
        assert_eq!(
            compute_orphans(&rows, &migrations, TableFormat::Name),
            ["0099_deleted"]
        );
    }

    #[test]
    fn test_hash_format_accepts_legacy_name_rows() {
        let migrations = [migration("0001_init", "h1"), migration("0002_add", "h2")];
        // `0001_init` was tracked by name before the format change
        let rows = [row(1, "0001_init"), row(2, "h2")];
        let applied = rows
            .iter()
            .map(|row| row.identifier.clone())
            .collect::<HashSet<_>>();

        assert!(compute_missing(&migrations, TableFormat::Hash, &applied).is_empty());
        assert!(compute_orphans(&rows, &migrations, TableFormat::Hash).is_empty());
    }

    #[test]
    fn test_renamed_file_turns_legacy_row_into_orphan() {
        let migrations = [migration("0001_renamed", "h1")];
        let rows = [row(1, "0001_init")];

        assert_eq!(
            compute_orphans(&rows, &migrations, TableFormat::DrizzleKit),
            ["0001_init"]
        );
    }

    #[test]
    fn test_orphans_are_deduplicated_but_ordered() {
        let migrations = [migration("0001_init", "h1")];
        let rows = [row(1, "b"), row(2, "a"), row(3, "b")];

        assert_eq!(
            compute_orphans(&rows, &migrations, TableFormat::Name),
            ["b", "a"]
        );
    }
}

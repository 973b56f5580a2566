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

//! Migrating the shared (public) schema.
//!
//! Tables common to all tenants (plans, roles, ...) live in the shared
//! schema with their own migrations folder and bookkeeping table, so a
//! caller can migrate shared tables once before fanning out tenants.

use std::{sync::Arc, time::Instant};

use sqlx::Executor;
use tracing::instrument;
use xayn_silo_shared::postgres::QuotedIdentifier;

use crate::{
    config::SiloConfig,
    error::SiloError,
    migration::{
        executor::{migrate_schema, schema_status, MigrateOptions, Mode, SchemaOutcome, SchemaPlan},
        SharedMigrationResult,
        SharedStatus,
    },
    schema::SchemaManager,
};

pub(crate) struct SharedExecutor {
    config: Arc<SiloConfig>,
    schema_manager: Arc<SchemaManager>,
}

impl SharedExecutor {
    pub(crate) fn new(config: Arc<SiloConfig>, schema_manager: Arc<SchemaManager>) -> Self {
        Self {
            config,
            schema_manager,
        }
    }

    fn plan(&self) -> Result<(QuotedIdentifier, SchemaPlan<'_>), SiloError> {
        Ok((
            self.config.shared_schema()?,
            SchemaPlan {
                folder: &self.config.shared.folder,
                table: self.config.shared_table()?,
                policy: self.config.shared.format,
                default_format: self.config.shared.default_format,
            },
        ))
    }

    pub(crate) async fn migrate_shared(&self, options: &MigrateOptions) -> SharedMigrationResult {
        self.run(options, Mode::Apply).await
    }

    pub(crate) async fn mark_shared_applied(
        &self,
        options: &MigrateOptions,
    ) -> SharedMigrationResult {
        self.run(options, Mode::RecordOnly).await
    }

    #[instrument(skip_all)]
    async fn run(&self, options: &MigrateOptions, mode: Mode) -> SharedMigrationResult {
        let start = Instant::now();
        let (schema, plan) = match self.plan() {
            Ok(plan) => plan,
            Err(error) => return failure(String::new(), options.dry_run, &error),
        };
        let pool = match self.schema_manager.operation_pool(&schema) {
            Ok(pool) => pool,
            Err(error) => {
                return failure(schema.as_unquoted_str().into(), options.dry_run, &error)
            }
        };

        // `public` always exists, but a custom shared schema may not yet
        let created = pool
            .execute(format!("CREATE SCHEMA IF NOT EXISTS {schema};").as_str())
            .await;
        if let Err(error) = created {
            pool.close().await;
            return failure(schema.as_unquoted_str().into(), options.dry_run, &error.into());
        }

        let outcome = migrate_schema(
            &pool,
            &schema,
            &plan,
            mode,
            options.dry_run,
            &options.cancel,
            None,
        )
        .await;
        pool.close().await;

        into_shared_result(outcome, &schema, start)
    }

    pub(crate) async fn shared_status(&self) -> SharedStatus {
        let error_status = |schema: String, error: &SiloError| SharedStatus {
            schema,
            format: None,
            applied_count: 0,
            pending_count: 0,
            pending: Vec::new(),
            state: crate::migration::TenantState::Error,
            error: Some(error.to_string()),
        };

        let (schema, plan) = match self.plan() {
            Ok(plan) => plan,
            Err(error) => return error_status(String::new(), &error),
        };
        let pool = match self.schema_manager.operation_pool(&schema) {
            Ok(pool) => pool,
            Err(error) => return error_status(schema.as_unquoted_str().into(), &error),
        };

        let view = schema_status(&pool, &schema, &plan).await;
        pool.close().await;

        SharedStatus {
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

fn failure(schema: String, dry_run: bool, error: &SiloError) -> SharedMigrationResult {
    SharedMigrationResult::failure(schema, dry_run, error)
}

fn into_shared_result(
    outcome: SchemaOutcome,
    schema: &QuotedIdentifier,
    start: Instant,
) -> SharedMigrationResult {
    SharedMigrationResult {
        schema: schema.as_unquoted_str().into(),
        success: outcome.success,
        dry_run: outcome.dry_run,
        format: outcome.format,
        applied: outcome.applied,
        pending: outcome.pending,
        failed_migration: outcome.failed_migration,
        error: outcome.error,
        error_kind: outcome.error_kind,
        duration: start.elapsed(),
    }
}

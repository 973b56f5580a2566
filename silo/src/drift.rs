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

//! Detecting structural drift between tenant schemas.

pub mod compare;
pub mod introspect;

use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};

use serde::Serialize;
use sqlx::{Pool, Postgres};
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use xayn_silo_shared::{
    serde::serde_duration_as_millis,
    tenant::TenantId,
};

pub use self::{
    compare::{
        ColumnDiff,
        ColumnDiffKind,
        DefinitionDiff,
        DefinitionDiffKind,
        TableDrift,
        TableDriftStatus,
    },
    introspect::{
        ColumnIntrospection,
        ConstraintIntrospection,
        ConstraintKind,
        IndexIntrospection,
        SchemaIntrospection,
        TableIntrospection,
    },
};
use self::{compare::compare_schemas, introspect::introspect_schema};
use crate::{
    config::SiloConfig,
    error::SiloError,
    migration::batch::{BatchExecutor, BatchOptions, TenantOperationResult},
    schema::SchemaManager,
};

#[derive(Clone, Debug)]
pub struct DriftOptions {
    /// Tenants to compare, all discovered tenants if unset.
    pub tenant_ids: Option<Vec<TenantId>>,
    /// Reference tenant, the first in discovery order if unset.
    pub reference: Option<TenantId>,
    pub include_indexes: bool,
    pub include_constraints: bool,
    /// Table names left out of the comparison, additionally to the
    /// bookkeeping tables which are always excluded.
    pub exclude_tables: Vec<String>,
    pub concurrency: Option<usize>,
    pub cancel: CancellationToken,
}

impl Default for DriftOptions {
    fn default() -> Self {
        Self {
            tenant_ids: None,
            reference: None,
            include_indexes: true,
            include_constraints: true,
            exclude_tables: Vec::new(),
            concurrency: None,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct TenantDriftReport {
    pub tenant_id: TenantId,
    pub schema: String,
    pub is_reference: bool,
    pub has_drift: bool,
    pub issue_count: usize,
    pub tables: Vec<TableDrift>,
    pub error: Option<String>,
}

impl TenantDriftReport {
    fn clean(tenant_id: TenantId, schema: String, is_reference: bool) -> Self {
        Self {
            tenant_id,
            schema,
            is_reference,
            has_drift: false,
            issue_count: 0,
            tables: Vec::new(),
            error: None,
        }
    }
}

impl TenantOperationResult for TenantDriftReport {
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
            error: Some(error.to_string()),
            ..Self::clean(tenant_id, String::new(), false)
        }
    }

    fn from_skipped(tenant_id: TenantId) -> Self {
        Self::from_error(tenant_id, &SiloError::Cancelled)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SchemaDriftStatus {
    pub reference_tenant: TenantId,
    pub total: usize,
    pub no_drift: usize,
    pub with_drift: usize,
    pub error: usize,
    pub details: Vec<TenantDriftReport>,
    #[serde(with = "serde_duration_as_millis")]
    pub duration: Duration,
}

pub(crate) struct DriftDetector {
    config: Arc<SiloConfig>,
    schema_manager: Arc<SchemaManager>,
}

impl DriftDetector {
    pub(crate) fn new(config: Arc<SiloConfig>, schema_manager: Arc<SchemaManager>) -> Self {
        Self {
            config,
            schema_manager,
        }
    }

    fn excluded_tables(&self, options: &DriftOptions) -> HashSet<String> {
        let mut exclude = options.exclude_tables.iter().cloned().collect::<HashSet<_>>();
        exclude.insert(self.config.migrations.table.clone());
        exclude.insert(self.config.shared.table.clone());
        exclude
    }

    /// Introspects one tenant's schema.
    #[instrument(skip(self, options), fields(tenant_id = %tenant_id))]
    pub(crate) async fn introspect_tenant(
        &self,
        tenant_id: &TenantId,
        options: &DriftOptions,
    ) -> Result<SchemaIntrospection, SiloError> {
        let pool = self.schema_manager.root_pool()?;
        let result = self.introspect_on(&pool, tenant_id, options).await;
        pool.close().await;
        result
    }

    async fn introspect_on(
        &self,
        pool: &Pool<Postgres>,
        tenant_id: &TenantId,
        options: &DriftOptions,
    ) -> Result<SchemaIntrospection, SiloError> {
        let schema = self.config.schema_for(tenant_id)?;
        if !crate::schema::schema_exists_on(pool, &schema).await? {
            return Err(SiloError::TenantNotFound {
                tenant_id: tenant_id.clone(),
            });
        }
        introspect_schema(
            pool,
            &schema,
            options.include_indexes,
            options.include_constraints,
            &self.excluded_tables(options),
        )
        .await
    }

    /// Compares one tenant against an explicit reference tenant.
    #[instrument(skip(self, options), fields(tenant_id = %tenant_id, reference = %reference_id))]
    pub(crate) async fn tenant_drift(
        &self,
        tenant_id: &TenantId,
        reference_id: &TenantId,
        options: &DriftOptions,
    ) -> TenantDriftReport {
        let pool = match self.schema_manager.root_pool() {
            Ok(pool) => pool,
            Err(error) => return TenantDriftReport::from_error(tenant_id.clone(), &error),
        };

        let report = async {
            let reference = self.introspect_on(&pool, reference_id, options).await?;
            Ok::<_, SiloError>(
                self.compare_against(&pool, &reference, tenant_id, options)
                    .await,
            )
        }
        .await
        .unwrap_or_else(|error| TenantDriftReport::from_error(tenant_id.clone(), &error));
        pool.close().await;
        report
    }

    async fn compare_against(
        &self,
        pool: &Pool<Postgres>,
        reference: &SchemaIntrospection,
        tenant_id: &TenantId,
        options: &DriftOptions,
    ) -> TenantDriftReport {
        let introspection = match self.introspect_on(pool, tenant_id, options).await {
            Ok(introspection) => introspection,
            Err(error) => return TenantDriftReport::from_error(tenant_id.clone(), &error),
        };

        let tables = compare_schemas(
            reference,
            &introspection,
            options.include_indexes,
            options.include_constraints,
        );
        let issue_count = tables.iter().map(TableDrift::issue_count).sum::<usize>();
        TenantDriftReport {
            tenant_id: tenant_id.clone(),
            schema: introspection.schema,
            is_reference: false,
            has_drift: issue_count > 0,
            issue_count,
            tables,
            error: None,
        }
    }

    /// Compares every tenant against the reference tenant.
    ///
    /// Failing to read the reference fails the whole run; a tenant which
    /// can't be introspected is reported as `error` and the run continues.
    #[instrument(skip_all)]
    pub(crate) async fn schema_drift(
        &self,
        tenant_ids: &[TenantId],
        options: &DriftOptions,
    ) -> Result<SchemaDriftStatus, SiloError> {
        let start = Instant::now();
        let reference_id = options
            .reference
            .clone()
            .or_else(|| tenant_ids.first().cloned())
            .ok_or_else(|| SiloError::ConfigInvalid("no tenants to compare".into()))?;

        let pool = self.schema_manager.root_pool()?;
        let reference = match self.introspect_on(&pool, &reference_id, options).await {
            Ok(reference) => reference,
            Err(error) => {
                pool.close().await;
                return Err(error);
            }
        };

        let batch = BatchExecutor::new(self.config.batch.concurrency);
        let batch_options = BatchOptions {
            concurrency: options.concurrency,
            cancel: options.cancel.clone(),
            ..BatchOptions::default()
        };
        let pool_ref = &pool;
        let reference_ref = &reference;
        let reference_id_ref = &reference_id;
        let summary = batch
            .run(tenant_ids, &batch_options, |tenant_id| async move {
                if &tenant_id == reference_id_ref {
                    return Ok(TenantDriftReport::clean(
                        tenant_id,
                        reference_ref.schema.clone(),
                        true,
                    ));
                }
                Ok(self
                    .compare_against(pool_ref, reference_ref, &tenant_id, options)
                    .await)
            })
            .await;
        pool.close().await;

        let details = summary.details;
        let error = details
            .iter()
            .filter(|report| report.error.is_some())
            .count();
        let with_drift = details.iter().filter(|report| report.has_drift).count();
        Ok(SchemaDriftStatus {
            reference_tenant: reference_id,
            total: details.len(),
            no_drift: details.len() - with_drift - error,
            with_drift,
            error,
            details,
            duration: start.elapsed(),
        })
    }
}

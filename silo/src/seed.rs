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

//! Running caller supplied seed closures inside a tenant's schema.
//!
//! The seeder only provides isolation: a schema bound pool, lifecycle
//! and error capture. What the closure does with the handle is opaque.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use futures_util::future::BoxFuture;
use serde::Serialize;
use sqlx::{Pool, Postgres};
use tracing::instrument;
use xayn_silo_shared::{serde::serde_duration_as_millis, tenant::TenantId};

use crate::{
    config::SiloConfig,
    error::{ErrorKind, SiloError},
    migration::batch::{BatchSummary, TenantOperationResult},
    schema::{schema_exists_on, SchemaManager},
};

pub type SeedFn =
    Arc<dyn Fn(Pool<Postgres>, TenantId) -> BoxFuture<'static, Result<(), anyhow::Error>> + Send + Sync>;

pub type SharedSeedFn =
    Arc<dyn Fn(Pool<Postgres>) -> BoxFuture<'static, Result<(), anyhow::Error>> + Send + Sync>;

#[derive(Clone, Debug, Serialize)]
pub struct SeedResult {
    pub tenant_id: TenantId,
    pub schema: String,
    pub success: bool,
    pub skipped: bool,
    #[serde(with = "serde_duration_as_millis")]
    pub duration: Duration,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl SeedResult {
    pub(crate) fn failure(tenant_id: TenantId, schema: String, error: &SiloError) -> Self {
        Self {
            tenant_id,
            schema,
            success: false,
            skipped: false,
            duration: Duration::ZERO,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
        }
    }
}

impl TenantOperationResult for SeedResult {
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
        Self::failure(tenant_id, String::new(), error)
    }

    fn from_skipped(tenant_id: TenantId) -> Self {
        Self {
            skipped: true,
            ..Self::failure(tenant_id, String::new(), &SiloError::Cancelled)
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SharedSeedResult {
    pub schema: String,
    pub success: bool,
    #[serde(with = "serde_duration_as_millis")]
    pub duration: Duration,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

/// Result of `seed_all_with_shared`; a failed shared seed does not
/// cancel the tenant batch.
#[derive(Clone, Debug, Serialize)]
pub struct SharedAndTenantSeeds {
    pub shared: SharedSeedResult,
    pub tenants: BatchSummary<SeedResult>,
}

pub(crate) struct Seeder {
    config: Arc<SiloConfig>,
    schema_manager: Arc<SchemaManager>,
}

impl Seeder {
    pub(crate) fn new(config: Arc<SiloConfig>, schema_manager: Arc<SchemaManager>) -> Self {
        Self {
            config,
            schema_manager,
        }
    }

    #[instrument(skip(self, seed), fields(tenant_id = %tenant_id))]
    pub(crate) async fn seed_tenant(&self, tenant_id: &TenantId, seed: &SeedFn) -> SeedResult {
        let start = Instant::now();
        let schema = match self.config.schema_for(tenant_id) {
            Ok(schema) => schema,
            Err(error) => return SeedResult::failure(tenant_id.clone(), String::new(), &error),
        };
        let pool = match self.schema_manager.operation_pool(&schema) {
            Ok(pool) => pool,
            Err(error) => {
                return SeedResult::failure(
                    tenant_id.clone(),
                    schema.as_unquoted_str().into(),
                    &error,
                )
            }
        };

        let outcome = async {
            if !schema_exists_on(&pool, &schema).await? {
                return Err(SiloError::TenantNotFound {
                    tenant_id: tenant_id.clone(),
                });
            }
            seed(pool.clone(), tenant_id.clone())
                .await
                .map_err(SiloError::Other)
        }
        .await;
        pool.close().await;

        match outcome {
            Ok(()) => SeedResult {
                tenant_id: tenant_id.clone(),
                schema: schema.as_unquoted_str().into(),
                success: true,
                skipped: false,
                duration: start.elapsed(),
                error: None,
                error_kind: None,
            },
            Err(error) => SeedResult {
                duration: start.elapsed(),
                ..SeedResult::failure(tenant_id.clone(), schema.as_unquoted_str().into(), &error)
            },
        }
    }

    #[instrument(skip_all)]
    pub(crate) async fn seed_shared(&self, seed: &SharedSeedFn) -> SharedSeedResult {
        let start = Instant::now();
        let failure = |schema: String, error: &SiloError| SharedSeedResult {
            schema,
            success: false,
            duration: start.elapsed(),
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
        };

        let schema = match self.config.shared_schema() {
            Ok(schema) => schema,
            Err(error) => return failure(String::new(), &error),
        };
        let pool = match self.schema_manager.operation_pool(&schema) {
            Ok(pool) => pool,
            Err(error) => return failure(schema.as_unquoted_str().into(), &error),
        };

        let outcome = seed(pool.clone()).await.map_err(SiloError::Other);
        pool.close().await;

        match outcome {
            Ok(()) => SharedSeedResult {
                schema: schema.as_unquoted_str().into(),
                success: true,
                duration: start.elapsed(),
                error: None,
                error_kind: None,
            },
            Err(error) => failure(schema.as_unquoted_str().into(), &error),
        }
    }
}

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

//! Tenant schema lifecycle and bookkeeping table DDL.

use std::sync::Arc;

use futures_util::FutureExt;
use sqlx::{pool::PoolOptions, postgres::PgConnection, Executor, Pool, Postgres};
use tracing::{info, instrument};
use xayn_silo_shared::{postgres::QuotedIdentifier, tenant::TenantId};

use crate::{config::SiloConfig, error::SiloError, migration::format::TableFormat};

/// Connections a per-operation schema bound pool may hold.
const OPERATION_POOL_SIZE: u32 = 2;

/// Creates, drops and inspects tenant schemas.
///
/// All DDL splices identifiers through [`QuotedIdentifier`], a raw tenant
/// id never reaches a query without passing the schema template first.
pub struct SchemaManager {
    config: Arc<SiloConfig>,
}

impl SchemaManager {
    pub(crate) fn new(config: Arc<SiloConfig>) -> Self {
        Self { config }
    }

    /// Applies the schema template.
    pub fn schema_name(&self, tenant_id: &TenantId) -> Result<QuotedIdentifier, SiloError> {
        self.config.schema_for(tenant_id)
    }

    /// A short lived single connection pool without a tenant search path.
    ///
    /// Callers close it once their operation is done.
    pub(crate) async fn connect_root(&self) -> Result<Pool<Postgres>, SiloError> {
        let options = self.config.postgres.to_connection_options()?;
        Ok(PoolOptions::new()
            .max_connections(1)
            .acquire_timeout(self.config.postgres.connect_timeout)
            .connect_with(options)
            .await?)
    }

    /// A lazily connecting pool without a tenant search path, used by
    /// operations which introspect several schemas over one pool.
    pub(crate) fn root_pool(&self) -> Result<Pool<Postgres>, SiloError> {
        let options = self.config.postgres.to_connection_options()?;
        Ok(self
            .config
            .postgres
            .to_pool_options()
            .connect_lazy_with(options))
    }

    /// A lazily connecting pool whose connections are bound to `schema`.
    ///
    /// Every fresh connection runs `SET search_path TO "<schema>", public`
    /// before it is handed out.
    pub(crate) fn schema_pool(
        &self,
        schema: &QuotedIdentifier,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Pool<Postgres>, SiloError> {
        let options = self.config.postgres.to_connection_options()?;
        let search_path = format!("SET search_path TO {schema}, public;");
        Ok(PoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections.min(max_connections))
            .acquire_timeout(self.config.postgres.connect_timeout)
            .idle_timeout(self.config.postgres.idle_timeout)
            .after_connect(move |conn: &mut PgConnection, _metadata| {
                let search_path = search_path.clone();
                async move {
                    conn.execute(search_path.as_str()).await?;
                    Ok(())
                }
                .boxed()
            })
            .connect_lazy_with(options))
    }

    /// A small schema bound pool for the duration of one operation.
    pub(crate) fn operation_pool(
        &self,
        schema: &QuotedIdentifier,
    ) -> Result<Pool<Postgres>, SiloError> {
        self.schema_pool(schema, OPERATION_POOL_SIZE, 0)
    }

    #[instrument(skip(self), err)]
    pub async fn create_schema(&self, tenant_id: &TenantId) -> Result<QuotedIdentifier, SiloError> {
        let schema = self.schema_name(tenant_id)?;
        let pool = self.connect_root().await?;
        //Hint: $ binds won't work for identifiers (e.g. schema names)
        let query = format!("CREATE SCHEMA IF NOT EXISTS {schema};");
        let result = pool.execute(query.as_str()).await;
        pool.close().await;
        result?;
        info!({ schema = %schema }, "schema created");
        Ok(schema)
    }

    #[instrument(skip(self), err)]
    pub async fn drop_schema(&self, tenant_id: &TenantId, cascade: bool) -> Result<(), SiloError> {
        let schema = self.schema_name(tenant_id)?;
        let mode = if cascade { "CASCADE" } else { "RESTRICT" };
        let pool = self.connect_root().await?;
        let query = format!("DROP SCHEMA IF EXISTS {schema} {mode};");
        let result = pool.execute(query.as_str()).await;
        pool.close().await;
        result?;
        info!({ schema = %schema }, "schema dropped");
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn schema_exists(&self, tenant_id: &TenantId) -> Result<bool, SiloError> {
        let schema = self.schema_name(tenant_id)?;
        let pool = self.connect_root().await?;
        let result = schema_exists_on(&pool, &schema).await;
        pool.close().await;
        result
    }

    /// Lists schema names, optionally filtered with a `LIKE` pattern.
    #[instrument(skip(self), err)]
    pub async fn list_schemas(&self, pattern: Option<&str>) -> Result<Vec<String>, SiloError> {
        let pool = self.connect_root().await?;
        let result = sqlx::query_scalar::<_, String>(
            "SELECT schema_name FROM information_schema.schemata
                WHERE schema_name LIKE $1
                ORDER BY schema_name;",
        )
        .bind(pattern.unwrap_or("%"))
        .fetch_all(&pool)
        .await;
        pool.close().await;
        Ok(result?)
    }
}

pub(crate) async fn schema_exists_on(
    pool: &Pool<Postgres>,
    schema: &QuotedIdentifier,
) -> Result<bool, SiloError> {
    Ok(sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS(SELECT 1 FROM information_schema.schemata WHERE schema_name = $1);",
    )
    .bind(schema.as_unquoted_str())
    .fetch_one(pool)
    .await?)
}

/// Creates the bookkeeping table for `format` if it is missing. Idempotent.
pub(crate) async fn ensure_bookkeeping(
    pool: &Pool<Postgres>,
    schema: &QuotedIdentifier,
    table: &QuotedIdentifier,
    format: TableFormat,
) -> Result<(), SiloError> {
    let columns = match format {
        TableFormat::Name => {
            "id SERIAL PRIMARY KEY,
            name VARCHAR(255) NOT NULL UNIQUE,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()"
        }
        TableFormat::Hash => {
            "id SERIAL PRIMARY KEY,
            hash TEXT NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()"
        }
        TableFormat::DrizzleKit => {
            "id SERIAL PRIMARY KEY,
            hash TEXT NOT NULL,
            created_at BIGINT"
        }
    };
    let query = format!("CREATE TABLE IF NOT EXISTS {schema}.{table} ({columns});");
    pool.execute(query.as_str()).await?;
    Ok(())
}

pub(crate) async fn bookkeeping_exists(
    pool: &Pool<Postgres>,
    schema: &QuotedIdentifier,
    table: &QuotedIdentifier,
) -> Result<bool, SiloError> {
    Ok(sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS(
            SELECT 1 FROM information_schema.tables
            WHERE table_schema = $1 AND table_name = $2
        );",
    )
    .bind(schema.as_unquoted_str())
    .bind(table.as_unquoted_str())
    .fetch_one(pool)
    .await?)
}

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

//! Toolkit configuration.
//!
//! The configuration is immutable once a [`Silo`] was built from it.
//! Function valued settings (schema template, tenant discovery, hooks,
//! seed functions) are plain closures on the config struct, the
//! serializable variants exist so configs can also come from files.
//!
//! [`Silo`]: crate::Silo

use std::{
    fmt::{self, Debug},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use xayn_silo_shared::{
    postgres::{self, QuotedIdentifier},
    retry::ExponentialJitterRetryPolicyConfig,
    serde::serde_duration_as_millis,
    tenant::TenantId,
};

use crate::{
    error::SiloError,
    hooks::Hooks,
    migration::format::{FormatPolicy, TableFormat},
};

/// Process wide configuration, immutable after [`Silo::new`].
///
/// [`Silo::new`]: crate::Silo::new
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
#[cfg_attr(test, serde(deny_unknown_fields))]
pub struct SiloConfig {
    pub postgres: postgres::Config,
    pub isolation: IsolationConfig,
    pub pool_cache: PoolCacheConfig,
    pub migrations: MigrationsConfig,
    pub shared: SharedSchemaConfig,
    pub batch: BatchConfig,
    pub probe: ProbeConfig,
    pub discovery: TenantDiscovery,
    #[serde(skip)]
    pub hooks: Hooks,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
#[cfg_attr(test, serde(deny_unknown_fields))]
pub struct IsolationConfig {
    pub strategy: IsolationStrategy,
    pub schema_template: SchemaTemplate,
}

/// How tenants are isolated from each other.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationStrategy {
    /// One postgres schema per tenant.
    #[default]
    Schema,
    /// Row level security, accepted by the parser but not implemented.
    Rls,
}

/// Total, deterministic mapping tenant id → schema name.
#[derive(Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchemaTemplate {
    /// `{prefix}{tenant_id}`.
    Prefix { prefix: String },
    /// Caller registered callback, the escape hatch for layouts the
    /// prefix template can't express.
    #[serde(skip)]
    Custom(SchemaTemplateFn),
}

pub type SchemaTemplateFn = Arc<dyn Fn(&TenantId) -> String + Send + Sync>;

impl SchemaTemplate {
    pub fn schema_name(&self, tenant_id: &TenantId) -> Result<QuotedIdentifier, SiloError> {
        let name = match self {
            SchemaTemplate::Prefix { prefix } => format!("{prefix}{tenant_id}"),
            SchemaTemplate::Custom(template) => template(tenant_id),
        };
        name.try_into()
            .map_err(|source| SiloError::InvalidSchemaName {
                tenant_id: tenant_id.clone(),
                source,
            })
    }

    pub(crate) fn prefix(&self) -> Option<&str> {
        match self {
            SchemaTemplate::Prefix { prefix } => Some(prefix),
            SchemaTemplate::Custom(_) => None,
        }
    }
}

impl Default for SchemaTemplate {
    fn default() -> Self {
        SchemaTemplate::Prefix {
            prefix: "tenant_".into(),
        }
    }
}

impl Debug for SchemaTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaTemplate::Prefix { prefix } => {
                f.debug_struct("Prefix").field("prefix", prefix).finish()
            }
            SchemaTemplate::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Where the set of tenant ids comes from.
#[derive(Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TenantDiscovery {
    /// A fixed list.
    Static { tenants: Vec<TenantId> },
    /// List schemas matching the prefix template and strip the prefix.
    SchemaScan,
    /// Caller registered callback.
    #[serde(skip)]
    Callback(DiscoveryFn),
}

pub type DiscoveryFn =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<TenantId>, anyhow::Error>> + Send + Sync>;

impl Default for TenantDiscovery {
    fn default() -> Self {
        TenantDiscovery::SchemaScan
    }
}

impl Debug for TenantDiscovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TenantDiscovery::Static { tenants } => {
                f.debug_struct("Static").field("tenants", tenants).finish()
            }
            TenantDiscovery::SchemaScan => f.write_str("SchemaScan"),
            TenantDiscovery::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
#[cfg_attr(test, serde(deny_unknown_fields))]
pub struct PoolCacheConfig {
    /// Upper bound of concurrently cached tenant pools.
    pub max_pools: usize,
    /// Idle time after which a cached pool is evicted.
    #[serde(with = "serde_duration_as_millis")]
    pub pool_ttl: Duration,
}

impl Default for PoolCacheConfig {
    fn default() -> Self {
        Self {
            max_pools: 50,
            pool_ttl: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
#[cfg_attr(test, serde(deny_unknown_fields))]
pub struct MigrationsConfig {
    /// Folder holding the per-tenant `*.sql` migrations.
    pub folder: PathBuf,
    /// Bookkeeping table name, created inside every tenant schema.
    pub table: String,
    pub format: FormatPolicy,
    /// Format used when `format = "auto"` finds no table to inspect.
    pub default_format: TableFormat,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            folder: "./migrations".into(),
            table: "__drizzle_migrations".into(),
            format: FormatPolicy::Auto,
            default_format: TableFormat::Name,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
#[cfg_attr(test, serde(deny_unknown_fields))]
pub struct SharedSchemaConfig {
    /// The schema carrying tables common to all tenants.
    pub schema: String,
    pub folder: PathBuf,
    pub table: String,
    pub format: FormatPolicy,
    pub default_format: TableFormat,
}

impl Default for SharedSchemaConfig {
    fn default() -> Self {
        Self {
            schema: "public".into(),
            folder: "./migrations/shared".into(),
            table: "__drizzle_shared_migrations".into(),
            format: FormatPolicy::Auto,
            default_format: TableFormat::Name,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
#[cfg_attr(test, serde(deny_unknown_fields))]
pub struct BatchConfig {
    /// Bounded worker count for multi-tenant fan-out.
    pub concurrency: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { concurrency: 10 }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
#[cfg_attr(test, serde(deny_unknown_fields))]
pub struct ProbeConfig {
    /// Timeout of a single `SELECT 1` liveness probe.
    #[serde(with = "serde_duration_as_millis")]
    pub timeout: Duration,
    pub retry: ExponentialJitterRetryPolicyConfig,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            retry: ExponentialJitterRetryPolicyConfig::default(),
        }
    }
}

impl SiloConfig {
    /// Loads the config from an optional toml file plus prefixed env vars.
    ///
    /// Env variables are split at `__`, i.e. `SILO__POSTGRES__MAX_POOL_SIZE=5`
    /// maps to `postgres.max_pool_size`. Env overrides the file; anything
    /// unset falls back to the defaults.
    pub fn load(file: Option<&Path>, env_prefix: &str) -> Result<Self, SiloError> {
        // the order must be from highest to lowest priority
        // or else it won't work correctly
        let mut figment = Figment::new().join(Env::prefixed(env_prefix).split("__"));
        if let Some(file) = file {
            figment = figment.join(Toml::file(file));
        }
        figment
            .extract()
            .map_err(|error| SiloError::ConfigInvalid(error.to_string()))
    }

    /// Post deserialization validation, run once by [`Silo::new`].
    ///
    /// [`Silo::new`]: crate::Silo::new
    pub fn validate(&self) -> Result<(), SiloError> {
        let invalid = |message: &str| Err(SiloError::ConfigInvalid(message.into()));

        if self.isolation.strategy == IsolationStrategy::Rls {
            return invalid("row-level-security isolation is not implemented, use `schema`");
        }
        if let Some(prefix) = self.isolation.schema_template.prefix() {
            // longest tenant id (50) plus prefix must stay a valid identifier (63)
            if prefix.len() > 13 {
                return invalid("schema template prefix must be at most 13 bytes");
            }
            if QuotedIdentifier::try_from(format!("{prefix}t")).is_err() {
                return invalid("schema template prefix is not a valid identifier part");
            }
        }
        if self.pool_cache.max_pools == 0 {
            return invalid("pool_cache.max_pools must be at least 1");
        }
        if self.pool_cache.pool_ttl < Duration::from_secs(1) {
            return invalid("pool_cache.pool_ttl must be at least one second");
        }
        if self.batch.concurrency == 0 {
            return invalid("batch.concurrency must be at least 1");
        }
        if self.probe.timeout.is_zero() {
            return invalid("probe.timeout must not be zero");
        }
        self.migrations_table()?;
        self.shared_table()?;
        self.shared_schema()?;

        Ok(())
    }

    pub(crate) fn schema_for(&self, tenant_id: &TenantId) -> Result<QuotedIdentifier, SiloError> {
        self.isolation.schema_template.schema_name(tenant_id)
    }

    pub(crate) fn shared_schema(&self) -> Result<QuotedIdentifier, SiloError> {
        self.shared.schema.parse().map_err(|_| {
            SiloError::ConfigInvalid(format!("invalid shared schema name: {}", self.shared.schema))
        })
    }

    pub(crate) fn migrations_table(&self) -> Result<QuotedIdentifier, SiloError> {
        self.migrations.table.parse().map_err(|_| {
            SiloError::ConfigInvalid(format!(
                "invalid bookkeeping table name: {}",
                self.migrations.table
            ))
        })
    }

    pub(crate) fn shared_table(&self) -> Result<QuotedIdentifier, SiloError> {
        self.shared.table.parse().map_err(|_| {
            SiloError::ConfigInvalid(format!(
                "invalid shared bookkeeping table name: {}",
                self.shared.table
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        SiloConfig::default().validate().unwrap();
    }

    #[test]
    fn test_load_without_sources_yields_defaults() {
        let config = SiloConfig::load(None, "SILO_CONFIG_TEST__").unwrap();
        config.validate().unwrap();
        assert_eq!(config.pool_cache.max_pools, 50);
        assert_eq!(config.migrations.table, "__drizzle_migrations");
    }

    #[test]
    fn test_rls_is_rejected() {
        let config = SiloConfig {
            isolation: IsolationConfig {
                strategy: IsolationStrategy::Rls,
                ..IsolationConfig::default()
            },
            ..SiloConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_limits_are_rejected() {
        let mut config = SiloConfig::default();
        config.pool_cache.max_pools = 0;
        assert!(config.validate().is_err());

        let mut config = SiloConfig::default();
        config.batch.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_prefix_template_produces_quoted_schema_names() {
        let config = SiloConfig::default();
        let schema = config.schema_for(&"acme".parse().unwrap()).unwrap();
        assert_eq!(schema.to_string(), "\"tenant_acme\"");
    }

    #[test]
    fn test_distinct_tenants_get_distinct_schemas() {
        let config = SiloConfig::default();
        let a = config.schema_for(&"a".parse().unwrap()).unwrap();
        let b = config.schema_for(&"b".parse().unwrap()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_custom_template() {
        let template = SchemaTemplate::Custom(Arc::new(|tenant_id| format!("org_{tenant_id}")));
        let schema = template.schema_name(&"acme".parse().unwrap()).unwrap();
        assert_eq!(schema.as_unquoted_str(), "org_acme");
    }

    #[test]
    fn test_config_from_toml() {
        let config: SiloConfig = toml::from_str(
            r#"
            [isolation.schema_template]
            kind = "prefix"
            prefix = "t_"

            [migrations]
            folder = "./db/migrations"
            format = "drizzle-kit"

            [discovery]
            kind = "static"
            tenants = ["a", "b"]

            [pool_cache]
            max_pools = 2
            pool_ttl = 60000
            "#,
        )
        .unwrap();

        config.validate().unwrap();
        assert_eq!(config.migrations.format, FormatPolicy::DrizzleKit);
        assert_eq!(config.pool_cache.max_pools, 2);
        assert!(matches!(
            &config.discovery,
            TenantDiscovery::Static { tenants } if tenants.len() == 2
        ));
    }
}

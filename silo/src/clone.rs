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

//! Cloning a tenant schema, structure first, optionally data.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt::{self, Debug},
    sync::Arc,
    time::{Duration, Instant},
};

use futures_util::TryStreamExt;
use itertools::Itertools;
use serde::Serialize;
use sqlx::{Executor, Pool, Postgres, QueryBuilder, Row};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use xayn_silo_shared::{
    postgres::QuotedIdentifier,
    serde::serde_duration_as_millis,
    tenant::TenantId,
};

use crate::{
    config::SiloConfig,
    drift::introspect::{introspect_schema, SchemaIntrospection, TableIntrospection},
    error::{ErrorKind, SiloError},
    hooks::guarded,
    schema::{schema_exists_on, SchemaManager},
};

// https://docs.rs/sqlx/latest/sqlx/struct.QueryBuilder.html#note-database-specific-limits
const BIND_LIMIT: usize = 65_535;

/// Per column anonymization applied while copying data.
#[derive(Clone)]
pub enum AnonymizeRule {
    /// Replace with NULL.
    Null,
    /// Replace with a fixed literal.
    Literal(String),
    /// Compute the replacement from the source value (as text).
    Custom(Arc<dyn Fn(Option<&str>) -> Option<String> + Send + Sync>),
}

impl Debug for AnonymizeRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnonymizeRule::Null => f.write_str("Null"),
            AnonymizeRule::Literal(literal) => f.debug_tuple("Literal").field(literal).finish(),
            AnonymizeRule::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Rules per table, then per column.
#[derive(Clone, Debug, Default)]
pub struct AnonymizeConfig {
    pub rules: HashMap<String, HashMap<String, AnonymizeRule>>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ClonePhase {
    Introspecting,
    CreatingSchema,
    CreatingTables,
    CreatingIndexes,
    CreatingConstraints,
    CopyingData {
        table: String,
        copied: u64,
        total: u64,
    },
}

pub type CloneProgressHook = Arc<dyn Fn(&ClonePhase) + Send + Sync>;

#[derive(Clone, Default)]
pub struct CloneOptions {
    pub include_data: bool,
    pub anonymize: Option<AnonymizeConfig>,
    /// Rows per INSERT while copying anonymized data, 500 if unset.
    pub batch_size: Option<usize>,
    pub on_progress: Option<CloneProgressHook>,
    pub cancel: CancellationToken,
}

impl Debug for CloneOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloneOptions")
            .field("include_data", &self.include_data)
            .field("anonymize", &self.anonymize.is_some())
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CloneResult {
    pub source: TenantId,
    pub target: TenantId,
    pub source_schema: String,
    pub target_schema: String,
    pub success: bool,
    /// Tables created in the target, in creation order.
    pub tables: Vec<String>,
    pub rows_copied: Option<u64>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    #[serde(with = "serde_duration_as_millis")]
    pub duration: Duration,
}

impl CloneResult {
    pub(crate) fn failure(source: TenantId, target: TenantId, error: &SiloError) -> Self {
        Self {
            source,
            target,
            source_schema: String::new(),
            target_schema: String::new(),
            success: false,
            tables: Vec::new(),
            rows_copied: None,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            duration: Duration::ZERO,
        }
    }
}

pub(crate) struct Cloner {
    config: Arc<SiloConfig>,
    schema_manager: Arc<SchemaManager>,
}

impl Cloner {
    pub(crate) fn new(config: Arc<SiloConfig>, schema_manager: Arc<SchemaManager>) -> Self {
        Self {
            config,
            schema_manager,
        }
    }

    /// Clones `source`'s schema into a fresh schema for `target`.
    ///
    /// The clone is not one transaction: on failure the partially built
    /// target schema is left in place for the caller to inspect or drop.
    #[instrument(skip(self, options), fields(source = %source, target = %target))]
    pub(crate) async fn clone_tenant(
        &self,
        source: &TenantId,
        target: &TenantId,
        options: &CloneOptions,
    ) -> CloneResult {
        let start = Instant::now();
        let mut result = CloneResult {
            source: source.clone(),
            target: target.clone(),
            source_schema: String::new(),
            target_schema: String::new(),
            success: false,
            tables: Vec::new(),
            rows_copied: None,
            error: None,
            error_kind: None,
            duration: Duration::ZERO,
        };

        let outcome = self.run(source, target, options, &mut result).await;
        if let Err(error) = outcome {
            result.error = Some(error.to_string());
            result.error_kind = Some(error.kind());
        } else {
            result.success = true;
        }
        result.duration = start.elapsed();
        result
    }

    async fn run(
        &self,
        source: &TenantId,
        target: &TenantId,
        options: &CloneOptions,
        result: &mut CloneResult,
    ) -> Result<(), SiloError> {
        let source_schema = self.config.schema_for(source)?;
        let target_schema = self.config.schema_for(target)?;
        result.source_schema = source_schema.as_unquoted_str().into();
        result.target_schema = target_schema.as_unquoted_str().into();

        let progress = |phase: ClonePhase| {
            if let Some(hook) = &options.on_progress {
                guarded("clone_progress", || hook(&phase));
            }
        };

        let pool = self.schema_manager.root_pool()?;
        let outcome = self
            .run_on(
                &pool,
                (source, &source_schema),
                (target, &target_schema),
                options,
                &progress,
                result,
            )
            .await;
        pool.close().await;
        outcome
    }

    async fn run_on(
        &self,
        pool: &Pool<Postgres>,
        (source, source_schema): (&TenantId, &QuotedIdentifier),
        (target, target_schema): (&TenantId, &QuotedIdentifier),
        options: &CloneOptions,
        progress: &impl Fn(ClonePhase),
        result: &mut CloneResult,
    ) -> Result<(), SiloError> {
        progress(ClonePhase::Introspecting);
        if !schema_exists_on(pool, source_schema).await? {
            return Err(SiloError::TenantNotFound {
                tenant_id: source.clone(),
            });
        }
        if schema_exists_on(pool, target_schema).await? {
            return Err(SiloError::TenantAlreadyExists {
                tenant_id: target.clone(),
            });
        }
        let introspection = introspect_schema(
            pool,
            source_schema,
            true,
            true,
            // the bookkeeping table is cloned too, migration state travels along
            &HashSet::new(),
        )
        .await?;
        let ordered = topological_order(&introspection)?;

        progress(ClonePhase::CreatingSchema);
        pool.execute(format!("CREATE SCHEMA {target_schema};").as_str())
            .await?;

        progress(ClonePhase::CreatingTables);
        for table in &ordered {
            if options.cancel.is_cancelled() {
                return Err(SiloError::Cancelled);
            }
            let ddl = create_table_ddl(table, source_schema, target_schema);
            pool.execute(ddl.as_str()).await?;
            result.tables.push(table.name.clone());
        }

        progress(ClonePhase::CreatingIndexes);
        for table in &ordered {
            let constraint_names = table
                .constraints
                .iter()
                .map(|constraint| constraint.name.as_str())
                .collect::<HashSet<_>>();
            for index in &table.indexes {
                // constraint backed indexes come back with their constraint
                if constraint_names.contains(index.name.as_str()) {
                    continue;
                }
                let ddl = rewrite_schema(&index.definition, source_schema, target_schema);
                pool.execute(ddl.as_str()).await?;
            }
        }

        progress(ClonePhase::CreatingConstraints);
        // foreign keys strictly after every table exists
        for foreign_keys in [false, true] {
            for table in &ordered {
                for constraint in &table.constraints {
                    let is_foreign_key =
                        constraint.kind == crate::drift::introspect::ConstraintKind::ForeignKey;
                    if is_foreign_key != foreign_keys {
                        continue;
                    }
                    let table_name = quoted(&table.name);
                    let constraint_name = quoted(&constraint.name);
                    let definition =
                        rewrite_schema(&constraint.definition, source_schema, target_schema);
                    let ddl = format!(
                        "ALTER TABLE {target_schema}.{table_name} \
                            ADD CONSTRAINT {constraint_name} {definition};"
                    );
                    pool.execute(ddl.as_str()).await?;
                }
            }
        }

        if options.include_data {
            let mut rows_copied = 0;
            for table in &ordered {
                if options.cancel.is_cancelled() {
                    return Err(SiloError::Cancelled);
                }
                let rules = options
                    .anonymize
                    .as_ref()
                    .and_then(|anonymize| anonymize.rules.get(&table.name));
                rows_copied += match rules {
                    Some(rules) => {
                        self.copy_table_anonymized(
                            pool,
                            source_schema,
                            target_schema,
                            table,
                            rules,
                            options,
                            progress,
                        )
                        .await?
                    }
                    None => {
                        copy_table(pool, source_schema, target_schema, table, progress).await?
                    }
                };
            }
            result.rows_copied = Some(rows_copied);
        }

        info!({ tables = result.tables.len() }, "tenant cloned");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn copy_table_anonymized(
        &self,
        pool: &Pool<Postgres>,
        source_schema: &QuotedIdentifier,
        target_schema: &QuotedIdentifier,
        table: &TableIntrospection,
        rules: &HashMap<String, AnonymizeRule>,
        options: &CloneOptions,
        progress: &impl Fn(ClonePhase),
    ) -> Result<u64, SiloError> {
        let table_name = quoted(&table.name);
        let total = count_rows(pool, source_schema, &table_name).await?;
        progress(ClonePhase::CopyingData {
            table: table.name.clone(),
            copied: 0,
            total,
        });

        let column_list = table
            .columns
            .iter()
            .map(|column| quoted(&column.name).to_string())
            .join(", ");
        let select_list = table
            .columns
            .iter()
            .map(|column| format!("{}::text", quoted(&column.name)))
            .join(", ");
        let select = format!("SELECT {select_list} FROM {source_schema}.{table_name};");
        let insert_head = format!("INSERT INTO {target_schema}.{table_name} ({column_list}) ");
        let casts = table
            .columns
            .iter()
            .map(|column| rewrite_schema(&column.data_type, source_schema, target_schema))
            .collect::<Vec<_>>();

        let batch_size = options
            .batch_size
            .unwrap_or(500)
            .clamp(1, BIND_LIMIT / table.columns.len().max(1));

        let mut copied = 0_u64;
        let mut chunk = Vec::<Vec<Option<String>>>::with_capacity(batch_size);
        let mut rows = sqlx::query(&select).fetch(pool);
        while let Some(row) = rows.try_next().await? {
            if options.cancel.is_cancelled() {
                return Err(SiloError::Cancelled);
            }

            let mut values = Vec::with_capacity(table.columns.len());
            for (index, column) in table.columns.iter().enumerate() {
                let value = row.try_get::<Option<String>, _>(index)?;
                let value = match rules.get(&column.name) {
                    None => value,
                    Some(AnonymizeRule::Null) => None,
                    Some(AnonymizeRule::Literal(literal)) => Some(literal.clone()),
                    Some(AnonymizeRule::Custom(rule)) => rule(value.as_deref()),
                };
                values.push(value);
            }
            chunk.push(values);

            if chunk.len() >= batch_size {
                copied += insert_chunk(pool, &insert_head, &casts, &mut chunk).await?;
                progress(ClonePhase::CopyingData {
                    table: table.name.clone(),
                    copied,
                    total,
                });
            }
        }
        if !chunk.is_empty() {
            copied += insert_chunk(pool, &insert_head, &casts, &mut chunk).await?;
        }
        progress(ClonePhase::CopyingData {
            table: table.name.clone(),
            copied,
            total,
        });

        Ok(copied)
    }
}

async fn copy_table(
    pool: &Pool<Postgres>,
    source_schema: &QuotedIdentifier,
    target_schema: &QuotedIdentifier,
    table: &TableIntrospection,
    progress: &impl Fn(ClonePhase),
) -> Result<u64, SiloError> {
    let table_name = quoted(&table.name);
    let total = count_rows(pool, source_schema, &table_name).await?;
    progress(ClonePhase::CopyingData {
        table: table.name.clone(),
        copied: 0,
        total,
    });

    let query = format!(
        "INSERT INTO {target_schema}.{table_name} SELECT * FROM {source_schema}.{table_name};"
    );
    let copied = pool.execute(query.as_str()).await?.rows_affected();

    progress(ClonePhase::CopyingData {
        table: table.name.clone(),
        copied,
        total,
    });
    Ok(copied)
}

async fn count_rows(
    pool: &Pool<Postgres>,
    schema: &QuotedIdentifier,
    table_name: &QuotedIdentifier,
) -> Result<u64, SiloError> {
    let query = format!("SELECT COUNT(*) FROM {schema}.{table_name};");
    let count = sqlx::query_scalar::<_, i64>(&query).fetch_one(pool).await?;
    Ok(count.max(0) as u64)
}

async fn insert_chunk(
    pool: &Pool<Postgres>,
    insert_head: &str,
    casts: &[String],
    chunk: &mut Vec<Vec<Option<String>>>,
) -> Result<u64, SiloError> {
    let mut builder = QueryBuilder::<Postgres>::new(insert_head);
    builder.push_values(chunk.drain(..), |mut row, values| {
        for (value, cast) in values.into_iter().zip(casts) {
            row.push_bind(value);
            row.push_unseparated(format!("::{cast}"));
        }
    });
    Ok(builder.build().execute(pool).await?.rows_affected())
}

/// Parents before children along foreign key edges.
///
/// Self references are ignored; a cycle between distinct tables is an
/// error naming the tables involved.
fn topological_order(
    introspection: &SchemaIntrospection,
) -> Result<Vec<&TableIntrospection>, SiloError> {
    let tables = introspection
        .tables
        .iter()
        .map(|table| (table.name.as_str(), table))
        .collect::<BTreeMap<_, _>>();

    let mut dependencies = tables
        .iter()
        .map(|(name, table)| {
            let parents = table
                .constraints
                .iter()
                .filter_map(|constraint| constraint.referenced_table())
                .filter(|parent| parent != name && tables.contains_key(parent.as_str()))
                .collect::<HashSet<_>>();
            (*name, parents)
        })
        .collect::<BTreeMap<_, _>>();

    let mut ordered = Vec::with_capacity(tables.len());
    while !dependencies.is_empty() {
        let ready = dependencies
            .iter()
            .filter(|(_, parents)| parents.is_empty())
            .map(|(name, _)| *name)
            .collect::<Vec<_>>();
        if ready.is_empty() {
            return Err(SiloError::ForeignKeyCycle {
                tables: dependencies.keys().map(|name| (*name).to_owned()).collect(),
            });
        }
        for name in ready {
            dependencies.remove(name);
            for parents in dependencies.values_mut() {
                parents.remove(name);
            }
            ordered.push(tables[name]);
        }
    }
    Ok(ordered)
}

fn create_table_ddl(
    table: &TableIntrospection,
    source_schema: &QuotedIdentifier,
    target_schema: &QuotedIdentifier,
) -> String {
    let columns = table
        .columns
        .iter()
        .map(|column| {
            let name = quoted(&column.name);
            let serial = column
                .default
                .as_deref()
                .map_or(false, |default| default.contains("nextval("));
            let mut line = if serial {
                // a serial column re-creates its own sequence in the target
                let data_type = match column.udt_name.as_str() {
                    "int2" => "smallserial",
                    "int8" => "bigserial",
                    _ => "serial",
                };
                format!("{name} {data_type}")
            } else {
                format!(
                    "{name} {}",
                    rewrite_schema(&column.data_type, source_schema, target_schema)
                )
            };
            if !column.nullable {
                line.push_str(" NOT NULL");
            }
            if !serial {
                if let Some(default) = &column.default {
                    line.push_str(" DEFAULT ");
                    line.push_str(&rewrite_schema(default, source_schema, target_schema));
                }
            }
            line
        })
        .join(",\n    ");

    let table_name = quoted(&table.name);
    format!("CREATE TABLE {target_schema}.{table_name} (\n    {columns}\n);")
}

fn rewrite_schema(text: &str, source: &QuotedIdentifier, target: &QuotedIdentifier) -> String {
    text.replace(&format!("{source}."), &format!("{target}."))
        .replace(
            &format!("{}.", source.as_unquoted_str()),
            &format!("{}.", target.as_unquoted_str()),
        )
}

fn quoted(name: &str) -> QuotedIdentifier {
    name.parse().unwrap_or_else(|_| {
        // introspected identifiers are already valid, the fallback only
        // exists to avoid a panic on exotic catalog content
        "invalid_identifier".parse().unwrap(/* literal is valid */)
    })
}

#[cfg(test)]
mod tests {
    use crate::drift::introspect::{ColumnIntrospection, ConstraintIntrospection, ConstraintKind};

    use super::*;

    fn table(name: &str, foreign_keys: &[&str]) -> TableIntrospection {
        TableIntrospection {
            name: name.into(),
            columns: vec![ColumnIntrospection {
                name: "id".into(),
                udt_name: "int4".into(),
                data_type: "integer".into(),
                nullable: false,
                default: None,
                ordinal: 1,
            }],
            indexes: Vec::new(),
            constraints: foreign_keys
                .iter()
                .map(|parent| ConstraintIntrospection {
                    name: format!("{name}_{parent}_fkey"),
                    kind: ConstraintKind::ForeignKey,
                    definition: format!("FOREIGN KEY (id) REFERENCES {parent}(id)"),
                })
                .collect(),
        }
    }

    fn schema(tables: Vec<TableIntrospection>) -> SchemaIntrospection {
        SchemaIntrospection {
            schema: "tenant_a".into(),
            tables,
        }
    }

    #[test]
    fn test_topological_order_puts_parents_first() {
        let introspection = schema(vec![
            table("orders", &["customers"]),
            table("customers", &[]),
            table("order_items", &["orders", "products"]),
            table("products", &[]),
        ]);

        let ordered = topological_order(&introspection)
            .unwrap()
            .iter()
            .map(|table| table.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ordered, ["customers", "products", "orders", "order_items"]);
    }

    #[test]
    fn test_self_reference_is_not_a_cycle() {
        let introspection = schema(vec![table("employees", &["employees"])]);
        assert_eq!(topological_order(&introspection).unwrap().len(), 1);
    }

    #[test]
    fn test_cycle_is_reported() {
        let introspection = schema(vec![table("a", &["b"]), table("b", &["a"])]);
        let error = topological_order(&introspection).unwrap_err();
        assert!(matches!(
            error,
            SiloError::ForeignKeyCycle { tables } if tables == ["a", "b"]
        ));
    }

    #[test]
    fn test_create_table_ddl_rewrites_schema_and_serials() {
        let table = TableIntrospection {
            name: "t".into(),
            columns: vec![
                ColumnIntrospection {
                    name: "id".into(),
                    udt_name: "int4".into(),
                    data_type: "integer".into(),
                    nullable: false,
                    default: Some("nextval('tenant_a.t_id_seq'::regclass)".into()),
                    ordinal: 1,
                },
                ColumnIntrospection {
                    name: "v".into(),
                    udt_name: "varchar".into(),
                    data_type: "character varying(255)".into(),
                    nullable: true,
                    default: Some("'x'::character varying".into()),
                    ordinal: 2,
                },
            ],
            indexes: Vec::new(),
            constraints: Vec::new(),
        };
        let source = "tenant_a".parse().unwrap();
        let target = "tenant_b".parse().unwrap();

        let ddl = create_table_ddl(&table, &source, &target);
        assert!(ddl.starts_with("CREATE TABLE \"tenant_b\".\"t\""));
        assert!(ddl.contains("\"id\" serial NOT NULL"));
        assert!(ddl.contains("\"v\" character varying(255) DEFAULT 'x'::character varying"));
        assert!(!ddl.contains("tenant_a"));
    }

    #[test]
    fn test_rewrite_schema_handles_quoted_and_bare() {
        let source = "tenant_a".parse().unwrap();
        let target = "tenant_b".parse().unwrap();
        assert_eq!(
            rewrite_schema("\"tenant_a\".t and tenant_a.t", &source, &target),
            "\"tenant_b\".t and tenant_b.t"
        );
    }
}

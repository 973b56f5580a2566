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

//! Structural introspection of one schema via `pg_catalog`.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use sqlx::{Pool, Postgres};
use tracing::debug;
use xayn_silo_shared::postgres::QuotedIdentifier;

use crate::error::SiloError;

#[derive(Clone, Debug, Serialize)]
pub struct SchemaIntrospection {
    pub schema: String,
    pub tables: Vec<TableIntrospection>,
}

impl SchemaIntrospection {
    pub fn table(&self, name: &str) -> Option<&TableIntrospection> {
        self.tables.iter().find(|table| table.name == name)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct TableIntrospection {
    pub name: String,
    pub columns: Vec<ColumnIntrospection>,
    pub indexes: Vec<IndexIntrospection>,
    pub constraints: Vec<ConstraintIntrospection>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ColumnIntrospection {
    pub name: String,
    /// `pg_type.typname`, e.g. `int4`, `varchar`.
    pub udt_name: String,
    /// Rendered type incl. modifiers, e.g. `character varying(255)`.
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub ordinal: i16,
}

#[derive(Clone, Debug, Serialize)]
pub struct IndexIntrospection {
    pub name: String,
    pub definition: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct ConstraintIntrospection {
    pub name: String,
    pub kind: ConstraintKind,
    pub definition: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    PrimaryKey,
    ForeignKey,
    Unique,
    Check,
}

impl ConstraintIntrospection {
    /// The table a foreign key points at, schema prefix stripped.
    pub(crate) fn referenced_table(&self) -> Option<String> {
        if self.kind != ConstraintKind::ForeignKey {
            return None;
        }
        let after = self.definition.split("REFERENCES ").nth(1)?;
        let target = after
            .split(|chr: char| chr == '(' || chr.is_whitespace())
            .next()?;
        let table = target.rsplit('.').next()?;
        Some(table.trim_matches('"').to_owned())
    }
}

/// Reads tables, columns and (optionally) indexes/constraints of one
/// schema. `exclude` filters tables by (unquoted) name.
pub(crate) async fn introspect_schema(
    pool: &Pool<Postgres>,
    schema: &QuotedIdentifier,
    include_indexes: bool,
    include_constraints: bool,
    exclude: &HashSet<String>,
) -> Result<SchemaIntrospection, SiloError> {
    let schema_name = schema.as_unquoted_str();
    let failed = |source| SiloError::IntrospectFailure {
        schema: schema_name.into(),
        source,
    };

    let table_names = sqlx::query_scalar::<_, String>(
        "SELECT c.relname
            FROM pg_catalog.pg_class c
            JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = $1 AND c.relkind = 'r'
            ORDER BY c.relname;",
    )
    .bind(schema_name)
    .fetch_all(pool)
    .await
    .map_err(failed)?;

    let mut tables = table_names
        .into_iter()
        .filter(|name| !exclude.contains(name))
        .map(|name| {
            (
                name.clone(),
                TableIntrospection {
                    name,
                    columns: Vec::new(),
                    indexes: Vec::new(),
                    constraints: Vec::new(),
                },
            )
        })
        .collect::<BTreeMap<_, _>>();

    let columns = sqlx::query_as::<_, (String, String, String, String, bool, Option<String>, i16)>(
        "SELECT c.relname,
                a.attname,
                t.typname,
                pg_catalog.format_type(a.atttypid, a.atttypmod),
                NOT a.attnotnull,
                pg_catalog.pg_get_expr(d.adbin, d.adrelid),
                a.attnum
            FROM pg_catalog.pg_attribute a
            JOIN pg_catalog.pg_class c ON c.oid = a.attrelid
            JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
            JOIN pg_catalog.pg_type t ON t.oid = a.atttypid
            LEFT JOIN pg_catalog.pg_attrdef d
                ON d.adrelid = a.attrelid AND d.adnum = a.attnum
            WHERE n.nspname = $1
                AND c.relkind = 'r'
                AND a.attnum > 0
                AND NOT a.attisdropped
            ORDER BY c.relname, a.attnum;",
    )
    .bind(schema_name)
    .fetch_all(pool)
    .await
    .map_err(failed)?;

    for (table, name, udt_name, data_type, nullable, default, ordinal) in columns {
        if let Some(table) = tables.get_mut(&table) {
            table.columns.push(ColumnIntrospection {
                name,
                udt_name,
                data_type,
                nullable,
                default,
                ordinal,
            });
        }
    }

    if include_indexes {
        let indexes = sqlx::query_as::<_, (String, String, String)>(
            "SELECT tablename, indexname, indexdef
                FROM pg_catalog.pg_indexes
                WHERE schemaname = $1
                ORDER BY indexname;",
        )
        .bind(schema_name)
        .fetch_all(pool)
        .await
        .map_err(failed)?;

        for (table, name, definition) in indexes {
            if let Some(table) = tables.get_mut(&table) {
                table.indexes.push(IndexIntrospection {
                    unique: definition.starts_with("CREATE UNIQUE INDEX"),
                    columns: parse_index_columns(&definition),
                    name,
                    definition,
                });
            }
        }
    }

    if include_constraints {
        let constraints = sqlx::query_as::<_, (String, String, i8, String)>(
            "SELECT rel.relname, con.conname, con.contype, pg_catalog.pg_get_constraintdef(con.oid)
                FROM pg_catalog.pg_constraint con
                JOIN pg_catalog.pg_class rel ON rel.oid = con.conrelid
                JOIN pg_catalog.pg_namespace nsp ON nsp.oid = rel.relnamespace
                WHERE nsp.nspname = $1
                ORDER BY con.conname;",
        )
        .bind(schema_name)
        .fetch_all(pool)
        .await
        .map_err(failed)?;

        for (table, name, kind, definition) in constraints {
            let Some(kind) = constraint_kind(kind) else {
                debug!({ constraint = %name }, "skipping unsupported constraint type");
                continue;
            };
            if let Some(table) = tables.get_mut(&table) {
                table.constraints.push(ConstraintIntrospection {
                    name,
                    kind,
                    definition,
                });
            }
        }
    }

    Ok(SchemaIntrospection {
        schema: schema_name.into(),
        tables: tables.into_values().collect(),
    })
}

fn constraint_kind(contype: i8) -> Option<ConstraintKind> {
    match contype as u8 {
        b'p' => Some(ConstraintKind::PrimaryKey),
        b'f' => Some(ConstraintKind::ForeignKey),
        b'u' => Some(ConstraintKind::Unique),
        b'c' => Some(ConstraintKind::Check),
        _ => None,
    }
}

/// Columns named in an index definition; expressions are kept verbatim.
fn parse_index_columns(definition: &str) -> Vec<String> {
    let Some(start) = definition.find('(') else {
        return Vec::new();
    };
    let Some(end) = definition.rfind(')') else {
        return Vec::new();
    };
    if end <= start {
        return Vec::new();
    }
    definition[start + 1..end]
        .split(',')
        .map(|column| column.trim().trim_matches('"').to_owned())
        .filter(|column| !column.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_index_columns() {
        assert_eq!(
            parse_index_columns(
                "CREATE UNIQUE INDEX t_pkey ON tenant_a.t USING btree (id, \"camelCase\")"
            ),
            ["id", "camelCase"]
        );
        assert_eq!(
            parse_index_columns("CREATE INDEX broken ON t"),
            Vec::<String>::new()
        );
    }

    #[test]
    fn test_referenced_table_parsing() {
        let constraint = ConstraintIntrospection {
            name: "orders_customer_fkey".into(),
            kind: ConstraintKind::ForeignKey,
            definition: "FOREIGN KEY (customer_id) REFERENCES \"tenant_a\".customers(id)".into(),
        };
        assert_eq!(constraint.referenced_table().as_deref(), Some("customers"));

        let unqualified = ConstraintIntrospection {
            definition: "FOREIGN KEY (customer_id) REFERENCES customers(id)".into(),
            ..constraint.clone()
        };
        assert_eq!(unqualified.referenced_table().as_deref(), Some("customers"));

        let check = ConstraintIntrospection {
            name: "positive".into(),
            kind: ConstraintKind::Check,
            definition: "CHECK (amount > 0)".into(),
        };
        assert_eq!(check.referenced_table(), None);
    }
}

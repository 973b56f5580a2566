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

//! Bookkeeping table formats and their detection.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use sqlx::{Pool, Postgres};
use tracing::warn;
use xayn_silo_shared::postgres::QuotedIdentifier;

use crate::{error::SiloError, migration::MigrationFile};

/// Column layout of a bookkeeping table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TableFormat {
    /// `name VARCHAR(255) UNIQUE` + `applied_at TIMESTAMPTZ`.
    Name,
    /// `hash TEXT` + `applied_at TIMESTAMPTZ`.
    Hash,
    /// `hash TEXT` + `created_at BIGINT` (epoch millis), drizzle-kit compatible.
    DrizzleKit,
}

impl TableFormat {
    pub(crate) fn identifier_column(&self) -> &'static str {
        match self {
            TableFormat::Name => "name",
            TableFormat::Hash | TableFormat::DrizzleKit => "hash",
        }
    }

    /// The value tracked for a migration under this format.
    pub(crate) fn identifier_of<'a>(&self, migration: &'a MigrationFile) -> &'a str {
        match self {
            TableFormat::Name => &migration.name,
            TableFormat::Hash | TableFormat::DrizzleKit => &migration.hash,
        }
    }

    /// Whether a migration counts as applied given the tracked identifiers.
    ///
    /// Hash keyed tables additionally accept rows keyed by name; tables
    /// converted from the name format stay recognized.
    pub(crate) fn is_applied(
        &self,
        migration: &MigrationFile,
        applied: &std::collections::HashSet<String>,
    ) -> bool {
        match self {
            TableFormat::Name => applied.contains(&migration.name),
            TableFormat::Hash | TableFormat::DrizzleKit => {
                applied.contains(&migration.hash) || applied.contains(&migration.name)
            }
        }
    }
}

impl Display for TableFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TableFormat::Name => "name",
            TableFormat::Hash => "hash",
            TableFormat::DrizzleKit => "drizzle-kit",
        })
    }
}

/// Configured format handling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FormatPolicy {
    /// Use whatever the table uses, fall back to the configured default.
    #[default]
    Auto,
    Name,
    Hash,
    DrizzleKit,
}

impl FormatPolicy {
    pub(crate) fn fixed(&self) -> Option<TableFormat> {
        match self {
            FormatPolicy::Auto => None,
            FormatPolicy::Name => Some(TableFormat::Name),
            FormatPolicy::Hash => Some(TableFormat::Hash),
            FormatPolicy::DrizzleKit => Some(TableFormat::DrizzleKit),
        }
    }
}

/// Looks up the bookkeeping table's columns and classifies its format.
///
/// Returns `None` if the table does not exist.
pub(crate) async fn detect_format(
    pool: &Pool<Postgres>,
    schema: &QuotedIdentifier,
    table: &QuotedIdentifier,
) -> Result<Option<TableFormat>, SiloError> {
    let columns = sqlx::query_as::<_, (String, String)>(
        "SELECT column_name, data_type
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2;",
    )
    .bind(schema.as_unquoted_str())
    .bind(table.as_unquoted_str())
    .fetch_all(pool)
    .await?;

    if columns.is_empty() {
        return Ok(None);
    }

    classify_columns(&columns)
        .map(Some)
        .ok_or_else(|| SiloError::FormatUnknown {
            schema: schema.as_unquoted_str().into(),
            table: table.as_unquoted_str().into(),
        })
}

/// Classification over `(column_name, data_type)` pairs.
///
/// Refuses to guess: an existing table which matches none of the known
/// layouts yields `None`.
pub(crate) fn classify_columns(columns: &[(String, String)]) -> Option<TableFormat> {
    let type_of = |name: &str| {
        columns
            .iter()
            .find_map(|(column, data_type)| (column == name).then_some(data_type.as_str()))
    };
    let has_timestamp = |name: &str| type_of(name).map_or(false, |ty| ty.starts_with("timestamp"));

    if type_of("name").is_some() && has_timestamp("applied_at") {
        Some(TableFormat::Name)
    } else if type_of("hash").is_some() && type_of("created_at") == Some("bigint") {
        Some(TableFormat::DrizzleKit)
    } else if type_of("hash").is_some() && has_timestamp("applied_at") {
        Some(TableFormat::Hash)
    } else {
        None
    }
}

/// Picks the format to operate under.
///
/// An existing table always wins over the configured format: we never
/// write rows a table's actual layout can't hold.
pub(crate) fn resolve_format(
    policy: FormatPolicy,
    detected: Option<TableFormat>,
    default_format: TableFormat,
    schema: &QuotedIdentifier,
) -> TableFormat {
    match (detected, policy.fixed()) {
        (Some(found), Some(fixed)) => {
            if found != fixed {
                warn!(
                    { schema = %schema, configured = %fixed, actual = %found },
                    "configured table format differs from the existing table, using the existing one",
                );
            }
            found
        }
        (Some(found), None) => found,
        (None, Some(fixed)) => fixed,
        (None, None) => default_format,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(column, data_type)| (column.to_string(), data_type.to_string()))
            .collect()
    }

    #[test]
    fn test_classify_name_format() {
        let columns = columns(&[
            ("id", "integer"),
            ("name", "character varying"),
            ("applied_at", "timestamp with time zone"),
        ]);
        assert_eq!(classify_columns(&columns), Some(TableFormat::Name));
    }

    #[test]
    fn test_classify_hash_format() {
        let columns = columns(&[
            ("id", "integer"),
            ("hash", "text"),
            ("applied_at", "timestamp with time zone"),
        ]);
        assert_eq!(classify_columns(&columns), Some(TableFormat::Hash));
    }

    #[test]
    fn test_classify_drizzle_kit_format() {
        let columns = columns(&[("id", "integer"), ("hash", "text"), ("created_at", "bigint")]);
        assert_eq!(classify_columns(&columns), Some(TableFormat::DrizzleKit));
    }

    #[test]
    fn test_classify_refuses_to_guess() {
        let columns = columns(&[("id", "integer"), ("version", "text")]);
        assert_eq!(classify_columns(&columns), None);
    }

    #[test]
    fn test_existing_format_wins_over_fixed_config() {
        let schema = "tenant_acme".parse().unwrap();
        let resolved = resolve_format(
            FormatPolicy::Name,
            Some(TableFormat::DrizzleKit),
            TableFormat::Name,
            &schema,
        );
        assert_eq!(resolved, TableFormat::DrizzleKit);
    }

    #[test]
    fn test_auto_without_table_uses_default() {
        let schema = "tenant_acme".parse().unwrap();
        let resolved = resolve_format(FormatPolicy::Auto, None, TableFormat::Name, &schema);
        assert_eq!(resolved, TableFormat::Name);
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(
            serde_json::to_string(&TableFormat::DrizzleKit).unwrap(),
            "\"drizzle-kit\""
        );
        assert_eq!(
            serde_json::from_str::<FormatPolicy>("\"auto\"").unwrap(),
            FormatPolicy::Auto
        );
    }
}

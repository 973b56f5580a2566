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

//! Pure comparison of two introspected schemas.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::drift::introspect::{SchemaIntrospection, TableIntrospection};

#[derive(Clone, Debug, Serialize)]
pub struct TableDrift {
    pub name: String,
    pub status: TableDriftStatus,
    pub column_diffs: Vec<ColumnDiff>,
    pub index_diffs: Vec<DefinitionDiff>,
    pub constraint_diffs: Vec<DefinitionDiff>,
}

impl TableDrift {
    pub fn issue_count(&self) -> usize {
        match self.status {
            TableDriftStatus::Missing | TableDriftStatus::Extra => 1,
            TableDriftStatus::Ok | TableDriftStatus::Drifted => {
                self.column_diffs.len() + self.index_diffs.len() + self.constraint_diffs.len()
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableDriftStatus {
    Ok,
    /// Present in the reference, absent in the tenant.
    Missing,
    /// Present in the tenant, unknown to the reference.
    Extra,
    Drifted,
}

#[derive(Clone, Debug, Serialize)]
pub struct ColumnDiff {
    pub column: String,
    pub kind: ColumnDiffKind,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub description: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnDiffKind {
    Missing,
    Extra,
    TypeMismatch,
    NullableMismatch,
    DefaultMismatch,
}

#[derive(Clone, Debug, Serialize)]
pub struct DefinitionDiff {
    pub name: String,
    pub kind: DefinitionDiffKind,
    pub expected: Option<String>,
    pub actual: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionDiffKind {
    Missing,
    Extra,
    DefinitionMismatch,
}

/// Compares a tenant schema against the reference, table by table.
pub(crate) fn compare_schemas(
    reference: &SchemaIntrospection,
    actual: &SchemaIntrospection,
    include_indexes: bool,
    include_constraints: bool,
) -> Vec<TableDrift> {
    let names = reference
        .tables
        .iter()
        .chain(&actual.tables)
        .map(|table| table.name.clone())
        .collect::<BTreeSet<_>>();

    names
        .into_iter()
        .map(|name| {
            match (reference.table(&name), actual.table(&name)) {
                (Some(_), None) => empty_drift(name, TableDriftStatus::Missing),
                (None, Some(_)) => empty_drift(name, TableDriftStatus::Extra),
                (Some(expected), Some(found)) => compare_tables(
                    expected,
                    found,
                    &reference.schema,
                    &actual.schema,
                    include_indexes,
                    include_constraints,
                ),
                (None, None) => unreachable!(/* name came from one of the two sides */),
            }
        })
        .collect()
}

fn empty_drift(name: String, status: TableDriftStatus) -> TableDrift {
    TableDrift {
        name,
        status,
        column_diffs: Vec::new(),
        index_diffs: Vec::new(),
        constraint_diffs: Vec::new(),
    }
}

fn compare_tables(
    expected: &TableIntrospection,
    actual: &TableIntrospection,
    expected_schema: &str,
    actual_schema: &str,
    include_indexes: bool,
    include_constraints: bool,
) -> TableDrift {
    let mut drift = empty_drift(expected.name.clone(), TableDriftStatus::Ok);

    for column in &expected.columns {
        let Some(found) = actual
            .columns
            .iter()
            .find(|candidate| candidate.name == column.name)
        else {
            drift.column_diffs.push(ColumnDiff {
                column: column.name.clone(),
                kind: ColumnDiffKind::Missing,
                expected: Some(column.data_type.clone()),
                actual: None,
                description: format!("column {} is missing", column.name),
            });
            continue;
        };

        // exact equality on the udt; precision/scale modifiers show up in
        // the rendered type, so both comparisons feed the same diff kind
        if column.udt_name != found.udt_name || column.data_type != found.data_type {
            drift.column_diffs.push(ColumnDiff {
                column: column.name.clone(),
                kind: ColumnDiffKind::TypeMismatch,
                expected: Some(column.data_type.clone()),
                actual: Some(found.data_type.clone()),
                description: format!(
                    "column {} is {} but should be {}",
                    column.name, found.data_type, column.data_type,
                ),
            });
        }
        if column.nullable != found.nullable {
            drift.column_diffs.push(ColumnDiff {
                column: column.name.clone(),
                kind: ColumnDiffKind::NullableMismatch,
                expected: Some(nullability(column.nullable).into()),
                actual: Some(nullability(found.nullable).into()),
                description: format!(
                    "column {} is {} but should be {}",
                    column.name,
                    nullability(found.nullable),
                    nullability(column.nullable),
                ),
            });
        }
        let expected_default = normalized_default(column.default.as_deref(), expected_schema);
        let actual_default = normalized_default(found.default.as_deref(), actual_schema);
        if expected_default != actual_default {
            drift.column_diffs.push(ColumnDiff {
                column: column.name.clone(),
                kind: ColumnDiffKind::DefaultMismatch,
                expected: column.default.clone(),
                actual: found.default.clone(),
                description: format!("column {} has a different default", column.name),
            });
        }
    }
    for column in &actual.columns {
        if !expected
            .columns
            .iter()
            .any(|candidate| candidate.name == column.name)
        {
            drift.column_diffs.push(ColumnDiff {
                column: column.name.clone(),
                kind: ColumnDiffKind::Extra,
                expected: None,
                actual: Some(column.data_type.clone()),
                description: format!("column {} is not in the reference", column.name),
            });
        }
    }

    if include_indexes {
        drift.index_diffs = compare_definitions(
            expected
                .indexes
                .iter()
                .map(|index| (index.name.as_str(), index.definition.as_str())),
            actual
                .indexes
                .iter()
                .map(|index| (index.name.as_str(), index.definition.as_str())),
            expected_schema,
            actual_schema,
        );
    }
    if include_constraints {
        drift.constraint_diffs = compare_definitions(
            expected
                .constraints
                .iter()
                .map(|constraint| (constraint.name.as_str(), constraint.definition.as_str())),
            actual
                .constraints
                .iter()
                .map(|constraint| (constraint.name.as_str(), constraint.definition.as_str())),
            expected_schema,
            actual_schema,
        );
    }

    if drift.issue_count() > 0 {
        drift.status = TableDriftStatus::Drifted;
    }
    drift
}

fn compare_definitions<'a>(
    expected: impl Iterator<Item = (&'a str, &'a str)>,
    actual: impl Iterator<Item = (&'a str, &'a str)>,
    expected_schema: &str,
    actual_schema: &str,
) -> Vec<DefinitionDiff> {
    let expected = expected.collect::<Vec<_>>();
    let actual = actual.collect::<Vec<_>>();
    let mut diffs = Vec::new();

    for (name, definition) in &expected {
        match actual.iter().find(|(candidate, _)| candidate == name) {
            None => diffs.push(DefinitionDiff {
                name: (*name).to_owned(),
                kind: DefinitionDiffKind::Missing,
                expected: Some((*definition).to_owned()),
                actual: None,
            }),
            Some((_, found)) => {
                if canonicalize_definition(definition, expected_schema)
                    != canonicalize_definition(found, actual_schema)
                {
                    diffs.push(DefinitionDiff {
                        name: (*name).to_owned(),
                        kind: DefinitionDiffKind::DefinitionMismatch,
                        expected: Some((*definition).to_owned()),
                        actual: Some((*found).to_owned()),
                    });
                }
            }
        }
    }
    for (name, definition) in &actual {
        if !expected.iter().any(|(candidate, _)| candidate == name) {
            diffs.push(DefinitionDiff {
                name: (*name).to_owned(),
                kind: DefinitionDiffKind::Extra,
                expected: None,
                actual: Some((*definition).to_owned()),
            });
        }
    }

    diffs
}

fn nullability(nullable: bool) -> &'static str {
    if nullable {
        "nullable"
    } else {
        "not null"
    }
}

/// Strips the schema prefix and collapses whitespace so definitions from
/// different schemas compare structurally.
pub(crate) fn canonicalize_definition(definition: &str, schema: &str) -> String {
    definition
        .replace(&format!("\"{schema}\"."), "")
        .replace(&format!("{schema}."), "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn normalized_default(default: Option<&str>, schema: &str) -> Option<String> {
    default.map(|default| canonicalize_definition(default, schema))
}

#[cfg(test)]
mod tests {
    use crate::drift::introspect::ColumnIntrospection;

    use super::*;

    fn column(name: &str, udt: &str, data_type: &str, nullable: bool) -> ColumnIntrospection {
        ColumnIntrospection {
            name: name.into(),
            udt_name: udt.into(),
            data_type: data_type.into(),
            nullable,
            default: None,
            ordinal: 0,
        }
    }

    fn table(name: &str, columns: Vec<ColumnIntrospection>) -> TableIntrospection {
        TableIntrospection {
            name: name.into(),
            columns,
            indexes: Vec::new(),
            constraints: Vec::new(),
        }
    }

    fn schema(name: &str, tables: Vec<TableIntrospection>) -> SchemaIntrospection {
        SchemaIntrospection {
            schema: name.into(),
            tables,
        }
    }

    #[test]
    fn test_drift_against_self_is_empty() {
        let introspection = schema(
            "tenant_a",
            vec![table(
                "t",
                vec![
                    column("id", "int4", "integer", false),
                    column("v", "text", "text", true),
                ],
            )],
        );

        let drifts = compare_schemas(&introspection, &introspection, true, true);
        assert_eq!(drifts.len(), 1);
        assert_eq!(drifts[0].status, TableDriftStatus::Ok);
        assert_eq!(drifts[0].issue_count(), 0);
    }

    #[test]
    fn test_missing_and_extra_tables() {
        let reference = schema("tenant_a", vec![table("only_in_reference", Vec::new())]);
        let actual = schema("tenant_b", vec![table("only_in_tenant", Vec::new())]);

        let drifts = compare_schemas(&reference, &actual, true, true);
        assert_eq!(drifts.len(), 2);
        assert_eq!(drifts[0].name, "only_in_reference");
        assert_eq!(drifts[0].status, TableDriftStatus::Missing);
        assert_eq!(drifts[1].status, TableDriftStatus::Extra);
    }

    #[test]
    fn test_column_diff_kinds() {
        let reference = schema(
            "tenant_a",
            vec![table(
                "t",
                vec![
                    column("id", "int4", "integer", false),
                    column("price", "numeric", "numeric(10,2)", false),
                    column("gone", "text", "text", true),
                ],
            )],
        );
        let actual = schema(
            "tenant_b",
            vec![table(
                "t",
                vec![
                    column("id", "int4", "integer", true),
                    column("price", "numeric", "numeric(12,2)", false),
                    column("added", "text", "text", true),
                ],
            )],
        );

        let drifts = compare_schemas(&reference, &actual, true, true);
        let kinds = drifts[0]
            .column_diffs
            .iter()
            .map(|diff| diff.kind)
            .collect::<Vec<_>>();
        assert_eq!(
            kinds,
            [
                ColumnDiffKind::NullableMismatch,
                ColumnDiffKind::TypeMismatch,
                ColumnDiffKind::Missing,
                ColumnDiffKind::Extra,
            ]
        );
        assert_eq!(drifts[0].status, TableDriftStatus::Drifted);
    }

    #[test]
    fn test_index_definitions_compare_canonicalized() {
        let mut reference_table = table("t", Vec::new());
        reference_table.indexes.push(crate::drift::introspect::IndexIntrospection {
            name: "t_v_idx".into(),
            definition: "CREATE INDEX t_v_idx ON \"tenant_a\".t  USING btree (v)".into(),
            columns: vec!["v".into()],
            unique: false,
        });
        let mut actual_table = table("t", Vec::new());
        actual_table.indexes.push(crate::drift::introspect::IndexIntrospection {
            name: "t_v_idx".into(),
            definition: "CREATE INDEX t_v_idx ON tenant_b.t USING btree (v)".into(),
            columns: vec!["v".into()],
            unique: false,
        });

        let reference = schema("tenant_a", vec![reference_table]);
        let actual = schema("tenant_b", vec![actual_table]);

        let drifts = compare_schemas(&reference, &actual, true, true);
        assert!(drifts[0].index_diffs.is_empty());
        assert_eq!(drifts[0].status, TableDriftStatus::Ok);
    }

    #[test]
    fn test_canonicalize_definition() {
        assert_eq!(
            canonicalize_definition(
                "CREATE INDEX  x ON \"tenant_a\".t USING btree\n  (v)",
                "tenant_a",
            ),
            "CREATE INDEX x ON t USING btree (v)"
        );
    }
}

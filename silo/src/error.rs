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

use displaydoc::Display;
use serde::Serialize;
use thiserror::Error;
use xayn_silo_shared::{postgres::InvalidQuotedIdentifier, tenant::TenantId};

/// Failures surfaced by the toolkit.
///
/// Batch operations never propagate these past the per-tenant boundary,
/// instead each per-tenant result carries the rendered error plus its
/// [`ErrorKind`].
#[derive(Debug, Display, Error)]
pub enum SiloError {
    /// configuration is invalid: {0}
    ConfigInvalid(String),
    /// used after dispose() was called
    Disposed,
    /// unknown tenant: {tenant_id}
    TenantNotFound { tenant_id: TenantId },
    /// tenant already exists: {tenant_id}
    TenantAlreadyExists { tenant_id: TenantId },
    /// no usable pool for tenant {tenant_id}: {reason}
    PoolUnavailable { tenant_id: TenantId, reason: String },
    /// migration {migration} failed: {source}
    SqlFailure {
        migration: String,
        #[source]
        source: sqlx::Error,
    },
    /// bookkeeping table {table} in schema {schema} has an unrecognized column layout
    FormatUnknown { schema: String, table: String },
    /// failed to introspect schema {schema}: {source}
    IntrospectFailure {
        schema: String,
        #[source]
        source: sqlx::Error,
    },
    /// migrations folder holds more than one migration named {name}
    DuplicateMigration { name: String },
    /// failed to read migrations from {path}: {source}
    MigrationsUnreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// schema name derived for tenant {tenant_id} is not a valid identifier: {source}
    InvalidSchemaName {
        tenant_id: TenantId,
        #[source]
        source: InvalidQuotedIdentifier,
    },
    /// foreign keys between tables form a cycle: {tables:?}
    ForeignKeyCycle { tables: Vec<String> },
    /// operation was cancelled
    Cancelled,
    /// {0}
    Database(#[from] sqlx::Error),
    /// {0}
    Other(#[from] anyhow::Error),
}

/// Machine readable classification of a [`SiloError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigInvalid,
    Disposed,
    TenantNotFound,
    TenantAlreadyExists,
    PoolUnavailable,
    ConnectFailure,
    SqlFailure,
    FormatUnknown,
    IntrospectFailure,
    InvalidMigrations,
    InvalidSchemaName,
    ForeignKeyCycle,
    Cancelled,
    Internal,
}

impl SiloError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SiloError::ConfigInvalid(_) => ErrorKind::ConfigInvalid,
            SiloError::Disposed => ErrorKind::Disposed,
            SiloError::TenantNotFound { .. } => ErrorKind::TenantNotFound,
            SiloError::TenantAlreadyExists { .. } => ErrorKind::TenantAlreadyExists,
            SiloError::PoolUnavailable { .. } => ErrorKind::PoolUnavailable,
            SiloError::SqlFailure { .. } => ErrorKind::SqlFailure,
            SiloError::FormatUnknown { .. } => ErrorKind::FormatUnknown,
            SiloError::IntrospectFailure { .. } => ErrorKind::IntrospectFailure,
            SiloError::DuplicateMigration { .. } | SiloError::MigrationsUnreadable { .. } => {
                ErrorKind::InvalidMigrations
            }
            SiloError::InvalidSchemaName { .. } => ErrorKind::InvalidSchemaName,
            SiloError::ForeignKeyCycle { .. } => ErrorKind::ForeignKeyCycle,
            SiloError::Cancelled => ErrorKind::Cancelled,
            SiloError::Database(error) => {
                if xayn_silo_shared::postgres::is_transient_error(error) {
                    ErrorKind::ConnectFailure
                } else {
                    ErrorKind::Internal
                }
            }
            SiloError::Other(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::TenantAlreadyExists).unwrap(),
            "\"tenant_already_exists\""
        );
    }

    #[test]
    fn test_transient_database_errors_classify_as_connect_failure() {
        let error = SiloError::Database(sqlx::Error::PoolTimedOut);
        assert_eq!(error.kind(), ErrorKind::ConnectFailure);
    }
}

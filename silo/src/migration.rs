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

//! Loading, tracking and applying of SQL migrations.

pub mod batch;
pub mod executor;
pub mod format;
pub mod loader;
pub mod shared;

use std::{path::PathBuf, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use xayn_silo_shared::{serde::serde_duration_as_millis, tenant::TenantId};

use crate::error::{ErrorKind, SiloError};
use self::batch::TenantOperationResult;
pub use self::{
    batch::{BatchOptions, BatchPhase, BatchSummary, ErrorDisposition, ErrorHook, ProgressHook},
    executor::MigrateOptions,
    format::{FormatPolicy, TableFormat},
};

/// One SQL file from the migrations folder.
#[derive(Clone, Debug)]
pub struct MigrationFile {
    /// File name without the `.sql` extension.
    pub name: String,
    pub path: PathBuf,
    pub sql: String,
    /// Leading integer of the file name, `0` if there is none.
    pub sequence: u64,
    /// Lowercase hex sha256 of the file content.
    pub hash: String,
}

/// One row of a bookkeeping table.
#[derive(Clone, Debug, Serialize)]
pub struct AppliedMigration {
    pub id: i32,
    /// Migration name or content hash, depending on the table format.
    pub identifier: String,
    /// `None` if the tracking row has no usable timestamp.
    pub applied_at: Option<DateTime<Utc>>,
}

/// What `migrate` / `mark_as_applied` did to one tenant.
#[derive(Clone, Debug, Serialize)]
pub struct TenantMigrationResult {
    pub tenant_id: TenantId,
    pub schema: String,
    pub success: bool,
    pub skipped: bool,
    pub dry_run: bool,
    pub format: Option<TableFormat>,
    /// Names applied (or recorded) by this run, in order.
    pub applied: Vec<String>,
    /// Names that were pending when the run started.
    pub pending: Vec<String>,
    pub failed_migration: Option<String>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    #[serde(with = "serde_duration_as_millis")]
    pub duration: Duration,
}

impl TenantMigrationResult {
    pub(crate) fn failure(tenant_id: TenantId, schema: String, error: &SiloError) -> Self {
        Self {
            tenant_id,
            schema,
            success: false,
            skipped: false,
            dry_run: false,
            format: None,
            applied: Vec::new(),
            pending: Vec::new(),
            failed_migration: None,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            duration: Duration::ZERO,
        }
    }
}

impl TenantOperationResult for TenantMigrationResult {
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

/// Migration state of one tenant, computed without mutating anything.
#[derive(Clone, Debug, Serialize)]
pub struct TenantStatus {
    pub tenant_id: TenantId,
    pub schema: String,
    /// `None` iff the bookkeeping table does not exist.
    pub format: Option<TableFormat>,
    pub applied_count: usize,
    pub pending_count: usize,
    pub pending: Vec<String>,
    pub state: TenantState,
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantState {
    Ok,
    Behind,
    Error,
}

impl TenantOperationResult for TenantStatus {
    fn is_success(&self) -> bool {
        self.state != TenantState::Error
    }

    fn is_skipped(&self) -> bool {
        false
    }

    fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn from_error(tenant_id: TenantId, error: &SiloError) -> Self {
        Self {
            tenant_id,
            schema: String::new(),
            format: None,
            applied_count: 0,
            pending_count: 0,
            pending: Vec::new(),
            state: TenantState::Error,
            error: Some(error.to_string()),
        }
    }

    fn from_skipped(tenant_id: TenantId) -> Self {
        Self::from_error(tenant_id, &SiloError::Cancelled)
    }
}

/// Aggregated [`TenantStatus`] over a tenant set.
#[derive(Clone, Debug, Serialize)]
pub struct MigrationStatus {
    pub total: usize,
    pub ok: usize,
    pub behind: usize,
    pub error: usize,
    pub tenants: Vec<TenantStatus>,
    #[serde(with = "serde_duration_as_millis")]
    pub duration: Duration,
}

/// What `migrate_shared` / `mark_shared_as_applied` did to the shared schema.
#[derive(Clone, Debug, Serialize)]
pub struct SharedMigrationResult {
    pub schema: String,
    pub success: bool,
    pub dry_run: bool,
    pub format: Option<TableFormat>,
    pub applied: Vec<String>,
    pub pending: Vec<String>,
    pub failed_migration: Option<String>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    #[serde(with = "serde_duration_as_millis")]
    pub duration: Duration,
}

impl SharedMigrationResult {
    pub(crate) fn failure(schema: String, dry_run: bool, error: &SiloError) -> Self {
        Self {
            schema,
            success: false,
            dry_run,
            format: None,
            applied: Vec::new(),
            pending: Vec::new(),
            failed_migration: None,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            duration: Duration::ZERO,
        }
    }
}

/// Migration state of the shared schema.
#[derive(Clone, Debug, Serialize)]
pub struct SharedStatus {
    pub schema: String,
    pub format: Option<TableFormat>,
    pub applied_count: usize,
    pub pending_count: usize,
    pub pending: Vec<String>,
    pub state: TenantState,
    pub error: Option<String>,
}

/// Result of `migrate_all_with_shared`.
///
/// A failed shared migration does *not* cancel the tenant batch, both
/// results are reported and the caller decides.
#[derive(Clone, Debug, Serialize)]
pub struct SharedAndTenantsResult {
    pub shared: SharedMigrationResult,
    pub tenants: BatchSummary<TenantMigrationResult>,
}

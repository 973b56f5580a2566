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

//! Caller supplied lifecycle hooks.
//!
//! Hooks are plain function values, they must not capture the [`Silo`]
//! they are registered on. They are called synchronously from whichever
//! component fires them; a panicking hook is caught and logged but never
//! aborts the surrounding operation.
//!
//! [`Silo`]: crate::Silo

use std::{
    fmt::{self, Debug},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};

use tracing::error;
use xayn_silo_shared::tenant::TenantId;

use crate::{error::SiloError, migration::TenantMigrationResult};

pub type PoolHook = Arc<dyn Fn(&TenantId) + Send + Sync>;
pub type PoolErrorHook = Arc<dyn Fn(Option<&TenantId>, &SiloError) + Send + Sync>;
pub type BeforeTenantHook = Arc<dyn Fn(&TenantId) + Send + Sync>;
pub type AfterTenantHook = Arc<dyn Fn(&TenantMigrationResult) + Send + Sync>;
pub type BeforeMigrationHook = Arc<dyn Fn(&TenantId, &str) + Send + Sync>;
pub type AfterMigrationHook = Arc<dyn Fn(&TenantId, &str, Duration) + Send + Sync>;

#[derive(Clone, Default)]
pub struct Hooks {
    pub on_pool_created: Option<PoolHook>,
    pub on_pool_evicted: Option<PoolHook>,
    pub on_pool_error: Option<PoolErrorHook>,
    pub before_tenant: Option<BeforeTenantHook>,
    pub after_tenant: Option<AfterTenantHook>,
    pub before_migration: Option<BeforeMigrationHook>,
    pub after_migration: Option<AfterMigrationHook>,
}

impl Hooks {
    pub(crate) fn fire_pool_created(&self, tenant_id: &TenantId) {
        if let Some(hook) = &self.on_pool_created {
            guarded("on_pool_created", || hook(tenant_id));
        }
    }

    pub(crate) fn fire_pool_evicted(&self, tenant_id: &TenantId) {
        if let Some(hook) = &self.on_pool_evicted {
            guarded("on_pool_evicted", || hook(tenant_id));
        }
    }

    pub(crate) fn fire_pool_error(&self, tenant_id: Option<&TenantId>, error: &SiloError) {
        if let Some(hook) = &self.on_pool_error {
            guarded("on_pool_error", || hook(tenant_id, error));
        }
    }

    pub(crate) fn fire_before_tenant(&self, tenant_id: &TenantId) {
        if let Some(hook) = &self.before_tenant {
            guarded("before_tenant", || hook(tenant_id));
        }
    }

    pub(crate) fn fire_after_tenant(&self, result: &TenantMigrationResult) {
        if let Some(hook) = &self.after_tenant {
            guarded("after_tenant", || hook(result));
        }
    }

    pub(crate) fn fire_before_migration(&self, tenant_id: &TenantId, migration: &str) {
        if let Some(hook) = &self.before_migration {
            guarded("before_migration", || hook(tenant_id, migration));
        }
    }

    pub(crate) fn fire_after_migration(
        &self,
        tenant_id: &TenantId,
        migration: &str,
        duration: Duration,
    ) {
        if let Some(hook) = &self.after_migration {
            guarded("after_migration", || hook(tenant_id, migration, duration));
        }
    }
}

pub(crate) fn guarded(hook: &str, call: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(call)).is_err() {
        error!({ hook }, "lifecycle hook panicked");
    }
}

impl Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn set(hook: &Option<impl Sized>) -> &'static str {
            if hook.is_some() {
                "set"
            } else {
                "unset"
            }
        }
        f.debug_struct("Hooks")
            .field("on_pool_created", &set(&self.on_pool_created))
            .field("on_pool_evicted", &set(&self.on_pool_evicted))
            .field("on_pool_error", &set(&self.on_pool_error))
            .field("before_tenant", &set(&self.before_tenant))
            .field("after_tenant", &set(&self.after_tenant))
            .field("before_migration", &set(&self.before_migration))
            .field("after_migration", &set(&self.after_migration))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_panicking_hook_is_contained() {
        let hooks = Hooks {
            on_pool_created: Some(Arc::new(|_| panic!("boom"))),
            ..Hooks::default()
        };
        hooks.fire_pool_created(&"acme".parse().unwrap());
    }

    #[test]
    fn test_hooks_fire_with_arguments() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let hooks = Hooks {
            after_migration: Some(Arc::new(|tenant_id, migration, _duration| {
                assert_eq!(tenant_id.to_string(), "acme");
                assert_eq!(migration, "0001_init");
                CALLS.fetch_add(1, Ordering::Relaxed);
            })),
            ..Hooks::default()
        };
        hooks.fire_after_migration(&"acme".parse().unwrap(), "0001_init", Duration::ZERO);
        assert_eq!(CALLS.load(Ordering::Relaxed), 1);
    }
}

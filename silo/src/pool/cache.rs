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

//! The bounded LRU cache of tenant pools.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use serde::Serialize;
use sqlx::{Pool, Postgres};
use tracing::debug;
use xayn_silo_shared::{postgres::QuotedIdentifier, tenant::TenantId};

use crate::{config::PoolCacheConfig, error::SiloError, hooks::Hooks};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    /// Created but not yet validated by a liveness probe.
    Initializing,
    Ready,
    Errored,
}

struct CachedPool {
    pool: Pool<Postgres>,
    schema: QuotedIdentifier,
    state: PoolState,
    last_used: Instant,
}

#[derive(Clone)]
pub(crate) struct PoolSnapshot {
    pub(crate) tenant_id: TenantId,
    pub(crate) schema: QuotedIdentifier,
    pub(crate) pool: Pool<Postgres>,
    pub(crate) state: PoolState,
}

struct Inner {
    entries: HashMap<TenantId, CachedPool>,
    disposed: bool,
}

/// Bounded map tenant id → live pool, LRU evicted.
///
/// The mutex only ever guards map bookkeeping; pool closes happen in
/// spawned tasks, never under the lock.
pub(crate) struct PoolCache {
    inner: Mutex<Inner>,
    config: PoolCacheConfig,
    hooks: Hooks,
}

impl PoolCache {
    pub(crate) fn new(config: PoolCacheConfig, hooks: Hooks) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                disposed: false,
            }),
            config,
            hooks,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the cached pool, creating it (and evicting the least
    /// recently used entry if the cache is full) when absent.
    ///
    /// Access, including creation, moves the entry to most recently used.
    pub(crate) fn get_or_create(
        &self,
        tenant_id: &TenantId,
        schema: &QuotedIdentifier,
        create: impl FnOnce() -> Result<Pool<Postgres>, SiloError>,
    ) -> Result<Pool<Postgres>, SiloError> {
        let (pool, evicted, created) = {
            let mut inner = self.lock();
            if inner.disposed {
                return Err(SiloError::Disposed);
            }

            if let Some(entry) = inner.entries.get_mut(tenant_id) {
                entry.last_used = Instant::now();
                (entry.pool.clone(), None, false)
            } else {
                let evicted = (inner.entries.len() >= self.config.max_pools)
                    .then(|| remove_lru(&mut inner.entries))
                    .flatten();
                // creation is lazy, no round-trip happens under the lock
                let pool = create()?;
                let now = Instant::now();
                inner.entries.insert(
                    tenant_id.clone(),
                    CachedPool {
                        pool: pool.clone(),
                        schema: schema.clone(),
                        state: PoolState::Initializing,
                        last_used: now,
                    },
                );
                (pool, evicted, true)
            }
        };

        if let Some((victim_id, victim)) = evicted {
            self.close_evicted(victim_id, victim);
        }
        if created {
            self.hooks.fire_pool_created(tenant_id);
        }
        Ok(pool)
    }

    pub(crate) fn touch(&self, tenant_id: &TenantId) {
        if let Some(entry) = self.lock().entries.get_mut(tenant_id) {
            entry.last_used = Instant::now();
        }
    }

    pub(crate) fn set_state(&self, tenant_id: &TenantId, state: PoolState) {
        if let Some(entry) = self.lock().entries.get_mut(tenant_id) {
            entry.state = state;
        }
    }

    pub(crate) fn contains(&self, tenant_id: &TenantId) -> bool {
        self.lock().entries.contains_key(tenant_id)
    }

    /// Removes and closes the tenant's pool, no-op if absent.
    pub(crate) fn evict(&self, tenant_id: &TenantId) -> bool {
        let removed = self.lock().entries.remove(tenant_id);
        if let Some(entry) = removed {
            self.close_evicted(tenant_id.clone(), entry);
            true
        } else {
            false
        }
    }

    /// Evicts every entry unused for longer than the configured TTL.
    pub(crate) fn sweep(&self, now: Instant) -> usize {
        let expired = {
            let mut inner = self.lock();
            let expired_ids = inner
                .entries
                .iter()
                .filter(|(_, entry)| {
                    now.saturating_duration_since(entry.last_used) > self.config.pool_ttl
                })
                .map(|(tenant_id, _)| tenant_id.clone())
                .collect::<Vec<_>>();
            expired_ids
                .into_iter()
                .filter_map(|tenant_id| {
                    inner
                        .entries
                        .remove(&tenant_id)
                        .map(|entry| (tenant_id, entry))
                })
                .collect::<Vec<_>>()
        };

        let count = expired.len();
        for (tenant_id, entry) in expired {
            debug!({ tenant_id = %tenant_id }, "pool expired");
            self.close_evicted(tenant_id, entry);
        }
        count
    }

    /// Evicts everything; the cache refuses further use afterwards.
    pub(crate) fn dispose(&self) {
        let drained = {
            let mut inner = self.lock();
            inner.disposed = true;
            inner.entries.drain().collect::<Vec<_>>()
        };
        for (tenant_id, entry) in drained {
            self.close_evicted(tenant_id, entry);
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.lock().entries.len()
    }

    pub(crate) fn active_ids(&self) -> Vec<TenantId> {
        let mut ids = self.lock().entries.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub(crate) fn snapshot(&self) -> Vec<PoolSnapshot> {
        let mut pools = self
            .lock()
            .entries
            .iter()
            .map(|(tenant_id, entry)| PoolSnapshot {
                tenant_id: tenant_id.clone(),
                schema: entry.schema.clone(),
                pool: entry.pool.clone(),
                state: entry.state,
            })
            .collect::<Vec<_>>();
        pools.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        pools
    }

    /// Closing is fire and forget, the evicting caller never waits on it.
    fn close_evicted(&self, tenant_id: TenantId, entry: CachedPool) {
        debug!({ tenant_id = %tenant_id, schema = %entry.schema }, "evicting pool");
        let pool = entry.pool;
        tokio::spawn(async move {
            pool.close().await;
        });
        self.hooks.fire_pool_evicted(&tenant_id);
    }
}

fn remove_lru(entries: &mut HashMap<TenantId, CachedPool>) -> Option<(TenantId, CachedPool)> {
    let lru = entries
        .iter()
        .min_by_key(|(_, entry)| entry.last_used)
        .map(|(tenant_id, _)| tenant_id.clone())?;
    entries.remove(&lru).map(|entry| (lru, entry))
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use super::*;

    fn lazy_pool() -> Result<Pool<Postgres>, SiloError> {
        let options = "postgres://user:pw@localhost:5432/unused"
            .parse::<sqlx::postgres::PgConnectOptions>()
            .map_err(SiloError::Database)?;
        Ok(sqlx::pool::PoolOptions::new().connect_lazy_with(options))
    }

    fn cache(max_pools: usize, hooks: Hooks) -> PoolCache {
        PoolCache::new(
            PoolCacheConfig {
                max_pools,
                pool_ttl: Duration::from_secs(60),
            },
            hooks,
        )
    }

    fn tenant(id: &str) -> TenantId {
        id.parse().unwrap()
    }

    fn schema(name: &str) -> QuotedIdentifier {
        name.parse().unwrap()
    }

    fn nudge_clock() {
        // make consecutive `last_used` stamps strictly ordered
        std::thread::sleep(Duration::from_millis(2));
    }

    #[tokio::test]
    async fn test_lru_eviction_keeps_the_cache_bounded() {
        let evicted = Arc::new(std::sync::Mutex::new(Vec::new()));
        let observed = evicted.clone();
        let hooks = Hooks {
            on_pool_evicted: Some(Arc::new(move |tenant_id| {
                observed.lock().unwrap().push(tenant_id.to_string());
            })),
            ..Hooks::default()
        };
        let cache = cache(2, hooks);

        cache
            .get_or_create(&tenant("a"), &schema("tenant_a"), lazy_pool)
            .unwrap();
        nudge_clock();
        cache
            .get_or_create(&tenant("b"), &schema("tenant_b"), lazy_pool)
            .unwrap();
        nudge_clock();
        cache
            .get_or_create(&tenant("c"), &schema("tenant_c"), lazy_pool)
            .unwrap();

        assert_eq!(cache.count(), 2);
        let ids = cache
            .active_ids()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        assert_eq!(ids, ["b", "c"]);
        assert_eq!(*evicted.lock().unwrap(), ["a"]);
    }

    #[tokio::test]
    async fn test_access_refreshes_lru_position() {
        let cache = cache(2, Hooks::default());

        cache
            .get_or_create(&tenant("a"), &schema("tenant_a"), lazy_pool)
            .unwrap();
        nudge_clock();
        cache
            .get_or_create(&tenant("b"), &schema("tenant_b"), lazy_pool)
            .unwrap();
        nudge_clock();
        // touch `a`, making `b` the eviction victim
        cache
            .get_or_create(&tenant("a"), &schema("tenant_a"), lazy_pool)
            .unwrap();
        nudge_clock();
        cache
            .get_or_create(&tenant("c"), &schema("tenant_c"), lazy_pool)
            .unwrap();

        let ids = cache
            .active_ids()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        assert_eq!(ids, ["a", "c"]);
    }

    #[tokio::test]
    async fn test_cached_entry_is_reused() {
        let created = Arc::new(AtomicUsize::new(0));
        let observed = created.clone();
        let hooks = Hooks {
            on_pool_created: Some(Arc::new(move |_| {
                observed.fetch_add(1, Ordering::SeqCst);
            })),
            ..Hooks::default()
        };
        let cache = cache(4, hooks);

        cache
            .get_or_create(&tenant("a"), &schema("tenant_a"), lazy_pool)
            .unwrap();
        cache
            .get_or_create(&tenant("a"), &schema("tenant_a"), || {
                panic!("entry must be cached")
            })
            .unwrap();

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(cache.count(), 1);
    }

    #[tokio::test]
    async fn test_sweep_evicts_expired_entries() {
        let cache = PoolCache::new(
            PoolCacheConfig {
                max_pools: 10,
                pool_ttl: Duration::from_millis(1),
            },
            Hooks::default(),
        );

        cache
            .get_or_create(&tenant("a"), &schema("tenant_a"), lazy_pool)
            .unwrap();
        nudge_clock();

        assert_eq!(cache.sweep(Instant::now()), 1);
        assert_eq!(cache.count(), 0);
    }

    #[tokio::test]
    async fn test_dispose_rejects_further_use() {
        let cache = cache(2, Hooks::default());
        cache
            .get_or_create(&tenant("a"), &schema("tenant_a"), lazy_pool)
            .unwrap();

        cache.dispose();

        assert_eq!(cache.count(), 0);
        let error = cache
            .get_or_create(&tenant("b"), &schema("tenant_b"), lazy_pool)
            .unwrap_err();
        assert!(matches!(error, SiloError::Disposed));
    }

    #[tokio::test]
    async fn test_explicit_evict() {
        let cache = cache(2, Hooks::default());
        cache
            .get_or_create(&tenant("a"), &schema("tenant_a"), lazy_pool)
            .unwrap();

        assert!(cache.evict(&tenant("a")));
        assert!(!cache.evict(&tenant("a")));
        assert_eq!(cache.count(), 0);
    }
}

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

//! Per-key coalescing of identical in-flight work.

use std::{
    collections::HashMap,
    future::Future,
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures_util::{
    future::{BoxFuture, Shared},
    FutureExt,
};

use crate::error::SiloError;

type SharedResult<T> = Result<T, Arc<SiloError>>;
type Pending<T> = Shared<BoxFuture<'static, SharedResult<T>>>;

/// N concurrent calls for the same key share one future; only the first
/// caller's work runs, everybody awaits its (cloned) result.
pub(crate) struct Coalescer<K, T> {
    pending: Mutex<HashMap<K, Pending<T>>>,
}

impl<K, T> Coalescer<K, T>
where
    K: Clone + Eq + Hash,
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Pending<T>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) async fn run<F>(&self, key: K, make: impl FnOnce() -> F) -> SharedResult<T>
    where
        F: Future<Output = Result<T, SiloError>> + Send + 'static,
    {
        let (future, leader) = {
            let mut pending = self.lock();
            if let Some(pending) = pending.get(&key) {
                (pending.clone(), false)
            } else {
                let future = make().map(|result| result.map_err(Arc::new)).boxed().shared();
                pending.insert(key.clone(), future.clone());
                (future, true)
            }
        };

        let result = future.await;
        if leader {
            self.lock().remove(&key);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures_util::future::join_all;

    use super::*;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_run() {
        let coalescer = Arc::new(Coalescer::<&str, usize>::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let callers = (0..10).map(|_| {
            let coalescer = coalescer.clone();
            let runs = runs.clone();
            async move {
                coalescer
                    .run("x", move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        Ok(42)
                    })
                    .await
            }
        });
        let results = join_all(callers).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.unwrap(), 42);
        }
    }

    #[tokio::test]
    async fn test_completed_keys_run_again() {
        let coalescer = Coalescer::<&str, usize>::new();
        let runs = AtomicUsize::new(0);

        for _ in 0..2 {
            coalescer
                .run("x", || {
                    runs.fetch_add(1, Ordering::SeqCst);
                    async { Ok(1) }
                })
                .await
                .unwrap();
        }

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_errors_are_shared_too() {
        let coalescer = Coalescer::<&str, usize>::new();
        let error = coalescer
            .run("x", || async { Err(SiloError::Disposed) })
            .await
            .unwrap_err();
        assert!(matches!(*error, SiloError::Disposed));
    }
}

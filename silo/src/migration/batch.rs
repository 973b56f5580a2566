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

//! Fanning per-tenant operations out over a bounded worker set.

use std::{
    fmt::{self, Debug},
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use futures_util::{stream, StreamExt};
use itertools::Itertools;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use xayn_silo_shared::{serde::serde_duration_as_millis, tenant::TenantId};

use crate::{error::SiloError, hooks::guarded};

/// Per-tenant result a batch operation collects.
///
/// Implemented by every per-tenant result struct so the batch executor
/// can account for infrastructure errors and skipped tenants uniformly.
pub(crate) trait TenantOperationResult: Send {
    fn is_success(&self) -> bool;
    fn is_skipped(&self) -> bool;
    fn error(&self) -> Option<&str>;
    fn from_error(tenant_id: TenantId, error: &SiloError) -> Self;
    fn from_skipped(tenant_id: TenantId) -> Self;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPhase {
    Starting,
    Migrating,
    Completed,
    Failed,
    Skipped,
}

/// Whether a failed tenant drains the rest of the batch or stops it.
///
/// `Abort` only prevents tenants from *starting*; in-flight tenants
/// always run to completion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ErrorDisposition {
    #[default]
    Continue,
    Abort,
}

pub type ProgressHook = Arc<dyn Fn(&TenantId, BatchPhase) + Send + Sync>;
pub type ErrorHook = Arc<dyn Fn(&TenantId, &str) -> ErrorDisposition + Send + Sync>;

#[derive(Clone, Default)]
pub struct BatchOptions {
    /// Worker bound, the configured default if unset.
    pub concurrency: Option<usize>,
    pub cancel: CancellationToken,
    pub on_progress: Option<ProgressHook>,
    pub on_error: Option<ErrorHook>,
}

impl Debug for BatchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchOptions")
            .field("concurrency", &self.concurrency)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("on_progress", &self.on_progress.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Aggregated batch result; `succeeded + failed + skipped == total` and
/// `details` is in input order.
#[derive(Clone, Debug, Serialize)]
pub struct BatchSummary<T> {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub details: Vec<T>,
    #[serde(with = "serde_duration_as_millis")]
    pub duration: Duration,
}

pub(crate) struct BatchExecutor {
    default_concurrency: usize,
}

impl BatchExecutor {
    pub(crate) fn new(default_concurrency: usize) -> Self {
        Self {
            default_concurrency,
        }
    }

    /// Runs `op` for every (deduplicated) tenant id with bounded
    /// concurrency.
    ///
    /// Tenants finish in arbitrary order; results are reported in input
    /// order. Cancellation behaves like `Abort`: nothing new starts,
    /// in-flight tenants run to completion, the rest reports skipped.
    pub(crate) async fn run<T, F, Fut>(
        &self,
        tenant_ids: &[TenantId],
        options: &BatchOptions,
        op: F,
    ) -> BatchSummary<T>
    where
        T: TenantOperationResult,
        F: Fn(TenantId) -> Fut,
        Fut: Future<Output = Result<T, SiloError>>,
    {
        let start = Instant::now();
        let ids = tenant_ids.iter().cloned().unique().collect::<Vec<_>>();
        let total = ids.len();
        let concurrency = options
            .concurrency
            .unwrap_or(self.default_concurrency)
            .max(1);

        let progress = |tenant_id: &TenantId, phase: BatchPhase| {
            if let Some(hook) = &options.on_progress {
                guarded("on_progress", || hook(tenant_id, phase));
            }
        };
        let aborted = AtomicBool::new(false);
        let aborted = &aborted;
        let progress = &progress;
        let op = &op;

        let mut indexed = stream::iter(ids.into_iter().enumerate())
            .map(|(index, tenant_id)| async move {
                if aborted.load(Ordering::SeqCst) || options.cancel.is_cancelled() {
                    progress(&tenant_id, BatchPhase::Skipped);
                    return (index, T::from_skipped(tenant_id));
                }

                progress(&tenant_id, BatchPhase::Starting);
                progress(&tenant_id, BatchPhase::Migrating);
                let result = match op(tenant_id.clone()).await {
                    Ok(result) => result,
                    Err(error) => T::from_error(tenant_id.clone(), &error),
                };

                if result.is_success() {
                    progress(&tenant_id, BatchPhase::Completed);
                } else {
                    progress(&tenant_id, BatchPhase::Failed);
                    let message = result.error().unwrap_or_default().to_owned();
                    let disposition = options
                        .on_error
                        .as_ref()
                        .map_or(ErrorDisposition::Continue, |hook| {
                            hook(&tenant_id, &message)
                        });
                    if disposition == ErrorDisposition::Abort {
                        aborted.store(true, Ordering::SeqCst);
                    }
                }
                (index, result)
            })
            .buffer_unordered(concurrency)
            .collect::<Vec<_>>()
            .await;
        indexed.sort_by_key(|(index, _)| *index);

        let details = indexed
            .into_iter()
            .map(|(_, result)| result)
            .collect::<Vec<_>>();
        let skipped = details.iter().filter(|result| result.is_skipped()).count();
        let succeeded = details.iter().filter(|result| result.is_success()).count();

        BatchSummary {
            total,
            succeeded,
            failed: total - succeeded - skipped,
            skipped,
            details,
            duration: start.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[derive(Debug, PartialEq)]
    struct TestResult {
        tenant_id: TenantId,
        ok: bool,
        skipped: bool,
        error: Option<String>,
    }

    impl TestResult {
        fn ok(tenant_id: TenantId) -> Self {
            Self {
                tenant_id,
                ok: true,
                skipped: false,
                error: None,
            }
        }
    }

    impl TenantOperationResult for TestResult {
        fn is_success(&self) -> bool {
            self.ok
        }
        fn is_skipped(&self) -> bool {
            self.skipped
        }
        fn error(&self) -> Option<&str> {
            self.error.as_deref()
        }
        fn from_error(tenant_id: TenantId, error: &SiloError) -> Self {
            Self {
                tenant_id,
                ok: false,
                skipped: false,
                error: Some(error.to_string()),
            }
        }
        fn from_skipped(tenant_id: TenantId) -> Self {
            Self {
                tenant_id,
                ok: false,
                skipped: true,
                error: None,
            }
        }
    }

    fn tenants(ids: &[&str]) -> Vec<TenantId> {
        ids.iter().map(|id| id.parse().unwrap()).collect()
    }

    #[tokio::test]
    async fn test_results_are_in_input_order_and_deduplicated() {
        let executor = BatchExecutor::new(4);
        let summary = executor
            .run(
                &tenants(&["c", "a", "b", "a"]),
                &BatchOptions::default(),
                |tenant_id| async move { Ok(TestResult::ok(tenant_id)) },
            )
            .await;

        assert_eq!(summary.total, 3);
        assert_eq!(summary.succeeded, 3);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.skipped, 0);
        let order = summary
            .details
            .iter()
            .map(|result| result.tenant_id.to_string())
            .collect::<Vec<_>>();
        assert_eq!(order, ["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let executor = BatchExecutor::new(2);
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let running = &running;
        let peak = &peak;

        let summary = executor
            .run(
                &tenants(&["a", "b", "c", "d", "e"]),
                &BatchOptions::default(),
                |tenant_id| async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(TestResult::ok(tenant_id))
                },
            )
            .await;

        assert_eq!(summary.succeeded, 5);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_abort_skips_remaining_tenants() {
        let executor = BatchExecutor::new(1);
        let options = BatchOptions {
            // sequential, so the failure of `b` happens before `c` starts
            concurrency: Some(1),
            on_error: Some(Arc::new(|_, _| ErrorDisposition::Abort)),
            ..BatchOptions::default()
        };
        let summary = executor
            .run(&tenants(&["a", "b", "c"]), &options, |tenant_id| async move {
                if tenant_id.to_string() == "b" {
                    Err(SiloError::Disposed)
                } else {
                    Ok(TestResult::ok(tenant_id))
                }
            })
            .await;

        assert_eq!(summary.total, 3);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert!(summary.details[1].error.is_some());
        assert!(summary.details[2].skipped);
    }

    #[tokio::test]
    async fn test_failures_drain_by_default() {
        let executor = BatchExecutor::new(1);
        let summary = executor
            .run(
                &tenants(&["a", "b", "c"]),
                &BatchOptions {
                    concurrency: Some(1),
                    ..BatchOptions::default()
                },
                |tenant_id| async move {
                    if tenant_id.to_string() == "a" {
                        Err(SiloError::Disposed)
                    } else {
                        Ok(TestResult::ok(tenant_id))
                    }
                },
            )
            .await;

        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 0);
    }

    #[tokio::test]
    async fn test_cancel_skips_everything_not_started() {
        let executor = BatchExecutor::new(4);
        let options = BatchOptions::default();
        options.cancel.cancel();
        let summary = executor
            .run(&tenants(&["a", "b"]), &options, |tenant_id| async move {
                Ok(TestResult::ok(tenant_id))
            })
            .await;

        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.succeeded, 0);
    }

    #[tokio::test]
    async fn test_progress_phases_fire_in_order() {
        let executor = BatchExecutor::new(1);
        let phases = Arc::new(std::sync::Mutex::new(Vec::new()));
        let observed = phases.clone();
        let options = BatchOptions {
            concurrency: Some(1),
            on_progress: Some(Arc::new(move |tenant_id, phase| {
                observed
                    .lock()
                    .unwrap()
                    .push((tenant_id.to_string(), phase));
            })),
            ..BatchOptions::default()
        };
        executor
            .run(&tenants(&["a", "b"]), &options, |tenant_id| async move {
                Ok(TestResult::ok(tenant_id))
            })
            .await;

        let phases = phases.lock().unwrap();
        assert_eq!(
            *phases,
            [
                ("a".to_string(), BatchPhase::Starting),
                ("a".to_string(), BatchPhase::Migrating),
                ("a".to_string(), BatchPhase::Completed),
                ("b".to_string(), BatchPhase::Starting),
                ("b".to_string(), BatchPhase::Migrating),
                ("b".to_string(), BatchPhase::Completed),
            ]
        );
    }
}

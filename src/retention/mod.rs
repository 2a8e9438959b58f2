//! Retention engine: garbage collection, trash, obsolete sweeps and copy
//! reconciliation.
//!
//! Every algorithm here reads its inputs (listings, indexes, checkpoint)
//! up front and fails as a whole if any of them is unavailable. Only the
//! per-object mutations are retried, in bounded rounds.

pub mod copy;
pub mod garbage;
pub mod obsolete;
pub mod trash;
pub mod untrash;

use futures::stream::{self, StreamExt};
use std::future::Future;
use tokio_util::sync::CancellationToken;

use crate::error::{GatewayError, Result};

pub use copy::{copy_objects, CopyReport};
pub use garbage::{delete_file, delete_garbage, list_garbage, select_garbage, GarbageReport};
pub use obsolete::{collect_obsolete, delete_obsolete, ObsoleteReport};
pub use trash::{trash_path, trash_prefix, untrash_path};
pub use untrash::{untrashify, UntrashReport};

/// Apply `op` to every item, at most `concurrency` at a time, retrying the
/// failed subset for at most `rounds` rounds. Items still failing afterwards
/// are reported as a partial failure.
///
/// Once `shutdown` fires no new item is started; those already running are
/// awaited and the call returns [`GatewayError::Cancelled`].
pub(crate) async fn retry_rounds<F, Fut>(
    what: &str,
    items: Vec<String>,
    rounds: usize,
    concurrency: usize,
    shutdown: &CancellationToken,
    mut op: F,
) -> Result<()>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut pending = items;
    for round in 1..=rounds {
        if pending.is_empty() {
            break;
        }
        if shutdown.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }

        let results: Vec<(String, Option<anyhow::Result<()>>)> = stream::iter(pending)
            .map(|item| {
                let fut = (!shutdown.is_cancelled()).then(|| op(item.clone()));
                async move {
                    let result = match fut {
                        Some(fut) => Some(fut.await),
                        None => None,
                    };
                    (item, result)
                }
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let mut failed = Vec::new();
        let mut skipped = 0;
        for (item, result) in results {
            match result {
                Some(Ok(())) => {}
                Some(Err(err)) => {
                    tracing::warn!(path = %item, round, "failed to {what}: {err:#}");
                    failed.push(item);
                }
                None => skipped += 1,
            }
        }
        if skipped > 0 || (shutdown.is_cancelled() && !failed.is_empty()) {
            tracing::warn!(
                "{what}: shutting down in round {round}, {skipped} object(s) not started"
            );
            return Err(GatewayError::Cancelled);
        }
        failed.sort();
        if !failed.is_empty() {
            tracing::info!("{what}: {} object(s) left after round {round}", failed.len());
        }
        pending = failed;
    }

    if pending.is_empty() {
        Ok(())
    } else {
        tracing::error!("{what}: {} object(s) failed: {:?}", pending.len(), pending);
        Err(GatewayError::PartialFailure { failed: pending })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_failed_subset_is_retried() {
        // "b" fails twice, "c" never succeeds.
        let attempts = Mutex::new(HashMap::<String, usize>::new());
        let items = vec!["a".to_string(), "b".to_string(), "c".to_string()];

        let err = retry_rounds("move", items, 5, 2, &CancellationToken::new(), |item| {
            let n = {
                let mut attempts = attempts.lock().unwrap();
                let n = attempts.entry(item.clone()).or_default();
                *n += 1;
                *n
            };
            async move {
                match item.as_str() {
                    "b" if n <= 2 => anyhow::bail!("slow down"),
                    "c" => anyhow::bail!("access denied"),
                    _ => Ok(()),
                }
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(&err, GatewayError::PartialFailure { failed } if failed == &["c"]));
        let attempts = attempts.lock().unwrap();
        assert_eq!(attempts["a"], 1);
        assert_eq!(attempts["b"], 3);
        assert_eq!(attempts["c"], 5);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_round() {
        let token = CancellationToken::new();
        token.cancel();
        let err = retry_rounds("delete", vec!["a".to_string()], 3, 4, &token, |_| async {
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, GatewayError::Cancelled));
    }

    #[tokio::test]
    async fn test_shutdown_stops_starting_new_items() {
        let token = CancellationToken::new();
        let started = Mutex::new(Vec::new());
        let items = vec!["a".to_string(), "b".to_string(), "c".to_string()];

        let err = retry_rounds("move", items, 3, 1, &token, |item| {
            started.lock().unwrap().push(item.clone());
            let token = token.clone();
            async move {
                if item == "a" {
                    token.cancel();
                }
                Ok(())
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, GatewayError::Cancelled));
        assert_eq!(*started.lock().unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_items_run_concurrently() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let items: Vec<String> = (0..16).map(|i| i.to_string()).collect();

        retry_rounds("delete", items, 1, 4, &CancellationToken::new(), |_| {
            let running = &running;
            let peak = &peak;
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();

        let peak = peak.load(Ordering::SeqCst);
        assert!(peak > 1 && peak <= 4, "peak concurrency {peak}");
    }

    #[tokio::test]
    async fn test_empty_batch_succeeds() {
        let token = CancellationToken::new();
        token.cancel();
        retry_rounds("delete", Vec::new(), 3, 4, &token, |_| async { Ok(()) })
            .await
            .unwrap();
    }
}

//! A deduplicating, at-most-once-per-key async computation cache.
//!
//! Each key owns a [`tokio::sync::OnceCell`]. `OnceCell` gives the core
//! guarantees for free:
//!
//! * the init future for a given key runs to completion for **at most one**
//!   caller; every other concurrent caller `.await`s that same in-flight
//!   future instead of starting a duplicate;
//! * once a cell is initialized it never runs its init future again;
//! * nothing here blocks a worker thread — the `OnceCell` wait is itself an
//!   `.await` point.
//!
//! A non-fatal failure leaves the key retryable; a fatal one caches the
//! failure permanently. This falls directly out of how
//! `OnceCell::get_or_try_init` treats an `Err`: the cell is **not**
//! committed, so the next caller re-invokes the init future. A fatal error
//! is therefore represented by committing an `Ok(Err(..))` into the cell (a
//! permanently cached failure), while a non-fatal error is propagated as a
//! plain `Err` out of the init future so the cell stays empty and a later
//! call retries.

use crate::error::MapError;
use std::{collections::HashMap, future::Future, hash::Hash, sync::Arc, sync::Mutex};
use tokio::sync::OnceCell;

type Cell<V> = Arc<OnceCell<Result<V, MapError>>>;

/// A deduplicating, at-most-once-per-key async computation cache.
pub struct AsyncMap<K, V> {
    entries: Mutex<HashMap<K, Cell<V>>>,
}

impl<K, V> Default for AsyncMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> AsyncMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn cell_for(&self, key: &K) -> Cell<V> {
        let mut entries = self.entries.lock().expect("async map mutex poisoned");
        entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Resolves `key`, running `init` at most once across the process
    /// lifetime. A fatal `MapError` is cached permanently (the key never
    /// recomputes); a non-fatal one leaves the key retryable by a later
    /// caller.
    pub async fn get_or_try_init<F, Fut>(&self, key: K, init: F) -> Result<V, MapError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, MapError>>,
    {
        let cell = self.cell_for(&key);

        let result = cell
            .get_or_try_init(|| async {
                match init().await {
                    Ok(v) => Ok(Ok(v)),
                    Err(e) if e.fatal => Ok(Err(e)),
                    Err(e) => Err(e),
                }
            })
            .await?;

        result.clone()
    }

    /// True if `key` has already reached a terminal state (`Ready` or
    /// `Failed`) without triggering computation.
    pub fn is_resolved(&self, key: &K) -> bool {
        let entries = self.entries.lock().expect("async map mutex poisoned");
        entries.get(key).map(|c| c.initialized()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn compute_runs_at_most_once_for_concurrent_callers() {
        let map: Arc<AsyncMap<&'static str, u32>> = Arc::new(AsyncMap::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let map = map.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                map.get_or_try_init("k", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    Ok(42)
                })
                .await
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), 42);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_fatal_error_leaves_key_retryable() {
        let map: AsyncMap<&'static str, u32> = AsyncMap::new();
        let attempt = AtomicUsize::new(0);

        let first = map
            .get_or_try_init("k", || async {
                attempt.fetch_add(1, Ordering::SeqCst);
                Err(MapError::non_fatal("try again later"))
            })
            .await;
        assert!(first.is_err());

        let second = map
            .get_or_try_init("k", || async {
                attempt.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            })
            .await;

        assert_eq!(second.unwrap(), 7);
        assert_eq!(attempt.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fatal_error_is_cached_and_never_recomputed() {
        let map: AsyncMap<&'static str, u32> = AsyncMap::new();
        let attempt = AtomicUsize::new(0);

        for _ in 0..3 {
            let result = map
                .get_or_try_init("k", || async {
                    attempt.fetch_add(1, Ordering::SeqCst);
                    Err(MapError::fatal("nope"))
                })
                .await;
            assert!(result.is_err());
        }

        assert_eq!(attempt.load(Ordering::SeqCst), 1);
    }
}

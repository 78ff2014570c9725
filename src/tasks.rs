//! A fixed-width worker pool with work-stealing semantics, backed by a
//! `tokio` multi-thread runtime: a fixed number of worker OS threads, a
//! work-stealing scheduler across them, and suspension always expressed as
//! a re-enqueued continuation (an `.await` point). Blocking `git2` and
//! subprocess calls are pushed off the async workers with
//! `tokio::task::spawn_blocking`.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Process-wide fail flag: a fatal error anywhere flips this, and
/// continuations check it to short-circuit to the error path instead of
/// doing further work.
#[derive(Clone, Default)]
pub struct FailFlag(Arc<AtomicBool>);

impl FailFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Owns the single worker pool for a run. Exactly one `TaskSystem` is ever
/// created, in `setup::run`.
pub struct TaskSystem {
    runtime: tokio::runtime::Runtime,
}

impl TaskSystem {
    /// `jobs`: the configurable worker-pool degree. Defaults to the number
    /// of hardware threads.
    pub fn new(jobs: Option<usize>) -> anyhow::Result<Self> {
        let jobs = jobs.unwrap_or_else(num_cpus::get).max(1);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(jobs)
            .enable_all()
            .build()?;

        Ok(Self { runtime })
    }

    /// Runs `fut` to completion on the pool, blocking the calling thread
    /// only at this single boundary.
    pub fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    pub fn handle(&self) -> tokio::runtime::Handle {
        self.runtime.handle().clone()
    }
}

impl Drop for TaskSystem {
    fn drop(&mut self) {
        // Exiting the scoped region drains to quiescence; in-flight tasks
        // are given a bounded grace period rather than being aborted
        // mid-write to the Git store or CAS.
        let shutdown_grace = std::time::Duration::from_secs(30);
        // `shutdown_timeout` takes `self` by value on `Runtime`, but we only
        // have `&mut Runtime` here; swap in a throwaway runtime so we can
        // move the real one out for shutdown.
        if let Ok(placeholder) = tokio::runtime::Builder::new_current_thread().build() {
            let real = std::mem::replace(&mut self.runtime, placeholder);
            real.shutdown_timeout(shutdown_grace);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_an_async_computation() {
        let ts = TaskSystem::new(Some(2)).unwrap();
        let result = ts.block_on(async { 1 + 1 });
        assert_eq!(result, 2);
    }

    #[test]
    fn fail_flag_starts_clear_and_latches() {
        let flag = FailFlag::new();
        assert!(!flag.is_set());
        flag.set();
        assert!(flag.is_set());

        let clone = flag.clone();
        assert!(clone.is_set());
    }
}

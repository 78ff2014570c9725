//! Serializes mutating Git operations against a single target path.
//!
//! `git2` gives no guarantee that concurrent writers against the same
//! on-disk repository are safe; this component makes the pipeline safe
//! against that by granting at most one in-flight critical operation per
//! `target_path` at a time, while still deduplicating and caching
//! completed results by the full operation key so two callers asking for
//! the exact same op never redo the work.

use crate::asyncmap::AsyncMap;
use crate::error::MapError;
use crate::git_store;
use crate::hash::TreeId;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex as StdMutex,
};
use tokio::sync::Mutex as AsyncMutex;
use tracing_futures::Instrument as _;

/// The operation requested against `target_path`. Distinct values sharing
/// a `target_path` still serialize against one another at the exclusion
/// layer — only one critical op is ever running per path at a time — but
/// each is cached and deduplicated independently by its own key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum GitOp {
    EnsureInit,
    InitialCommit { stage_dir: PathBuf, message: String },
    KeepTag { commit_id: TreeId, message: String },
    /// Reads the commit id `HEAD` resolves to in the repository at
    /// `target_path`. Read-only, but still routed through the serializer:
    /// `git2::Repository::open`/`head()` race against a concurrent mutation
    /// of the same on-disk repository exactly as the writing ops do.
    GetHeadId,
    /// Points `refs/heads/{branch}` at `commit_id` in `target_path`.
    BranchRef { branch: String, commit_id: TreeId },
    FetchFrom {
        src_path: PathBuf,
        refspec: Option<String>,
        git_bin: String,
        launcher: Vec<String>,
    },
}

/// `(target_path, op)`: the full cache/dedup key. Coalescing across
/// concurrent identical requests happens here; mutual exclusion against
/// the physical path happens separately, keyed on `target_path` alone.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct FullKey(PathBuf, GitOp);

/// The result of a completed critical op. `tree_id`/`commit_id` are
/// populated only by the ops that produce one.
#[derive(Clone, Debug, Default)]
pub struct GitOpResult {
    pub created: bool,
    pub tree_id: Option<TreeId>,
    pub commit_id: Option<TreeId>,
}

/// Serializes critical Git operations. Two independent layers:
/// `locks` grants exclusive access per `target_path` (the non-reentrancy
/// guarantee `git2` needs); `results` deduplicates and caches completed
/// work per full `(target_path, op)` key (the at-most-once guarantee).
pub struct GitOpSerializer {
    locks: StdMutex<HashMap<PathBuf, std::sync::Arc<AsyncMutex<()>>>>,
    results: AsyncMap<FullKey, GitOpResult>,
}

impl Default for GitOpSerializer {
    fn default() -> Self {
        Self {
            locks: StdMutex::new(HashMap::new()),
            results: AsyncMap::new(),
        }
    }
}

impl GitOpSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, target_path: &Path) -> std::sync::Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("git op lock map poisoned");
        locks
            .entry(target_path.to_path_buf())
            .or_insert_with(|| std::sync::Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Runs `op` against `target_path`. A second caller for the identical
    /// `(target_path, op)` is coalesced onto the first's in-flight future
    /// and never re-executes it; a caller for a *different* op on the
    /// same path waits for exclusive access to the path but still gets
    /// its own result.
    pub async fn run(&self, target_path: PathBuf, op: GitOp) -> Result<GitOpResult, MapError> {
        let full_key = FullKey(target_path.clone(), op.clone());
        let path_lock = self.lock_for(&target_path);
        let span = tracing::debug_span!("critical_git_op", target = %target_path.display(), op = ?op);

        self.results
            .get_or_try_init(full_key, move || {
                async move {
                    let _guard = path_lock.lock().await;
                    tokio::task::spawn_blocking(move || run_blocking(&target_path, op))
                        .await
                        .map_err(|e| MapError::fatal(format!("critical git op task panicked: {}", e)))?
                }
                .instrument(span)
            })
            .await
    }
}

fn run_blocking(target_path: &Path, op: GitOp) -> Result<GitOpResult, MapError> {
    match op {
        GitOp::EnsureInit => git_store::ensure_bare_init(target_path)
            .map(|created| GitOpResult {
                created,
                ..Default::default()
            })
            .map_err(|e| MapError::fatal(format!("{:#}", e))),

        GitOp::InitialCommit { stage_dir, message } => {
            git_store::initial_commit(target_path, &stage_dir, &message)
                .map(|(tree_id, commit_id)| GitOpResult {
                    created: true,
                    tree_id: Some(tree_id),
                    commit_id: Some(TreeId::from(commit_id)),
                })
                .map_err(|e| MapError::fatal(format!("{:#}", e)))
        }

        GitOp::KeepTag { commit_id, message } => {
            git_store::keep_tag(target_path, commit_id.into(), &message)
                .map(|created| GitOpResult {
                    created,
                    ..Default::default()
                })
                .map_err(|e| MapError::fatal(format!("{:#}", e)))
        }

        GitOp::GetHeadId => git_store::read_head_id(target_path)
            .map(|head_id| GitOpResult {
                created: false,
                commit_id: head_id.map(TreeId::from),
                ..Default::default()
            })
            .map_err(|e| MapError::fatal(format!("{:#}", e))),

        GitOp::BranchRef { branch, commit_id } => {
            git_store::set_branch_ref(target_path, &branch, commit_id.into())
                .map(|()| GitOpResult {
                    created: true,
                    ..Default::default()
                })
                .map_err(|e| MapError::fatal(format!("{:#}", e)))
        }

        GitOp::FetchFrom {
            src_path,
            refspec,
            git_bin,
            launcher,
        } => git_store::fetch_via_tmp_repo(target_path, &src_path, refspec.as_deref(), &git_bin, &launcher)
            .map(|fetched| GitOpResult {
                created: fetched,
                ..Default::default()
            })
            .map_err(|e| MapError::fatal(format!("{:#}", e))),
    }
}

//! Import-to-Git map: deduplicated import of a directory tree into the
//! shared Git object database as an orphan commit, returning the tree and
//! commit identifiers.

use crate::asyncmap::AsyncMap;
use crate::error::MapError;
use crate::git_ops::{GitOp, GitOpSerializer};
use crate::hash::TreeId;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_futures::Instrument as _;

/// Stage-directory imports are deduplicated by the absolute path being
/// staged; re-importing the same path (e.g. two repositories pointing at
/// the same extracted archive) yields the same tree/commit pair without
/// redoing the work.
pub struct ImportMap {
    map: AsyncMap<PathBuf, (TreeId, TreeId)>,
    store_path: PathBuf,
    git_ops: Arc<GitOpSerializer>,
}

impl ImportMap {
    pub fn new(store_path: impl Into<PathBuf>, git_ops: Arc<GitOpSerializer>) -> Self {
        Self {
            map: AsyncMap::new(),
            store_path: store_path.into(),
            git_ops,
        }
    }

    /// Imports `stage_dir` as an orphan commit in the shared store,
    /// returning `(tree_id, commit_id)`.
    pub async fn import(&self, stage_dir: &Path) -> Result<(TreeId, TreeId), MapError> {
        let key = stage_dir.to_path_buf();
        let store_path = self.store_path.clone();
        let git_ops = self.git_ops.clone();
        let stage_dir = stage_dir.to_path_buf();
        let span = tracing::debug_span!("import", stage_dir = %key.display());

        self.map
            .get_or_try_init(key, move || {
                async move {
                    let result = git_ops
                        .run(
                            store_path,
                            GitOp::InitialCommit {
                                stage_dir,
                                message: "reap import".into(),
                            },
                        )
                        .await?;

                    let tree_id = result
                        .tree_id
                        .ok_or_else(|| MapError::fatal("initial commit op returned no tree id"))?;
                    let commit_id = result
                        .commit_id
                        .ok_or_else(|| MapError::fatal("initial commit op returned no commit id"))?;

                    Ok((tree_id, commit_id))
                }
                .instrument(span)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git_store;
    use tempfile::tempdir;

    #[tokio::test]
    async fn import_is_deduplicated_for_the_same_directory() {
        let root = tempdir().unwrap();
        let store_path = root.path().join("store");
        git_store::ensure_bare_init(&store_path).unwrap();

        let stage = tempdir().unwrap();
        std::fs::write(stage.path().join("a.txt"), b"hi").unwrap();

        let git_ops = Arc::new(GitOpSerializer::new());
        let imports = Arc::new(ImportMap::new(&store_path, git_ops));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let imports = imports.clone();
            let path = stage.path().to_path_buf();
            handles.push(tokio::spawn(async move { imports.import(&path).await }));
        }

        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap().unwrap());
        }

        let first = results[0];
        assert!(results.iter().all(|r| *r == first));
    }
}

//! The central state machine: given a declared tree identifier, ensure
//! that identifier is present in the local Git object database, consulting
//! in order the local store, an optional remote CAS, and a described
//! generator command.
//!
//! ```text
//! S0 init ──► S1 ensure-bare-init ──► S2 probe-local-git
//! S2 ──hit──► S_done(cache_hit=true)
//! S2 ──miss─► S3 probe-remote-CAS
//! S3 ──hit──► S4 retrieve-to-CAS ──► S5 CAS→tmpdir ──► S6 import-to-git ──► S_done(false)
//! S3 ──miss─► S7 run-generator-command ──► S8 import-to-git ──► S9 verify-tree-id
//! S9 ──mismatch─► S_fail(fatal, with command stdout/stderr appended)
//! S9 ──match──► S10 fetch-into-shared-store ──► S11 keep-tag ──► S_done(false)
//! any stage I/O error ──► S_fail(fatal)
//! ```

use crate::asyncmap::AsyncMap;
use crate::cas::LocalCas;
use crate::error::MapError;
use crate::git_ops::{GitOp, GitOpSerializer};
use crate::git_store::{self, GitStore};
use crate::hash::{ContentHash, ScopedTempDir, TreeId};
use crate::import::ImportMap;
use crate::progress::TaskTracker;
use futures::future::BoxFuture;
use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::Arc,
};
use tokio::process::Command;
use tracing_futures::Instrument as _;

/// The remote CAS collaborator is a generic typed interface the core only
/// consumes: implementing an actual RPC client against a specific remote
/// store is out of scope here. Boxed futures stand in for `async fn` in a
/// trait object position (no `async-trait` dependency carried for a
/// single trait).
pub trait RemoteCas: Send + Sync {
    /// Checks whether `tree_id` is known to the remote CAS without
    /// downloading it.
    fn probe(&self, tree_id: TreeId) -> BoxFuture<'_, Result<bool, MapError>>;

    /// Retrieves the tarball of the materialized tree for `tree_id`.
    fn retrieve(&self, tree_id: TreeId) -> BoxFuture<'_, Result<Vec<u8>, MapError>>;
}

/// Identifies one tree-fetch request. Two requests with identical fields
/// are the same key and are deduplicated.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GitTreeInfo {
    pub tree_id: TreeId,
    pub command: Vec<String>,
    pub env_vars: BTreeMap<String, String>,
    pub inherit_env: Vec<String>,
    pub origin: String,
}

/// Configuration shared by every generator invocation: the launcher prefix
/// and the git binary/tmp-dir base used for the remote-CAS and generator
/// paths.
pub struct GeneratorConfig {
    pub git_bin: String,
    pub launcher: Vec<String>,
    pub tmp_base: Option<PathBuf>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            git_bin: "git".to_owned(),
            launcher: Vec::new(),
            tmp_base: None,
        }
    }
}

pub struct GitTreeFetchMap {
    map: AsyncMap<GitTreeInfo, bool>,
    store_path: PathBuf,
    git_ops: Arc<GitOpSerializer>,
    imports: Arc<ImportMap>,
    local_cas: Arc<LocalCas>,
    remote_cas: Option<Arc<dyn RemoteCas>>,
    progress: Arc<TaskTracker>,
    generator: GeneratorConfig,
}

impl GitTreeFetchMap {
    pub fn new(
        store_path: impl Into<PathBuf>,
        git_ops: Arc<GitOpSerializer>,
        imports: Arc<ImportMap>,
        local_cas: Arc<LocalCas>,
        remote_cas: Option<Arc<dyn RemoteCas>>,
        progress: Arc<TaskTracker>,
        generator: GeneratorConfig,
    ) -> Self {
        Self {
            map: AsyncMap::new(),
            store_path: store_path.into(),
            git_ops,
            imports,
            local_cas,
            remote_cas,
            progress,
            generator,
        }
    }

    /// Resolves `key`, returning whether the tree was already present
    /// locally (`cache_hit = true`) before this call.
    pub async fn resolve(&self, key: GitTreeInfo) -> Result<bool, MapError> {
        let store_path = self.store_path.clone();
        let git_ops = self.git_ops.clone();
        let imports = self.imports.clone();
        let local_cas = self.local_cas.clone();
        let remote_cas = self.remote_cas.clone();
        let progress = self.progress.clone();
        let generator = &self.generator;
        let git_bin = generator.git_bin.clone();
        let launcher = generator.launcher.clone();
        let tmp_base = generator.tmp_base.clone();
        let span = tracing::debug_span!("git_tree_fetch", origin = %key.origin, tree_id = %key.tree_id);

        self.map
            .get_or_try_init(key.clone(), move || async move {
                // S1: ensure-bare-init.
                git_ops.run(store_path.clone(), GitOp::EnsureInit).await?;

                // S2: probe-local-git.
                let store = GitStore::new(&store_path);
                let handle = store
                    .open()
                    .map_err(MapError::from)?
                    .ok_or_else(|| MapError::fatal("store failed to initialize"))?;
                if handle.check_tree_exists(key.tree_id).map_err(MapError::from)? {
                    return Ok(true);
                }

                let guard = progress.start(&key.origin);

                // S3: probe-remote-CAS.
                let remote_hit = match &remote_cas {
                    Some(cas) => cas.probe(key.tree_id).await.unwrap_or(false),
                    None => false,
                };

                if remote_hit {
                    // S4: retrieve-to-CAS. The remote blob is written into
                    // the local content-addressed store, keyed by its own
                    // digest, before anything reads it back.
                    let cas = remote_cas.as_ref().expect("remote_hit implies remote_cas is set");
                    let tarball = cas.retrieve(key.tree_id).await?;
                    let content_hash = ContentHash::digest(&tarball);
                    local_cas.insert(content_hash, &tarball).await.map_err(MapError::from)?;

                    // S5: CAS->tmpdir.
                    let bytes = local_cas.read(content_hash).await.map_err(MapError::from)?;
                    let tmp = ScopedTempDir::new().map_err(MapError::from)?;
                    unpack_tarball(&bytes, tmp.path()).map_err(MapError::from)?;

                    // S6: import-to-git. The resulting commit gets the same
                    // keep-tag every other import path does (S11 below,
                    // `setup.rs::import_and_pin`): an orphan commit with no
                    // ref pointing to it is fair game for garbage collection.
                    let (_tree_id, commit_id) = imports.import(tmp.path()).await?;
                    git_ops
                        .run(
                            store_path.clone(),
                            GitOp::KeepTag {
                                commit_id,
                                message: format!("keep {}", key.origin),
                            },
                        )
                        .await?;
                    guard.finish();
                    return Ok(false);
                }

                // S7: run-generator-command.
                let work_dir = match &tmp_base {
                    Some(base) => ScopedTempDir::new_in(base),
                    None => ScopedTempDir::new(),
                }
                .map_err(MapError::from)?;

                let (status, stdout, stderr) =
                    run_generator(&key.command, &key.env_vars, &key.inherit_env, &launcher, work_dir.path())
                        .await
                        .map_err(MapError::from)?;

                // S8: import-to-git, into a throwaway working repository
                // (not the shared store) so S9 can verify before promoting.
                let working_repo = ScopedTempDir::new().map_err(MapError::from)?;
                git_store::ensure_bare_init(working_repo.path()).map_err(MapError::from)?;
                let (tree_id, commit_id) =
                    git_store::initial_commit(working_repo.path(), work_dir.path(), "generator output")
                        .map_err(MapError::from)?;

                // S9: verify-tree-id.
                if tree_id != key.tree_id {
                    return Err(MapError::fatal(format!(
                        "generator produced tree {} but {} was declared; command: {}\nstdout:\n{}\nstderr:\n{}",
                        tree_id,
                        key.tree_id,
                        serde_json::to_string(&key.command).unwrap_or_default(),
                        stdout,
                        stderr,
                    )));
                }
                if !status {
                    tracing::warn!(origin = %key.origin, "generator command exited non-zero but produced the declared tree");
                }

                // S10: fetch-into-shared-store, serialized against the store
                // path through the same critical-op map as every other
                // mutation of this store.
                let fetch_result = git_ops
                    .run(
                        store_path.clone(),
                        GitOp::FetchFrom {
                            src_path: working_repo.path().to_path_buf(),
                            refspec: None,
                            git_bin: git_bin.clone(),
                            launcher: launcher.clone(),
                        },
                    )
                    .await?;
                if !fetch_result.created {
                    return Err(MapError::fatal("failed to fetch generator output into the shared store"));
                }

                // S11: keep-tag.
                git_ops
                    .run(
                        store_path.clone(),
                        GitOp::KeepTag {
                            commit_id: TreeId::from(commit_id),
                            message: format!("keep {}", key.origin),
                        },
                    )
                    .await?;

                guard.finish();
                Ok(false)
            }.instrument(span))
            .await
    }
}

/// Runs `command` (extended by `launcher`) in `work_dir`, with environment
/// `env_vars` overlaid on the ambient environment restricted to
/// `inherit_env` names. Captures stdout/stderr so a later verification
/// failure can include them. A non-zero exit is only reported, not
/// treated as fatal here — S9's tree-id comparison is the real verdict.
async fn run_generator(
    command: &[String],
    env_vars: &BTreeMap<String, String>,
    inherit_env: &[String],
    launcher: &[String],
    work_dir: &std::path::Path,
) -> anyhow::Result<(bool, String, String)> {
    let mut full_command: Vec<String> = launcher.to_vec();
    full_command.extend(command.iter().cloned());

    let (head, rest) = full_command
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("generator command must not be empty"))?;

    let mut cmd = Command::new(head);
    cmd.args(rest).current_dir(work_dir).env_clear();

    for name in inherit_env {
        if let Ok(value) = std::env::var(name) {
            cmd.env(name, value);
        }
    }
    for (k, v) in env_vars {
        cmd.env(k, v);
    }

    let output = cmd.output().await?;
    Ok((
        output.status.success(),
        String::from_utf8_lossy(&output.stdout).into_owned(),
        String::from_utf8_lossy(&output.stderr).into_owned(),
    ))
}

fn unpack_tarball(bytes: &[u8], dest: &std::path::Path) -> anyhow::Result<()> {
    let decoder = flate2::read::GzDecoder::new(bytes);
    let mut archive = tar::Archive::new(decoder);
    archive.unpack(dest)?;
    Ok(())
}

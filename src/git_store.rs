//! A Git object store adapter over `git2`: opening a bare repository,
//! reading objects/trees cheaply, importing a staged directory as an
//! orphan commit, and the handful of mutating operations the critical-git-
//! op serializer drives.
//!
//! Every function here is synchronous and potentially blocking (`git2` has
//! no async API); callers on the task system run these via
//! `tokio::task::spawn_blocking`. Keeping this module itself synchronous
//! makes it independently unit-testable without a runtime.

use crate::hash::TreeId;
use anyhow::{bail, Context as _, Error};
use std::{
    path::{Path, PathBuf},
    process::Command,
    sync::{Arc, Mutex},
};

/// The kind of a tree entry after file-mode translation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Executable,
    Tree,
}

/// `100644 -> File`, `100755 -> Executable`, `040000 -> Tree`. Any other
/// mode is an error: the store never silently drops an unrecognized mode.
pub fn translate_file_mode(mode: i32) -> Result<EntryKind, Error> {
    match mode {
        0o100644 => Ok(EntryKind::File),
        0o100755 => Ok(EntryKind::Executable),
        0o040000 => Ok(EntryKind::Tree),
        other => bail!("unrecognized git file mode {:o}", other),
    }
}

/// Owns the filesystem location of a bare Git object database. `open()` is
/// the only way to get at its contents; the store itself holds no open
/// `git2::Repository`.
pub struct GitStore {
    root: PathBuf,
    open_guard: Mutex<()>,
}

impl GitStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            open_guard: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns `None` if `root` is not a Git object store (not yet
    /// created). `git2::Repository::open` is guarded by a mutex here since
    /// the underlying library gives no thread-safety guarantee for opening
    /// the same path concurrently; once open, each `Handle` owns an
    /// independent `git2::Repository` and is safe for concurrent read.
    pub fn open(&self) -> Result<Option<Handle>, Error> {
        let _guard = self.open_guard.lock().expect("git store open mutex poisoned");
        match git2::Repository::open(&self.root) {
            Ok(repo) => Ok(Some(Handle {
                repo: Arc::new(Mutex::new(repo)),
            })),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e).context("failed to open git object store"),
        }
    }
}

/// A handle onto an already-open store. Reads take the inner mutex only
/// for the duration of a single `git2` call; mutation of the store goes
/// through the critical-git-op serializer (`src/git_ops.rs`), not through
/// this handle, matching the adapter's read-only contract.
#[derive(Clone)]
pub struct Handle {
    repo: Arc<Mutex<git2::Repository>>,
}

impl Handle {
    fn with_repo<R>(&self, f: impl FnOnce(&git2::Repository) -> Result<R, Error>) -> Result<R, Error> {
        let repo = self.repo.lock().expect("git handle mutex poisoned");
        f(&repo)
    }

    /// Cheaper than `read_object`: only the object's size and type.
    pub fn read_header(&self, id: git2::Oid) -> Result<Option<(usize, git2::ObjectType)>, Error> {
        self.with_repo(|repo| match repo.odb()?.read_header(id) {
            Ok(header) => Ok(Some(header)),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e).context("failed to read object header"),
        })
    }

    pub fn read_object(&self, id: git2::Oid) -> Result<Option<Vec<u8>>, Error> {
        self.with_repo(|repo| match repo.find_object(id, None) {
            Ok(obj) => Ok(obj.peel_to_blob().ok().map(|b| b.content().to_vec())),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e).context("failed to read object"),
        })
    }

    /// Walks one level of a tree, mapping each child's raw id to the
    /// `(name, kind)` entries that reference it — duplicates are possible
    /// when the same subtree is referenced under multiple names.
    pub fn read_tree(
        &self,
        id: git2::Oid,
    ) -> Result<Option<Vec<(git2::Oid, String, EntryKind)>>, Error> {
        self.with_repo(|repo| {
            let tree = match repo.find_tree(id) {
                Ok(t) => t,
                Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(None),
                Err(e) => return Err(e).context("failed to read tree"),
            };

            let mut entries = Vec::with_capacity(tree.len());
            for entry in tree.iter() {
                let name = entry
                    .name()
                    .context("tree entry has non-utf8 name")?
                    .to_owned();
                let kind = translate_file_mode(entry.filemode())?;
                entries.push((entry.id(), name, kind));
            }
            Ok(Some(entries))
        })
    }

    pub fn check_tree_exists(&self, tree_id: TreeId) -> Result<bool, Error> {
        let id: git2::Oid = tree_id.into();
        self.with_repo(|repo| Ok(repo.find_tree(id).is_ok()))
    }
}

/// Idempotently creates a bare repository at `path`; returns `true` if it
/// was freshly created, `false` if one already existed.
pub fn ensure_bare_init(path: &Path) -> Result<bool, Error> {
    if git2::Repository::open_bare(path).is_ok() {
        return Ok(false);
    }

    std::fs::create_dir_all(path)
        .with_context(|| format!("failed to create bare repository directory '{}'", path.display()))?;

    let mut opts = git2::RepositoryInitOptions::new();
    opts.bare(true);
    opts.external_template(false);

    git2::Repository::init_opts(path, &opts)
        .with_context(|| format!("failed to init bare repository at '{}'", path.display()))?;

    Ok(true)
}

/// Stages everything under `stage_dir`, writes a tree and a parentless
/// commit against `store` (the repository rooted at `store_path`), and
/// returns the tree and commit identifiers. The commit has no parents and
/// no ref update — it exists only to anchor the tree for `keep_tag`.
pub fn initial_commit(
    store_path: &Path,
    stage_dir: &Path,
    message: &str,
) -> Result<(TreeId, git2::Oid), Error> {
    let repo = git2::Repository::open(store_path)
        .with_context(|| format!("failed to open store at '{}'", store_path.display()))?;

    let tree_id = build_tree_from_dir(&repo, stage_dir)?;
    let tree = repo.find_tree(tree_id).context("failed to look up freshly written tree")?;

    let sig = git2::Signature::now("reap", "reap@localhost").context("failed to build commit signature")?;
    let commit_id = repo
        .commit(None, &sig, &sig, message, &tree, &[])
        .context("failed to write orphan commit")?;

    Ok((TreeId::from(tree_id), commit_id))
}

fn build_tree_from_dir(repo: &git2::Repository, dir: &Path) -> Result<git2::Oid, Error> {
    let mut index = git2::Index::new().context("failed to create in-memory index")?;

    for entry in walkdir::WalkDir::new(dir).into_iter() {
        let entry = entry.context("failed to walk staged directory")?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .expect("walkdir entries are rooted under dir");

        let content = std::fs::read(entry.path())
            .with_context(|| format!("failed to read staged file '{}'", entry.path().display()))?;
        let blob_id = repo.blob(&content).context("failed to write blob")?;

        let mode = if is_executable(entry.path()) {
            git2::FileMode::BlobExecutable
        } else {
            git2::FileMode::Blob
        };

        index
            .add_frombuffer(
                &git2::IndexEntry {
                    ctime: git2::IndexTime::new(0, 0),
                    mtime: git2::IndexTime::new(0, 0),
                    dev: 0,
                    ino: 0,
                    mode: mode as u32,
                    uid: 0,
                    gid: 0,
                    file_size: content.len() as u32,
                    id: blob_id,
                    flags: 0,
                    flags_extended: 0,
                    path: rel.to_string_lossy().into_owned().into_bytes(),
                },
                &content,
            )
            .with_context(|| format!("failed to stage '{}'", rel.display()))?;
    }

    index.write_tree_to(repo).context("failed to write tree from staged index")
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}

/// Writes a tag object referencing `commit_id` under a reserved namespace
/// so its tree stays reachable across garbage collection. Returns `true`
/// if a new tag was written, `false` if an equivalent tag already existed.
pub fn keep_tag(store_path: &Path, commit_id: git2::Oid, message: &str) -> Result<bool, Error> {
    let repo = git2::Repository::open(store_path)
        .with_context(|| format!("failed to open store at '{}'", store_path.display()))?;

    let tag_name = format!("keep-{}", commit_id);
    let ref_name = format!("refs/keep/{}", tag_name);

    if repo.find_reference(&ref_name).is_ok() {
        return Ok(false);
    }

    let object = repo
        .find_object(commit_id, None)
        .context("failed to find commit to tag")?;
    let sig = git2::Signature::now("reap", "reap@localhost").context("failed to build tag signature")?;

    repo.tag(&tag_name, &object, &sig, message, false)
        .context("failed to write keep-tag")?;

    Ok(true)
}

/// Reads the commit id `HEAD` resolves to in the repository at `repo_path`,
/// or `None` for an unborn HEAD (an empty repository with no commits yet).
pub fn read_head_id(repo_path: &Path) -> Result<Option<git2::Oid>, Error> {
    let repo = git2::Repository::open(repo_path)
        .with_context(|| format!("failed to open repository at '{}'", repo_path.display()))?;

    match repo.head() {
        Ok(head) => Ok(head.target()),
        Err(e) if e.code() == git2::ErrorCode::UnbornBranch => Ok(None),
        Err(e) => Err(e).context("failed to resolve HEAD"),
    }
}

/// Points `refs/heads/{branch}` at `commit_id` in `store`, creating or
/// moving the ref as needed (`force = true`, matching the single-writer
/// guarantee the critical-op serializer already provides for `store_path`).
pub fn set_branch_ref(store_path: &Path, branch: &str, commit_id: git2::Oid) -> Result<(), Error> {
    let repo = git2::Repository::open(store_path)
        .with_context(|| format!("failed to open store at '{}'", store_path.display()))?;

    let ref_name = format!("refs/heads/{}", branch);
    repo.reference(&ref_name, commit_id, true, "reap: pin adopted tree")
        .with_context(|| format!("failed to set branch ref '{}'", ref_name))?;

    Ok(())
}

/// Invokes an external `git` binary (through an optional launcher prefix,
/// e.g. `["env", "GIT_CONFIG_NOSYSTEM=1"]`) to fetch `src_path`'s objects
/// into `tmp_path`'s object database, sharing `tmp_path`'s store with the
/// caller without pulling in `src_path`'s refs. Returns whether the fetch
/// reported success.
pub fn fetch_via_tmp_repo(
    tmp_path: &Path,
    src_path: &Path,
    refspec: Option<&str>,
    git_bin: &str,
    launcher: &[String],
) -> Result<bool, Error> {
    let mut cmd = if let Some((head, rest)) = launcher.split_first() {
        let mut c = Command::new(head);
        c.args(rest).arg(git_bin);
        c
    } else {
        Command::new(git_bin)
    };

    cmd.arg("fetch")
        .arg("--no-tags")
        .arg(src_path)
        .arg(refspec.unwrap_or("+refs/heads/*:refs/fetched/*"))
        .current_dir(tmp_path)
        .env_remove("GIT_DIR")
        .env_remove("GIT_WORK_TREE");

    let output = cmd.output().context("failed to spawn git fetch")?;
    if !output.status.success() {
        tracing::warn!(
            stderr = %String::from_utf8_lossy(&output.stderr),
            "fetch-via-tmp-repo failed"
        );
    }

    Ok(output.status.success())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn translates_known_file_modes() {
        assert_eq!(translate_file_mode(0o100644).unwrap(), EntryKind::File);
        assert_eq!(translate_file_mode(0o100755).unwrap(), EntryKind::Executable);
        assert_eq!(translate_file_mode(0o040000).unwrap(), EntryKind::Tree);
        assert!(translate_file_mode(0o120000).is_err());
    }

    #[test]
    fn open_returns_none_for_non_repository_path() {
        let dir = tempdir().unwrap();
        let store = GitStore::new(dir.path());
        assert!(store.open().unwrap().is_none());
    }

    #[test]
    fn ensure_bare_init_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");

        assert!(ensure_bare_init(&path).unwrap());
        assert!(!ensure_bare_init(&path).unwrap());

        let store = GitStore::new(&path);
        assert!(store.open().unwrap().is_some());
    }

    #[test]
    fn initial_commit_and_keep_tag_round_trip() {
        let root = tempdir().unwrap();
        let store_path = root.path().join("store");
        ensure_bare_init(&store_path).unwrap();

        let stage = tempdir().unwrap();
        std::fs::write(stage.path().join("a.txt"), b"hello").unwrap();

        let (tree_id, commit_id) = initial_commit(&store_path, stage.path(), "import").unwrap();

        let store = GitStore::new(&store_path);
        let handle = store.open().unwrap().unwrap();
        assert!(handle.check_tree_exists(tree_id).unwrap());

        assert!(keep_tag(&store_path, commit_id, "keep").unwrap());
        assert!(!keep_tag(&store_path, commit_id, "keep").unwrap());
    }

    #[test]
    fn read_head_id_follows_head_to_the_tip_commit() {
        let root = tempdir().unwrap();
        let store_path = root.path().join("store");
        ensure_bare_init(&store_path).unwrap();

        let stage = tempdir().unwrap();
        std::fs::write(stage.path().join("a.txt"), b"hello").unwrap();
        let (_tree_id, commit_id) = initial_commit(&store_path, stage.path(), "import").unwrap();
        set_branch_ref(&store_path, "main", commit_id).unwrap();

        {
            let repo = git2::Repository::open(&store_path).unwrap();
            repo.set_head("refs/heads/main").unwrap();
        }

        assert_eq!(read_head_id(&store_path).unwrap(), Some(commit_id));
    }

    #[test]
    fn read_head_id_is_none_for_an_unborn_branch() {
        let root = tempdir().unwrap();
        let store_path = root.path().join("store");
        ensure_bare_init(&store_path).unwrap();

        assert_eq!(read_head_id(&store_path).unwrap(), None);
    }

    #[test]
    fn set_branch_ref_moves_an_existing_branch() {
        let root = tempdir().unwrap();
        let store_path = root.path().join("store");
        ensure_bare_init(&store_path).unwrap();

        let stage = tempdir().unwrap();
        std::fs::write(stage.path().join("a.txt"), b"hello").unwrap();
        let (_tree_id, first) = initial_commit(&store_path, stage.path(), "first").unwrap();
        set_branch_ref(&store_path, "adopted", first).unwrap();

        std::fs::write(stage.path().join("b.txt"), b"world").unwrap();
        let (_tree_id, second) = initial_commit(&store_path, stage.path(), "second").unwrap();
        set_branch_ref(&store_path, "adopted", second).unwrap();

        let repo = git2::Repository::open(&store_path).unwrap();
        let reference = repo.find_reference("refs/heads/adopted").unwrap();
        assert_eq!(reference.target(), Some(second));
    }

    #[test]
    fn read_tree_reports_one_level_of_entries() {
        let root = tempdir().unwrap();
        let store_path = root.path().join("store");
        ensure_bare_init(&store_path).unwrap();

        let stage = tempdir().unwrap();
        std::fs::create_dir(stage.path().join("sub")).unwrap();
        std::fs::write(stage.path().join("sub").join("b.txt"), b"b").unwrap();
        std::fs::write(stage.path().join("a.txt"), b"a").unwrap();

        let (tree_id, _commit_id) = initial_commit(&store_path, stage.path(), "import").unwrap();

        let store = GitStore::new(&store_path);
        let handle = store.open().unwrap().unwrap();
        let entries = handle.read_tree(tree_id.into()).unwrap().unwrap();

        let names: Vec<&str> = entries.iter().map(|(_, name, _)| name.as_str()).collect();
        assert!(names.contains(&"a.txt"));
        assert!(names.contains(&"sub"));
    }
}

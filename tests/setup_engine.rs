//! End-to-end exercises of `reap::setup::run` over real temp stores: archive
//! materialization via a dist-dir hit, generator deduplication across
//! repositories that share one descriptor, a generator/declared-tree
//! mismatch surfacing as a failure, and the round-trip idempotence property
//! (re-running setup against its own emitted output is a no-op).

use reap::config::RepoConfig;
use reap::error::{exit_code_for, ExitCode};
use reap::git_store::{self, GitStore};
use reap::hash::{ContentHash, TreeId};
use reap::setup::{self, SetupMode, SetupOptions};

fn base_opts(repo_config: RepoConfig, store: &std::path::Path, cas: &std::path::Path) -> SetupOptions {
    SetupOptions {
        repo_config,
        git_store_root: store.to_path_buf(),
        cas_root: cas.to_path_buf(),
        dist_dirs: Vec::new(),
        jobs: Some(2),
        git_bin: "git".into(),
        launcher: Vec::new(),
        remote_cas: None,
    }
}

#[test]
fn archive_root_is_fetched_from_a_dist_dir_and_materialized() {
    let dist = tempfile::tempdir().unwrap();
    let tarball = {
        let mut buf = Vec::new();
        let staged = tempfile::tempdir().unwrap();
        std::fs::write(staged.path().join("README"), b"archived content").unwrap();
        let encoder = flate2::write::GzEncoder::new(&mut buf, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.append_dir_all(".", staged.path()).unwrap();
        builder.into_inner().unwrap().finish().unwrap();
        buf
    };
    std::fs::write(dist.path().join("thing.tar.gz"), &tarball).unwrap();
    let content_hash = ContentHash::digest(&tarball);

    let store = tempfile::tempdir().unwrap();
    let cas = tempfile::tempdir().unwrap();

    let cfg_json = format!(
        r#"{{"main": "a", "repositories": {{"a": {{"repository": {{
            "type": "archive",
            "content": "{}",
            "fetch": "https://example.invalid/thing.tar.gz",
            "distfile": "thing.tar.gz"
        }}}}}}}}"#,
        content_hash
    );
    let cfg = RepoConfig::from_str(&cfg_json).unwrap();

    let mut opts = base_opts(cfg, store.path(), cas.path());
    opts.dist_dirs = vec![dist.path().to_path_buf()];

    let outcome = setup::run(opts, SetupMode::Setup, None).unwrap();
    let rewritten = outcome.rewritten.unwrap();
    let repo_field = &rewritten["repositories"]["a"]["repository"];
    assert_eq!(repo_field[0], serde_json::Value::from("git tree"));

    let tree_id: TreeId = repo_field[1].as_str().unwrap().parse().unwrap();
    let handle = GitStore::new(store.path()).open().unwrap().unwrap();
    assert!(handle.check_tree_exists(tree_id).unwrap());
}

#[test]
fn repositories_sharing_one_generator_descriptor_run_it_once() {
    let store = tempfile::tempdir().unwrap();
    let cas = tempfile::tempdir().unwrap();
    let counter = tempfile::tempdir().unwrap().into_path();
    let counter_file = counter.join("counter.txt");

    // Compute the tree id the generator command below is expected to
    // produce, the same way `tree_fetch.rs`'s own tests do.
    let reference_store = tempfile::tempdir().unwrap();
    let staged = tempfile::tempdir().unwrap();
    std::fs::write(staged.path().join("a.txt"), b"hi").unwrap();
    git_store::ensure_bare_init(reference_store.path()).unwrap();
    let (expected_tree_id, _commit_id) =
        git_store::initial_commit(reference_store.path(), staged.path(), "reference").unwrap();

    let cfg_json = format!(
        r#"{{"repositories": {{
            "shared": {{"repository": {{
                "type": "git tree",
                "tree_id": "{tree_id}",
                "command": ["sh", "-c", "echo 1 >> {counter} && printf hi > a.txt"],
                "inherit_env": ["PATH"]
            }}}},
            "a": {{"repository": "shared"}},
            "b": {{"repository": "shared"}}
        }}}}"#,
        tree_id = expected_tree_id,
        counter = counter_file.display(),
    );
    let cfg = RepoConfig::from_str(&cfg_json).unwrap();
    let opts = base_opts(cfg, store.path(), cas.path());

    setup::run(opts, SetupMode::Update, None).unwrap();

    let invocations = std::fs::read_to_string(&counter_file).unwrap();
    assert_eq!(invocations.lines().count(), 1, "generator ran more than once: {:?}", invocations);
}

#[test]
fn generator_tree_mismatch_fails_setup() {
    let store = tempfile::tempdir().unwrap();
    let cas = tempfile::tempdir().unwrap();

    let bogus_tree_id = TreeId::from_raw([0x42u8; 20]);
    let cfg_json = format!(
        r#"{{"main": "a", "repositories": {{"a": {{"repository": {{
            "type": "git tree",
            "tree_id": "{}",
            "command": ["sh", "-c", "printf nope > a.txt"],
            "inherit_env": ["PATH"]
        }}}}}}}}"#,
        bogus_tree_id
    );
    let cfg = RepoConfig::from_str(&cfg_json).unwrap();
    let opts = base_opts(cfg, store.path(), cas.path());

    let err = setup::run(opts, SetupMode::Setup, None).unwrap_err();
    assert!(format!("{:#}", err).contains("tree"));
}

#[test]
fn cyclic_repository_indirection_exits_with_the_config_error_code() {
    let store = tempfile::tempdir().unwrap();
    let cas = tempfile::tempdir().unwrap();

    let cfg = RepoConfig::from_str(
        r#"{"main": "a", "repositories": {
            "a": {"repository": "b"},
            "b": {"repository": "a"}
        }}"#,
    )
    .unwrap();

    let err = setup::run(base_opts(cfg, store.path(), cas.path()), SetupMode::Setup, None).unwrap_err();
    assert_eq!(exit_code_for(&err), ExitCode::ConfigError);
}

#[test]
fn unresolvable_binding_exits_with_the_config_error_code() {
    let store = tempfile::tempdir().unwrap();
    let cas = tempfile::tempdir().unwrap();

    let cfg = RepoConfig::from_str(
        r#"{"main": "a", "repositories": {
            "a": {"repository": ["file", "/a"], "bindings": {"x": "missing"}}
        }}"#,
    )
    .unwrap();

    let err = setup::run(base_opts(cfg, store.path(), cas.path()), SetupMode::Setup, None).unwrap_err();
    assert_eq!(exit_code_for(&err), ExitCode::ConfigError);
}

#[test]
fn setup_output_is_idempotent_under_a_second_run() {
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("a.txt"), b"hi").unwrap();

    let store = tempfile::tempdir().unwrap();
    let cas = tempfile::tempdir().unwrap();

    let cfg = RepoConfig::from_str(&format!(
        r#"{{"main": "a", "repositories": {{"a": {{"repository": ["file", "{}"]}}}}}}"#,
        src.path().display()
    ))
    .unwrap();

    let first = setup::run(base_opts(cfg, store.path(), cas.path()), SetupMode::Setup, None).unwrap();
    let first_output = first.rewritten.unwrap();

    // Feed the emitted configuration back in as a fresh repository
    // configuration and run setup again against the same store.
    let second_cfg = RepoConfig::parse(&first_output).unwrap();
    let second = setup::run(base_opts(second_cfg, store.path(), cas.path()), SetupMode::Setup, None).unwrap();
    let second_output = second.rewritten.unwrap();

    assert_eq!(
        first_output["repositories"]["a"]["repository"],
        second_output["repositories"]["a"]["repository"]
    );
}

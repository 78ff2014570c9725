use anyhow::{Context, Error};
use reap::config::{self, RepoConfig, RunControl};
use reap::setup::SetupOptions;
use std::path::PathBuf;
use structopt::StructOpt;
use tracing_subscriber::filter::LevelFilter;

mod fetch;
mod setup;
mod update;

#[derive(StructOpt)]
enum Command {
    /// Materializes the repositories reachable from `main` into the shared
    /// Git store; prints nothing
    #[structopt(name = "fetch")]
    Fetch(fetch::Args),
    /// Materializes the repositories reachable from `main` and prints the
    /// configuration rewritten to pinned `git tree` roots
    #[structopt(name = "setup")]
    Setup(setup::Args),
    /// Materializes every repository in the configuration and prints the
    /// rewritten configuration
    #[structopt(name = "update")]
    Update(update::Args),
}

fn parse_level(s: &str) -> Result<LevelFilter, Error> {
    s.parse::<LevelFilter>()
        .map_err(|_| anyhow::anyhow!("failed to parse level '{}'", s))
}

#[derive(StructOpt)]
struct Opts {
    /// Path to the repository configuration JSON document
    #[structopt(short, long, parse(from_os_str))]
    config: PathBuf,
    /// Path to the run-control JSON document (distdirs, checkout locations)
    #[structopt(long = "run-control", parse(from_os_str))]
    run_control: Option<PathBuf>,
    /// Root of the shared bare Git object store
    #[structopt(
        long = "git-store",
        default_value = "git-store",
        parse(from_os_str)
    )]
    git_store: PathBuf,
    /// Root of the local content-addressed archive cache
    #[structopt(long = "cas-dir", default_value = "cas", parse(from_os_str))]
    cas_dir: PathBuf,
    /// Path to the `git` binary invoked for fetch/commit operations
    #[structopt(long = "git-bin", default_value = "git")]
    git_bin: String,
    /// Number of worker threads in the task system; defaults to the number
    /// of available cores
    #[structopt(short, long)]
    jobs: Option<usize>,
    #[structopt(
        short = "L",
        long = "log-level",
        default_value = "info",
        parse(try_from_str = parse_level),
        long_help = "The log level for messages, only log messages at or above the level will be emitted.

Possible values:
* off
* error
* warn
* info (default)
* debug
* trace"
    )]
    log_level: LevelFilter,
    /// Output log messages as json
    #[structopt(long)]
    json: bool,
    #[structopt(subcommand)]
    cmd: Command,
}

/// Everything built once from [`Opts`] that every subcommand needs to
/// construct a [`SetupOptions`]. Kept separate from `Opts` itself so a
/// subcommand only ever sees what it asked for.
struct Common {
    repo_config: RepoConfig,
    git_store: PathBuf,
    cas_dir: PathBuf,
    dist_dirs: Vec<PathBuf>,
    jobs: Option<usize>,
    git_bin: String,
}

impl Common {
    fn build(opts: &Opts) -> Result<Self, Error> {
        let text = std::fs::read_to_string(&opts.config)
            .with_context(|| format!("failed to read repository configuration '{}'", opts.config.display()))?;
        let repo_config = RepoConfig::from_str(&text)
            .with_context(|| format!("failed to parse repository configuration '{}'", opts.config.display()))?;

        let run_control = match &opts.run_control {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read run-control input '{}'", path.display()))?;
                RunControl::from_str(&text)
                    .with_context(|| format!("failed to parse run-control input '{}'", path.display()))?
            }
            None => RunControl::default(),
        };

        let cwd = std::env::current_dir().context("failed to determine current directory")?;
        let workspace_root = config::detect_workspace_root(&cwd, &["workspace.lock", ".git"]);

        let mut dist_dirs = Vec::new();
        for loc in run_control.distdirs() {
            if let Some(resolved) = config::resolve_location(loc, workspace_root.as_deref())? {
                dist_dirs.push(resolved.path);
            }
        }

        Ok(Self {
            repo_config,
            git_store: opts.git_store.clone(),
            cas_dir: opts.cas_dir.clone(),
            dist_dirs,
            jobs: opts.jobs,
            git_bin: opts.git_bin.clone(),
        })
    }

    fn into_setup_options(self) -> Result<SetupOptions, Error> {
        Ok(SetupOptions {
            repo_config: self.repo_config,
            git_store_root: self.git_store,
            cas_root: self.cas_dir,
            dist_dirs: self.dist_dirs,
            jobs: self.jobs,
            git_bin: self.git_bin,
            launcher: Vec::new(),
            remote_cas: None,
        })
    }
}

fn init_tracing(level: LevelFilter, json: bool) -> Result<(), Error> {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());
    let subscriber = tracing_subscriber::FmtSubscriber::builder().with_env_filter(env_filter);

    if json {
        tracing::subscriber::set_global_default(subscriber.json().finish())
    } else {
        tracing::subscriber::set_global_default(subscriber.finish())
    }
    .context("failed to set default subscriber")
}

fn real_main() -> Result<(), Error> {
    let opts = Opts::from_args();
    init_tracing(opts.log_level, opts.json)?;

    let common = Common::build(&opts)?;

    match opts.cmd {
        Command::Fetch(args) => fetch::cmd(common, args),
        Command::Setup(args) => setup::cmd(common, args),
        Command::Update(args) => update::cmd(common, args),
    }
}

fn main() {
    match real_main() {
        Ok(()) => {}
        Err(e) => {
            tracing::error!("{:#}", e);
            std::process::exit(reap::error::exit_code_for(&e).code());
        }
    }
}

use super::Common;
use anyhow::{Context, Error};

#[derive(structopt::StructOpt)]
pub struct Args {
    /// Overrides the main repository name computed from the repository
    /// configuration's own `main` field
    #[structopt(long)]
    pub main: Option<String>,
}

/// Materializes the main-rooted closure and prints the rewritten
/// configuration (every root replaced with its pinned `git tree` form) to
/// stdout.
pub(crate) fn cmd(common: Common, args: Args) -> Result<(), Error> {
    let opts = common.into_setup_options()?;
    let outcome = reap::setup::run(opts, reap::setup::SetupMode::Setup, args.main)?;

    let rewritten = outcome
        .rewritten
        .context("setup mode always produces a rewritten configuration")?;
    println!("{}", serde_json::to_string_pretty(&rewritten)?);
    Ok(())
}

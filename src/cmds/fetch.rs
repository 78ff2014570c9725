use super::Common;
use anyhow::Error;
use reap::setup::{self, SetupMode};

#[derive(structopt::StructOpt)]
pub struct Args {
    /// Overrides the main repository name computed from the repository
    /// configuration's own `main` field
    #[structopt(long)]
    pub main: Option<String>,
}

/// Materializes the main-rooted closure into the shared Git store without
/// emitting a rewritten configuration.
pub(crate) fn cmd(common: Common, args: Args) -> Result<(), Error> {
    let opts = common.into_setup_options()?;
    let outcome = setup::run(opts, SetupMode::Fetch, args.main)?;
    tracing::info!(
        repositories = outcome.closure.to_setup.len(),
        "fetch complete"
    );
    Ok(())
}

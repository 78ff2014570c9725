use super::Common;
use anyhow::{Context, Error};

#[derive(structopt::StructOpt)]
pub struct Args {}

/// Materializes every repository in the configuration, not just the
/// main-rooted closure, and prints the rewritten configuration to stdout.
pub(crate) fn cmd(common: Common, _args: Args) -> Result<(), Error> {
    let opts = common.into_setup_options()?;
    let outcome = reap::setup::run(opts, reap::setup::SetupMode::Update, None)?;

    let rewritten = outcome
        .rewritten
        .context("update mode always produces a rewritten configuration")?;
    println!("{}", serde_json::to_string_pretty(&rewritten)?);
    Ok(())
}

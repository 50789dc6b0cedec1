mod build;
mod cli;
mod sessions;

use std::process::ExitCode;

use anyhow::{Context, Result};
use distro_forge::logging;
use distro_forge::BuildConfig;

pub(crate) use cli::{Cli, Command};

pub(crate) fn dispatch(cli: Cli) -> Result<ExitCode> {
    let config = BuildConfig::load(&cli.config)
        .with_context(|| format!("loading build configuration '{}'", cli.config.display()))?;
    logging::init(cli.log_format, Some(config.build.state_dir.as_path()))?;

    match cli.command {
        Command::Build(args) => build::run_build(config, args),
        Command::Sessions => sessions::list_sessions(&config).map(|()| ExitCode::SUCCESS),
        Command::Prune { keep } => sessions::prune_sessions(&config, keep).map(|()| ExitCode::SUCCESS),
    }
}

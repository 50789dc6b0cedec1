use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use distro_forge::config::DEFAULT_CONFIG_FILE;
use distro_forge::logging::LogFormat;
use distro_forge::Variant;

#[derive(Debug, Parser)]
#[command(
    name = "distro-forge",
    version,
    about = "Phased, resumable builds of bootable distribution images"
)]
pub(crate) struct Cli {
    /// Build configuration file.
    #[arg(long, global = true, value_name = "PATH", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Run, or resume, a build session.
    Build(BuildArgs),
    /// List resumable and archived sessions.
    Sessions,
    /// Delete all but the newest archived sessions.
    Prune {
        #[arg(long, value_name = "N")]
        keep: usize,
    },
}

#[derive(Debug, Args)]
pub(crate) struct BuildArgs {
    #[arg(long, value_enum, required_unless_present = "resume")]
    pub variant: Option<Variant>,

    /// Continue a failed or interrupted session at its first incomplete phase.
    #[arg(long, value_name = "SESSION_ID")]
    pub resume: Option<String>,

    /// Record the package tiers as skipped instead of installing them.
    #[arg(long)]
    pub skip_packages: bool,

    /// Probe the host, resolve priorities and print the phase plan.
    #[arg(long)]
    pub dry_run: bool,

    /// Staged root directory; overrides `[build].root`.
    #[arg(long, value_name = "PATH")]
    pub root: Option<PathBuf>,
}

//! Tracing subscriber setup.
//!
//! Two sinks: a human stream on stderr filtered by `RUST_LOG` (default
//! `info`), and a JSON-lines event log under the state directory that keeps
//! every retry, skip, pause and phase transition for post-mortem reports.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Name of the structured event log inside the state directory.
pub const EVENTS_FILE: &str = "events.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

pub fn init(format: LogFormat, state_dir: Option<&Path>) -> Result<()> {
    let stderr_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let stderr_layer = match format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
            .with_filter(stderr_filter)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .json()
            .with_filter(stderr_filter)
            .boxed(),
    };

    let events_layer = match state_dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating state directory '{}'", dir.display()))?;
            let path = dir.join(EVENTS_FILE);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("opening event log '{}'", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .json()
                    .with_current_span(false)
                    .with_filter(EnvFilter::new("distro_forge=info")),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(events_layer)
        .try_init()
        .context("installing tracing subscriber")
}

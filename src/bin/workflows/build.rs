use std::process::ExitCode;

use anyhow::{Context, Result};
use distro_forge::orchestrator::estimated_total;
use distro_forge::stager::mounts::install_interrupt_handler;
use distro_forge::{BuildConfig, BuildExit, BuildReport, BuildRequest, Catalog, Orchestrator, Toolbox};

use super::cli::BuildArgs;

pub(crate) fn run_build(config: BuildConfig, args: BuildArgs) -> Result<ExitCode> {
    install_interrupt_handler().context("installing interrupt handler")?;
    let catalog = Catalog::load(&config.build.catalog).with_context(|| {
        format!("loading package catalog '{}'", config.build.catalog.display())
    })?;

    let request = BuildRequest {
        variant: args.variant,
        resume: args.resume,
        skip_packages: args.skip_packages,
        dry_run: args.dry_run,
        root: args.root,
    };
    let toolbox = Toolbox::system(&config);
    let report = Orchestrator::new(config, catalog, toolbox).run(&request);
    print_summary(&report, request.dry_run);
    Ok(ExitCode::from(report.exit.code() as u8))
}

fn print_summary(report: &BuildReport, dry_run: bool) {
    let tag = match &report.session_id {
        Some(id) => format!("[forge:{id}]"),
        None => "[forge]".to_string(),
    };

    if dry_run && report.exit == BuildExit::Success {
        println!("{tag} dry run; nothing staged");
        for planned in &report.plan {
            println!("{tag}   {planned}");
        }
        let total = estimated_total(&report.plan);
        println!("{tag} estimated time: ~{} min", total.as_secs().div_ceil(60));
    }
    for reason in &report.pauses {
        println!("{tag} paused: {reason}");
    }
    if !report.executed.is_empty() {
        let phases: Vec<String> = report.executed.iter().map(|p| p.index().to_string()).collect();
        println!("{tag} phases run: {}", phases.join(", "));
    }

    match report.exit {
        BuildExit::Success if dry_run => {}
        BuildExit::Success | BuildExit::Partial => {
            if let Some(image) = &report.image {
                println!("{tag} image: {}", image.display());
                println!("{tag} checksums: {0}.md5, {0}.sha256", image.display());
            }
            if let Some(path) = &report.report_path {
                println!("{tag} installation report: {}", path.display());
            }
            if report.skipped > 0 {
                println!(
                    "{tag} completed with {} skipped packages (see installation report)",
                    report.skipped
                );
            } else {
                println!("{tag} completed");
            }
        }
        BuildExit::Prerequisite => {
            println!(
                "{tag} prerequisites not met: {}",
                report.error.as_deref().unwrap_or("unknown error")
            );
        }
        BuildExit::Fatal => {
            println!(
                "{tag} failed: {}",
                report.error.as_deref().unwrap_or("unknown error")
            );
            if let Some(id) = &report.session_id {
                println!("{tag} resume with: distro-forge build --resume {id}");
            }
        }
    }
}

//! Kernel step: make sure the staged root boots with the intended kernel.
//!
//! The kernel build itself is an opaque external command that produces one
//! binary. This module only decides whether that command has to run, checks
//! that the artifact exists afterwards and installs it (plus an optional
//! initrd) as `boot/vmlinuz` and `boot/initrd.img` in the root. Without a
//! `[kernel]` section the newest kernel shipped by a package is used.

use std::cmp::Ordering;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::KernelConfig;
use crate::process::{CommandRunner, CommandSpec, ExecError};

pub const KERNEL_PATH: &str = "boot/vmlinuz";
pub const INITRD_PATH: &str = "boot/initrd.img";

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("kernel artifact '{}' does not exist and no [kernel].build command is configured", .path.display())]
    MissingArtifact { path: PathBuf },

    #[error("kernel build '{command}' exited with {code:?}: {detail}")]
    BuildFailed {
        command: String,
        code: Option<i32>,
        detail: String,
    },

    #[error("kernel build '{command}' succeeded but '{}' was not produced", .path.display())]
    NotProduced { command: String, path: PathBuf },

    #[error("no kernel configured and no boot/vmlinuz-* found in '{}'", .root.display())]
    NoKernel { root: PathBuf },

    #[error("initrd '{}' does not exist", .path.display())]
    MissingInitrd { path: PathBuf },

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// How the kernel artifact was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelOutcome {
    /// Configured artifact already existed.
    AlreadyPresent,
    /// The external build ran in this invocation.
    BuiltNow,
    /// Taken from a kernel package in the root.
    Packaged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelInstall {
    pub outcome: KernelOutcome,
    pub source: PathBuf,
    pub kernel: PathBuf,
    pub initrd: Option<PathBuf>,
    pub sha256: String,
}

/// Obtain the kernel and install it into `root`.
pub fn install_kernel(
    config: Option<&KernelConfig>,
    runner: &dyn CommandRunner,
    root: &Path,
) -> Result<KernelInstall, KernelError> {
    let (outcome, source, initrd) = match config {
        Some(config) => {
            let outcome = ensure_artifact(config, runner)?;
            if let Some(initrd) = &config.initrd {
                if !initrd.is_file() {
                    return Err(KernelError::MissingInitrd {
                        path: initrd.clone(),
                    });
                }
            }
            (outcome, config.artifact.clone(), config.initrd.clone())
        }
        None => {
            let (kernel, initrd) = packaged_kernel(root)?;
            (KernelOutcome::Packaged, kernel, initrd)
        }
    };

    let kernel = root.join(KERNEL_PATH);
    copy_into(&source, &kernel)?;
    let installed_initrd = match &initrd {
        Some(initrd) => {
            let target = root.join(INITRD_PATH);
            copy_into(initrd, &target)?;
            Some(target)
        }
        None => None,
    };
    let sha256 = sha256_file(&kernel).map_err(|source| KernelError::Io {
        path: kernel.clone(),
        source,
    })?;

    tracing::info!(
        event = "kernel_installed",
        outcome = ?outcome,
        source = %source.display(),
        initrd = installed_initrd.is_some(),
        sha256 = %sha256,
        "kernel installed into staged root"
    );
    Ok(KernelInstall {
        outcome,
        source,
        kernel,
        initrd: installed_initrd,
        sha256,
    })
}

/// Run the external build only when the artifact is missing or a rebuild
/// was asked for.
pub fn ensure_artifact(
    config: &KernelConfig,
    runner: &dyn CommandRunner,
) -> Result<KernelOutcome, KernelError> {
    if config.artifact.is_file() && !config.rebuild {
        return Ok(KernelOutcome::AlreadyPresent);
    }
    let Some(command) = build_command(config) else {
        return Err(KernelError::MissingArtifact {
            path: config.artifact.clone(),
        });
    };

    let line = command.display_line();
    tracing::info!(event = "kernel_build_started", command = %line, "running external kernel build");
    let output = runner.run(&command)?;
    if !output.success() {
        return Err(KernelError::BuildFailed {
            command: line,
            code: output.code,
            detail: output.combined(),
        });
    }
    if !config.artifact.is_file() {
        return Err(KernelError::NotProduced {
            command: line,
            path: config.artifact.clone(),
        });
    }
    Ok(KernelOutcome::BuiltNow)
}

fn build_command(config: &KernelConfig) -> Option<CommandSpec> {
    let (program, args) = config.build.split_first()?;
    let mut command = CommandSpec::new(program.clone())
        .args(args.iter().cloned())
        .label("kernel build");
    if let Some(workdir) = &config.workdir {
        command = command.current_dir(workdir);
    }
    Some(command)
}

/// Newest `boot/vmlinuz-<release>` in the root and its matching initrd.
pub fn packaged_kernel(root: &Path) -> Result<(PathBuf, Option<PathBuf>), KernelError> {
    let boot = root.join("boot");
    let entries = match fs::read_dir(&boot) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(KernelError::NoKernel {
                root: root.to_path_buf(),
            })
        }
        Err(source) => return Err(KernelError::Io { path: boot, source }),
    };

    let mut releases: Vec<String> = entries
        .filter_map(Result::ok)
        .filter_map(|e| {
            e.file_name()
                .to_str()
                .and_then(|name| name.strip_prefix("vmlinuz-"))
                .map(str::to_string)
        })
        .collect();
    releases.sort_by(|a, b| compare_releases(a, b));
    let release = releases.pop().ok_or_else(|| KernelError::NoKernel {
        root: root.to_path_buf(),
    })?;

    let initrd = boot.join(format!("initrd.img-{release}"));
    Ok((
        boot.join(format!("vmlinuz-{release}")),
        initrd.is_file().then_some(initrd),
    ))
}

/// Compare kernel releases by their numeric runs, so 6.10 sorts after 6.9.
pub fn compare_releases(a: &str, b: &str) -> Ordering {
    let key = |s: &str| -> Vec<u64> {
        s.split(|c: char| !c.is_ascii_digit())
            .filter(|part| !part.is_empty())
            .filter_map(|part| part.parse().ok())
            .collect()
    };
    key(a).cmp(&key(b)).then_with(|| a.cmp(b))
}

fn copy_into(source: &Path, target: &Path) -> Result<(), KernelError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| KernelError::Io {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    fs::copy(source, target).map_err(|e| KernelError::Io {
        path: source.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

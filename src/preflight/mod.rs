//! Environment probing before any work starts.
//!
//! Validates that the host has the required tools, enough disk and the
//! privilege level staging needs. This is read-only and runs on every
//! invocation, including resumes, before a single directory is created.
//!
//! # Example
//!
//! ```rust,ignore
//! use distro_forge::preflight::{probe, SystemHost};
//!
//! let report = probe(&config, &SystemHost)?;
//! println!("{} GiB free", report.disk_available >> 30);
//! ```

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::config::BuildConfig;
use crate::monitor::host::{self, MemoryInfo};

const GIB: u64 = 1024 * 1024 * 1024;

/// Required host tools for staging and assembling an image.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("chroot", "coreutils"),
    ("mount", "mount"),
    ("mksquashfs", "squashfs-tools"),
    ("xorriso", "xorriso"),
    ("grub-mkrescue", "grub-common"),
    ("mformat", "mtools"),
];

/// Needed only when the base root is bootstrapped rather than unpacked.
pub const BOOTSTRAP_TOOL: (&str, &str) = ("debootstrap", "debootstrap");

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingTool {
    pub command: String,
    pub package: String,
}

impl fmt::Display for MissingTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (install: {})", self.command, self.package)
    }
}

#[derive(Debug, Error)]
pub enum PrereqError {
    #[error(
        "insufficient disk space at '{}': {} GiB required, {} GiB available",
        .path.display(),
        .required / GIB,
        .available / GIB
    )]
    InsufficientDiskSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    #[error("missing required host tools: {}", .tools.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "))]
    MissingTool { tools: Vec<MissingTool> },

    #[error("staging requires root privileges (running as uid {euid})")]
    PrivilegeError { euid: u32 },

    #[error("probing {what}: {source}")]
    Probe {
        what: String,
        #[source]
        source: io::Error,
    },
}

/// Read-only view of the build host.
pub trait HostInspector: Send + Sync {
    fn tool_exists(&self, command: &str) -> bool;
    fn available_disk(&self, path: &Path) -> io::Result<u64>;
    fn effective_uid(&self) -> u32;
    fn memory(&self) -> io::Result<MemoryInfo>;
    fn cpu_count(&self) -> usize;
    fn load_average(&self) -> Option<f64>;
}

/// The real host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemHost;

impl HostInspector for SystemHost {
    fn tool_exists(&self, command: &str) -> bool {
        which::which(command).is_ok()
    }

    fn available_disk(&self, path: &Path) -> io::Result<u64> {
        host::available_disk(path)
    }

    fn effective_uid(&self) -> u32 {
        host::effective_uid()
    }

    fn memory(&self) -> io::Result<MemoryInfo> {
        host::read_meminfo()
    }

    fn cpu_count(&self) -> usize {
        host::cpu_count()
    }

    fn load_average(&self) -> Option<f64> {
        host::load_average()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentReport {
    pub disk_path: PathBuf,
    pub disk_available: u64,
    pub disk_required: u64,
    pub memory_total: u64,
    pub memory_available: u64,
    pub cpus: usize,
    pub load_average: Option<f64>,
    pub euid: u32,
    pub tools_checked: Vec<String>,
}

/// Host tools needed for this configuration, deduplicated, in check order.
pub fn required_tools(config: &BuildConfig) -> Vec<(String, String)> {
    let mut tools: Vec<(String, String)> = REQUIRED_TOOLS
        .iter()
        .map(|(cmd, pkg)| (cmd.to_string(), pkg.to_string()))
        .collect();
    if config.base.tarball.is_none() {
        tools.push((BOOTSTRAP_TOOL.0.to_string(), BOOTSTRAP_TOOL.1.to_string()));
    }
    for extra in &config.host.extra_tools {
        let (cmd, pkg) = extra.split_once(':').unwrap_or((extra.as_str(), extra.as_str()));
        tools.push((cmd.to_string(), pkg.to_string()));
    }
    if let Some(program) = config.kernel.as_ref().and_then(|k| k.build.first()) {
        tools.push((program.clone(), program.clone()));
    }

    let mut seen = std::collections::HashSet::new();
    tools.retain(|(cmd, _)| seen.insert(cmd.clone()));
    tools
}

/// Check every prerequisite. Creates nothing.
pub fn probe(config: &BuildConfig, host: &dyn HostInspector) -> Result<EnvironmentReport, PrereqError> {
    let euid = host.effective_uid();
    if config.host.require_root && euid != 0 {
        return Err(PrereqError::PrivilegeError { euid });
    }

    let tools = required_tools(config);
    let missing: Vec<MissingTool> = tools
        .iter()
        .filter(|(cmd, _)| !host.tool_exists(cmd))
        .map(|(cmd, pkg)| MissingTool {
            command: cmd.clone(),
            package: pkg.clone(),
        })
        .collect();
    if !missing.is_empty() {
        return Err(PrereqError::MissingTool { tools: missing });
    }

    let disk_path = config.build.root.clone();
    let disk_required = config.host.min_disk_gb.saturating_mul(GIB);
    let disk_available = host
        .available_disk(&disk_path)
        .map_err(|source| PrereqError::Probe {
            what: format!("free space at '{}'", disk_path.display()),
            source,
        })?;
    if disk_available < disk_required {
        return Err(PrereqError::InsufficientDiskSpace {
            path: disk_path,
            required: disk_required,
            available: disk_available,
        });
    }

    let memory = host.memory().map_err(|source| PrereqError::Probe {
        what: "memory".to_string(),
        source,
    })?;

    let report = EnvironmentReport {
        disk_path,
        disk_available,
        disk_required,
        memory_total: memory.total,
        memory_available: memory.available,
        cpus: host.cpu_count(),
        load_average: host.load_average(),
        euid,
        tools_checked: tools.into_iter().map(|(cmd, _)| cmd).collect(),
    };
    tracing::info!(
        event = "environment_probed",
        disk_available_gib = report.disk_available / GIB,
        memory_total_gib = report.memory_total / GIB,
        cpus = report.cpus,
        "host prerequisites satisfied"
    );
    Ok(report)
}

//! Build configuration.
//!
//! One TOML file describes the host requirements, the package sources and
//! their pin priorities, the base filesystem, the optional kernel artifact and
//! image options. The package catalog lives in a second file referenced by
//! `[build].catalog` (see [`catalog`]). Relative paths are resolved against
//! the directory holding the config file.

pub mod catalog;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::repo::{RepositorySource, SourceRole};

pub use catalog::Catalog;

/// Default config file name looked up in the current directory.
pub const DEFAULT_CONFIG_FILE: &str = "distro-forge.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config '{path}': {reason}")]
    Invalid { path: PathBuf, reason: String },
}

/// Image variant selected on the command line.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, serde::Serialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    Minimal,
    Standard,
    Full,
}

impl Variant {
    pub const ALL: [Variant; 3] = [Variant::Minimal, Variant::Standard, Variant::Full];

    pub fn as_str(self) -> &'static str {
        match self {
            Variant::Minimal => "minimal",
            Variant::Standard => "standard",
            Variant::Full => "full",
        }
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    pub build: BuildSection,
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub install: InstallConfig,
    pub base: BaseConfig,
    #[serde(default)]
    pub priorities: PriorityPolicy,
    #[serde(default)]
    pub sources: Vec<RepositorySource>,
    pub kernel: Option<KernelConfig>,
    #[serde(default)]
    pub image: ImageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildSection {
    /// Distribution name; used in image file names and boot menu titles.
    pub name: String,
    #[serde(default = "default_label")]
    pub label: String,
    #[serde(default = "default_arch")]
    pub arch: String,
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Package catalog file.
    pub catalog: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    #[serde(default = "default_min_disk_gb")]
    pub min_disk_gb: u64,
    #[serde(default = "default_true")]
    pub require_root: bool,
    /// Tools required on top of the built-in list, as `command` or `command:package`.
    #[serde(default)]
    pub extra_tools: Vec<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            min_disk_gb: default_min_disk_gb(),
            require_root: true,
            extra_tools: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Number of samples kept in the rolling window.
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default = "default_max_memory_ratio")]
    pub max_memory_ratio: f64,
    #[serde(default = "default_min_disk_free_gb")]
    pub min_disk_free_gb: u64,
    /// Defaults to four times the online CPU count.
    pub max_load_average: Option<f64>,
    #[serde(default = "default_resume_poll_secs")]
    pub resume_poll_secs: u64,
    #[serde(default = "default_idle_window_secs")]
    pub idle_window_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            window: default_window(),
            max_memory_ratio: default_max_memory_ratio(),
            min_disk_free_gb: default_min_disk_free_gb(),
            max_load_average: None,
            resume_poll_secs: default_resume_poll_secs(),
            idle_window_secs: default_idle_window_secs(),
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    /// Zero re-samples without sleeping.
    pub fn resume_poll(&self) -> Duration {
        Duration::from_secs(self.resume_poll_secs)
    }

    pub fn idle_window(&self) -> Duration {
        Duration::from_secs(self.idle_window_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_secs")]
    pub initial_backoff_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// Defer dpkg triggers during batch installs; the settle step runs them.
    #[serde(default = "default_true")]
    pub defer_triggers: bool,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_secs: default_initial_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            defer_triggers: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BaseConfig {
    pub suite: String,
    pub mirror: String,
    /// Prebuilt base root (`.tar` or `.tar.zst`); skips debootstrap when set.
    pub tarball: Option<PathBuf>,
    /// Extra packages passed to debootstrap `--include`.
    #[serde(default)]
    pub include: Vec<String>,
}

/// Pin priorities used by the repository resolver.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PriorityPolicy {
    #[serde(default = "default_stable_priority")]
    pub stable: i32,
    #[serde(default = "default_secondary_priority")]
    pub default: i32,
    #[serde(rename = "override", default = "default_override_priority")]
    pub override_priority: i32,
    /// Package-name patterns forming the core library scope. Overrides may never touch these.
    #[serde(default = "default_core_patterns")]
    pub core_patterns: Vec<String>,
}

impl Default for PriorityPolicy {
    fn default() -> Self {
        Self {
            stable: default_stable_priority(),
            default: default_secondary_priority(),
            override_priority: default_override_priority(),
            core_patterns: default_core_patterns(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KernelConfig {
    /// The single binary the external kernel build produces.
    pub artifact: PathBuf,
    /// Build command; required when the artifact does not exist yet.
    #[serde(default)]
    pub build: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub initrd: Option<PathBuf>,
    #[serde(default)]
    pub rebuild: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageConfig {
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default = "default_block_size")]
    pub block_size: String,
    #[serde(default)]
    pub xattrs: bool,
    /// Image file name; defaults to `<name>-<variant>.iso`.
    pub filename: Option<String>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            compression: default_compression(),
            block_size: default_block_size(),
            xattrs: false,
            filename: None,
        }
    }
}

impl BuildConfig {
    /// Load, resolve relative paths and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut config = Self::parse(&text, path)?;
        config.resolve_paths(base_dir);
        config.validate(path)?;
        Ok(config)
    }

    /// Parse config text without touching the filesystem.
    pub fn parse(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    pub fn resolve_paths(&mut self, base_dir: &Path) {
        let build = &mut self.build;
        build.root = resolve_path(base_dir, &build.root);
        build.state_dir = resolve_path(base_dir, &build.state_dir);
        build.work_dir = resolve_path(base_dir, &build.work_dir);
        build.output_dir = resolve_path(base_dir, &build.output_dir);
        build.catalog = resolve_path(base_dir, &build.catalog);
        if let Some(tarball) = self.base.tarball.as_mut() {
            *tarball = resolve_path(base_dir, tarball);
        }
        if let Some(kernel) = self.kernel.as_mut() {
            kernel.artifact = resolve_path(base_dir, &kernel.artifact);
            kernel.workdir = kernel.workdir.as_deref().map(|p| resolve_path(base_dir, p));
            kernel.initrd = kernel.initrd.as_deref().map(|p| resolve_path(base_dir, p));
        }
    }

    pub fn validate(&self, origin: &Path) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::Invalid {
            path: origin.to_path_buf(),
            reason,
        };

        if self.build.name.trim().is_empty() {
            return Err(invalid("[build].name must not be empty".to_string()));
        }
        if self.sources.is_empty() {
            return Err(invalid("at least one [[sources]] entry is required".to_string()));
        }
        let mut names: Vec<&str> = self.sources.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        if let Some(dup) = names.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(invalid(format!("duplicate source name '{}'", dup[0])));
        }
        for source in &self.sources {
            if source.role == SourceRole::Stable && !source.packages.is_empty() {
                return Err(invalid(format!(
                    "stable source '{}' cannot carry a package allow-list",
                    source.name
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.monitor.max_memory_ratio) {
            return Err(invalid(format!(
                "[monitor].max_memory_ratio must be within 0..=1, got {}",
                self.monitor.max_memory_ratio
            )));
        }
        if self.install.max_retries == 0 {
            return Err(invalid("[install].max_retries must be >= 1".to_string()));
        }
        if let Some(kernel) = &self.kernel {
            if kernel.rebuild && kernel.build.is_empty() {
                return Err(invalid(
                    "[kernel].rebuild requires a [kernel].build command".to_string(),
                ));
            }
        }
        Ok(())
    }
}

fn resolve_path(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

fn default_label() -> String {
    "FORGE_LIVE".to_string()
}

fn default_arch() -> String {
    "amd64".to_string()
}

fn default_root() -> PathBuf {
    PathBuf::from("/var/tmp/distro-forge/rootfs")
}

fn default_state_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .map(|dir| dir.join("distro-forge"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/distro-forge"))
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/var/tmp/distro-forge/work")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("out")
}

fn default_min_disk_gb() -> u64 {
    40
}

fn default_true() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    5
}

fn default_window() -> usize {
    60
}

fn default_max_memory_ratio() -> f64 {
    0.92
}

fn default_min_disk_free_gb() -> u64 {
    5
}

fn default_resume_poll_secs() -> u64 {
    30
}

fn default_idle_window_secs() -> u64 {
    1800
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_secs() -> u64 {
    5
}

fn default_max_backoff_secs() -> u64 {
    120
}

fn default_stable_priority() -> i32 {
    900
}

fn default_secondary_priority() -> i32 {
    100
}

fn default_override_priority() -> i32 {
    990
}

fn default_core_patterns() -> Vec<String> {
    [
        "libc6*",
        "libc-bin",
        "libgcc-s1",
        "libstdc++6",
        "libssl*",
        "libcrypt1",
        "perl-base",
        "python3",
        "python3.*",
        "libpython3*",
        "dpkg",
        "apt",
        "libapt-pkg*",
        "systemd",
        "libsystemd*",
        "udev",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_compression() -> String {
    "zstd".to_string()
}

fn default_block_size() -> String {
    "1M".to_string()
}

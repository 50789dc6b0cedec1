//! Scripted collaborators for unit and scenario tests.

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use time::OffsetDateTime;

use crate::assembler::{ImageTools, SquashfsOptions};
use crate::config::BuildConfig;
use crate::installer::{FailureKind, InstallFailure, PackageManager, PackageSpec, PmError};
use crate::monitor::host::MemoryInfo;
use crate::monitor::{ResourceProbe, ResourceSample};
use crate::preflight::HostInspector;
use crate::process::{CommandOutput, CommandRunner, CommandSpec, ExecError};
use crate::stager::mounts::{filter_under, MountSpec, Mounter};
use crate::stager::ContextExec;

pub const GIB: u64 = 1024 * 1024 * 1024;

pub const TEST_KERNEL_RELEASE: &str = "6.1.0-18-amd64";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A small base root tarball with a packaged kernel, written under `dir`.
pub fn write_base_tarball(dir: &Path) -> PathBuf {
    let src = dir.join("base-src");
    fs::create_dir_all(src.join("etc")).unwrap();
    fs::create_dir_all(src.join("boot")).unwrap();
    fs::create_dir_all(src.join("usr/bin")).unwrap();
    fs::write(src.join("etc/os-release"), "ID=debian\nVERSION_CODENAME=bookworm\n").unwrap();
    fs::write(src.join("usr/bin/sh"), "#!/bin/true\n").unwrap();
    fs::write(
        src.join(format!("boot/vmlinuz-{TEST_KERNEL_RELEASE}")),
        b"packaged kernel",
    )
    .unwrap();
    fs::write(
        src.join(format!("boot/initrd.img-{TEST_KERNEL_RELEASE}")),
        b"packaged initrd",
    )
    .unwrap();

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_dir_all(".", &src).unwrap();
    let tarball = dir.join("base.tar");
    fs::write(&tarball, builder.into_inner().unwrap()).unwrap();
    tarball
}

/// A valid config whose every path lives under `dir`.
pub fn test_config(dir: &Path) -> BuildConfig {
    let tarball = write_base_tarball(dir);
    let text = format!(
        r#"
[build]
name = "forge"
label = "FORGE_TEST"
root = "{root}"
state_dir = "{state}"
work_dir = "{work}"
output_dir = "{output}"
catalog = "{catalog}"

[monitor]
interval_secs = 3600
resume_poll_secs = 0

[install]
initial_backoff_secs = 0
max_backoff_secs = 0

[base]
suite = "bookworm"
mirror = "http://deb.debian.org/debian"
tarball = "{tarball}"

[[sources]]
name = "debian"
uri = "http://deb.debian.org/debian"
suite = "bookworm"
role = "stable"

[[sources]]
name = "tools"
uri = "http://http.kali.org/kali"
suite = "kali-rolling"
components = ["main", "non-free"]
packages = ["nmap", "metasploit-*"]
"#,
        root = dir.join("rootfs").display(),
        state = dir.join("state").display(),
        work = dir.join("work").display(),
        output = dir.join("out").display(),
        catalog = dir.join("catalog.toml").display(),
        tarball = tarball.display(),
    );
    BuildConfig::parse(&text, &dir.join("distro-forge.toml")).unwrap()
}

// Host

#[derive(Debug, Clone)]
pub struct FakeHost {
    missing: Vec<String>,
    disk: u64,
    euid: u32,
}

impl FakeHost {
    pub fn healthy() -> Self {
        Self {
            missing: Vec::new(),
            disk: 500 * GIB,
            euid: 0,
        }
    }

    pub fn without_tools(mut self, tools: &[&str]) -> Self {
        self.missing.extend(tools.iter().map(|t| t.to_string()));
        self
    }

    pub fn with_disk(mut self, bytes: u64) -> Self {
        self.disk = bytes;
        self
    }

    pub fn with_euid(mut self, euid: u32) -> Self {
        self.euid = euid;
        self
    }
}

impl HostInspector for FakeHost {
    fn tool_exists(&self, command: &str) -> bool {
        !self.missing.iter().any(|m| m == command)
    }

    fn available_disk(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.disk)
    }

    fn effective_uid(&self) -> u32 {
        self.euid
    }

    fn memory(&self) -> io::Result<MemoryInfo> {
        Ok(MemoryInfo {
            total: 16 * GIB,
            available: 12 * GIB,
        })
    }

    fn cpu_count(&self) -> usize {
        4
    }

    fn load_average(&self) -> Option<f64> {
        Some(0.5)
    }
}

// Mounts

#[derive(Debug, Default)]
struct MountState {
    active: Vec<PathBuf>,
    unmounted: Vec<PathBuf>,
    mounts: usize,
}

/// Records mounts instead of making them.
#[derive(Debug, Default)]
pub struct FakeMounter {
    state: Mutex<MountState>,
    fail_on: Option<String>,
}

impl FakeMounter {
    /// Fail every mount whose target ends in `relative`.
    pub fn failing_on(relative: &str) -> Self {
        Self {
            fail_on: Some(relative.to_string()),
            ..Self::default()
        }
    }

    /// Pretend an earlier run left these mounted.
    pub fn preload(&self, targets: &[PathBuf]) {
        lock(&self.state).active.extend(targets.iter().cloned());
    }

    pub fn active(&self) -> Vec<PathBuf> {
        lock(&self.state).active.clone()
    }

    pub fn unmount_log(&self) -> Vec<PathBuf> {
        lock(&self.state).unmounted.clone()
    }

    /// Successful mounts over the mounter's lifetime.
    pub fn mount_count(&self) -> usize {
        lock(&self.state).mounts
    }
}

impl Mounter for FakeMounter {
    fn mount(&self, spec: &MountSpec, target: &Path) -> Result<(), ExecError> {
        if let Some(fail_on) = &self.fail_on {
            if target.ends_with(fail_on) {
                return Err(ExecError::Mount {
                    what: format!("{:?}", spec.kind),
                    target: target.to_path_buf(),
                    reason: "scripted failure".to_string(),
                });
            }
        }
        let mut state = lock(&self.state);
        state.active.push(target.to_path_buf());
        state.mounts += 1;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), ExecError> {
        let mut state = lock(&self.state);
        match state.active.iter().position(|m| m == target) {
            Some(pos) => {
                state.active.remove(pos);
                state.unmounted.push(target.to_path_buf());
                Ok(())
            }
            None => Err(ExecError::Unmount {
                target: target.to_path_buf(),
                reason: "not mounted".to_string(),
            }),
        }
    }

    fn mounts_under(&self, root: &Path) -> Result<Vec<PathBuf>, ExecError> {
        Ok(filter_under(self.active(), root))
    }
}

// Commands

#[derive(Debug, Default)]
struct RunnerState {
    calls: Vec<String>,
    failures: Vec<(String, i32, String)>,
    panics: Vec<String>,
    creates: Vec<(String, PathBuf)>,
}

/// Succeeds for every command unless a script entry matches its display line.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    state: Mutex<RunnerState>,
}

impl ScriptedRunner {
    pub fn fail_matching(&self, pattern: &str, code: i32, stderr: &str) {
        lock(&self.state)
            .failures
            .push((pattern.to_string(), code, stderr.to_string()));
    }

    pub fn panic_matching(&self, pattern: &str) {
        lock(&self.state).panics.push(pattern.to_string());
    }

    /// Write a file at `path` whenever a matching command succeeds.
    pub fn create_on(&self, pattern: &str, path: &Path) {
        lock(&self.state)
            .creates
            .push((pattern.to_string(), path.to_path_buf()));
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, command: &CommandSpec) -> Result<CommandOutput, ExecError> {
        let line = command.display_line();
        let (panics, failure, creates) = {
            let mut state = lock(&self.state);
            state.calls.push(line.clone());
            let panics = state.panics.iter().any(|p| line.contains(p.as_str()));
            let failure = state
                .failures
                .iter()
                .find(|(p, _, _)| line.contains(p.as_str()))
                .map(|(_, code, stderr)| (*code, stderr.clone()));
            let creates: Vec<PathBuf> = state
                .creates
                .iter()
                .filter(|(p, _)| line.contains(p.as_str()))
                .map(|(_, path)| path.clone())
                .collect();
            (panics, failure, creates)
        };
        if panics {
            panic!("scripted panic in '{line}'");
        }
        if let Some((code, stderr)) = failure {
            return Ok(CommandOutput {
                code: Some(code),
                stdout: String::new(),
                stderr,
            });
        }
        for path in creates {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(&path, format!("built by {line}")).unwrap();
        }
        Ok(CommandOutput {
            code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

/// Context that accepts every command without a real root.
#[derive(Debug, Default)]
pub struct FakeContext {
    root: PathBuf,
    calls: Mutex<Vec<String>>,
}

impl FakeContext {
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }
}

impl ContextExec for FakeContext {
    fn exec(&self, command: &CommandSpec) -> Result<CommandOutput, ExecError> {
        lock(&self.calls).push(command.display_line());
        Ok(CommandOutput {
            code: Some(0),
            ..CommandOutput::default()
        })
    }

    fn root(&self) -> &Path {
        &self.root
    }
}

// Package manager

#[derive(Debug, Default)]
struct PmState {
    installs: Vec<Vec<String>>,
    refreshes: usize,
    repairs: usize,
    configures: usize,
    cleans: usize,
    transient_failures: u32,
    refresh_failures: u32,
    settle_failures: u32,
    half_configured: Vec<String>,
    removals: Vec<Vec<String>>,
}

/// Installs succeed unless a batch holds a conflicting package or transient
/// failures are still queued.
#[derive(Debug, Default)]
pub struct FakePackageManager {
    conflicts: HashSet<String>,
    unavailable: HashSet<String>,
    failing_scripts: HashSet<String>,
    state: Mutex<PmState>,
}

impl FakePackageManager {
    pub fn with_conflict(mut self, package: &str) -> Self {
        self.conflicts.insert(package.to_string());
        self
    }

    /// `package` unpacks but its maintainer script fails, so every configure
    /// run fails until the package is removed.
    pub fn with_failing_script(mut self, package: &str) -> Self {
        self.failing_scripts.insert(package.to_string());
        self
    }

    pub fn without_versions(mut self, package: &str) -> Self {
        self.unavailable.insert(package.to_string());
        self
    }

    /// Fail the next `count` installs as network errors.
    pub fn with_transient_failures(self, count: u32) -> Self {
        lock(&self.state).transient_failures = count;
        self
    }

    pub fn with_refresh_failures(self, count: u32) -> Self {
        lock(&self.state).refresh_failures = count;
        self
    }

    /// Fail the next `count` configure runs.
    pub fn with_settle_failures(self, count: u32) -> Self {
        lock(&self.state).settle_failures = count;
        self
    }

    pub fn install_calls(&self) -> Vec<Vec<String>> {
        lock(&self.state).installs.clone()
    }

    pub fn refresh_count(&self) -> usize {
        lock(&self.state).refreshes
    }

    pub fn repair_count(&self) -> usize {
        lock(&self.state).repairs
    }

    pub fn configure_count(&self) -> usize {
        lock(&self.state).configures
    }

    pub fn clean_count(&self) -> usize {
        lock(&self.state).cleans
    }

    pub fn removals(&self) -> Vec<Vec<String>> {
        lock(&self.state).removals.clone()
    }
}

fn failed(kind: FailureKind, detail: impl Into<String>) -> PmError {
    PmError::Failed(InstallFailure {
        kind,
        detail: detail.into(),
    })
}

impl PackageManager for FakePackageManager {
    fn refresh_catalog(&self, _ctx: &dyn ContextExec) -> Result<(), PmError> {
        let mut state = lock(&self.state);
        state.refreshes += 1;
        if state.refresh_failures > 0 {
            state.refresh_failures -= 1;
            return Err(failed(
                FailureKind::Transient,
                "W: Failed to fetch http://deb.debian.org/debian/dists/bookworm/InRelease",
            ));
        }
        Ok(())
    }

    fn install(&self, _ctx: &dyn ContextExec, packages: &[PackageSpec]) -> Result<(), PmError> {
        let mut state = lock(&self.state);
        state
            .installs
            .push(packages.iter().map(|p| p.name.clone()).collect());
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(failed(
                FailureKind::Transient,
                "E: Failed to fetch http://deb.debian.org/debian/pool/main  Temporary failure resolving 'deb.debian.org'",
            ));
        }
        if let Some(bad) = packages.iter().find(|p| self.failing_scripts.contains(&p.name)) {
            if !state.half_configured.contains(&bad.name) {
                state.half_configured.push(bad.name.clone());
            }
            return Err(failed(
                FailureKind::Other,
                format!(
                    "dpkg: error processing package {} (--configure):\n installed {} package post-installation script subprocess returned error exit status 1",
                    bad.name, bad.name
                ),
            ));
        }
        if let Some(conflict) = packages.iter().find(|p| self.conflicts.contains(&p.name)) {
            return Err(failed(
                FailureKind::Conflict,
                format!(
                    "{} : Depends: libfoo1 (= 2.1-1) but 2.3-1 is to be installed\nE: Unable to correct problems, you have held broken packages.",
                    conflict.name
                ),
            ));
        }
        Ok(())
    }

    fn configure_pending(&self, _ctx: &dyn ContextExec) -> Result<(), PmError> {
        let mut state = lock(&self.state);
        state.configures += 1;
        if let Some(bad) = state.half_configured.first() {
            return Err(failed(
                FailureKind::Other,
                format!("dpkg: error processing package {bad} (--configure)"),
            ));
        }
        if state.settle_failures > 0 {
            state.settle_failures -= 1;
            return Err(failed(
                FailureKind::Other,
                "dpkg: error processing package foo (--configure)",
            ));
        }
        Ok(())
    }

    fn repair(&self, _ctx: &dyn ContextExec) -> Result<(), PmError> {
        lock(&self.state).repairs += 1;
        Ok(())
    }

    fn broken_packages(&self, _ctx: &dyn ContextExec) -> Result<Vec<String>, PmError> {
        Ok(lock(&self.state).half_configured.clone())
    }

    fn remove_broken(&self, _ctx: &dyn ContextExec, packages: &[String]) -> Result<(), PmError> {
        let mut state = lock(&self.state);
        state.half_configured.retain(|p| !packages.contains(p));
        state.removals.push(packages.to_vec());
        Ok(())
    }

    fn available_versions(
        &self,
        _ctx: &dyn ContextExec,
        package: &PackageSpec,
    ) -> Result<Vec<String>, PmError> {
        if self.unavailable.contains(&package.name) {
            Ok(Vec::new())
        } else {
            Ok(vec!["1.0-1".to_string()])
        }
    }

    fn clean_cache(&self, _ctx: &dyn ContextExec) -> Result<(), PmError> {
        lock(&self.state).cleans += 1;
        Ok(())
    }
}

// Resources

/// A sample with `memory_ratio` of 16 GiB in use and `disk_gib` free.
pub fn sample(memory_ratio: f64, disk_gib: u64, load_average: f64) -> ResourceSample {
    let total = 16 * GIB;
    ResourceSample {
        timestamp: OffsetDateTime::now_utc(),
        memory_used: (total as f64 * memory_ratio) as u64,
        memory_total: total,
        disk_free: disk_gib * GIB,
        load_average,
    }
}

/// Hands out scripted samples in order, then repeats the last one.
#[derive(Debug)]
pub struct ScriptedProbe {
    samples: Mutex<VecDeque<ResourceSample>>,
    last: Mutex<Option<ResourceSample>>,
    taken: AtomicUsize,
    disk_paths: Mutex<Vec<PathBuf>>,
}

impl ScriptedProbe {
    pub fn new(samples: Vec<ResourceSample>) -> Self {
        Self {
            samples: Mutex::new(samples.into()),
            last: Mutex::new(None),
            taken: AtomicUsize::new(0),
            disk_paths: Mutex::new(Vec::new()),
        }
    }

    pub fn healthy() -> Self {
        Self::new(vec![sample(0.2, 200, 0.1)])
    }

    pub fn taken(&self) -> usize {
        self.taken.load(Ordering::SeqCst)
    }

    /// Distinct paths disk free was asked for, in first-seen order.
    pub fn disk_paths(&self) -> Vec<PathBuf> {
        lock(&self.disk_paths).clone()
    }
}

impl ResourceProbe for ScriptedProbe {
    fn sample(&self, disk_path: &Path) -> io::Result<ResourceSample> {
        self.taken.fetch_add(1, Ordering::SeqCst);
        {
            let mut paths = lock(&self.disk_paths);
            if !paths.iter().any(|p| p == disk_path) {
                paths.push(disk_path.to_path_buf());
            }
        }
        let next = lock(&self.samples).pop_front();
        let mut last = lock(&self.last);
        let value = next.or(*last).unwrap_or_else(|| sample(0.2, 200, 0.1));
        *last = Some(value);
        Ok(value)
    }
}

// Image tools

#[derive(Debug, Default)]
struct ImageState {
    squashed: Vec<PathBuf>,
    isos: Vec<PathBuf>,
}

/// Writes placeholder image files instead of running mksquashfs and grub.
#[derive(Debug, Default)]
pub struct FakeImageTools {
    free_space: Option<u64>,
    /// Mount point, filesystem id and free bytes; longest prefix wins.
    filesystems: Vec<(PathBuf, u64, u64)>,
    state: Mutex<ImageState>,
}

impl FakeImageTools {
    pub fn with_free_space(mut self, bytes: u64) -> Self {
        self.free_space = Some(bytes);
        self
    }

    /// Paths under `mount` report filesystem `id` with `free` bytes.
    pub fn with_filesystem(mut self, mount: &Path, id: u64, free: u64) -> Self {
        self.filesystems.push((mount.to_path_buf(), id, free));
        self
    }

    fn filesystem_for(&self, path: &Path) -> Option<(u64, u64)> {
        self.filesystems
            .iter()
            .filter(|(mount, _, _)| path.starts_with(mount))
            .max_by_key(|(mount, _, _)| mount.components().count())
            .map(|&(_, id, free)| (id, free))
    }

    pub fn squash_count(&self) -> usize {
        lock(&self.state).squashed.len()
    }

    pub fn iso_count(&self) -> usize {
        lock(&self.state).isos.len()
    }
}

impl ImageTools for FakeImageTools {
    fn squash(
        &self,
        root: &Path,
        output: &Path,
        options: &SquashfsOptions,
    ) -> Result<CommandOutput, ExecError> {
        let io_err = |source| ExecError::Io {
            program: "mksquashfs".to_string(),
            source,
        };
        let mut listing: Vec<String> = walkdir::WalkDir::new(root)
            .into_iter()
            .filter_map(Result::ok)
            .map(|e| e.path().display().to_string())
            .collect();
        listing.sort();
        let listing = listing.join(",");
        fs::write(output, format!("squashfs {} [{listing}]", options.compression)).map_err(io_err)?;
        lock(&self.state).squashed.push(output.to_path_buf());
        Ok(CommandOutput {
            code: Some(0),
            ..CommandOutput::default()
        })
    }

    fn make_iso(&self, iso_root: &Path, output: &Path, label: &str) -> Result<CommandOutput, ExecError> {
        let io_err = |source| ExecError::Io {
            program: "grub-mkrescue".to_string(),
            source,
        };
        let grub = fs::read_to_string(iso_root.join("boot/grub/grub.cfg")).map_err(io_err)?;
        let squashfs = fs::read(iso_root.join("live/filesystem.squashfs")).map_err(io_err)?;
        let mut image = format!("ISO {label}\n{grub}\n").into_bytes();
        image.extend_from_slice(&squashfs);
        fs::write(output, image).map_err(io_err)?;
        lock(&self.state).isos.push(output.to_path_buf());
        Ok(CommandOutput {
            code: Some(0),
            ..CommandOutput::default()
        })
    }

    fn available_space(&self, path: &Path) -> io::Result<u64> {
        if let Some((_, free)) = self.filesystem_for(path) {
            return Ok(free);
        }
        Ok(self.free_space.unwrap_or(500 * GIB))
    }

    fn filesystem_id(&self, path: &Path) -> io::Result<u64> {
        Ok(self.filesystem_for(path).map_or(0, |(id, _)| id))
    }
}

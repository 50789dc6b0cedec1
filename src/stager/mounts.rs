//! Virtual filesystems bound into the staged root.
//!
//! Every mount made for a chroot command is owned by a [`ContextGuard`] and
//! also listed in a process-wide registry. The guard unmounts on drop, which
//! covers normal returns, errors and panics. The interrupt handler drains the
//! registry, which covers SIGINT/SIGTERM. Whatever SIGKILL leaves behind is
//! found through `/proc/self/mountinfo` by [`sweep_stale_mounts`] on the next
//! run.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use nix::mount::{mount, umount2, MntFlags, MsFlags};

use crate::process::{self, ExecError};

/// Exit code used when the build is interrupted by the operator.
pub const INTERRUPT_EXIT_CODE: i32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountKind {
    Proc,
    Tmpfs,
    /// Recursive bind of a host directory, made a slave so unmounting it
    /// inside the root never propagates back to the host.
    RecursiveBind(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub kind: MountKind,
    /// Mount point relative to the staged root.
    pub relative: PathBuf,
}

/// Mounts every chroot command runs with, in mount order.
pub fn context_mounts() -> Vec<MountSpec> {
    vec![
        MountSpec {
            kind: MountKind::Proc,
            relative: PathBuf::from("proc"),
        },
        MountSpec {
            kind: MountKind::RecursiveBind(PathBuf::from("/sys")),
            relative: PathBuf::from("sys"),
        },
        MountSpec {
            kind: MountKind::RecursiveBind(PathBuf::from("/dev")),
            relative: PathBuf::from("dev"),
        },
        MountSpec {
            kind: MountKind::Tmpfs,
            relative: PathBuf::from("run"),
        },
    ]
}

pub trait Mounter: Send + Sync {
    fn mount(&self, spec: &MountSpec, target: &Path) -> Result<(), ExecError>;
    fn unmount(&self, target: &Path) -> Result<(), ExecError>;
    /// Active mount points strictly below `root`, deepest first. A
    /// filesystem mounted at `root` itself is the root's storage, not a
    /// context mount.
    fn mounts_under(&self, root: &Path) -> Result<Vec<PathBuf>, ExecError>;
}

/// Real mounts through mount(2) and umount2(2).
#[derive(Debug, Clone, Copy, Default)]
pub struct NixMounter;

impl Mounter for NixMounter {
    fn mount(&self, spec: &MountSpec, target: &Path) -> Result<(), ExecError> {
        let mount_err = |what: &str, e: nix::Error| ExecError::Mount {
            what: what.to_string(),
            target: target.to_path_buf(),
            reason: e.to_string(),
        };
        match &spec.kind {
            MountKind::Proc => mount(
                Some("proc"),
                target,
                Some("proc"),
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                None::<&str>,
            )
            .map_err(|e| mount_err("proc", e)),
            MountKind::Tmpfs => mount(
                Some("tmpfs"),
                target,
                Some("tmpfs"),
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
                Some("mode=0755"),
            )
            .map_err(|e| mount_err("tmpfs", e)),
            MountKind::RecursiveBind(source) => {
                let what = source.display().to_string();
                mount(
                    Some(source.as_path()),
                    target,
                    None::<&str>,
                    MsFlags::MS_BIND | MsFlags::MS_REC,
                    None::<&str>,
                )
                .map_err(|e| mount_err(&what, e))?;
                if let Err(e) = mount(
                    None::<&str>,
                    target,
                    None::<&str>,
                    MsFlags::MS_SLAVE | MsFlags::MS_REC,
                    None::<&str>,
                ) {
                    let _ = umount2(target, MntFlags::MNT_DETACH);
                    return Err(mount_err(&what, e));
                }
                Ok(())
            }
        }
    }

    fn unmount(&self, target: &Path) -> Result<(), ExecError> {
        umount2(target, MntFlags::MNT_DETACH).map_err(|e| ExecError::Unmount {
            target: target.to_path_buf(),
            reason: e.to_string(),
        })
    }

    fn mounts_under(&self, root: &Path) -> Result<Vec<PathBuf>, ExecError> {
        let text = fs::read_to_string("/proc/self/mountinfo").map_err(|source| ExecError::Io {
            program: "mountinfo".to_string(),
            source,
        })?;
        Ok(filter_under(parse_mountinfo(&text), root))
    }
}

/// Mount points listed in mountinfo text (field 5), unescaped.
pub fn parse_mountinfo(text: &str) -> Vec<PathBuf> {
    text.lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(|field| PathBuf::from(unescape_octal(field)))
        .collect()
}

/// Mount points strictly below `root`, deepest first.
pub fn filter_under(mounts: Vec<PathBuf>, root: &Path) -> Vec<PathBuf> {
    let mut under: Vec<PathBuf> = mounts
        .into_iter()
        .filter(|m| m.as_path() != root && m.starts_with(root))
        .collect();
    under.sort_by(|a, b| {
        b.components()
            .count()
            .cmp(&a.components().count())
            .then_with(|| b.cmp(a))
    });
    under.dedup();
    under
}

fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or("");
            if let Ok(value) = u8::from_str_radix(digits, 8) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

struct RegisteredMount {
    id: u64,
    target: PathBuf,
    mounter: Arc<dyn Mounter>,
}

static REGISTRY: Mutex<Vec<RegisteredMount>> = Mutex::new(Vec::new());
static NEXT_MOUNT_ID: AtomicU64 = AtomicU64::new(1);

fn registry() -> MutexGuard<'static, Vec<RegisteredMount>> {
    REGISTRY.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn register(target: PathBuf, mounter: Arc<dyn Mounter>) -> u64 {
    let id = NEXT_MOUNT_ID.fetch_add(1, Ordering::Relaxed);
    registry().push(RegisteredMount {
        id,
        target,
        mounter,
    });
    id
}

/// Remove a mount from the registry; false if the interrupt handler already took it.
fn unregister(id: u64) -> bool {
    let mut mounts = registry();
    match mounts.iter().position(|m| m.id == id) {
        Some(pos) => {
            mounts.remove(pos);
            true
        }
        None => false,
    }
}

/// Unmount everything live guards still hold, newest first. Returns how many
/// mounts were released.
pub fn release_registered_mounts() -> usize {
    release_matching(|_| true)
}

/// Same as [`release_registered_mounts`], limited to mounts below `root`.
pub fn release_mounts_under(root: &Path) -> usize {
    release_matching(|target| target.starts_with(root))
}

fn release_matching(matches: impl Fn(&Path) -> bool) -> usize {
    let drained: Vec<RegisteredMount> = {
        let mut mounts = registry();
        let (taken, kept): (Vec<RegisteredMount>, Vec<RegisteredMount>) =
            mounts.drain(..).partition(|m| matches(&m.target));
        *mounts = kept;
        taken
    };
    let count = drained.len();
    for entry in drained.into_iter().rev() {
        if let Err(e) = entry.mounter.unmount(&entry.target) {
            tracing::error!(
                event = "unmount_failed",
                target = %entry.target.display(),
                error = %e,
                "failed to release mount during shutdown"
            );
        }
    }
    count
}

/// Install the SIGINT/SIGTERM handler: stop new work, release mounts, exit 3.
pub fn install_interrupt_handler() -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(|| {
        process::mark_interrupted();
        let released = release_registered_mounts();
        tracing::warn!(
            event = "interrupted",
            released_mounts = released,
            "interrupt received; mounts released, checkpoint log preserved"
        );
        eprintln!("[forge] interrupted; released {released} mounts; resume with --resume");
        std::process::exit(INTERRUPT_EXIT_CODE);
    })
}

/// Holds the virtual filesystems of one chroot context.
pub struct ContextGuard {
    mounter: Arc<dyn Mounter>,
    mounted: Vec<(u64, PathBuf)>,
}

impl ContextGuard {
    /// Mount every context filesystem under `root`. A failure part way
    /// releases what was already mounted.
    pub fn acquire(mounter: Arc<dyn Mounter>, root: &Path) -> Result<Self, ExecError> {
        if process::interrupted() {
            return Err(ExecError::Interrupted {
                program: "chroot".to_string(),
            });
        }
        let mut guard = Self {
            mounter,
            mounted: Vec::new(),
        };
        for spec in context_mounts() {
            let target = root.join(&spec.relative);
            fs::create_dir_all(&target).map_err(|source| ExecError::Io {
                program: "mkdir".to_string(),
                source,
            })?;
            guard.mounter.mount(&spec, &target)?;
            let id = register(target.clone(), Arc::clone(&guard.mounter));
            guard.mounted.push((id, target));
        }
        Ok(guard)
    }

    pub fn mounted(&self) -> Vec<&Path> {
        self.mounted.iter().map(|(_, p)| p.as_path()).collect()
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        for (id, target) in self.mounted.drain(..).rev() {
            if !unregister(id) {
                continue;
            }
            if let Err(e) = self.mounter.unmount(&target) {
                tracing::error!(
                    event = "unmount_failed",
                    target = %target.display(),
                    error = %e,
                    "failed to release context mount"
                );
            }
        }
    }
}

/// Detach mounts a killed earlier run left under `root`. Returns what was detached.
pub fn sweep_stale_mounts(mounter: &dyn Mounter, root: &Path) -> Result<Vec<PathBuf>, ExecError> {
    let stale = mounter.mounts_under(root)?;
    for target in &stale {
        tracing::warn!(
            event = "stale_mount",
            target = %target.display(),
            "detaching mount left by an earlier run"
        );
        mounter.unmount(target)?;
    }
    Ok(stale)
}

//! Layout helpers for the staged root.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Directories the build relies on, whether the base came from a tarball or
/// from debootstrap.
const REQUIRED_DIRS: &[&str] = &[
    "proc",
    "sys",
    "dev",
    "run",
    "tmp",
    "boot",
    "etc/apt/sources.list.d",
    "etc/apt/preferences.d",
    "usr/sbin",
    "var/cache/apt/archives",
    "var/lib/dpkg",
];

/// Denies service starts inside the chroot (invoke-rc.d exit code 101).
pub const POLICY_RC_D: &str = "usr/sbin/policy-rc.d";
const POLICY_RC_D_BODY: &str = "#!/bin/sh\n# Installed by distro-forge while packages are installed.\nexit 101\n";

/// Create every directory the build needs. Existing ones are left as they are.
pub fn ensure_layout(root: &Path) -> io::Result<()> {
    for dir in REQUIRED_DIRS {
        let path = root.join(dir);
        if !path.exists() {
            fs::create_dir_all(&path)?;
        }
    }
    fs::set_permissions(root.join("tmp"), fs::Permissions::from_mode(0o1777))?;
    Ok(())
}

/// Remove everything inside `root`, keeping the directory itself (it may be a
/// mount point). Callers must have verified that nothing is mounted below it.
pub fn clear_dir(root: &Path) -> io::Result<()> {
    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        let meta = fs::symlink_metadata(&path)?;
        if meta.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

pub fn is_empty_dir(path: &Path) -> io::Result<bool> {
    Ok(fs::read_dir(path)?.next().is_none())
}

pub fn install_policy_rc_d(root: &Path) -> io::Result<()> {
    let path = root.join(POLICY_RC_D);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, POLICY_RC_D_BODY)?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
}

pub fn remove_policy_rc_d(root: &Path) -> io::Result<()> {
    match fs::remove_file(root.join(POLICY_RC_D)) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Give the chroot the host's resolver configuration so the package manager
/// can reach its mirrors. A symlink (systemd-resolved stub) is replaced.
pub fn copy_host_resolver(root: &Path) -> io::Result<bool> {
    let host = Path::new("/etc/resolv.conf");
    let Ok(contents) = fs::read(host) else {
        return Ok(false);
    };
    let target = root.join("etc/resolv.conf");
    if fs::symlink_metadata(&target).is_ok() {
        fs::remove_file(&target)?;
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&target, contents)?;
    Ok(true)
}

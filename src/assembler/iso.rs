//! ISO tree layout and the `grub-mkrescue` invocation.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::kernel::{INITRD_PATH, KERNEL_PATH};
use crate::process::CommandSpec;

use super::bootcfg::{ISO_INITRD, ISO_KERNEL};

pub const ISO_BOOT_DIR: &str = "boot/grub";
pub const ISO_LIVE_DIR: &str = "live";
pub const ISO_EFI_DIR: &str = "EFI/BOOT";
pub const SQUASHFS_NAME: &str = "filesystem.squashfs";

/// Recreate the ISO tree from scratch:
/// - boot/grub/ - boot menu
/// - live/ - kernel, initrd, compressed root
/// - EFI/BOOT/ - UEFI loader, filled by grub-mkrescue
pub fn setup_iso_structure(iso_root: &Path) -> io::Result<()> {
    if iso_root.exists() {
        fs::remove_dir_all(iso_root)?;
    }
    fs::create_dir_all(iso_root.join(ISO_BOOT_DIR))?;
    fs::create_dir_all(iso_root.join(ISO_LIVE_DIR))?;
    fs::create_dir_all(iso_root.join(ISO_EFI_DIR))?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootFiles {
    pub kernel: PathBuf,
    pub initrd: Option<PathBuf>,
}

/// Copy the installed kernel and initrd from the staged root into the tree.
/// `Ok(None)` when the root has no kernel.
pub fn copy_boot_files(root: &Path, iso_root: &Path) -> io::Result<Option<BootFiles>> {
    let kernel_src = root.join(KERNEL_PATH);
    if !kernel_src.is_file() {
        return Ok(None);
    }
    let kernel = iso_root.join(ISO_KERNEL);
    fs::copy(&kernel_src, &kernel)?;

    let initrd_src = root.join(INITRD_PATH);
    let initrd = if initrd_src.is_file() {
        let initrd = iso_root.join(ISO_INITRD);
        fs::copy(&initrd_src, &initrd)?;
        Some(initrd)
    } else {
        None
    };
    Ok(Some(BootFiles { kernel, initrd }))
}

pub fn iso_command(iso_root: &Path, output: &Path, label: &str) -> CommandSpec {
    CommandSpec::new("grub-mkrescue")
        .arg("-o")
        .arg_path(output)
        .arg_path(iso_root)
        .args(["--", "-volid", label])
        .label("grub-mkrescue")
}

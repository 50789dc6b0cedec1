//! GRUB boot menu for the live image.

use std::fmt::Write as _;

/// Kernel path inside the ISO tree.
pub const ISO_KERNEL: &str = "live/vmlinuz";
pub const ISO_INITRD: &str = "live/initrd.img";

/// Parameters every entry boots with.
const BASE_PARAMS: &str = "boot=live components";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootEntry {
    pub id: &'static str,
    pub title: &'static str,
    pub params: &'static str,
}

pub const BOOT_ENTRIES: &[BootEntry] = &[
    BootEntry {
        id: "normal",
        title: "Live",
        params: "quiet splash",
    },
    BootEntry {
        id: "safe",
        title: "Live (safe graphics)",
        params: "nomodeset noapic acpi=off",
    },
    BootEntry {
        id: "debug",
        title: "Live (debug)",
        params: "debug loglevel=7 systemd.log_level=debug",
    },
    BootEntry {
        id: "recovery",
        title: "Recovery shell",
        params: "single systemd.unit=rescue.target",
    },
];

/// Render `boot/grub/grub.cfg`.
pub fn render_grub_cfg(os_name: &str, label: &str, with_initrd: bool) -> String {
    let mut cfg = String::new();
    let _ = writeln!(cfg, "set default=0");
    let _ = writeln!(cfg, "set timeout=5");
    let _ = writeln!(cfg, "search --no-floppy --set=root --label {label}");
    for entry in BOOT_ENTRIES {
        let _ = writeln!(cfg);
        let _ = writeln!(
            cfg,
            "menuentry '{os_name} {title}' --id {id} {{",
            title = entry.title,
            id = entry.id
        );
        let _ = writeln!(cfg, "    linux /{ISO_KERNEL} {BASE_PARAMS} {}", entry.params);
        if with_initrd {
            let _ = writeln!(cfg, "    initrd /{ISO_INITRD}");
        }
        let _ = writeln!(cfg, "}}");
    }
    cfg
}

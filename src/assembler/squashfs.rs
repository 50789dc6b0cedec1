//! Compressed root filesystem image.

use std::io;
use std::path::Path;

use walkdir::WalkDir;

use crate::config::ImageConfig;
use crate::process::CommandSpec;
use crate::stager::ROOT_MARKER;

/// Top-level directories whose contents never go into the image; the
/// directories themselves stay as mount points.
pub const EXCLUDED_DIRS: &[&str] = &["proc", "sys", "dev", "run", "tmp"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SquashfsOptions {
    /// Compression algorithm (gzip, zstd, xz, lzo, lz4).
    pub compression: String,
    /// Block size, e.g. "128K" or "1M".
    pub block_size: String,
    pub xattrs: bool,
}

impl SquashfsOptions {
    pub fn from_config(config: &ImageConfig) -> Self {
        Self {
            compression: config.compression.clone(),
            block_size: config.block_size.clone(),
            xattrs: config.xattrs,
        }
    }
}

impl Default for SquashfsOptions {
    fn default() -> Self {
        Self::from_config(&ImageConfig::default())
    }
}

pub fn squashfs_command(source: &Path, output: &Path, options: &SquashfsOptions) -> CommandSpec {
    let mut cmd = CommandSpec::new("mksquashfs")
        .arg_path(source)
        .arg_path(output)
        .arg("-noappend")
        .args(["-comp", options.compression.as_str()])
        .args(["-b", options.block_size.as_str()]);
    if !options.xattrs {
        cmd = cmd.arg("-no-xattrs");
    }
    cmd = cmd.arg("-wildcards").arg("-e");
    for dir in EXCLUDED_DIRS {
        cmd = cmd.arg(format!("{dir}/*"));
    }
    cmd.arg(ROOT_MARKER).label("mksquashfs")
}

/// Bytes the image will have to hold: every regular file under `root`
/// outside the excluded directories.
pub fn staged_size(root: &Path) -> io::Result<u64> {
    let mut total = 0;
    let walker = WalkDir::new(root).follow_links(false).into_iter().filter_entry(|entry| {
        entry.depth() != 1
            || !entry
                .file_name()
                .to_str()
                .is_some_and(|name| EXCLUDED_DIRS.contains(&name))
    });
    for entry in walker {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(io::Error::from)?.len();
        }
    }
    Ok(total)
}

//! Image assembler: staged root in, bootable ISO plus checksums out.
//!
//! Every run rebuilds the ISO tree, the compressed root and the image from
//! the current staged root. Nothing from an earlier assembly is reused.

pub mod bootcfg;
pub mod checksum;
pub mod iso;
pub mod squashfs;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{BuildConfig, ImageConfig, Variant};
use crate::monitor::host;
use crate::process::{CommandOutput, CommandRunner, ExecError};
use crate::stager::StagedRoot;

pub use squashfs::SquashfsOptions;

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum AssembleError {
    #[error(
        "not enough space in '{}' for the image: {} MiB needed, {} MiB free",
        .path.display(),
        .required >> 20,
        .available >> 20
    )]
    InsufficientSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    #[error("staged root '{}' has no kernel at boot/vmlinuz", .root.display())]
    MissingKernel { root: PathBuf },

    #[error("{tool} exited with {code:?}: {detail}")]
    ToolFailed {
        tool: String,
        code: Option<i32>,
        detail: String,
    },

    #[error("{} was not produced", .path.display())]
    NotProduced { path: PathBuf },

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// External image tools. Fakes implement this in tests.
pub trait ImageTools: Send + Sync {
    fn squash(
        &self,
        root: &Path,
        output: &Path,
        options: &SquashfsOptions,
    ) -> Result<CommandOutput, ExecError>;
    fn make_iso(&self, iso_root: &Path, output: &Path, label: &str) -> Result<CommandOutput, ExecError>;
    fn available_space(&self, path: &Path) -> io::Result<u64>;
    /// Identifies the filesystem holding `path`.
    fn filesystem_id(&self, path: &Path) -> io::Result<u64>;
}

/// mksquashfs and grub-mkrescue run on the host through a command runner.
#[derive(Clone)]
pub struct SystemImageTools {
    runner: Arc<dyn CommandRunner>,
}

impl SystemImageTools {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl ImageTools for SystemImageTools {
    fn squash(
        &self,
        root: &Path,
        output: &Path,
        options: &SquashfsOptions,
    ) -> Result<CommandOutput, ExecError> {
        self.runner
            .run(&squashfs::squashfs_command(root, output, options))
    }

    fn make_iso(&self, iso_root: &Path, output: &Path, label: &str) -> Result<CommandOutput, ExecError> {
        self.runner.run(&iso::iso_command(iso_root, output, label))
    }

    fn available_space(&self, path: &Path) -> io::Result<u64> {
        host::available_disk(path)
    }

    fn filesystem_id(&self, path: &Path) -> io::Result<u64> {
        host::filesystem_id(path)
    }
}

/// The finished image and where its pieces are.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageArtifact {
    pub image_path: PathBuf,
    pub md5: String,
    pub sha256: String,
    pub md5_path: PathBuf,
    pub sha256_path: PathBuf,
    pub squashfs: PathBuf,
    pub boot_config: PathBuf,
    pub size: u64,
}

pub struct Assembler {
    tools: Arc<dyn ImageTools>,
    image: ImageConfig,
    os_name: String,
    label: String,
    work_dir: PathBuf,
    output_dir: PathBuf,
}

impl Assembler {
    pub fn new(tools: Arc<dyn ImageTools>, config: &BuildConfig) -> Self {
        Self {
            tools,
            image: config.image.clone(),
            os_name: config.build.name.clone(),
            label: config.build.label.clone(),
            work_dir: config.build.work_dir.clone(),
            output_dir: config.build.output_dir.clone(),
        }
    }

    /// Where the image for `session_id` lands.
    pub fn output_dir(&self, session_id: &str) -> PathBuf {
        self.output_dir.join(session_id)
    }

    pub fn iso_root(&self, session_id: &str) -> PathBuf {
        self.scratch_dir(session_id).join("iso-root")
    }

    fn scratch_dir(&self, session_id: &str) -> PathBuf {
        self.work_dir.join(session_id)
    }

    pub fn image_filename(&self, variant: Variant) -> String {
        self.image
            .filename
            .clone()
            .unwrap_or_else(|| format!("{}-{}.iso", self.os_name, variant))
    }

    /// The compressed root is written under the work directory and the image
    /// under the output directory, each bounded by the staged size. Targets
    /// on one filesystem must fit together.
    fn check_space(&self, staged: u64, targets: &[&Path]) -> Result<(), AssembleError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| AssembleError::Io { path, source }
        };
        let mut needs: Vec<(u64, &Path, u64)> = Vec::new();
        for &path in targets {
            let fs_id = self.tools.filesystem_id(path).map_err(io_err(path))?;
            match needs.iter_mut().find(|(id, _, _)| *id == fs_id) {
                Some((_, _, need)) => *need = need.saturating_add(staged),
                None => needs.push((fs_id, path, staged)),
            }
        }
        for (_, path, required) in needs {
            let available = self.tools.available_space(path).map_err(io_err(path))?;
            tracing::debug!(
                path = %path.display(),
                required_mib = required >> 20,
                available_mib = available >> 20,
                "image space check"
            );
            if available < required {
                return Err(AssembleError::InsufficientSpace {
                    path: path.to_path_buf(),
                    required,
                    available,
                });
            }
        }
        Ok(())
    }

    pub fn assemble(&self, root: &StagedRoot, variant: Variant) -> Result<ImageArtifact, AssembleError> {
        let output_dir = self.output_dir(&root.session_id);
        create_dir(&output_dir)?;
        let scratch = self.scratch_dir(&root.session_id);
        create_dir(&scratch)?;

        let required = squashfs::staged_size(&root.path).map_err(|source| AssembleError::Io {
            path: root.path.clone(),
            source,
        })?;
        self.check_space(required, &[&scratch, &output_dir])?;

        let iso_root = self.iso_root(&root.session_id);
        iso::setup_iso_structure(&iso_root).map_err(|source| AssembleError::Io {
            path: iso_root.clone(),
            source,
        })?;
        let boot = iso::copy_boot_files(&root.path, &iso_root)
            .map_err(|source| AssembleError::Io {
                path: iso_root.clone(),
                source,
            })?
            .ok_or_else(|| AssembleError::MissingKernel {
                root: root.path.clone(),
            })?;

        let boot_config = iso_root.join(iso::ISO_BOOT_DIR).join("grub.cfg");
        let cfg = bootcfg::render_grub_cfg(&self.os_name, &self.label, boot.initrd.is_some());
        fs::write(&boot_config, cfg).map_err(|source| AssembleError::Io {
            path: boot_config.clone(),
            source,
        })?;

        let squashfs_path = iso_root.join(iso::ISO_LIVE_DIR).join(iso::SQUASHFS_NAME);
        tracing::info!(
            event = "squashfs_started",
            root = %root.path.display(),
            staged_mib = required >> 20,
            compression = %self.image.compression,
            "compressing staged root"
        );
        let options = SquashfsOptions::from_config(&self.image);
        check_tool("mksquashfs", self.tools.squash(&root.path, &squashfs_path, &options)?)?;
        produced(&squashfs_path)?;

        let image_path = output_dir.join(self.image_filename(variant));
        remove_stale(&image_path)?;
        tracing::info!(event = "iso_started", image = %image_path.display(), "building bootable image");
        check_tool("grub-mkrescue", self.tools.make_iso(&iso_root, &image_path, &self.label)?)?;
        let size = produced(&image_path)?;

        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| AssembleError::Io { path, source }
        };
        let digests = checksum::digest_file(&image_path).map_err(io_err(&image_path))?;
        let md5_path = checksum::write_checksum_file(&image_path, "md5", &digests.md5)
            .map_err(io_err(&image_path))?;
        let sha256_path = checksum::write_checksum_file(&image_path, "sha256", &digests.sha256)
            .map_err(io_err(&image_path))?;

        tracing::info!(
            event = "image_assembled",
            image = %image_path.display(),
            size_gib = size as f64 / GIB as f64,
            sha256 = %digests.sha256,
            "image assembled"
        );
        Ok(ImageArtifact {
            image_path,
            md5: digests.md5,
            sha256: digests.sha256,
            md5_path,
            sha256_path,
            squashfs: squashfs_path,
            boot_config,
            size,
        })
    }
}

fn create_dir(path: &Path) -> Result<(), AssembleError> {
    fs::create_dir_all(path).map_err(|source| AssembleError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn remove_stale(path: &Path) -> Result<(), AssembleError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(AssembleError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn check_tool(tool: &str, output: CommandOutput) -> Result<(), AssembleError> {
    if output.success() {
        return Ok(());
    }
    Err(AssembleError::ToolFailed {
        tool: tool.to_string(),
        code: output.code,
        detail: output.combined(),
    })
}

/// Size of a file a tool was supposed to write.
fn produced(path: &Path) -> Result<u64, AssembleError> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(meta.len()),
        _ => Err(AssembleError::NotProduced {
            path: path.to_path_buf(),
        }),
    }
}

//! Filesystem stager: owns the staged root and the chroot context.
//!
//! The root is tagged with a marker file the stager writes last, after the
//! base system is in place. A root whose marker says `partial` and names the
//! current session is reused as is; this is what makes resume cheap. A root
//! the stager did not create is never touched.
//!
//! Commands inside the root run through [`Stager::enter_context`], which
//! mounts the virtual filesystems for exactly the duration of one command.

pub mod base;
pub mod filesystem;
pub mod lock;
pub mod mounts;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::config::{BaseConfig, Variant};
use crate::fsutil::write_json_atomic;
use crate::process::{CommandOutput, CommandRunner, CommandSpec, ExecError};

pub use lock::RootLock;
pub use mounts::{ContextGuard, Mounter, NixMounter};

use base::BaseSource;

pub const ROOT_MARKER: &str = ".distro-forge-root.json";

/// PATH inside the chroot; the host PATH may point at directories the root lacks.
const CHROOT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

#[derive(Debug, Error)]
pub enum StageError {
    #[error("'{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("staged root '{root}' is locked by another session ({holder})")]
    RootLocked { root: PathBuf, holder: String },

    #[error("staged root '{root}' is corrupt: {reason}")]
    CorruptRoot { root: PathBuf, reason: String },

    #[error("staged root '{root}' does not exist; it cannot be resumed")]
    MissingRoot { root: PathBuf },

    #[error("staged root '{root}' belongs to session '{owner}'")]
    ForeignRoot { root: PathBuf, owner: String },

    #[error("populating base root: {reason}")]
    Base { reason: String },

    #[error(transparent)]
    Exec(#[from] ExecError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerState {
    /// Base population in progress; a root left in this state is rebuilt.
    Populating,
    /// Base complete; packages may or may not be installed yet.
    Partial,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootMarker {
    pub session_id: String,
    pub variant: Variant,
    pub state: MarkerState,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl RootMarker {
    pub fn read(root: &Path) -> Result<Option<Self>, StageError> {
        let path = root.join(ROOT_MARKER);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StageError::Io { path, source }),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StageError::CorruptRoot {
                root: root.to_path_buf(),
                reason: format!("unreadable root marker: {e}"),
            })
    }

    fn write(&self, root: &Path) -> Result<(), StageError> {
        let path = root.join(ROOT_MARKER);
        write_json_atomic(&path, self).map_err(|source| StageError::Io { path, source })
    }
}

/// A root ready for package installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedRoot {
    pub path: PathBuf,
    pub session_id: String,
    pub variant: Variant,
    /// True when an existing partial root was picked up instead of populated.
    pub reused: bool,
}

/// Runs commands inside a staged root. The installer only sees this.
pub trait ContextExec {
    fn exec(&self, command: &CommandSpec) -> Result<CommandOutput, ExecError>;
    fn root(&self) -> &Path;
}

#[derive(Clone)]
pub struct Stager {
    mounter: Arc<dyn Mounter>,
    runner: Arc<dyn CommandRunner>,
    base: BaseConfig,
    arch: String,
}

impl Stager {
    pub fn new(
        mounter: Arc<dyn Mounter>,
        runner: Arc<dyn CommandRunner>,
        base: BaseConfig,
        arch: impl Into<String>,
    ) -> Self {
        Self {
            mounter,
            runner,
            base,
            arch: arch.into(),
        }
    }

    /// Create, or reuse, the staged root for `session_id`.
    pub fn stage(
        &self,
        target_root: &Path,
        variant: Variant,
        session_id: &str,
    ) -> Result<StagedRoot, StageError> {
        self.release_stale(target_root)?;

        let io_err = |source| StageError::Io {
            path: target_root.to_path_buf(),
            source,
        };
        if target_root.exists() {
            match RootMarker::read(target_root)? {
                Some(marker) if marker.session_id == session_id && marker.state == MarkerState::Partial => {
                    filesystem::ensure_layout(target_root).map_err(io_err)?;
                    tracing::info!(
                        event = "root_reused",
                        root = %target_root.display(),
                        session = session_id,
                        "reusing partial staged root"
                    );
                    return Ok(StagedRoot {
                        path: target_root.to_path_buf(),
                        session_id: session_id.to_string(),
                        variant: marker.variant,
                        reused: true,
                    });
                }
                Some(marker) => {
                    tracing::warn!(
                        event = "root_recreated",
                        root = %target_root.display(),
                        previous_session = %marker.session_id,
                        previous_state = ?marker.state,
                        "clearing staged root before populating"
                    );
                    filesystem::clear_dir(target_root).map_err(io_err)?;
                }
                None => {
                    if !filesystem::is_empty_dir(target_root).map_err(io_err)? {
                        return Err(StageError::CorruptRoot {
                            root: target_root.to_path_buf(),
                            reason: "directory is not empty and carries no root marker; refusing to overwrite"
                                .to_string(),
                        });
                    }
                }
            }
        } else {
            fs::create_dir_all(target_root).map_err(io_err)?;
        }

        let mut marker = RootMarker {
            session_id: session_id.to_string(),
            variant,
            state: MarkerState::Populating,
            created_at: OffsetDateTime::now_utc(),
        };
        marker.write(target_root)?;

        match base::base_source(&self.base) {
            BaseSource::Tarball(tarball) => {
                tracing::info!(
                    event = "base_unpack",
                    tarball = %tarball.display(),
                    "unpacking base root"
                );
                base::unpack_tarball(tarball, target_root)?;
            }
            BaseSource::Bootstrap => {
                base::bootstrap(
                    self.runner.as_ref(),
                    &self.base,
                    &self.arch,
                    variant,
                    target_root,
                )?;
            }
        }
        filesystem::ensure_layout(target_root).map_err(io_err)?;

        marker.state = MarkerState::Partial;
        marker.write(target_root)?;
        tracing::info!(
            event = "root_staged",
            root = %target_root.display(),
            session = session_id,
            variant = %variant,
            "staged root populated"
        );
        Ok(StagedRoot {
            path: target_root.to_path_buf(),
            session_id: session_id.to_string(),
            variant,
            reused: false,
        })
    }

    /// Re-enter a root staged earlier in the same session, without touching
    /// its contents.
    pub fn reenter(&self, target_root: &Path, session_id: &str) -> Result<StagedRoot, StageError> {
        if !target_root.is_dir() {
            return Err(StageError::MissingRoot {
                root: target_root.to_path_buf(),
            });
        }
        self.release_stale(target_root)?;
        match RootMarker::read(target_root)? {
            Some(marker) if marker.session_id != session_id => Err(StageError::ForeignRoot {
                root: target_root.to_path_buf(),
                owner: marker.session_id,
            }),
            Some(marker) if marker.state == MarkerState::Partial => Ok(StagedRoot {
                path: target_root.to_path_buf(),
                session_id: session_id.to_string(),
                variant: marker.variant,
                reused: true,
            }),
            Some(_) => Err(StageError::CorruptRoot {
                root: target_root.to_path_buf(),
                reason: "base population never finished".to_string(),
            }),
            None => Err(StageError::CorruptRoot {
                root: target_root.to_path_buf(),
                reason: "root marker is missing".to_string(),
            }),
        }
    }

    /// Run one command chrooted into the staged root. The virtual filesystems
    /// are mounted before the command starts and released on every exit path.
    pub fn enter_context(
        &self,
        root: &StagedRoot,
        command: &CommandSpec,
    ) -> Result<CommandOutput, ExecError> {
        let _guard = ContextGuard::acquire(Arc::clone(&self.mounter), &root.path)?;
        self.runner.run(&chroot_command(&root.path, command))
    }

    pub fn context<'a>(&'a self, root: &'a StagedRoot) -> RootContext<'a> {
        RootContext { stager: self, root }
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    fn release_stale(&self, target_root: &Path) -> Result<(), StageError> {
        let swept = mounts::sweep_stale_mounts(self.mounter.as_ref(), target_root)?;
        let remaining = self.mounter.mounts_under(target_root)?;
        if !remaining.is_empty() {
            return Err(StageError::CorruptRoot {
                root: target_root.to_path_buf(),
                reason: format!(
                    "{} mounts remain under the root after detaching {}",
                    remaining.len(),
                    swept.len()
                ),
            });
        }
        Ok(())
    }
}

/// Wrap `command` so it runs inside `root`.
pub fn chroot_command(root: &Path, command: &CommandSpec) -> CommandSpec {
    let mut wrapped = CommandSpec::new("chroot")
        .arg_path(root)
        .arg(command.program.clone())
        .args(command.args.iter().cloned())
        .env("DEBIAN_FRONTEND", "noninteractive")
        .env("DEBCONF_NONINTERACTIVE_SEEN", "true")
        .env("LC_ALL", "C")
        .env("PATH", CHROOT_PATH)
        .label(command.label.clone());
    for (key, value) in &command.env {
        wrapped = wrapped.env(key.clone(), value.clone());
    }
    wrapped.log_path = command.log_path.clone();
    wrapped
}

pub struct RootContext<'a> {
    stager: &'a Stager,
    root: &'a StagedRoot,
}

impl ContextExec for RootContext<'_> {
    fn exec(&self, command: &CommandSpec) -> Result<CommandOutput, ExecError> {
        self.stager.enter_context(self.root, command)
    }

    fn root(&self) -> &Path {
        &self.root.path
    }
}

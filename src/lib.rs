//! Phased, resumable build orchestration for bootable Linux distribution images.
//!
//! A build stages a base root filesystem, layers several hundred third-party
//! packages from mutually inconsistent repositories onto it, installs a
//! kernel and packs the result into a bootable ISO. The work is split into
//! eight fixed phases; every phase boundary is checkpointed so an interrupted
//! or failed session resumes where it stopped instead of starting over.
//!
//! # Architecture
//!
//! ```text
//! orchestrator
//!     │
//!     ├── preflight   host tools, disk, privileges (every invocation)
//!     ├── repo        pin priorities for stable + secondary sources
//!     ├── stager      staged root, root lock, chroot context mounts
//!     ├── installer   tier batches, triage, retries, settle
//!     ├── kernel      external kernel artifact into boot/
//!     ├── assembler   squashfs, grub.cfg, ISO, checksums
//!     ├── monitor     background resource sampler, pause decisions
//!     └── checkpoint  append-only phase log + session store
//! ```
//!
//! External tools sit behind collaborator traits (`HostInspector`,
//! `Mounter`, `CommandRunner`, `PackageManager`, `ImageTools`,
//! `ResourceProbe`), so the whole sequence runs against scripted fakes in
//! tests.

pub mod assembler;
pub mod checkpoint;
pub mod config;
pub mod fsutil;
pub mod installer;
pub mod kernel;
pub mod logging;
pub mod monitor;
pub mod orchestrator;
pub mod preflight;
pub mod process;
pub mod repo;
pub mod session;
pub mod stager;

#[cfg(test)]
mod testing;

pub use config::{BuildConfig, Catalog, Variant};
pub use orchestrator::{BuildExit, BuildReport, BuildRequest, Orchestrator, Phase, Toolbox};

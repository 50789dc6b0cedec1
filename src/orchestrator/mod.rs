//! Build orchestrator: drives the fixed phase sequence for one session.
//!
//! Every invocation probes the host and resolves repository priorities
//! before anything is created. A phase is checkpointed `started` before it
//! runs and `completed` or `failed` after, so a resumed session restarts at
//! the first phase without a completed record. Tier outcomes are persisted
//! as they finish; a resumed tier phase skips tiers that already have one.

mod phases;
pub mod report;


use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};

use crate::assembler::{Assembler, ImageTools, SystemImageTools};
use crate::checkpoint::{self, CheckpointDetail, CheckpointLog, CheckpointStatus, ResumePoint};
use crate::config::{BuildConfig, Catalog, Variant};
use crate::installer::history::HISTORY_FILE;
use crate::installer::{
    AptPackageManager, ConflictHistory, Installer, PackageManager, RetryPolicy,
};
use crate::kernel::{self, KernelOutcome};
use crate::monitor::{HostProbe, ResourceMonitor, ResourceProbe, Thresholds};
use crate::preflight::{self, HostInspector, SystemHost};
use crate::process::{self, CommandRunner, SystemRunner};
use crate::repo::{resolve_priorities, PriorityPlan};
use crate::session::{generate_session_id, validate_session_id, BuildSession, SessionStatus, SessionStore};
use crate::stager::{filesystem, Mounter, NixMounter, RootLock, StagedRoot, Stager};

pub use phases::{estimated_total, first_pending, plan, Phase, PlannedAction, PlannedPhase};
pub use report::{InstallationReport, REPORT_FILE};

/// Process exit codes of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildExit {
    Success = 0,
    /// Host prerequisites, configuration or repository policy rejected the
    /// build before anything was staged.
    Prerequisite = 1,
    /// Image built, some packages skipped.
    Partial = 2,
    /// A phase failed, or the build was interrupted.
    Fatal = 3,
}

impl BuildExit {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// The external collaborators a build runs against.
#[derive(Clone)]
pub struct Toolbox {
    pub host: Arc<dyn HostInspector>,
    pub mounter: Arc<dyn Mounter>,
    /// Host-side commands: debootstrap, chroot, the kernel build.
    pub runner: Arc<dyn CommandRunner>,
    pub packages: Arc<dyn PackageManager>,
    pub image: Arc<dyn ImageTools>,
    pub probe: Arc<dyn ResourceProbe>,
}

impl Toolbox {
    pub fn system(config: &BuildConfig) -> Self {
        let runner: Arc<dyn CommandRunner> =
            Arc::new(SystemRunner::new(config.monitor.idle_window()));
        let apt_log = config.build.state_dir.join("apt.log");
        Self {
            host: Arc::new(SystemHost),
            mounter: Arc::new(NixMounter),
            packages: Arc::new(
                AptPackageManager::new(config.install.defer_triggers).with_log(&apt_log),
            ),
            image: Arc::new(SystemImageTools::new(Arc::clone(&runner))),
            probe: Arc::new(HostProbe),
            runner,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    /// Required for a new session; a resumed session keeps its own.
    pub variant: Option<Variant>,
    pub resume: Option<String>,
    pub skip_packages: bool,
    pub dry_run: bool,
    /// Staged root override.
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct BuildReport {
    pub session_id: Option<String>,
    pub exit: BuildExit,
    pub status: Option<SessionStatus>,
    pub image: Option<PathBuf>,
    pub report_path: Option<PathBuf>,
    pub skipped: usize,
    pub executed: Vec<Phase>,
    /// Reason of every pause, in order.
    pub pauses: Vec<String>,
    pub plan: Vec<PlannedPhase>,
    pub error: Option<String>,
}

impl BuildReport {
    fn new(session_id: Option<String>, exit: BuildExit) -> Self {
        Self {
            session_id,
            exit,
            status: None,
            image: None,
            report_path: None,
            skipped: 0,
            executed: Vec::new(),
            pauses: Vec::new(),
            plan: Vec::new(),
            error: None,
        }
    }

    fn rejected(session_id: Option<String>, error: &anyhow::Error) -> Self {
        let mut report = Self::new(session_id, BuildExit::Prerequisite);
        report.error = Some(format!("{error:#}"));
        report
    }
}

/// A session that passed every pre-phase check and owns its root.
struct ActiveRun {
    config: BuildConfig,
    session: BuildSession,
    resume: ResumePoint,
    plan: PriorityPlan,
    _lock: RootLock,
}

enum Prepared {
    DryRun(BuildReport),
    Ready(Box<ActiveRun>),
}

pub struct Orchestrator {
    config: BuildConfig,
    catalog: Catalog,
    toolbox: Toolbox,
}

impl Orchestrator {
    pub fn new(config: BuildConfig, catalog: Catalog, toolbox: Toolbox) -> Self {
        Self {
            config,
            catalog,
            toolbox,
        }
    }

    pub fn run(&self, request: &BuildRequest) -> BuildReport {
        match self.prepare(request) {
            Ok(Prepared::DryRun(report)) => report,
            Ok(Prepared::Ready(run)) => self.execute(*run, request.skip_packages),
            Err(e) => {
                tracing::error!(
                    event = "build_rejected",
                    error = %format!("{e:#}"),
                    "build rejected before staging"
                );
                BuildReport::rejected(request.resume.clone(), &e)
            }
        }
    }

    /// Everything that must hold before a root is touched. Creates nothing
    /// except the session manifest and the root lock, and those only once
    /// every check passed.
    fn prepare(&self, request: &BuildRequest) -> Result<Prepared> {
        let mut config = self.config.clone();
        if let Some(root) = &request.root {
            config.build.root = root.clone();
        }
        let store = SessionStore::new(&config.build.state_dir);

        let (mut session, resume) = match &request.resume {
            Some(id) => {
                validate_session_id(id)?;
                let session = store
                    .load(id)
                    .with_context(|| format!("loading session '{id}' for resume"))?;
                let resume =
                    checkpoint::load_resume_point(&config.build.state_dir, id, Phase::COUNT)
                        .with_context(|| format!("reading checkpoints of session '{id}'"))?;
                if request.root.is_none() {
                    config.build.root = session.root.clone();
                } else if config.build.root != session.root {
                    bail!(
                        "session '{}' was staged at '{}', not '{}'",
                        id,
                        session.root.display(),
                        config.build.root.display()
                    );
                }
                if let Some(variant) = request.variant.filter(|v| *v != session.variant) {
                    tracing::warn!(
                        session = %id,
                        requested = %variant,
                        variant = %session.variant,
                        "resumed session keeps its original variant"
                    );
                }
                (session, resume)
            }
            None => {
                let variant = request
                    .variant
                    .ok_or_else(|| anyhow!("a variant is required for a new build"))?;
                let id = generate_session_id()?;
                let session = BuildSession::new(id, config.build.root.clone(), variant);
                (session, ResumePoint::Phase(1))
            }
        };

        preflight::probe(&config, self.toolbox.host.as_ref())
            .context("checking host prerequisites")?;
        let priority_plan = resolve_priorities(&config.sources, &config.priorities)
            .context("resolving repository priorities")?;

        let planned = plan(&self.catalog, session.variant, resume, request.skip_packages);
        if request.dry_run {
            tracing::info!(
                event = "dry_run",
                variant = %session.variant,
                rules = priority_plan.rules.len(),
                "dry run; nothing staged"
            );
            let mut report = BuildReport::new(Some(session.id.clone()), BuildExit::Success);
            report.plan = planned;
            return Ok(Prepared::DryRun(report));
        }

        let lock = RootLock::acquire(&config.build.root, &session.id)
            .context("locking the staged root")?;
        session.error = None;
        session.set_status(SessionStatus::Running);
        store.save(&session)?;
        tracing::info!(
            event = "session_started",
            session = %session.id,
            variant = %session.variant,
            root = %config.build.root.display(),
            resume_at = first_pending(resume),
            "build session started"
        );

        Ok(Prepared::Ready(Box::new(ActiveRun {
            config,
            session,
            resume,
            plan: priority_plan,
            _lock: lock,
        })))
    }

    fn execute(&self, run: ActiveRun, skip_packages: bool) -> BuildReport {
        let ActiveRun {
            config,
            mut session,
            resume,
            plan: priority_plan,
            _lock,
        } = run;
        let store = SessionStore::new(&config.build.state_dir);
        let mut report = BuildReport::new(Some(session.id.clone()), BuildExit::Fatal);
        report.plan = plan(&self.catalog, session.variant, resume, skip_packages);

        let mut log = match CheckpointLog::open(&config.build.state_dir, &session.id) {
            Ok(log) => log,
            Err(e) => {
                let e = anyhow::Error::new(e).context("opening checkpoint log");
                return fail_session(&store, &mut session, report, &e);
            }
        };
        let monitor = ResourceMonitor::start(
            Arc::clone(&self.toolbox.probe),
            &config.build.root,
            Thresholds::from_config(&config.monitor, self.toolbox.host.cpu_count()),
            config.monitor.interval(),
            config.monitor.window,
        );

        let mut runner = PhaseRunner {
            config: &config,
            catalog: &self.catalog,
            toolbox: &self.toolbox,
            store: &store,
            monitor: &monitor,
            plan: &priority_plan,
            stager: Stager::new(
                Arc::clone(&self.toolbox.mounter),
                Arc::clone(&self.toolbox.runner),
                config.base.clone(),
                config.build.arch.clone(),
            ),
            assembler: Assembler::new(Arc::clone(&self.toolbox.image), &config),
            staged: None,
            skip_packages,
            pauses: Vec::new(),
        };

        let first = first_pending(resume);
        for phase in Phase::ALL.into_iter().filter(|p| p.index() >= first) {
            if let Err(e) = runner.run_phase(phase, &mut session, &mut log) {
                report.pauses = runner.pauses;
                report.executed.push(phase);
                return fail_session(&store, &mut session, report, &e);
            }
            report.executed.push(phase);
        }
        report.pauses = std::mem::take(&mut runner.pauses);
        drop(runner);
        drop(monitor);
        drop(log);

        match finalize(&config, &store, &mut session) {
            Ok(report_path) => {
                report.exit = if session.skipped_packages > 0 {
                    BuildExit::Partial
                } else {
                    BuildExit::Success
                };
                report.status = Some(session.status);
                report.image = session.image.clone();
                report.report_path = Some(report_path);
                report.skipped = session.skipped_packages;
                report
            }
            Err(e) => fail_session(&store, &mut session, report, &e),
        }
    }
}

fn fail_session(
    store: &SessionStore,
    session: &mut BuildSession,
    mut report: BuildReport,
    error: &anyhow::Error,
) -> BuildReport {
    let message = format!("{error:#}");
    tracing::error!(
        event = "session_failed",
        session = %session.id,
        phase = session.current_phase,
        error = %message,
        "build failed; resume with --resume {}",
        session.id
    );
    session.error = Some(message.clone());
    session.set_status(SessionStatus::Failed);
    if let Err(e) = store.save(session) {
        tracing::error!(session = %session.id, error = %format!("{e:#}"), "failed to save session");
    }
    report.exit = BuildExit::Fatal;
    report.status = Some(session.status);
    report.skipped = session.skipped_packages;
    report.error = Some(message);
    report
}

/// Write the installation report, mark the session completed and archive it.
fn finalize(config: &BuildConfig, store: &SessionStore, session: &mut BuildSession) -> Result<PathBuf> {
    let outcomes = store.load_outcomes(&session.id)?;
    let report = InstallationReport::from_outcomes(&session.id, session.variant, &outcomes);
    let path = config
        .build
        .output_dir
        .join(&session.id)
        .join(REPORT_FILE);
    report
        .write(&path)
        .with_context(|| format!("writing installation report '{}'", path.display()))?;

    session.skipped_packages = report.skipped();
    session.current_phase = Phase::COUNT;
    session.set_status(SessionStatus::Completed);
    store.save(session)?;
    let archived = store.archive(session)?;
    tracing::info!(
        event = "session_completed",
        session = %session.id,
        installed = report.installed(),
        skipped = report.skipped(),
        archive = %archived.display(),
        "build session completed"
    );
    Ok(path)
}

#[derive(Debug, Default)]
struct PhaseDone {
    artifacts: BTreeMap<String, String>,
    note: Option<String>,
    retries: u32,
}

impl PhaseDone {
    fn noted(note: impl Into<String>) -> Self {
        Self {
            note: Some(note.into()),
            ..Self::default()
        }
    }
}

struct PhaseRunner<'a> {
    config: &'a BuildConfig,
    catalog: &'a Catalog,
    toolbox: &'a Toolbox,
    store: &'a SessionStore,
    monitor: &'a ResourceMonitor,
    plan: &'a PriorityPlan,
    stager: Stager,
    assembler: Assembler,
    staged: Option<StagedRoot>,
    skip_packages: bool,
    pauses: Vec<String>,
}

impl PhaseRunner<'_> {
    fn run_phase(
        &mut self,
        phase: Phase,
        session: &mut BuildSession,
        log: &mut CheckpointLog,
    ) -> Result<()> {
        self.wait_for_resources(session)?;
        if process::interrupted() {
            bail!("interrupted before phase {phase}");
        }
        session.current_phase = phase.index();
        session.set_status(SessionStatus::Running);
        self.store.save(session)?;
        log.record(&session.id, phase.index(), phase.slug(), CheckpointStatus::Started)?;
        tracing::info!(
            event = "phase_started",
            phase = %phase,
            index = phase.index(),
            total = Phase::COUNT,
            "phase {} of {}: {}",
            phase.index(),
            Phase::COUNT,
            phase
        );

        let started = Instant::now();
        match self.phase_body(phase, session) {
            Ok(done) => {
                let elapsed = started.elapsed();
                log.record_with(
                    &session.id,
                    phase.index(),
                    phase.slug(),
                    CheckpointStatus::Completed,
                    CheckpointDetail {
                        artifacts: done.artifacts,
                        note: done.note.clone(),
                        duration_secs: Some(elapsed.as_secs()),
                        retries: done.retries,
                    },
                )?;
                tracing::info!(
                    event = "phase_finished",
                    phase = %phase,
                    index = phase.index(),
                    elapsed_secs = elapsed.as_secs(),
                    estimate_secs = phase.estimate().as_secs(),
                    retries = done.retries,
                    note = done.note.as_deref().unwrap_or(""),
                    "phase {} of {} done",
                    phase.index(),
                    Phase::COUNT
                );
                self.store.save(session)?;
                Ok(())
            }
            Err(e) => {
                let note = format!("{e:#}");
                if let Err(log_err) = log.record_with(
                    &session.id,
                    phase.index(),
                    phase.slug(),
                    CheckpointStatus::Failed,
                    CheckpointDetail {
                        note: Some(note),
                        duration_secs: Some(started.elapsed().as_secs()),
                        ..CheckpointDetail::default()
                    },
                ) {
                    tracing::error!(phase = %phase, error = %log_err, "failed to record phase failure");
                }
                Err(e.context(format!("phase {} failed", phase)))
            }
        }
    }

    fn phase_body(&mut self, phase: Phase, session: &mut BuildSession) -> Result<PhaseDone> {
        match phase {
            Phase::StageBaseFilesystem => self.stage_base(session),
            Phase::ConfigureRepositories => self.configure_repositories(session),
            Phase::InstallTier1 | Phase::InstallTier2 | Phase::InstallTier3 => {
                let slot = phase.tier_slot().unwrap_or_default();
                self.install_tiers(slot, session)
            }
            Phase::InstallKernel => self.install_kernel(session),
            Phase::FinalizeRoot => self.finalize_root(session),
            Phase::AssembleImage => self.assemble(session),
        }
    }

    /// Block while the monitor reports pressure. Running commands are
    /// never affected; this only delays the next unit of work.
    fn wait_for_resources(&mut self, session: &mut BuildSession) -> Result<()> {
        let mut paused = false;
        while let Some(reason) = self.monitor.should_pause() {
            if process::interrupted() {
                bail!("interrupted while paused ({reason})");
            }
            if !paused {
                paused = true;
                let reason = reason.to_string();
                tracing::warn!(
                    event = "build_paused",
                    session = %session.id,
                    phase = session.current_phase,
                    reason = %reason,
                    "pausing before new work"
                );
                session.set_status(SessionStatus::Paused);
                session.pause_reason = Some(reason.clone());
                self.store.save(session)?;
                self.pauses.push(reason);
            }
            thread::sleep(self.config.monitor.resume_poll());
            self.monitor.resample();
        }
        if paused {
            tracing::info!(event = "build_resumed", session = %session.id, "resources recovered; resuming");
            session.set_status(SessionStatus::Running);
            self.store.save(session)?;
        }
        Ok(())
    }

    /// The staged root of this session, re-entered on first use when phase 1
    /// ran in an earlier invocation.
    fn staged_root(&mut self, session: &BuildSession) -> Result<StagedRoot> {
        if let Some(root) = &self.staged {
            return Ok(root.clone());
        }
        let root = self
            .stager
            .reenter(&session.root, &session.id)
            .with_context(|| format!("re-entering staged root '{}'", session.root.display()))?;
        self.staged = Some(root.clone());
        Ok(root)
    }

    fn stage_base(&mut self, session: &BuildSession) -> Result<PhaseDone> {
        let root = self
            .stager
            .stage(&session.root, session.variant, &session.id)
            .with_context(|| format!("staging root '{}'", session.root.display()))?;
        let done = if root.reused {
            PhaseDone::noted("reused partial root")
        } else {
            PhaseDone::default()
        };
        self.staged = Some(root);
        Ok(done)
    }

    fn configure_repositories(&mut self, session: &BuildSession) -> Result<PhaseDone> {
        let root = self.staged_root(session)?;
        let written = self
            .plan
            .write_into(&root.path)
            .context("writing repository configuration")?;
        filesystem::install_policy_rc_d(&root.path).context("installing policy-rc.d")?;
        if !filesystem::copy_host_resolver(&root.path).context("copying host resolver configuration")? {
            tracing::warn!(root = %root.path.display(), "host has no resolv.conf; the root keeps its own");
        }

        let mut done = PhaseDone::default();
        for path in written {
            let digest = kernel::sha256_file(&path)
                .with_context(|| format!("hashing '{}'", path.display()))?;
            let name = path
                .strip_prefix(&root.path)
                .unwrap_or(&path)
                .display()
                .to_string();
            done.artifacts.insert(name, digest);
        }

        let installer = self.installer();
        let ctx = self.stager.context(&root);
        let retries = installer.refresh(&ctx)?;
        done.retries = retries;
        if retries > 0 {
            done.note = Some(format!("catalog refreshed after {retries} retries"));
        }
        Ok(done)
    }

    fn install_tiers(&mut self, slot: u8, session: &mut BuildSession) -> Result<PhaseDone> {
        if self.skip_packages {
            return Ok(PhaseDone::noted(phases::SKIPPED_BY_OPERATOR));
        }
        let catalog = self.catalog;
        let tiers = catalog.tiers_for(slot, session.variant);
        if tiers.is_empty() {
            return Ok(PhaseDone::noted(phases::NO_TIERS_SELECTED));
        }
        let root = self.staged_root(session)?;

        let finished: HashSet<String> = self
            .store
            .load_outcomes(&session.id)?
            .into_iter()
            .map(|o| o.tier)
            .collect();
        let history_path = self.config.build.state_dir.join(HISTORY_FILE);
        let mut history = ConflictHistory::load(&history_path)
            .with_context(|| format!("reading conflict history '{}'", history_path.display()))?;

        let mut installed = 0;
        let mut skipped = 0;
        let mut retries = 0;
        for tier in tiers {
            if finished.contains(&tier.name) {
                tracing::info!(
                    event = "tier_already_installed",
                    tier = %tier.name,
                    "tier finished in an earlier run"
                );
                continue;
            }
            self.wait_for_resources(session)?;
            if process::interrupted() {
                bail!("interrupted before tier '{}'", tier.name);
            }

            let installer = self.installer();
            let ctx = self.stager.context(&root);
            let outcome = installer.install_tier(tier, &ctx, &mut history)?;
            history
                .save(&history_path)
                .with_context(|| format!("writing conflict history '{}'", history_path.display()))?;
            self.store.save_outcome(&session.id, &outcome)?;

            installed += 1;
            retries += outcome.retries;
            skipped += outcome.skipped.len();
            session.skipped_packages += outcome.skipped.len();
            self.store.save(session)?;
        }
        let mut done = PhaseDone::noted(format!(
            "{installed} tiers installed, {skipped} packages skipped"
        ));
        done.retries = retries;
        Ok(done)
    }

    fn install_kernel(&mut self, session: &BuildSession) -> Result<PhaseDone> {
        let root = self.staged_root(session)?;
        let installed = kernel::install_kernel(
            self.config.kernel.as_ref(),
            self.toolbox.runner.as_ref(),
            &root.path,
        )?;
        let note = match installed.outcome {
            KernelOutcome::AlreadyPresent => "kernel artifact reused",
            KernelOutcome::BuiltNow => "kernel built",
            KernelOutcome::Packaged => "packaged kernel",
        };
        let mut done = PhaseDone::noted(note);
        done.artifacts
            .insert(kernel::KERNEL_PATH.to_string(), installed.sha256);
        Ok(done)
    }

    fn finalize_root(&mut self, session: &BuildSession) -> Result<PhaseDone> {
        let root = self.staged_root(session)?;
        let installer = self.installer();
        let ctx = self.stager.context(&root);
        let settle_runs = installer.settle_root(&ctx)?;
        self.toolbox
            .packages
            .clean_cache(&ctx)
            .context("cleaning the package cache")?;
        filesystem::remove_policy_rc_d(&root.path).context("removing policy-rc.d")?;
        Ok(PhaseDone::noted(format!("settled in {settle_runs} configure runs")))
    }

    fn assemble(&mut self, session: &mut BuildSession) -> Result<PhaseDone> {
        let root = self.staged_root(session)?;
        let artifact = self.assembler.assemble(&root, session.variant)?;
        let mut done = PhaseDone::default();
        let name = artifact
            .image_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        done.artifacts.insert(name, artifact.sha256.clone());
        session.image = Some(artifact.image_path);
        Ok(done)
    }

    fn installer(&self) -> Installer<'_> {
        Installer::new(
            self.toolbox.packages.as_ref(),
            RetryPolicy::from_config(&self.config.install),
        )
    }
}

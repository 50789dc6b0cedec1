//! Phased package installer.
//!
//! A tier is installed as one batch first. A failed batch is classified:
//! transient failures retry the same batch with backoff, anything else is
//! triaged. Triage splits the tier into clean packages, installed together,
//! and problematic ones, installed one by one. An individual failure is
//! recorded as a skip with a reason and never stops the tier.
//!
//! Every install attempt, batched or individual, successful or not, is
//! followed by the settle step (`dpkg --configure -a`), because triggers are
//! deferred during installs and a half-configured package database breaks
//! every later tier. Only a settle step that cannot be recovered, or a tier
//! where nothing at all got through because of transient errors, is fatal.

pub mod apt;
pub mod history;
mod model;
pub mod retry;

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::process::ExecError;
use crate::stager::ContextExec;

pub use apt::AptPackageManager;
pub use history::ConflictHistory;
pub use model::{ConflictHint, InstallationOutcome, PackageSpec, SkippedPackage, Tier};
pub use retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Dependency or version conflict between sources.
    Conflict,
    /// Package unknown to the configured sources (or a stale catalog).
    Missing,
    /// Network, mirror or lock trouble.
    Transient,
    Other,
}

impl FailureKind {
    /// Reason recorded for a package skipped with this failure.
    pub fn skip_reason(self) -> &'static str {
        match self {
            FailureKind::Conflict => "dependency version conflict",
            FailureKind::Missing => "package not available from configured sources",
            FailureKind::Transient => "transient fetch failure persisted after retries",
            FailureKind::Other => "installation failed",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Conflict => "conflict",
            FailureKind::Missing => "missing",
            FailureKind::Transient => "transient",
            FailureKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// A package manager operation that ran and failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallFailure {
    pub kind: FailureKind,
    pub detail: String,
}

#[derive(Debug, Error)]
pub enum PmError {
    #[error("{}: {}", .0.kind, .0.detail)]
    Failed(InstallFailure),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// The standard package manager interface, as seen from outside the root.
pub trait PackageManager: Send + Sync {
    fn refresh_catalog(&self, ctx: &dyn ContextExec) -> Result<(), PmError>;
    fn install(&self, ctx: &dyn ContextExec, packages: &[PackageSpec]) -> Result<(), PmError>;
    /// Force configuration of every unpacked but unconfigured package.
    fn configure_pending(&self, ctx: &dyn ContextExec) -> Result<(), PmError>;
    /// Let the package manager fix a broken dependency state.
    fn repair(&self, ctx: &dyn ContextExec) -> Result<(), PmError>;
    /// Packages left half-installed, half-configured or unpacked.
    fn broken_packages(&self, ctx: &dyn ContextExec) -> Result<Vec<String>, PmError>;
    /// Remove `packages` even though they need reinstallation.
    fn remove_broken(&self, ctx: &dyn ContextExec, packages: &[String]) -> Result<(), PmError>;
    fn available_versions(
        &self,
        ctx: &dyn ContextExec,
        package: &PackageSpec,
    ) -> Result<Vec<String>, PmError>;
    fn clean_cache(&self, ctx: &dyn ContextExec) -> Result<(), PmError>;
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("settle step failed in tier '{tier}' and repair did not help: {detail}")]
    SettleFailed { tier: String, detail: String },

    #[error("no package of tier '{tier}' could be installed; every attempt failed transiently: {detail}")]
    NoProgress { tier: String, detail: String },

    #[error("package catalog refresh failed: {detail}")]
    RefreshFailed { detail: String },

    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Outcome of one install attempt after retries.
enum Attempt {
    Installed,
    Failed(InstallFailure),
}

pub struct Installer<'a> {
    pm: &'a dyn PackageManager,
    retry: RetryPolicy,
}

impl<'a> Installer<'a> {
    pub fn new(pm: &'a dyn PackageManager, retry: RetryPolicy) -> Self {
        Self { pm, retry }
    }

    /// Install one tier into the root behind `ctx`.
    ///
    /// Individual package failures end up in the outcome. `history` is read
    /// to find problematic packages and updated with this run's results.
    pub fn install_tier(
        &self,
        tier: &Tier,
        ctx: &dyn ContextExec,
        history: &mut ConflictHistory,
    ) -> Result<InstallationOutcome, InstallError> {
        let mut outcome = InstallationOutcome::new(tier);
        if tier.packages.is_empty() {
            return Ok(outcome);
        }
        tracing::info!(
            event = "tier_started",
            tier = %tier.name,
            packages = tier.packages.len(),
            "installing tier as one batch"
        );

        let mut broken = Vec::new();
        let batch_failure =
            match self.install_with_retry(tier, &tier.packages, ctx, &mut outcome, &mut broken)? {
                Attempt::Installed => {
                    for package in &tier.packages {
                        history.clear(&package.name);
                        outcome.succeeded.push(package.name.clone());
                    }
                    self.finish(tier, &outcome);
                    return Ok(outcome);
                }
                Attempt::Failed(failure) => failure,
            };
        tracing::warn!(
            event = "batch_failed",
            tier = %tier.name,
            kind = %batch_failure.kind,
            detail = %batch_failure.detail,
            "tier batch failed; triaging packages"
        );

        let mut failure_kinds = Vec::new();
        let mut removed = skip_removed(tier, &mut broken, history, &mut outcome);
        failure_kinds.extend(removed.iter().map(|_| FailureKind::Other));

        let remaining: Vec<PackageSpec> = tier
            .packages
            .iter()
            .filter(|p| outcome.skip_reason(&p.name).is_none())
            .cloned()
            .collect();
        let (clean, problematic) = partition(&remaining, history);
        let mut individual: HashSet<&str> = problematic.iter().map(|p| p.name.as_str()).collect();

        if clean.is_empty() {
            tracing::info!(tier = %tier.name, "no clean packages; installing each package on its own");
        } else if problematic.is_empty() && removed.is_empty() {
            // The clean batch would be the batch that just failed.
            tracing::info!(
                event = "clean_batch_demoted",
                tier = %tier.name,
                packages = clean.len(),
                "no package is known to conflict; installing each package on its own"
            );
            individual.extend(clean.iter().map(|p| p.name.as_str()));
        } else {
            tracing::info!(
                event = "clean_batch_started",
                tier = %tier.name,
                clean = clean.len(),
                problematic = problematic.len(),
                "installing clean partition as one batch"
            );
            match self.install_with_retry(tier, &clean, ctx, &mut outcome, &mut broken)? {
                Attempt::Installed => {
                    for package in &clean {
                        history.clear(&package.name);
                        outcome.succeeded.push(package.name.clone());
                    }
                }
                Attempt::Failed(failure) => {
                    tracing::warn!(
                        event = "clean_batch_demoted",
                        tier = %tier.name,
                        kind = %failure.kind,
                        detail = %failure.detail,
                        "clean batch failed; installing its packages one by one"
                    );
                    individual.extend(clean.iter().map(|p| p.name.as_str()));
                }
            }
            let more = skip_removed(tier, &mut broken, history, &mut outcome);
            failure_kinds.extend(more.iter().map(|_| FailureKind::Other));
            removed.extend(more);
        }

        // Catalog order, so runs are reproducible.
        let individual: Vec<&PackageSpec> = tier
            .packages
            .iter()
            .filter(|p| individual.contains(p.name.as_str()))
            .collect();
        let routed: HashSet<&str> = individual.iter().map(|p| p.name.as_str()).collect();

        for package in individual {
            if outcome.skip_reason(&package.name).is_some() {
                continue;
            }
            match self.install_individual(tier, package, ctx, &mut outcome, &mut broken)? {
                Attempt::Installed => {
                    history.clear(&package.name);
                    outcome.succeeded.push(package.name.clone());
                    tracing::info!(
                        event = "package_installed",
                        tier = %tier.name,
                        package = %package.name,
                        "package installed individually"
                    );
                }
                Attempt::Failed(failure) => {
                    let reason = failure.kind.skip_reason();
                    tracing::warn!(
                        event = "package_skipped",
                        tier = %tier.name,
                        package = %package.name,
                        reason,
                        kind = %failure.kind,
                        detail = %failure.detail,
                        "package skipped"
                    );
                    history.record_failure(&package.name, reason);
                    outcome.failed.push(package.name.clone());
                    outcome.skipped.push(SkippedPackage {
                        name: package.name.clone(),
                        reason: reason.to_string(),
                        detail: failure.detail,
                    });
                    failure_kinds.push(failure.kind);
                }
            }
            let more = skip_removed(tier, &mut broken, history, &mut outcome);
            failure_kinds.extend(more.iter().map(|_| FailureKind::Other));
            removed.extend(more);
        }

        outcome.problematic = tier
            .packages
            .iter()
            .filter(|p| routed.contains(p.name.as_str()) || removed.contains(&p.name))
            .map(|p| p.name.clone())
            .collect();

        if outcome.succeeded.is_empty()
            && !failure_kinds.is_empty()
            && failure_kinds.iter().all(|k| *k == FailureKind::Transient)
        {
            return Err(InstallError::NoProgress {
                tier: tier.name.clone(),
                detail: batch_failure.detail,
            });
        }

        self.finish(tier, &outcome);
        Ok(outcome)
    }

    /// Refresh the package catalog, retrying transient failures.
    pub fn refresh(&self, ctx: &dyn ContextExec) -> Result<u32, InstallError> {
        let mut retry = 0;
        loop {
            let failure = match self.pm.refresh_catalog(ctx) {
                Ok(()) => return Ok(retry),
                Err(PmError::Exec(e)) => return Err(e.into()),
                Err(PmError::Failed(failure)) => failure,
            };
            if !self.retry.should_retry(failure.kind) || retry >= self.retry.max_retries {
                return Err(InstallError::RefreshFailed {
                    detail: failure.detail,
                });
            }
            retry += 1;
            tracing::warn!(
                event = "refresh_retry",
                kind = %failure.kind,
                attempt = retry + 1,
                detail = %failure.detail,
                "catalog refresh failed; retrying"
            );
            self.retry.wait(retry);
        }
    }

    /// Settle the whole root outside any tier. Returns how many configure
    /// runs it took.
    pub fn settle_root(&self, ctx: &dyn ContextExec) -> Result<u32, InstallError> {
        let tier = Tier {
            name: "finalize".to_string(),
            slot: 0,
            packages: Vec::new(),
        };
        let mut outcome = InstallationOutcome::new(&tier);
        self.settle(&tier, ctx, &mut outcome)?;
        Ok(outcome.settle_runs)
    }

    fn finish(&self, tier: &Tier, outcome: &InstallationOutcome) {
        tracing::info!(
            event = "tier_finished",
            tier = %tier.name,
            attempted = outcome.attempted,
            succeeded = outcome.succeeded.len(),
            skipped = outcome.skipped.len(),
            retries = outcome.retries,
            settle_runs = outcome.settle_runs,
            "tier finished"
        );
    }

    fn install_individual(
        &self,
        tier: &Tier,
        package: &PackageSpec,
        ctx: &dyn ContextExec,
        outcome: &mut InstallationOutcome,
        broken: &mut Vec<String>,
    ) -> Result<Attempt, InstallError> {
        match self.pm.available_versions(ctx, package) {
            Ok(versions) if versions.is_empty() => {
                return Ok(Attempt::Failed(InstallFailure {
                    kind: FailureKind::Missing,
                    detail: match &package.source {
                        Some(source) => format!("no version of '{}' in '{}'", package.name, source),
                        None => format!("no version of '{}' in any source", package.name),
                    },
                }))
            }
            Ok(versions) => {
                tracing::debug!(package = %package.name, versions = ?versions, "candidate versions");
            }
            Err(PmError::Failed(failure)) => {
                tracing::debug!(
                    package = %package.name,
                    detail = %failure.detail,
                    "version query failed; attempting install anyway"
                );
            }
            Err(PmError::Exec(e)) => return Err(e.into()),
        }
        self.install_with_retry(tier, std::slice::from_ref(package), ctx, outcome, broken)
    }

    /// Install `packages` with bounded retries, settling after every attempt.
    ///
    /// Packages removed to unblock the settle step after a failed attempt
    /// are appended to `broken`.
    fn install_with_retry(
        &self,
        tier: &Tier,
        packages: &[PackageSpec],
        ctx: &dyn ContextExec,
        outcome: &mut InstallationOutcome,
        broken: &mut Vec<String>,
    ) -> Result<Attempt, InstallError> {
        let mut retry = 0;
        loop {
            let result = self.pm.install(ctx, packages);
            match self.settle(tier, ctx, outcome) {
                Ok(()) => {}
                Err(err @ InstallError::SettleFailed { .. })
                    if matches!(result, Err(PmError::Failed(_))) =>
                {
                    self.remove_broken(tier, ctx, outcome, err, broken)?;
                }
                Err(err) => return Err(err),
            }
            let failure = match result {
                Ok(()) => return Ok(Attempt::Installed),
                Err(PmError::Exec(e)) => return Err(e.into()),
                Err(PmError::Failed(failure)) => failure,
            };

            if !self.retry.should_retry(failure.kind) || retry >= self.retry.max_retries {
                return Ok(Attempt::Failed(failure));
            }
            retry += 1;
            outcome.retries += 1;
            let backoff = self.retry.backoff_duration(retry);
            tracing::warn!(
                event = "install_retry",
                tier = %tier.name,
                packages = packages.len(),
                kind = %failure.kind,
                attempt = retry + 1,
                max_attempts = self.retry.max_retries + 1,
                backoff_ms = backoff.as_millis() as u64,
                detail = %failure.detail,
                "install failed transiently; retrying"
            );
            self.retry.wait(retry);
            match self.pm.refresh_catalog(ctx) {
                Ok(()) => {}
                Err(PmError::Exec(e)) => return Err(e.into()),
                Err(PmError::Failed(refresh)) => {
                    tracing::warn!(
                        event = "catalog_refresh_failed",
                        tier = %tier.name,
                        detail = %refresh.detail,
                        "catalog refresh failed before retry"
                    );
                }
            }
        }
    }

    /// A failed install can leave a package whose maintainer script fails
    /// on every configure run. Remove what dpkg reports as broken and settle
    /// again; `failed_settle` is returned when there is nothing to remove or
    /// the root still does not settle.
    fn remove_broken(
        &self,
        tier: &Tier,
        ctx: &dyn ContextExec,
        outcome: &mut InstallationOutcome,
        failed_settle: InstallError,
        broken: &mut Vec<String>,
    ) -> Result<(), InstallError> {
        let found = match self.pm.broken_packages(ctx) {
            Ok(found) => found,
            Err(PmError::Exec(e)) => return Err(e.into()),
            Err(PmError::Failed(failure)) => {
                tracing::warn!(tier = %tier.name, detail = %failure.detail, "broken package query failed");
                return Err(failed_settle);
            }
        };
        if found.is_empty() {
            return Err(failed_settle);
        }
        tracing::warn!(
            event = "broken_packages_removed",
            tier = %tier.name,
            packages = ?found,
            "removing packages that block the settle step"
        );
        match self.pm.remove_broken(ctx, &found) {
            Ok(()) => {}
            Err(PmError::Exec(e)) => return Err(e.into()),
            Err(PmError::Failed(failure)) => {
                tracing::warn!(tier = %tier.name, detail = %failure.detail, "removing broken packages failed");
                return Err(failed_settle);
            }
        }
        self.settle(tier, ctx, outcome)?;
        for name in found {
            if !broken.contains(&name) {
                broken.push(name);
            }
        }
        Ok(())
    }

    /// Force configuration of pending packages; repair once if that fails.
    fn settle(
        &self,
        tier: &Tier,
        ctx: &dyn ContextExec,
        outcome: &mut InstallationOutcome,
    ) -> Result<(), InstallError> {
        outcome.settle_runs += 1;
        let first = match self.pm.configure_pending(ctx) {
            Ok(()) => return Ok(()),
            Err(PmError::Exec(e)) => return Err(e.into()),
            Err(PmError::Failed(failure)) => failure,
        };
        tracing::warn!(
            event = "settle_failed",
            tier = %tier.name,
            detail = %first.detail,
            "configure step failed; attempting repair"
        );

        match self.pm.repair(ctx) {
            Ok(()) => {}
            Err(PmError::Exec(e)) => return Err(e.into()),
            Err(PmError::Failed(failure)) => {
                tracing::warn!(tier = %tier.name, detail = %failure.detail, "repair failed");
            }
        }
        outcome.settle_runs += 1;
        match self.pm.configure_pending(ctx) {
            Ok(()) => Ok(()),
            Err(PmError::Exec(e)) => Err(e.into()),
            Err(PmError::Failed(failure)) => Err(InstallError::SettleFailed {
                tier: tier.name.clone(),
                detail: failure.detail,
            }),
        }
    }
}

const REMOVED_DETAIL: &str = "left unconfigured by a failed install and removed from the root";

/// Record every tier package in `broken` that has no result yet as skipped
/// and return their names. Names outside the tier are only logged.
fn skip_removed(
    tier: &Tier,
    broken: &mut Vec<String>,
    history: &mut ConflictHistory,
    outcome: &mut InstallationOutcome,
) -> Vec<String> {
    let mut skipped = Vec::new();
    for name in broken.drain(..) {
        if !tier.packages.iter().any(|p| p.name == name) {
            tracing::warn!(tier = %tier.name, package = %name, "removed a broken dependency outside the tier");
            continue;
        }
        if outcome.skip_reason(&name).is_some() {
            skipped.push(name);
            continue;
        }
        let reason = FailureKind::Other.skip_reason();
        tracing::warn!(
            event = "package_skipped",
            tier = %tier.name,
            package = %name,
            reason,
            detail = REMOVED_DETAIL,
            "package skipped"
        );
        history.record_failure(&name, reason);
        outcome.succeeded.retain(|s| *s != name);
        outcome.failed.push(name.clone());
        outcome.skipped.push(SkippedPackage {
            name: name.clone(),
            reason: reason.to_string(),
            detail: REMOVED_DETAIL.to_string(),
        });
        skipped.push(name);
    }
    skipped
}

/// Split a tier into (clean, problematic), keeping catalog order.
pub fn partition(
    packages: &[PackageSpec],
    history: &ConflictHistory,
) -> (Vec<PackageSpec>, Vec<PackageSpec>) {
    packages.iter().cloned().partition(|p| match p.conflict_hint {
        ConflictHint::KnownClean => true,
        ConflictHint::KnownConflicting => false,
        ConflictHint::Unknown => !history.contains(&p.name),
    })
}

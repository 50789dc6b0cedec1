//! The fixed phase sequence and the dry-run plan built from it.

use std::fmt;
use std::time::Duration;

use crate::checkpoint::ResumePoint;
use crate::config::{Catalog, Variant};

/// Build phases in execution order. The discriminant is the 1-based index
/// recorded in the checkpoint log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Phase {
    /// Create or reuse the staged root and populate the base system.
    StageBaseFilesystem = 1,
    /// Sources list, pin table, policy-rc.d, catalog refresh.
    ConfigureRepositories = 2,
    InstallTier1 = 3,
    InstallTier2 = 4,
    InstallTier3 = 5,
    InstallKernel = 6,
    /// Final settle, cache clean, policy-rc.d removal.
    FinalizeRoot = 7,
    AssembleImage = 8,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::StageBaseFilesystem,
        Phase::ConfigureRepositories,
        Phase::InstallTier1,
        Phase::InstallTier2,
        Phase::InstallTier3,
        Phase::InstallKernel,
        Phase::FinalizeRoot,
        Phase::AssembleImage,
    ];

    pub const COUNT: u8 = Self::ALL.len() as u8;

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn from_index(index: u8) -> Option<Self> {
        let offset = index.checked_sub(1)?;
        Self::ALL.get(offset as usize).copied()
    }

    pub fn slug(self) -> &'static str {
        match self {
            Phase::StageBaseFilesystem => "stage-base-filesystem",
            Phase::ConfigureRepositories => "configure-repositories",
            Phase::InstallTier1 => "install-tier-1",
            Phase::InstallTier2 => "install-tier-2",
            Phase::InstallTier3 => "install-tier-3",
            Phase::InstallKernel => "install-kernel",
            Phase::FinalizeRoot => "finalize-root",
            Phase::AssembleImage => "assemble-image",
        }
    }

    /// Typical wall time on a workstation with a warm mirror.
    pub fn estimate(self) -> Duration {
        let minutes = match self {
            Phase::StageBaseFilesystem => 10,
            Phase::ConfigureRepositories => 3,
            Phase::InstallTier1 => 20,
            Phase::InstallTier2 => 30,
            Phase::InstallTier3 => 20,
            Phase::InstallKernel => 15,
            Phase::FinalizeRoot => 5,
            Phase::AssembleImage => 15,
        };
        Duration::from_secs(minutes * 60)
    }

    /// Catalog slot installed by a tier phase.
    pub fn tier_slot(self) -> Option<u8> {
        match self {
            Phase::InstallTier1 => Some(1),
            Phase::InstallTier2 => Some(2),
            Phase::InstallTier3 => Some(3),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// First phase index that still has to run.
pub fn first_pending(resume: ResumePoint) -> u8 {
    match resume {
        ResumePoint::Phase(index) => index,
        ResumePoint::Finished => Phase::COUNT + 1,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedAction {
    Run,
    /// Completed by an earlier invocation of the same session.
    AlreadyDone,
    Skip(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedPhase {
    pub phase: Phase,
    pub action: PlannedAction,
    /// Packages a tier phase would attempt.
    pub packages: usize,
}

impl fmt::Display for PlannedPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "phase {} of {} {:<24}",
            self.phase.index(),
            Phase::COUNT,
            self.phase.slug()
        )?;
        match &self.action {
            PlannedAction::Run if self.phase.tier_slot().is_some() => write!(
                f,
                "run ({} packages, ~{} min)",
                self.packages,
                minutes(self.phase.estimate())
            ),
            PlannedAction::Run => write!(f, "run (~{} min)", minutes(self.phase.estimate())),
            PlannedAction::AlreadyDone => f.write_str("done"),
            PlannedAction::Skip(why) => write!(f, "skip ({why})"),
        }
    }
}

fn minutes(duration: Duration) -> u64 {
    duration.as_secs().div_ceil(60)
}

/// Summed estimate of the phases a plan would run.
pub fn estimated_total(plan: &[PlannedPhase]) -> Duration {
    plan.iter()
        .filter(|p| p.action == PlannedAction::Run)
        .map(|p| p.phase.estimate())
        .sum()
}

pub const SKIPPED_BY_OPERATOR: &str = "skipped by operator";
pub const NO_TIERS_SELECTED: &str = "no tiers selected";

/// What each phase would do for `variant`, starting at `resume`.
pub fn plan(
    catalog: &Catalog,
    variant: Variant,
    resume: ResumePoint,
    skip_packages: bool,
) -> Vec<PlannedPhase> {
    let first = first_pending(resume);
    Phase::ALL
        .iter()
        .map(|&phase| {
            let packages: usize = phase
                .tier_slot()
                .map(|slot| {
                    catalog
                        .tiers_for(slot, variant)
                        .iter()
                        .map(|t| t.packages.len())
                        .sum()
                })
                .unwrap_or(0);
            let action = if phase.index() < first {
                PlannedAction::AlreadyDone
            } else {
                match phase.tier_slot() {
                    Some(_) if skip_packages => PlannedAction::Skip(SKIPPED_BY_OPERATOR),
                    Some(slot) if catalog.tiers_for(slot, variant).is_empty() => {
                        PlannedAction::Skip(NO_TIERS_SELECTED)
                    }
                    _ => PlannedAction::Run,
                }
            };
            PlannedPhase {
                phase,
                action,
                packages,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const CATALOG: &str = r#"
[[tiers]]
name = "core"
slot = 1
packages = ["nmap", "tcpdump"]

[[tiers]]
name = "wireless"
slot = 3
variants = ["full"]
packages = ["aircrack-ng"]
"#;

    #[test]
    fn test_indices_match_order() {
        for (offset, phase) in Phase::ALL.iter().enumerate() {
            assert_eq!(phase.index() as usize, offset + 1);
            assert_eq!(Phase::from_index(phase.index()), Some(*phase));
        }
        assert_eq!(Phase::from_index(0), None);
        assert_eq!(Phase::from_index(9), None);
        assert_eq!(Phase::COUNT, 8);
        assert_eq!(Phase::InstallKernel.to_string(), "install-kernel");
    }

    #[test]
    fn test_plan_marks_done_and_empty_slots() {
        let catalog = Catalog::parse(CATALOG, Path::new("catalog.toml")).unwrap();
        let planned = plan(&catalog, Variant::Minimal, ResumePoint::Phase(3), false);

        assert_eq!(planned[0].action, PlannedAction::AlreadyDone);
        assert_eq!(planned[1].action, PlannedAction::AlreadyDone);
        assert_eq!(planned[2].action, PlannedAction::Run);
        assert_eq!(planned[2].packages, 2);
        assert_eq!(planned[3].action, PlannedAction::Skip(NO_TIERS_SELECTED));
        assert_eq!(planned[4].action, PlannedAction::Skip(NO_TIERS_SELECTED));
        assert_eq!(planned[7].action, PlannedAction::Run);
        assert!(planned[2].to_string().ends_with("run (2 packages, ~20 min)"));
        assert!(planned[7].to_string().ends_with("run (~15 min)"));
        assert!(planned[0].to_string().ends_with("done"));
    }

    #[test]
    fn test_estimates_cover_every_phase() {
        assert!(Phase::ALL.iter().all(|p| p.estimate() > Duration::ZERO));
        assert!(Phase::InstallTier2.estimate() > Phase::ConfigureRepositories.estimate());

        let catalog = Catalog::parse(CATALOG, Path::new("catalog.toml")).unwrap();
        let planned = plan(&catalog, Variant::Minimal, ResumePoint::Phase(6), false);
        let expected = Phase::InstallKernel.estimate()
            + Phase::FinalizeRoot.estimate()
            + Phase::AssembleImage.estimate();
        assert_eq!(estimated_total(&planned), expected);
        assert_eq!(
            estimated_total(&plan(&catalog, Variant::Minimal, ResumePoint::Finished, false)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_plan_with_skipped_packages() {
        let catalog = Catalog::parse(CATALOG, Path::new("catalog.toml")).unwrap();
        let planned = plan(&catalog, Variant::Full, ResumePoint::Phase(1), true);
        assert!(planned
            .iter()
            .filter(|p| p.phase.tier_slot().is_some())
            .all(|p| p.action == PlannedAction::Skip(SKIPPED_BY_OPERATOR)));
        assert_eq!(planned[4].packages, 1);
        assert!(plan(&catalog, Variant::Full, ResumePoint::Finished, false)
            .iter()
            .all(|p| p.action == PlannedAction::AlreadyDone));
    }
}

//! apt/dpkg adapter.
//!
//! The rest of the installer never looks at tool output. Everything apt prints
//! is reduced here to a [`FailureKind`] plus a trailing detail string.

use std::path::{Path, PathBuf};

use crate::process::{CommandOutput, CommandSpec};
use crate::stager::ContextExec;

use super::{FailureKind, InstallFailure, PackageManager, PackageSpec, PmError};

/// Markers checked in order: a conflict anywhere in the output wins over a
/// missing package, which wins over a network problem.
const FAILURE_MARKERS: &[(FailureKind, &[&str])] = &[
    (
        FailureKind::Conflict,
        &[
            "unmet dependencies",
            "held broken packages",
            "but it is not going to be installed",
            "but it is not installable",
            "is to be installed",
            "dependency problems",
            "conflicting packages",
            "trying to overwrite",
            "breaks:",
            "conflicts:",
        ],
    ),
    (
        FailureKind::Missing,
        &[
            "unable to locate package",
            "has no installation candidate",
            "couldn't find any package",
            "was not found",
            "no packages found",
        ],
    ),
    (
        FailureKind::Transient,
        &[
            "temporary failure resolving",
            "could not resolve",
            "failed to fetch",
            "connection timed out",
            "connection failed",
            "connection refused",
            "hash sum mismatch",
            "some index files failed to download",
            "could not get lock",
            "unable to acquire the dpkg frontend lock",
            "503 service unavailable",
            "502 bad gateway",
        ],
    ),
];

/// Lines of output kept as failure detail.
const DETAIL_LINES: usize = 12;

pub fn classify_failure(output: &str) -> FailureKind {
    let lowered = output.to_ascii_lowercase();
    FAILURE_MARKERS
        .iter()
        .find(|(_, markers)| markers.iter().any(|m| lowered.contains(m)))
        .map(|(kind, _)| *kind)
        .unwrap_or(FailureKind::Other)
}

/// The last few meaningful lines of apt output, errors first.
pub fn failure_detail(output: &str) -> String {
    let errors: Vec<&str> = output
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("E:") || l.contains("Depends:") || l.contains("Breaks:"))
        .collect();
    let lines: Vec<&str> = if errors.is_empty() {
        output.lines().map(str::trim).filter(|l| !l.is_empty()).collect()
    } else {
        errors
    };
    let start = lines.len().saturating_sub(DETAIL_LINES);
    lines[start..].join("\n")
}

/// Versions listed by `apt-cache madison`, optionally limited to one suite.
pub fn parse_madison(output: &str, suite: Option<&str>) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut cols = line.split('|').map(str::trim);
            let _name = cols.next()?;
            let version = cols.next()?;
            let origin = cols.next()?;
            if version.is_empty() {
                return None;
            }
            if let Some(suite) = suite {
                let matches_suite = origin
                    .split_whitespace()
                    .any(|part| part == suite || part.starts_with(&format!("{suite}/")));
                if !matches_suite {
                    return None;
                }
            }
            Some(version.to_string())
        })
        .collect()
}

/// Packages in a state that keeps `dpkg --configure -a` failing, from
/// `dpkg-query -W -f='${db:Status-Abbrev} ${Package}\n'`. The status column is
/// desired, current and error flags: current `H`, `F` or `U`, or the
/// reinstallation-required error flag `R`, count as broken.
pub fn parse_broken_status(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let (status, name) = line.trim_end().split_once(' ')?;
            let mut flags = status.chars();
            let _desired = flags.next()?;
            let current = flags.next()?;
            let error = flags.next().unwrap_or(' ');
            let broken = matches!(current, 'H' | 'F' | 'U') || error == 'R';
            let name = name.trim();
            (broken && !name.is_empty()).then(|| name.to_string())
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct AptPackageManager {
    defer_triggers: bool,
    log_path: Option<PathBuf>,
}

impl AptPackageManager {
    pub fn new(defer_triggers: bool) -> Self {
        Self {
            defer_triggers,
            log_path: None,
        }
    }

    /// Append every apt/dpkg output line to `path`.
    pub fn with_log(mut self, path: &Path) -> Self {
        self.log_path = Some(path.to_path_buf());
        self
    }

    fn command(&self, program: &str, label: &str) -> CommandSpec {
        let cmd = CommandSpec::new(program).label(label);
        match &self.log_path {
            Some(path) => cmd.log_to(path),
            None => cmd,
        }
    }

    pub fn install_command(&self, packages: &[PackageSpec]) -> CommandSpec {
        let mut cmd = self
            .command("apt-get", "apt-get install")
            .args(["-y", "-q", "--no-install-recommends"])
            .args(["-o", "Dpkg::Options::=--force-confdef"])
            .args(["-o", "Dpkg::Options::=--force-confold"]);
        if self.defer_triggers {
            cmd = cmd.args(["-o", "DPkg::NoTriggers=true"]);
        }
        cmd.arg("install")
            .args(packages.iter().map(PackageSpec::install_target))
    }

    fn run_checked(&self, ctx: &dyn ContextExec, cmd: &CommandSpec) -> Result<CommandOutput, PmError> {
        let output = ctx.exec(cmd)?;
        if output.success() {
            return Ok(output);
        }
        let combined = output.combined();
        Err(PmError::Failed(InstallFailure {
            kind: classify_failure(&combined),
            detail: failure_detail(&combined),
        }))
    }
}

impl PackageManager for AptPackageManager {
    fn refresh_catalog(&self, ctx: &dyn ContextExec) -> Result<(), PmError> {
        let cmd = self.command("apt-get", "apt-get update").args(["-q", "update"]);
        self.run_checked(ctx, &cmd).map(drop)
    }

    fn install(&self, ctx: &dyn ContextExec, packages: &[PackageSpec]) -> Result<(), PmError> {
        self.run_checked(ctx, &self.install_command(packages)).map(drop)
    }

    fn configure_pending(&self, ctx: &dyn ContextExec) -> Result<(), PmError> {
        let cmd = self
            .command("dpkg", "dpkg configure")
            .args(["--force-confdef", "--force-confold", "--configure", "-a"]);
        self.run_checked(ctx, &cmd).map(drop)
    }

    fn repair(&self, ctx: &dyn ContextExec) -> Result<(), PmError> {
        let cmd = self
            .command("apt-get", "apt-get repair")
            .args(["-y", "-q", "-f", "install"]);
        self.run_checked(ctx, &cmd).map(drop)
    }

    fn broken_packages(&self, ctx: &dyn ContextExec) -> Result<Vec<String>, PmError> {
        let cmd = self
            .command("dpkg-query", "dpkg-query status")
            .args(["-W", "-f=${db:Status-Abbrev} ${Package}\n"]);
        let output = self.run_checked(ctx, &cmd)?;
        Ok(parse_broken_status(&output.stdout))
    }

    fn remove_broken(&self, ctx: &dyn ContextExec, packages: &[String]) -> Result<(), PmError> {
        let cmd = self
            .command("dpkg", "dpkg remove broken")
            .args(["--remove", "--force-remove-reinstreq", "--force-depends"])
            .args(packages);
        self.run_checked(ctx, &cmd).map(drop)
    }

    fn available_versions(
        &self,
        ctx: &dyn ContextExec,
        package: &PackageSpec,
    ) -> Result<Vec<String>, PmError> {
        let cmd = self
            .command("apt-cache", "apt-cache madison")
            .args(["madison", package.name.as_str()]);
        let output = self.run_checked(ctx, &cmd)?;
        Ok(parse_madison(&output.stdout, package.source.as_deref()))
    }

    fn clean_cache(&self, ctx: &dyn ContextExec) -> Result<(), PmError> {
        let cmd = self.command("apt-get", "apt-get clean").arg("clean");
        self.run_checked(ctx, &cmd).map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_conflict() {
        let out = "The following packages have unmet dependencies:\n libfoo-dev : Depends: libfoo1 (= 2.1-1) but 2.3-1 is to be installed\nE: Unable to correct problems, you have held broken packages.";
        assert_eq!(classify_failure(out), FailureKind::Conflict);
    }

    #[test]
    fn test_classify_missing_transient_other() {
        assert_eq!(
            classify_failure("E: Unable to locate package nmapp"),
            FailureKind::Missing
        );
        assert_eq!(
            classify_failure("Package foo has no installation candidate"),
            FailureKind::Missing
        );
        assert_eq!(
            classify_failure("E: Failed to fetch http://deb.debian.org/x.deb  Temporary failure resolving 'deb.debian.org'"),
            FailureKind::Transient
        );
        assert_eq!(
            classify_failure("E: Could not get lock /var/lib/dpkg/lock-frontend"),
            FailureKind::Transient
        );
        assert_eq!(
            classify_failure("dpkg: error processing package foo (--configure): installed post-installation script subprocess returned error exit status 1"),
            FailureKind::Other
        );
    }

    #[test]
    fn test_conflict_wins_over_transient() {
        let out = "W: Failed to fetch http://x/Release\nE: Unable to correct problems, you have held broken packages.";
        assert_eq!(classify_failure(out), FailureKind::Conflict);
    }

    #[test]
    fn test_failure_detail_prefers_error_lines() {
        let out = "Reading package lists...\nBuilding dependency tree...\n libfoo-dev : Depends: libfoo1 (= 2.1-1)\nE: Unable to correct problems";
        let detail = failure_detail(out);
        assert_eq!(
            detail,
            "libfoo-dev : Depends: libfoo1 (= 2.1-1)\nE: Unable to correct problems"
        );
        assert_eq!(failure_detail("just one line\n"), "just one line");
    }

    #[test]
    fn test_parse_madison() {
        let out = "      nmap | 7.94+git20230807.3be01efb1+dfsg-3 | http://http.kali.org/kali kali-rolling/main amd64 Packages\n      nmap | 7.93+dfsg1-1 | http://deb.debian.org/debian bookworm/main amd64 Packages\n";
        assert_eq!(parse_madison(out, None).len(), 2);
        assert_eq!(
            parse_madison(out, Some("bookworm")),
            vec!["7.93+dfsg1-1".to_string()]
        );
        assert!(parse_madison(out, Some("sid")).is_empty());
        assert!(parse_madison("", None).is_empty());
    }

    #[test]
    fn test_parse_broken_status() {
        let out = "ii  curl\niF  bad-postinst\niU  needs-bad\nrc  old-conf\niHR half\nii  nmap\n";
        assert_eq!(
            parse_broken_status(out),
            vec!["bad-postinst", "needs-bad", "half"]
        );
        assert!(parse_broken_status("ii  curl\n").is_empty());
        assert!(parse_broken_status("").is_empty());
    }

    #[test]
    fn test_install_command() {
        let pm = AptPackageManager::new(true);
        let cmd = pm.install_command(&[
            PackageSpec::new("curl"),
            PackageSpec::new("nmap").with_source("kali-rolling"),
        ]);
        let line = cmd.display_line();
        assert!(line.starts_with("apt-get -y -q --no-install-recommends"));
        assert!(line.contains("-o DPkg::NoTriggers=true"));
        assert!(line.ends_with("install curl nmap/kali-rolling"));

        let eager = AptPackageManager::new(false).install_command(&[PackageSpec::new("curl")]);
        assert!(!eager.display_line().contains("NoTriggers"));
    }
}

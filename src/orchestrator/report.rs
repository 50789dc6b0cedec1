//! Installation report written next to the image.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::config::Variant;
use crate::fsutil::write_json_atomic;
use crate::installer::InstallationOutcome;

pub const REPORT_FILE: &str = "installation-report.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageStatus {
    Installed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageEntry {
    pub status: PackageStatus,
    pub tier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSummary {
    pub name: String,
    pub attempted: usize,
    pub installed: usize,
    pub skipped: usize,
    pub retries: u32,
    pub settle_runs: u32,
}

/// Every attempted package with its final status, across all tiers of a
/// session, including tiers finished by an earlier invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallationReport {
    pub session_id: String,
    pub variant: Variant,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub tiers: Vec<TierSummary>,
    pub packages: BTreeMap<String, PackageEntry>,
}

impl InstallationReport {
    pub fn from_outcomes(session_id: &str, variant: Variant, outcomes: &[InstallationOutcome]) -> Self {
        let mut packages = BTreeMap::new();
        let mut tiers = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            for name in &outcome.succeeded {
                packages.insert(
                    name.clone(),
                    PackageEntry {
                        status: PackageStatus::Installed,
                        tier: outcome.tier.clone(),
                        reason: None,
                        detail: None,
                    },
                );
            }
            for skip in &outcome.skipped {
                packages.insert(
                    skip.name.clone(),
                    PackageEntry {
                        status: PackageStatus::Skipped,
                        tier: outcome.tier.clone(),
                        reason: Some(skip.reason.clone()),
                        detail: (!skip.detail.is_empty()).then(|| skip.detail.clone()),
                    },
                );
            }
            tiers.push(TierSummary {
                name: outcome.tier.clone(),
                attempted: outcome.attempted,
                installed: outcome.succeeded.len(),
                skipped: outcome.skipped.len(),
                retries: outcome.retries,
                settle_runs: outcome.settle_runs,
            });
        }
        Self {
            session_id: session_id.to_string(),
            variant,
            generated_at: OffsetDateTime::now_utc(),
            tiers,
            packages,
        }
    }

    pub fn skipped(&self) -> usize {
        self.packages
            .values()
            .filter(|p| p.status == PackageStatus::Skipped)
            .count()
    }

    pub fn installed(&self) -> usize {
        self.packages.len() - self.skipped()
    }

    pub fn write(&self, path: &Path) -> io::Result<()> {
        write_json_atomic(path, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::SkippedPackage;
    use tempfile::TempDir;

    #[test]
    fn test_report_lists_every_package() {
        let outcomes = vec![
            InstallationOutcome {
                tier: "core".to_string(),
                attempted: 2,
                succeeded: vec!["nmap".to_string(), "tcpdump".to_string()],
                ..InstallationOutcome::default()
            },
            InstallationOutcome {
                tier: "exploitation".to_string(),
                attempted: 2,
                succeeded: vec!["sqlmap".to_string()],
                failed: vec!["libfoo-dev".to_string()],
                skipped: vec![SkippedPackage {
                    name: "libfoo-dev".to_string(),
                    reason: "dependency version conflict".to_string(),
                    detail: String::new(),
                }],
                retries: 1,
                settle_runs: 3,
                ..InstallationOutcome::default()
            },
        ];
        let report = InstallationReport::from_outcomes("s1", Variant::Standard, &outcomes);
        assert_eq!(report.installed(), 3);
        assert_eq!(report.skipped(), 1);
        let entry = &report.packages["libfoo-dev"];
        assert_eq!(entry.tier, "exploitation");
        assert_eq!(entry.reason.as_deref(), Some("dependency version conflict"));
        assert_eq!(entry.detail, None);
        assert_eq!(report.tiers[1].settle_runs, 3);

        let temp = TempDir::new().unwrap();
        let path = temp.path().join(REPORT_FILE);
        report.write(&path).unwrap();
        let parsed: InstallationReport =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(parsed.packages, report.packages);
    }
}

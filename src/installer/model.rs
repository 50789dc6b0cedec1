use serde::{Deserialize, Serialize};

/// What the maintained conflict lists say about a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictHint {
    #[default]
    Unknown,
    KnownClean,
    KnownConflicting,
}

/// A requested package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSpec {
    pub name: String,
    /// Preferred source suite, passed to the package manager as `name/suite`.
    pub source: Option<String>,
    #[serde(default)]
    pub conflict_hint: ConflictHint,
}

impl PackageSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: None,
            conflict_hint: ConflictHint::Unknown,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_hint(mut self, hint: ConflictHint) -> Self {
        self.conflict_hint = hint;
        self
    }

    /// Argument handed to the package manager.
    pub fn install_target(&self) -> String {
        match &self.source {
            Some(source) => format!("{}/{}", self.name, source),
            None => self.name.clone(),
        }
    }
}

/// An ordered batch of packages installed with one strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    pub name: String,
    /// Installer phase slot, 1 to 3.
    pub slot: u8,
    pub packages: Vec<PackageSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedPackage {
    pub name: String,
    /// Human-readable explanation; never empty.
    pub reason: String,
    /// Trailing package manager output, when there was any.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

/// Result of installing one tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationOutcome {
    pub tier: String,
    pub attempted: usize,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<SkippedPackage>,
    /// Packages routed to individual installation.
    pub problematic: Vec<String>,
    pub retries: u32,
    pub settle_runs: u32,
}

impl InstallationOutcome {
    pub fn new(tier: &Tier) -> Self {
        Self {
            tier: tier.name.clone(),
            attempted: tier.packages.len(),
            ..Self::default()
        }
    }

    pub fn has_skips(&self) -> bool {
        !self.skipped.is_empty()
    }

    pub fn skip_reason(&self, package: &str) -> Option<&str> {
        self.skipped
            .iter()
            .find(|s| s.name == package)
            .map(|s| s.reason.as_str())
    }
}

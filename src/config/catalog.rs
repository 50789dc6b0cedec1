//! Package catalog: tiers of packages per variant plus the maintained
//! conflict lists that seed each package's conflict hint.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::{ConfigError, Variant};
use crate::installer::{ConflictHint, PackageSpec, Tier};

/// Number of installer slots in the phase sequence.
pub const TIER_SLOTS: u8 = 3;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogToml {
    #[serde(default)]
    conflicts: ConflictListsToml,
    #[serde(default)]
    tiers: Vec<TierToml>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConflictListsToml {
    #[serde(default)]
    known_conflicting: Vec<String>,
    #[serde(default)]
    known_clean: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TierToml {
    name: String,
    slot: u8,
    #[serde(default = "all_variants")]
    variants: Vec<Variant>,
    packages: Vec<PackageEntryToml>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PackageEntryToml {
    Name(String),
    Detailed(DetailedPackageToml),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DetailedPackageToml {
    name: String,
    source: Option<String>,
    #[serde(default)]
    conflicting: bool,
}

fn all_variants() -> Vec<Variant> {
    Variant::ALL.to_vec()
}

#[derive(Debug, Clone)]
pub struct CatalogTier {
    pub tier: Tier,
    pub variants: BTreeSet<Variant>,
}

#[derive(Debug, Clone)]
pub struct Catalog {
    pub tiers: Vec<CatalogTier>,
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    pub fn parse(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let raw: CatalogToml = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        let invalid = |reason: String| ConfigError::Invalid {
            path: PathBuf::from(origin),
            reason,
        };

        let conflicting: HashSet<&str> = raw
            .conflicts
            .known_conflicting
            .iter()
            .map(String::as_str)
            .collect();
        let clean: HashSet<&str> = raw.conflicts.known_clean.iter().map(String::as_str).collect();
        if let Some(both) = conflicting.intersection(&clean).next() {
            return Err(invalid(format!(
                "package '{both}' is listed as both known_conflicting and known_clean"
            )));
        }

        let mut tier_names = HashSet::new();
        let mut tiers = Vec::with_capacity(raw.tiers.len());
        for tier in raw.tiers {
            if !(1..=TIER_SLOTS).contains(&tier.slot) {
                return Err(invalid(format!(
                    "tier '{}' has slot {}; slots are 1..={}",
                    tier.name, tier.slot, TIER_SLOTS
                )));
            }
            if !tier_names.insert(tier.name.clone()) {
                return Err(invalid(format!("duplicate tier name '{}'", tier.name)));
            }
            if tier.name.contains(['/', '\\']) || tier.name.contains("..") {
                return Err(invalid(format!(
                    "tier name '{}' must not contain path separators",
                    tier.name
                )));
            }

            let mut seen = HashSet::new();
            let mut packages = Vec::with_capacity(tier.packages.len());
            for entry in tier.packages {
                let (name, source, flagged) = match entry {
                    PackageEntryToml::Name(name) => (name, None, false),
                    PackageEntryToml::Detailed(d) => (d.name, d.source, d.conflicting),
                };
                if name.trim().is_empty() {
                    return Err(invalid(format!("tier '{}' has an empty package name", tier.name)));
                }
                if !seen.insert(name.clone()) {
                    return Err(invalid(format!(
                        "package '{}' listed twice in tier '{}'",
                        name, tier.name
                    )));
                }
                let hint = if flagged || conflicting.contains(name.as_str()) {
                    ConflictHint::KnownConflicting
                } else if clean.contains(name.as_str()) {
                    ConflictHint::KnownClean
                } else {
                    ConflictHint::Unknown
                };
                packages.push(PackageSpec {
                    name,
                    source,
                    conflict_hint: hint,
                });
            }

            tiers.push(CatalogTier {
                tier: Tier {
                    name: tier.name,
                    slot: tier.slot,
                    packages,
                },
                variants: tier.variants.into_iter().collect(),
            });
        }

        Ok(Self { tiers })
    }

    /// Tiers of one slot selected by a variant, in catalog order.
    pub fn tiers_for(&self, slot: u8, variant: Variant) -> Vec<&Tier> {
        self.tiers
            .iter()
            .filter(|t| t.tier.slot == slot && t.variants.contains(&variant))
            .map(|t| &t.tier)
            .collect()
    }

    pub fn package_count(&self, variant: Variant) -> usize {
        self.tiers
            .iter()
            .filter(|t| t.variants.contains(&variant))
            .map(|t| t.tier.packages.len())
            .sum()
    }
}

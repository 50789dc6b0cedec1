//! Repository priority resolution.
//!
//! Several package sources are mixed into one root. Left to itself the package
//! manager would happily pull a newer shared library from a rolling source and
//! break every package built against the stable one. The resolver turns the
//! configured sources into a static pin table:
//!
//! - the single stable source wins every package (the unscoped rule),
//! - every other source sits below it,
//! - a narrow override lets a non-stable source win only for an explicit
//!   allow-list of tool packages that never take part in core library chains.
//!
//! Any configuration where the winner for some package is not decidable is
//! rejected up front with [`ResolveError::AmbiguousPriority`].

mod pattern;

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::PriorityPolicy;
use crate::fsutil::write_atomic;

pub use pattern::PackagePattern;

/// Owned by the build; anything else in these directories is left alone.
pub const SOURCES_LIST_PATH: &str = "etc/apt/sources.list.d/distro-forge.list";
pub const PREFERENCES_PATH: &str = "etc/apt/preferences.d/distro-forge.pref";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("ambiguous pin priority: {reason}")]
    AmbiguousPriority { reason: String },

    #[error("source '{source_name}': invalid package pattern '{pattern}': {reason}")]
    InvalidPattern {
        source_name: String,
        pattern: String,
        reason: String,
    },

    #[error("invalid priority policy: {0}")]
    InvalidPolicy(String),

    #[error("writing '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceRole {
    Stable,
    #[default]
    Secondary,
}

/// A configured package origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepositorySource {
    pub name: String,
    pub uri: String,
    pub suite: String,
    #[serde(default = "default_components")]
    pub components: Vec<String>,
    #[serde(default)]
    pub role: SourceRole,
    /// Unscoped pin priority. Defaults to the policy's stable or default value.
    pub priority: Option<i32>,
    /// Package-name patterns (`name` or `prefix*`) this source wins with the override priority.
    #[serde(default)]
    pub packages: Vec<String>,
    /// Pin expression; defaults to `release n=<suite>`.
    pub pin: Option<String>,
    pub signed_by: Option<PathBuf>,
}

impl RepositorySource {
    pub fn pin_expression(&self) -> String {
        self.pin
            .clone()
            .unwrap_or_else(|| format!("release n={}", self.suite))
    }
}

fn default_components() -> Vec<String> {
    vec!["main".to_string()]
}

/// Which packages a pin rule covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "patterns")]
pub enum RuleScope {
    All,
    Patterns(Vec<PackagePattern>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PinRule {
    pub source: String,
    pub pin: String,
    pub priority: i32,
    pub scope: RuleScope,
}

/// Validated preference table for a set of sources.
#[derive(Debug, Clone, Serialize)]
pub struct PriorityPlan {
    /// Unscoped rules first (stable, then secondaries in config order), then overrides.
    pub rules: Vec<PinRule>,
    pub sources: Vec<RepositorySource>,
}

/// Build and validate the pin table. Nothing is written here.
pub fn resolve_priorities(
    sources: &[RepositorySource],
    policy: &PriorityPolicy,
) -> Result<PriorityPlan, ResolveError> {
    if policy.default >= policy.stable {
        return Err(ResolveError::InvalidPolicy(format!(
            "default priority {} must be below stable priority {}",
            policy.default, policy.stable
        )));
    }

    let stable: Vec<&RepositorySource> = sources
        .iter()
        .filter(|s| s.role == SourceRole::Stable)
        .collect();
    let stable_source = match stable.as_slice() {
        [one] => *one,
        [] => {
            return Err(ResolveError::AmbiguousPriority {
                reason: "no source is designated stable for the unscoped rule".to_string(),
            })
        }
        many => {
            let names: Vec<&str> = many.iter().map(|s| s.name.as_str()).collect();
            return Err(ResolveError::AmbiguousPriority {
                reason: format!(
                    "sources {} all claim the unscoped stable priority",
                    quote_list(&names)
                ),
            });
        }
    };
    if !stable_source.packages.is_empty() {
        return Err(ResolveError::AmbiguousPriority {
            reason: format!(
                "stable source '{}' has a narrowed scope; the stable rule must cover all packages",
                stable_source.name
            ),
        });
    }
    let stable_priority = stable_source.priority.unwrap_or(policy.stable);
    if policy.override_priority <= stable_priority {
        return Err(ResolveError::InvalidPolicy(format!(
            "override priority {} must exceed stable priority {}",
            policy.override_priority, stable_priority
        )));
    }

    let core = parse_patterns("core_patterns", &policy.core_patterns)?;

    let mut unscoped = vec![PinRule {
        source: stable_source.name.clone(),
        pin: stable_source.pin_expression(),
        priority: stable_priority,
        scope: RuleScope::All,
    }];
    let mut overrides: Vec<PinRule> = Vec::new();

    for source in sources.iter().filter(|s| s.role == SourceRole::Secondary) {
        let priority = source.priority.unwrap_or(policy.default);
        if priority >= stable_priority {
            return Err(ResolveError::AmbiguousPriority {
                reason: format!(
                    "sources '{}' ({}) and '{}' ({}) both claim the unscoped top priority",
                    stable_source.name, stable_priority, source.name, priority
                ),
            });
        }
        unscoped.push(PinRule {
            source: source.name.clone(),
            pin: source.pin_expression(),
            priority,
            scope: RuleScope::All,
        });

        if source.packages.is_empty() {
            continue;
        }
        let patterns = parse_patterns(&source.name, &source.packages)?;
        for pattern in &patterns {
            if pattern.is_catch_all() {
                return Err(ResolveError::AmbiguousPriority {
                    reason: format!(
                        "override '{}' from '{}' covers every package and competes with the stable rule",
                        pattern, source.name
                    ),
                });
            }
            if let Some(hit) = core.iter().find(|c| c.overlaps(pattern)) {
                return Err(ResolveError::AmbiguousPriority {
                    reason: format!(
                        "override '{}' from '{}' overlaps core library scope '{}'",
                        pattern, source.name, hit
                    ),
                });
            }
            for other in &overrides {
                let RuleScope::Patterns(existing) = &other.scope else {
                    continue;
                };
                if let Some(hit) = existing.iter().find(|e| e.overlaps(pattern)) {
                    return Err(ResolveError::AmbiguousPriority {
                        reason: format!(
                            "override '{}' from '{}' overlaps '{}' from '{}'",
                            pattern, source.name, hit, other.source
                        ),
                    });
                }
            }
            if let Some(dup) = patterns
                .iter()
                .filter(|p| *p != pattern)
                .find(|p| p.overlaps(pattern))
            {
                tracing::debug!(
                    source = %source.name,
                    pattern = %pattern,
                    other = %dup,
                    "overlapping patterns within one source"
                );
            }
        }
        overrides.push(PinRule {
            source: source.name.clone(),
            pin: source.pin_expression(),
            priority: policy.override_priority,
            scope: RuleScope::Patterns(patterns),
        });
    }

    for (i, a) in unscoped.iter().enumerate() {
        if let Some(b) = unscoped[i + 1..].iter().find(|b| b.pin == a.pin) {
            return Err(ResolveError::AmbiguousPriority {
                reason: format!(
                    "sources '{}' and '{}' share pin '{}' with different priorities",
                    a.source, b.source, a.pin
                ),
            });
        }
    }

    let mut rules = unscoped;
    rules.extend(overrides);
    Ok(PriorityPlan {
        rules,
        sources: sources.to_vec(),
    })
}

fn parse_patterns(owner: &str, raw: &[String]) -> Result<Vec<PackagePattern>, ResolveError> {
    raw.iter()
        .map(|p| {
            PackagePattern::parse(p).map_err(|reason| ResolveError::InvalidPattern {
                source_name: owner.to_string(),
                pattern: p.clone(),
                reason,
            })
        })
        .collect()
}

fn quote_list(names: &[&str]) -> String {
    names
        .iter()
        .map(|n| format!("'{n}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl PriorityPlan {
    /// The source that wins `package`, with its priority.
    pub fn effective_priority(&self, package: &str) -> Option<(&str, i32)> {
        self.rules
            .iter()
            .filter(|rule| match &rule.scope {
                RuleScope::All => true,
                RuleScope::Patterns(patterns) => patterns.iter().any(|p| p.matches(package)),
            })
            .max_by_key(|rule| rule.priority)
            .map(|rule| (rule.source.as_str(), rule.priority))
    }

    pub fn stable_source(&self) -> &str {
        self.rules
            .first()
            .map(|rule| rule.source.as_str())
            .unwrap_or_default()
    }

    /// Render the table in apt_preferences(5) format.
    ///
    /// apt uses the first record matching a package version, so the narrow
    /// overrides are written before the unscoped rules.
    pub fn render_preferences(&self) -> String {
        let mut out = String::from("# Generated by distro-forge. Do not edit.\n");
        let (scoped, unscoped): (Vec<&PinRule>, Vec<&PinRule>) = self
            .rules
            .iter()
            .partition(|rule| matches!(rule.scope, RuleScope::Patterns(_)));
        for rule in scoped.into_iter().chain(unscoped) {
            let packages = match &rule.scope {
                RuleScope::All => "*".to_string(),
                RuleScope::Patterns(patterns) => patterns
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(" "),
            };
            out.push_str(&format!(
                "\n# {}\nPackage: {}\nPin: {}\nPin-Priority: {}\n",
                rule.source, packages, rule.pin, rule.priority
            ));
        }
        out
    }

    pub fn render_sources_list(&self) -> String {
        let mut out = String::from("# Generated by distro-forge. Do not edit.\n");
        for source in &self.sources {
            let options = source
                .signed_by
                .as_ref()
                .map(|key| format!("[signed-by={}] ", key.display()))
                .unwrap_or_default();
            out.push_str(&format!(
                "deb {}{} {} {}\n",
                options,
                source.uri,
                source.suite,
                source.components.join(" ")
            ));
        }
        out
    }

    /// Write the sources list and the preference table into a staged root.
    pub fn write_into(&self, root: &Path) -> Result<Vec<PathBuf>, ResolveError> {
        let files = [
            (root.join(SOURCES_LIST_PATH), self.render_sources_list()),
            (root.join(PREFERENCES_PATH), self.render_preferences()),
        ];
        let mut written = Vec::with_capacity(files.len());
        for (path, body) in files {
            write_atomic(&path, body.as_bytes()).map_err(|source| ResolveError::Write {
                path: path.clone(),
                source,
            })?;
            written.push(path);
        }

        // A base sources.list pointing at the same mirror would duplicate entries.
        let legacy = root.join("etc/apt/sources.list");
        if legacy.is_file() {
            fs::write(&legacy, "# Managed in sources.list.d/distro-forge.list\n").map_err(
                |source| ResolveError::Write {
                    path: legacy.clone(),
                    source,
                },
            )?;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn source(name: &str, suite: &str, role: SourceRole) -> RepositorySource {
        RepositorySource {
            name: name.to_string(),
            uri: format!("http://mirror.example/{name}"),
            suite: suite.to_string(),
            components: vec!["main".to_string()],
            role,
            priority: None,
            packages: Vec::new(),
            pin: None,
            signed_by: None,
        }
    }

    fn tools_source() -> RepositorySource {
        let mut tools = source("tools", "tools-rolling", SourceRole::Secondary);
        tools.packages = vec!["nmap".to_string(), "metasploit*".to_string()];
        tools
    }

    #[test]
    fn test_stable_wins_unscoped_and_override_wins_allow_list() {
        let sources = vec![source("debian", "bookworm", SourceRole::Stable), tools_source()];
        let plan = resolve_priorities(&sources, &PriorityPolicy::default()).unwrap();

        assert_eq!(plan.stable_source(), "debian");
        assert_eq!(plan.effective_priority("libc6"), Some(("debian", 900)));
        assert_eq!(plan.effective_priority("nmap"), Some(("tools", 990)));
        assert_eq!(
            plan.effective_priority("metasploit-framework"),
            Some(("tools", 990))
        );
        assert_eq!(plan.effective_priority("nmap-common"), Some(("debian", 900)));
    }

    #[test]
    fn test_two_unscoped_stable_sources_are_ambiguous() {
        let sources = vec![
            source("debian", "bookworm", SourceRole::Stable),
            source("rolling", "sid", SourceRole::Stable),
        ];
        let err = resolve_priorities(&sources, &PriorityPolicy::default()).unwrap_err();
        assert!(matches!(err, ResolveError::AmbiguousPriority { .. }));
        assert!(err.to_string().contains("'debian', 'rolling'"));
    }

    #[test]
    fn test_secondary_claiming_top_priority_is_ambiguous() {
        let mut rolling = source("rolling", "sid", SourceRole::Secondary);
        rolling.priority = Some(900);
        let sources = vec![source("debian", "bookworm", SourceRole::Stable), rolling];
        let err = resolve_priorities(&sources, &PriorityPolicy::default()).unwrap_err();
        assert!(matches!(err, ResolveError::AmbiguousPriority { .. }));
    }

    #[test]
    fn test_no_stable_source_is_ambiguous() {
        let sources = vec![source("rolling", "sid", SourceRole::Secondary)];
        let err = resolve_priorities(&sources, &PriorityPolicy::default()).unwrap_err();
        assert!(matches!(err, ResolveError::AmbiguousPriority { .. }));
    }

    #[test]
    fn test_override_touching_core_scope_is_rejected() {
        let mut tools = tools_source();
        tools.packages.push("libssl3".to_string());
        let sources = vec![source("debian", "bookworm", SourceRole::Stable), tools];
        let err = resolve_priorities(&sources, &PriorityPolicy::default()).unwrap_err();
        assert!(err.to_string().contains("core library scope 'libssl*'"));
    }

    #[test]
    fn test_overlapping_overrides_across_sources_are_rejected() {
        let mut other = source("extras", "extras", SourceRole::Secondary);
        other.packages = vec!["metasploit-framework".to_string()];
        let sources = vec![
            source("debian", "bookworm", SourceRole::Stable),
            tools_source(),
            other,
        ];
        let err = resolve_priorities(&sources, &PriorityPolicy::default()).unwrap_err();
        assert!(err.to_string().contains("overlaps 'metasploit*' from 'tools'"));
    }

    #[test]
    fn test_catch_all_override_is_rejected() {
        let mut tools = tools_source();
        tools.packages = vec!["*".to_string()];
        let sources = vec![source("debian", "bookworm", SourceRole::Stable), tools];
        let err = resolve_priorities(&sources, &PriorityPolicy::default()).unwrap_err();
        assert!(matches!(err, ResolveError::AmbiguousPriority { .. }));
    }

    #[test]
    fn test_invalid_pattern_is_reported() {
        let mut tools = tools_source();
        tools.packages = vec!["py*thon".to_string()];
        let sources = vec![source("debian", "bookworm", SourceRole::Stable), tools];
        let err = resolve_priorities(&sources, &PriorityPolicy::default()).unwrap_err();
        assert!(matches!(err, ResolveError::InvalidPattern { .. }));
    }

    #[test]
    fn test_render_puts_overrides_first() {
        let sources = vec![source("debian", "bookworm", SourceRole::Stable), tools_source()];
        let plan = resolve_priorities(&sources, &PriorityPolicy::default()).unwrap();
        let prefs = plan.render_preferences();

        let override_at = prefs.find("Package: nmap metasploit*").unwrap();
        let stable_at = prefs.find("Pin: release n=bookworm").unwrap();
        assert!(override_at < stable_at);
        assert!(prefs.contains("Pin-Priority: 990"));
        assert!(prefs.contains("Pin-Priority: 100"));
    }

    #[test]
    fn test_write_into_root() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("etc/apt")).unwrap();
        fs::write(temp.path().join("etc/apt/sources.list"), "deb http://old bookworm main\n")
            .unwrap();
        let sources = vec![source("debian", "bookworm", SourceRole::Stable), tools_source()];
        let plan = resolve_priorities(&sources, &PriorityPolicy::default()).unwrap();

        let written = plan.write_into(temp.path()).unwrap();
        assert_eq!(written.len(), 2);
        let list = fs::read_to_string(temp.path().join(SOURCES_LIST_PATH)).unwrap();
        assert!(list.contains("deb http://mirror.example/tools tools-rolling main"));
        let legacy = fs::read_to_string(temp.path().join("etc/apt/sources.list")).unwrap();
        assert!(!legacy.contains("deb "));
    }
}

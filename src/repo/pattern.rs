use std::fmt;

use serde::Serialize;

/// A package-name pattern: an exact name or a `prefix*` glob.
///
/// Only a trailing wildcard is accepted. That keeps overlap between two
/// patterns decidable by prefix comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub enum PackagePattern {
    Exact(String),
    Prefix(String),
}

impl PackagePattern {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("pattern is empty".to_string());
        }
        if raw.chars().any(char::is_whitespace) {
            return Err("pattern contains whitespace".to_string());
        }
        match raw.find(['*', '?', '[']) {
            None => Ok(Self::Exact(raw.to_string())),
            Some(pos) if pos == raw.len() - 1 && raw.ends_with('*') => {
                Ok(Self::Prefix(raw[..pos].to_string()))
            }
            Some(_) => Err("only a single trailing '*' wildcard is supported".to_string()),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == name,
            Self::Prefix(prefix) => name.starts_with(prefix.as_str()),
        }
    }

    /// Whether some package name matches both patterns.
    pub fn overlaps(&self, other: &PackagePattern) -> bool {
        match (self, other) {
            (Self::Exact(a), Self::Exact(b)) => a == b,
            (Self::Exact(name), Self::Prefix(prefix)) | (Self::Prefix(prefix), Self::Exact(name)) => {
                name.starts_with(prefix.as_str())
            }
            (Self::Prefix(a), Self::Prefix(b)) => a.starts_with(b.as_str()) || b.starts_with(a.as_str()),
        }
    }

    pub fn is_catch_all(&self) -> bool {
        matches!(self, Self::Prefix(prefix) if prefix.is_empty())
    }
}

impl fmt::Display for PackagePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(name) => f.write_str(name),
            Self::Prefix(prefix) => write!(f, "{prefix}*"),
        }
    }
}

impl From<PackagePattern> for String {
    fn from(pattern: PackagePattern) -> Self {
        pattern.to_string()
    }
}

//! Packages that failed individual installation in earlier runs.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::fsutil::{now_rfc3339, write_json_atomic};

pub const HISTORY_FILE: &str = "conflict-history.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub reason: String,
    pub failures: u32,
    pub last_failed_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictHistory {
    #[serde(default)]
    pub packages: BTreeMap<String, HistoryEntry>,
}

impl ConflictHistory {
    /// Load the history, treating a missing file as empty.
    pub fn load(path: &Path) -> io::Result<Self> {
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        write_json_atomic(path, self)
    }

    pub fn contains(&self, package: &str) -> bool {
        self.packages.contains_key(package)
    }

    pub fn record_failure(&mut self, package: &str, reason: &str) {
        let entry = self
            .packages
            .entry(package.to_string())
            .or_insert_with(|| HistoryEntry {
                reason: reason.to_string(),
                failures: 0,
                last_failed_at: String::new(),
            });
        entry.reason = reason.to_string();
        entry.failures += 1;
        entry.last_failed_at = now_rfc3339();
    }

    pub fn clear(&mut self, package: &str) -> bool {
        self.packages.remove(package).is_some()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_record_clear_and_persist() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(HISTORY_FILE);
        assert!(ConflictHistory::load(&path).unwrap().is_empty());

        let mut history = ConflictHistory::default();
        history.record_failure("libfoo-dev", "dependency version conflict");
        history.record_failure("libfoo-dev", "dependency version conflict");
        history.record_failure("bar", "installation failed");
        assert!(history.clear("bar"));
        history.save(&path).unwrap();

        let loaded = ConflictHistory::load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.packages["libfoo-dev"].failures, 2);
        assert!(!loaded.contains("bar"));
    }
}

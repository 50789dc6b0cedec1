//! Append-only checkpoint log.
//!
//! One JSON object per line, one file per session. Lines are only ever
//! appended and each append is followed by `fdatasync`, so a crash mid-write
//! can at worst leave a truncated final line; the reader drops it and the
//! previous checkpoint stays authoritative.
//!
//! Phase indices never go backwards within a session. Resuming starts at the
//! lowest phase index without a `completed` checkpoint.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

pub const CHECKPOINTS_DIR: &str = "checkpoints";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint log '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("checkpoint log '{path}' line {line} is corrupt: {reason}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error(
        "checkpoint for phase {attempted} would follow phase {last} in session {session_id}"
    )]
    NonMonotonic {
        session_id: String,
        last: u8,
        attempted: u8,
    },

    #[error("checkpoint log belongs to session '{expected}', not '{found}'")]
    SessionMismatch { expected: String, found: String },

    #[error("no checkpoint log for session '{0}'")]
    UnknownSession(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Started,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: String,
    pub phase_index: u8,
    pub phase: String,
    pub status: CheckpointStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Artifact name to SHA-256.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifacts: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Wall time of the phase, set on its terminal checkpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
    #[serde(default)]
    pub retries: u32,
}

/// Payload of a terminal checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointDetail {
    pub artifacts: BTreeMap<String, String>,
    pub note: Option<String>,
    pub duration_secs: Option<u64>,
    pub retries: u32,
}

/// Where a session picks up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePoint {
    Phase(u8),
    Finished,
}

pub fn log_path(state_dir: &Path, session_id: &str) -> PathBuf {
    state_dir
        .join(CHECKPOINTS_DIR)
        .join(format!("{session_id}.jsonl"))
}

/// Writer half of a session's checkpoint log.
#[derive(Debug)]
pub struct CheckpointLog {
    path: PathBuf,
    session_id: String,
    file: File,
    last_index: Option<u8>,
}

impl CheckpointLog {
    /// Open (creating if needed) the log of `session_id` for appending.
    ///
    /// A torn final line from an earlier crash is cut off first so the next
    /// append starts on a line boundary.
    pub fn open(state_dir: &Path, session_id: &str) -> Result<Self, CheckpointError> {
        let path = log_path(state_dir, session_id);
        let io_err = |source| CheckpointError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let existing = if path.exists() {
            let loaded = read_entries(&path)?;
            if let Some(good_len) = loaded.torn_tail_at {
                tracing::warn!(
                    event = "checkpoint_torn_tail",
                    path = %path.display(),
                    "discarding truncated final checkpoint line"
                );
                let file = OpenOptions::new().write(true).open(&path).map_err(io_err)?;
                file.set_len(good_len).map_err(io_err)?;
                file.sync_all().map_err(io_err)?;
            }
            loaded.entries
        } else {
            Vec::new()
        };

        if let Some(foreign) = existing.iter().find(|c| c.session_id != session_id) {
            return Err(CheckpointError::SessionMismatch {
                expected: session_id.to_string(),
                found: foreign.session_id.clone(),
            });
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        Ok(Self {
            last_index: existing.iter().map(|c| c.phase_index).max(),
            path,
            session_id: session_id.to_string(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(
        &mut self,
        session_id: &str,
        phase_index: u8,
        phase: &str,
        status: CheckpointStatus,
    ) -> Result<Checkpoint, CheckpointError> {
        self.record_with(session_id, phase_index, phase, status, CheckpointDetail::default())
    }

    /// Append one checkpoint and flush it to disk before returning.
    pub fn record_with(
        &mut self,
        session_id: &str,
        phase_index: u8,
        phase: &str,
        status: CheckpointStatus,
        detail: CheckpointDetail,
    ) -> Result<Checkpoint, CheckpointError> {
        if session_id != self.session_id {
            return Err(CheckpointError::SessionMismatch {
                expected: self.session_id.clone(),
                found: session_id.to_string(),
            });
        }
        if let Some(last) = self.last_index {
            if phase_index < last {
                return Err(CheckpointError::NonMonotonic {
                    session_id: session_id.to_string(),
                    last,
                    attempted: phase_index,
                });
            }
        }

        let checkpoint = Checkpoint {
            session_id: session_id.to_string(),
            phase_index,
            phase: phase.to_string(),
            status,
            timestamp: OffsetDateTime::now_utc(),
            artifacts: detail.artifacts,
            note: detail.note,
            duration_secs: detail.duration_secs,
            retries: detail.retries,
        };
        let mut line = serde_json::to_vec(&checkpoint).map_err(|e| CheckpointError::Io {
            path: self.path.clone(),
            source: io::Error::other(e),
        })?;
        line.push(b'\n');

        let io_err = |source| CheckpointError::Io {
            path: self.path.clone(),
            source,
        };
        self.file.write_all(&line).map_err(io_err)?;
        self.file.sync_data().map_err(io_err)?;
        self.last_index = Some(phase_index);

        tracing::debug!(
            session = %session_id,
            phase_index,
            phase,
            status = ?status,
            "checkpoint recorded"
        );
        Ok(checkpoint)
    }
}

struct LoadedEntries {
    entries: Vec<Checkpoint>,
    /// Byte length of the valid prefix when the last line is torn.
    torn_tail_at: Option<u64>,
}

fn read_entries(path: &Path) -> Result<LoadedEntries, CheckpointError> {
    let bytes = fs::read(path).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut entries = Vec::new();
    let mut offset = 0usize;
    let mut line_no = 0usize;
    while offset < bytes.len() {
        line_no += 1;
        let rest = &bytes[offset..];
        let (line, terminated, next) = match rest.iter().position(|b| *b == b'\n') {
            Some(end) => (&rest[..end], true, offset + end + 1),
            None => (rest, false, bytes.len()),
        };

        if line.iter().all(u8::is_ascii_whitespace) {
            offset = next;
            continue;
        }
        // An unterminated line was never fully written, even if it parses.
        if !terminated {
            return Ok(LoadedEntries {
                entries,
                torn_tail_at: Some(offset as u64),
            });
        }
        match serde_json::from_slice::<Checkpoint>(line) {
            Ok(checkpoint) => entries.push(checkpoint),
            Err(e) => {
                return Err(CheckpointError::Corrupt {
                    path: path.to_path_buf(),
                    line: line_no,
                    reason: e.to_string(),
                })
            }
        }
        offset = next;
    }
    Ok(LoadedEntries {
        entries,
        torn_tail_at: None,
    })
}

/// Every intact checkpoint of a log, in append order.
pub fn load(path: &Path) -> Result<Vec<Checkpoint>, CheckpointError> {
    Ok(read_entries(path)?.entries)
}

/// Phase a session resumes at, given `total_phases` 1-based phases.
pub fn load_resume_point(
    state_dir: &Path,
    session_id: &str,
    total_phases: u8,
) -> Result<ResumePoint, CheckpointError> {
    let path = log_path(state_dir, session_id);
    if !path.exists() {
        return Err(CheckpointError::UnknownSession(session_id.to_string()));
    }
    Ok(resume_point(&load(&path)?, total_phases))
}

pub fn resume_point(entries: &[Checkpoint], total_phases: u8) -> ResumePoint {
    let completed: BTreeSet<u8> = entries
        .iter()
        .filter(|c| c.status == CheckpointStatus::Completed)
        .map(|c| c.phase_index)
        .collect();
    (1..=total_phases)
        .find(|index| !completed.contains(index))
        .map(ResumePoint::Phase)
        .unwrap_or(ResumePoint::Finished)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn complete(log: &mut CheckpointLog, index: u8) {
        log.record("s1", index, "phase", CheckpointStatus::Started)
            .unwrap();
        log.record("s1", index, "phase", CheckpointStatus::Completed)
            .unwrap();
    }

    #[test]
    fn test_resume_point_is_first_incomplete_phase() {
        let temp = TempDir::new().unwrap();
        let mut log = CheckpointLog::open(temp.path(), "s1").unwrap();
        for index in 1..=5 {
            complete(&mut log, index);
        }
        log.record("s1", 6, "phase", CheckpointStatus::Started)
            .unwrap();

        assert_eq!(
            load_resume_point(temp.path(), "s1", 8).unwrap(),
            ResumePoint::Phase(6)
        );
    }

    #[test]
    fn test_failed_phase_is_resumed_and_finished_sessions_report_it() {
        let temp = TempDir::new().unwrap();
        let mut log = CheckpointLog::open(temp.path(), "s1").unwrap();
        complete(&mut log, 1);
        log.record("s1", 2, "phase", CheckpointStatus::Failed).unwrap();
        assert_eq!(
            load_resume_point(temp.path(), "s1", 2).unwrap(),
            ResumePoint::Phase(2)
        );

        complete(&mut log, 2);
        assert_eq!(
            load_resume_point(temp.path(), "s1", 2).unwrap(),
            ResumePoint::Finished
        );
    }

    #[test]
    fn test_rejects_lower_phase_index() {
        let temp = TempDir::new().unwrap();
        let mut log = CheckpointLog::open(temp.path(), "s1").unwrap();
        complete(&mut log, 3);
        let err = log
            .record("s1", 2, "phase", CheckpointStatus::Started)
            .unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::NonMonotonic {
                last: 3,
                attempted: 2,
                ..
            }
        ));

        drop(log);
        let mut reopened = CheckpointLog::open(temp.path(), "s1").unwrap();
        assert!(reopened
            .record("s1", 1, "phase", CheckpointStatus::Started)
            .is_err());
    }

    #[test]
    fn test_torn_tail_is_ignored_and_repaired() {
        let temp = TempDir::new().unwrap();
        let mut log = CheckpointLog::open(temp.path(), "s1").unwrap();
        complete(&mut log, 1);
        let path = log.path().to_path_buf();
        drop(log);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"session_id":"s1","phase_ind"#).unwrap();
        drop(file);

        assert_eq!(load(&path).unwrap().len(), 2);
        let mut log = CheckpointLog::open(temp.path(), "s1").unwrap();
        log.record("s1", 2, "phase", CheckpointStatus::Started)
            .unwrap();
        let entries = load(&path).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].phase_index, 2);
    }

    #[test]
    fn test_corrupt_middle_line_is_an_error() {
        let temp = TempDir::new().unwrap();
        let mut log = CheckpointLog::open(temp.path(), "s1").unwrap();
        complete(&mut log, 1);
        let path = log.path().to_path_buf();
        drop(log);

        let mut text = fs::read_to_string(&path).unwrap();
        text.insert_str(0, "not json\n");
        fs::write(&path, text).unwrap();
        assert!(matches!(
            load(&path),
            Err(CheckpointError::Corrupt { line: 1, .. })
        ));
    }

    #[test]
    fn test_artifacts_and_notes_round_trip() {
        let temp = TempDir::new().unwrap();
        let mut log = CheckpointLog::open(temp.path(), "s1").unwrap();
        let mut artifacts = BTreeMap::new();
        artifacts.insert("forge-minimal.iso".to_string(), "ab".repeat(32));
        log.record_with(
            "s1",
            8,
            "assemble-image",
            CheckpointStatus::Completed,
            CheckpointDetail {
                artifacts: artifacts.clone(),
                note: Some("done".to_string()),
                duration_secs: Some(412),
                retries: 2,
            },
        )
        .unwrap();

        let entries = load(log.path()).unwrap();
        assert_eq!(entries[0].artifacts, artifacts);
        assert_eq!(entries[0].note.as_deref(), Some("done"));
        assert_eq!(entries[0].duration_secs, Some(412));
        assert_eq!(entries[0].retries, 2);
    }

    #[test]
    fn test_entries_without_timing_still_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("old.jsonl");
        fs::write(
            &path,
            concat!(
                r#"{"session_id":"s1","phase_index":1,"phase":"stage-base-filesystem","#,
                r#""status":"completed","timestamp":"2026-01-05T10:00:00Z"}"#,
                "\n"
            ),
        )
        .unwrap();

        let entries = load(&path).unwrap();
        assert_eq!(entries[0].duration_secs, None);
        assert_eq!(entries[0].retries, 0);
    }

    #[test]
    fn test_unknown_session() {
        let temp = TempDir::new().unwrap();
        assert!(matches!(
            load_resume_point(temp.path(), "nope", 8),
            Err(CheckpointError::UnknownSession(_))
        ));
    }
}

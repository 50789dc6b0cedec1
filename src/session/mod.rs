//! Build sessions and their on-disk state.
//!
//! ```text
//! <state_dir>/
//!   checkpoints/<id>.jsonl          append-only checkpoint log
//!   sessions/<id>/session.json      manifest of a live or failed session
//!   sessions/<id>/outcomes/*.json   per-tier installation outcomes
//!   archive/<id>/                   completed sessions, checkpoint log included
//! ```

mod id;

use std::cmp::Reverse;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::checkpoint::{self, CHECKPOINTS_DIR};
use crate::config::Variant;
use crate::fsutil::write_json_atomic;
use crate::installer::InstallationOutcome;
use crate::stager::RootLock;

pub use id::{generate_session_id, validate_session_id};

const SESSIONS_DIR: &str = "sessions";
const ARCHIVE_DIR: &str = "archive";
const OUTCOMES_DIR: &str = "outcomes";
const SESSION_MANIFEST: &str = "session.json";
const ARCHIVED_LOG: &str = "checkpoints.jsonl";

pub const INTERRUPTED: &str = "interrupted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Paused,
    Failed,
    Completed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Failed | SessionStatus::Completed)
    }
}

/// One invocation's unit of work. Only the orchestrator mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSession {
    pub id: String,
    pub root: PathBuf,
    pub variant: Variant,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    /// 1-based index of the phase being worked on.
    pub current_phase: u8,
    pub status: SessionStatus,
    #[serde(default)]
    pub skipped_packages: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BuildSession {
    pub fn new(id: String, root: PathBuf, variant: Variant) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id,
            root,
            variant,
            started_at: now,
            updated_at: now,
            current_phase: 1,
            status: SessionStatus::Running,
            skipped_packages: 0,
            pause_reason: None,
            image: None,
            error: None,
        }
    }

    pub fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
        self.updated_at = OffsetDateTime::now_utc();
        if status != SessionStatus::Paused {
            self.pause_reason = None;
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session: BuildSession,
    pub archived: bool,
    pub checkpoint_log: PathBuf,
}

/// File-backed session storage under a state directory.
#[derive(Debug, Clone)]
pub struct SessionStore {
    state_dir: PathBuf,
}

impl SessionStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn session_dir(&self, id: &str) -> PathBuf {
        self.state_dir.join(SESSIONS_DIR).join(id)
    }

    pub fn archive_dir(&self, id: &str) -> PathBuf {
        self.state_dir.join(ARCHIVE_DIR).join(id)
    }

    pub fn save(&self, session: &BuildSession) -> Result<()> {
        validate_session_id(&session.id)?;
        let path = self.session_dir(&session.id).join(SESSION_MANIFEST);
        write_json_atomic(&path, session)
            .with_context(|| format!("writing session manifest '{}'", path.display()))
    }

    /// Load a resumable session.
    pub fn load(&self, id: &str) -> Result<BuildSession> {
        validate_session_id(id)?;
        let path = self.session_dir(id).join(SESSION_MANIFEST);
        if !path.is_file() {
            if self.archive_dir(id).join(SESSION_MANIFEST).is_file() {
                bail!("session '{id}' already completed and was archived");
            }
            bail!("unknown session '{id}'");
        }
        let mut session = read_manifest(&path)?;
        mark_if_abandoned(&mut session);
        Ok(session)
    }

    pub fn save_outcome(&self, id: &str, outcome: &InstallationOutcome) -> Result<()> {
        let path = self
            .session_dir(id)
            .join(OUTCOMES_DIR)
            .join(format!("{}.json", outcome.tier));
        write_json_atomic(&path, outcome)
            .with_context(|| format!("writing tier outcome '{}'", path.display()))
    }

    /// Outcomes of every tier installed so far, also across resumed runs.
    pub fn load_outcomes(&self, id: &str) -> Result<Vec<InstallationOutcome>> {
        let dir = self.session_dir(id).join(OUTCOMES_DIR);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut paths: Vec<PathBuf> = fs::read_dir(&dir)
            .with_context(|| format!("reading outcomes directory '{}'", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();
        paths
            .iter()
            .map(|path| {
                let bytes = fs::read(path)
                    .with_context(|| format!("reading tier outcome '{}'", path.display()))?;
                serde_json::from_slice(&bytes)
                    .with_context(|| format!("parsing tier outcome '{}'", path.display()))
            })
            .collect()
    }

    /// Move a completed session, with its checkpoint log, into the archive.
    pub fn archive(&self, session: &BuildSession) -> Result<PathBuf> {
        let from = self.session_dir(&session.id);
        let to = self.archive_dir(&session.id);
        if to.exists() {
            fs::remove_dir_all(&to)
                .with_context(|| format!("replacing archived session '{}'", to.display()))?;
        }
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating archive directory '{}'", parent.display()))?;
        }
        fs::rename(&from, &to).with_context(|| {
            format!("archiving session '{}' to '{}'", from.display(), to.display())
        })?;

        let log = checkpoint::log_path(&self.state_dir, &session.id);
        if log.is_file() {
            let archived = to.join(ARCHIVED_LOG);
            fs::rename(&log, &archived).with_context(|| {
                format!("archiving checkpoint log '{}'", log.display())
            })?;
        }
        Ok(to)
    }

    /// Every known session, newest first.
    pub fn list(&self) -> Result<Vec<SessionSummary>> {
        let mut all = Vec::new();
        for (dir_name, archived) in [(SESSIONS_DIR, false), (ARCHIVE_DIR, true)] {
            let dir = self.state_dir.join(dir_name);
            if !dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&dir)
                .with_context(|| format!("reading sessions directory '{}'", dir.display()))?
            {
                let entry = entry
                    .with_context(|| format!("iterating sessions directory '{}'", dir.display()))?;
                let session_dir = entry.path();
                let Some(name) = session_dir.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if name.starts_with('.') {
                    continue;
                }
                let manifest = session_dir.join(SESSION_MANIFEST);
                if !manifest.is_file() {
                    continue;
                }
                let mut session = read_manifest(&manifest)?;
                if !archived {
                    mark_if_abandoned(&mut session);
                }
                let checkpoint_log = if archived {
                    session_dir.join(ARCHIVED_LOG)
                } else {
                    self.state_dir
                        .join(CHECKPOINTS_DIR)
                        .join(format!("{}.jsonl", session.id))
                };
                all.push(SessionSummary {
                    session,
                    archived,
                    checkpoint_log,
                });
            }
        }
        all.sort_by_key(|s| Reverse(s.session.started_at));
        Ok(all)
    }

    /// Delete all but the newest `keep` archived sessions. Returns the removed ids.
    pub fn prune(&self, keep: usize) -> Result<Vec<String>> {
        let archived: Vec<SessionSummary> =
            self.list()?.into_iter().filter(|s| s.archived).collect();
        let mut removed = Vec::new();
        for summary in archived.into_iter().skip(keep) {
            let path = self.archive_dir(&summary.session.id);
            fs::remove_dir_all(&path).with_context(|| {
                format!("removing expired session directory '{}'", path.display())
            })?;
            removed.push(summary.session.id);
        }
        Ok(removed)
    }
}

/// A running or paused manifest whose root lock has no live holder belongs
/// to a process that died mid-build. Reported as failed; the file is left
/// for the next save.
fn mark_if_abandoned(session: &mut BuildSession) {
    if session.status.is_terminal() {
        return;
    }
    if RootLock::holder(&session.root).as_deref() == Some(session.id.as_str()) {
        return;
    }
    tracing::debug!(
        session = %session.id,
        status = ?session.status,
        "no live lock holder; reporting session as interrupted"
    );
    session.status = SessionStatus::Failed;
    session.pause_reason = None;
    session.error.get_or_insert_with(|| INTERRUPTED.to_string());
}

fn read_manifest(path: &Path) -> Result<BuildSession> {
    let bytes =
        fs::read(path).with_context(|| format!("reading session manifest '{}'", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing session manifest '{}'", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointLog, CheckpointStatus};
    use tempfile::TempDir;

    fn session(id: &str, offset_secs: i64) -> BuildSession {
        let mut s = BuildSession::new(id.to_string(), PathBuf::from("/r"), Variant::Minimal);
        s.started_at += time::Duration::seconds(offset_secs);
        s
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let store = SessionStore::new(temp.path());
        let mut s = session("abc", 0);
        s.root = temp.path().join("rootfs");
        store.save(&s).unwrap();
        let _lock = RootLock::acquire(&s.root, "abc").unwrap();

        let loaded = store.load("abc").unwrap();
        assert_eq!(loaded, s);
        assert!(store.load("missing").is_err());
    }

    #[test]
    fn test_running_session_without_lock_holder_reads_as_interrupted() {
        let temp = TempDir::new().unwrap();
        let store = SessionStore::new(temp.path());
        let root = temp.path().join("rootfs");
        let mut running = session("cut", 0);
        running.root = root.clone();
        running.current_phase = 4;
        store.save(&running).unwrap();
        let mut paused = session("held", 10);
        paused.root = root.clone();
        paused.set_status(SessionStatus::Paused);
        paused.pause_reason = Some("memory use 97%".to_string());
        store.save(&paused).unwrap();

        let loaded = store.load("cut").unwrap();
        assert_eq!(loaded.status, SessionStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some(INTERRUPTED));
        assert_eq!(loaded.current_phase, 4);
        let on_disk = read_manifest(&store.session_dir("cut").join(SESSION_MANIFEST)).unwrap();
        assert_eq!(on_disk.status, SessionStatus::Running);

        // A live lock on the shared root only vouches for its own session.
        let _lock = RootLock::acquire(&root, "held").unwrap();
        let listed = store.list().unwrap();
        let status = |id: &str| {
            listed
                .iter()
                .find(|s| s.session.id == id)
                .map(|s| s.session.status)
                .unwrap()
        };
        assert_eq!(status("held"), SessionStatus::Paused);
        assert_eq!(status("cut"), SessionStatus::Failed);
    }

    #[test]
    fn test_archive_moves_manifest_and_log() {
        let temp = TempDir::new().unwrap();
        let store = SessionStore::new(temp.path());
        let mut s = session("abc", 0);
        store.save(&s).unwrap();
        let mut log = CheckpointLog::open(temp.path(), "abc").unwrap();
        log.record("abc", 1, "stage-base-filesystem", CheckpointStatus::Completed)
            .unwrap();
        drop(log);

        s.set_status(SessionStatus::Completed);
        store.save(&s).unwrap();
        let archived = store.archive(&s).unwrap();

        assert!(archived.join("session.json").is_file());
        assert!(archived.join("checkpoints.jsonl").is_file());
        assert!(!checkpoint::log_path(temp.path(), "abc").exists());
        let err = store.load("abc").unwrap_err();
        assert!(err.to_string().contains("archived"));
    }

    #[test]
    fn test_outcomes_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = SessionStore::new(temp.path());
        let outcome = InstallationOutcome {
            tier: "core".to_string(),
            attempted: 2,
            succeeded: vec!["a".to_string(), "b".to_string()],
            ..InstallationOutcome::default()
        };
        store.save_outcome("abc", &outcome).unwrap();
        assert_eq!(store.load_outcomes("abc").unwrap(), vec![outcome]);
        assert!(store.load_outcomes("other").unwrap().is_empty());
    }

    #[test]
    fn test_list_and_prune_keep_newest_archived() {
        let temp = TempDir::new().unwrap();
        let store = SessionStore::new(temp.path());
        for (i, id) in ["old", "mid", "new"].iter().enumerate() {
            let mut s = session(id, i as i64 * 60);
            s.set_status(SessionStatus::Completed);
            store.save(&s).unwrap();
            store.archive(&s).unwrap();
        }
        store.save(&session("live", 500)).unwrap();

        let listed: Vec<String> = store
            .list()
            .unwrap()
            .into_iter()
            .map(|s| s.session.id)
            .collect();
        assert_eq!(listed, vec!["live", "new", "mid", "old"]);

        let removed = store.prune(1).unwrap();
        assert_eq!(removed, vec!["mid", "old"]);
        assert!(store.session_dir("live").exists());
        assert!(store.archive_dir("new").exists());
    }
}

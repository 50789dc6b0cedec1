use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use super::StageError;

/// Exclusive ownership of a staged root, held for a whole session.
///
/// The lock file sits next to the root (`<root>.lock`) so it never ends up in
/// the image. The flock is released when the process exits, however it exits.
#[derive(Debug)]
pub struct RootLock {
    _file: File,
    path: PathBuf,
    session_id: String,
}

impl RootLock {
    pub fn path_for(root: &Path) -> PathBuf {
        let mut name = root
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "root".into());
        name.push(".lock");
        root.with_file_name(name)
    }

    pub fn acquire(root: &Path, session_id: &str) -> Result<Self, StageError> {
        let path = Self::path_for(root);
        let io_err = |source| StageError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err)?;

        if file.try_lock_exclusive().is_err() {
            let mut holder = String::new();
            let _ = file.read_to_string(&mut holder);
            return Err(StageError::RootLocked {
                root: root.to_path_buf(),
                holder: holder.trim().to_string(),
            });
        }

        file.set_len(0).map_err(io_err)?;
        file.seek(SeekFrom::Start(0)).map_err(io_err)?;
        writeln!(file, "{} {}", session_id, std::process::id()).map_err(io_err)?;
        file.sync_data().map_err(io_err)?;

        Ok(Self {
            _file: file,
            path,
            session_id: session_id.to_string(),
        })
    }

    /// Session id of the live process holding the lock on `root`, if any.
    pub fn holder(root: &Path) -> Option<String> {
        let mut file = File::open(Self::path_for(root)).ok()?;
        if file.try_lock_shared().is_ok() {
            let _ = FileExt::unlock(&file);
            return None;
        }
        let mut contents = String::new();
        file.read_to_string(&mut contents).ok()?;
        contents.split_whitespace().next().map(str::to_string)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_path_is_sibling() {
        assert_eq!(
            RootLock::path_for(Path::new("/srv/build/rootfs")),
            PathBuf::from("/srv/build/rootfs.lock")
        );
    }

    #[test]
    fn test_second_session_is_refused() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("rootfs");
        let first = RootLock::acquire(&root, "s1").unwrap();

        match RootLock::acquire(&root, "s2") {
            Err(StageError::RootLocked { holder, .. }) => assert!(holder.starts_with("s1 ")),
            other => panic!("expected RootLocked, got {other:?}"),
        }

        drop(first);
        let second = RootLock::acquire(&root, "s2").unwrap();
        assert_eq!(second.session_id(), "s2");
    }

    #[test]
    fn test_holder_reports_only_live_locks() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("rootfs");
        assert_eq!(RootLock::holder(&root), None);

        let lock = RootLock::acquire(&root, "s1").unwrap();
        assert_eq!(RootLock::holder(&root).as_deref(), Some("s1"));
        assert_eq!(RootLock::holder(&root).as_deref(), Some("s1"));

        drop(lock);
        assert!(RootLock::path_for(&root).exists());
        assert_eq!(RootLock::holder(&root), None);
        RootLock::acquire(&root, "s2").unwrap();
    }
}

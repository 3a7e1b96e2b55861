//! Lazily-opened, append-only, mutex-guarded file writers for one operation directory.
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::Error;

/// A single artifact file, opened on first write and held open until [`LazyFile::close`].
pub struct LazyFile {
    path: PathBuf,
    handle: Mutex<Option<File>>,
}

impl LazyFile {
    /// Creates a writer for `name` under `dir`, without opening it yet.
    pub fn new(dir: &Path, name: &str) -> Self {
        LazyFile {
            path: dir.join(name),
            handle: Mutex::new(None),
        }
    }

    /// Appends `content` (expected to already be LF-terminated or a full structured block) to
    /// the file, opening it lazily on first use.
    pub fn append(&self, content: &str) -> Result<(), Error> {
        let mut guard = self.handle.lock().expect("log file lock poisoned");
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            *guard = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)?,
            );
        }
        // `is_none()` check above guarantees this unwrap always succeeds.
        #[allow(clippy::unwrap_used)]
        guard.as_mut().unwrap().write_all(content.as_bytes())?;
        Ok(())
    }

    /// Whether this file has been opened (i.e. at least one entry was appended).
    pub fn was_opened(&self) -> bool {
        self.handle.lock().expect("log file lock poisoned").is_some()
    }

    /// Flushes and releases the underlying file handle, if open.
    pub fn close(&self) -> Result<(), Error> {
        let mut guard = self.handle.lock().expect("log file lock poisoned");
        if let Some(mut f) = guard.take() {
            f.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_and_creates_parent_directories() {
        let dir = std::env::temp_dir().join(format!("cqlstream-logfile-{}", uuid::Uuid::new_v4()));
        let file = LazyFile::new(&dir, "connector.bad");
        file.append("line one\n").unwrap();
        file.append("line two\n").unwrap();
        file.close().unwrap();

        let contents = std::fs::read_to_string(dir.join("connector.bad")).unwrap();
        assert_eq!(contents, "line one\nline two\n");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn unopened_file_reports_not_opened() {
        let dir = std::env::temp_dir().join(format!("cqlstream-logfile-{}", uuid::Uuid::new_v4()));
        let file = LazyFile::new(&dir, "load.bad");
        assert!(!file.was_opened());
    }
}

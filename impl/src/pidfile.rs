//! Pidfile registry recording the master process id.
use std::fs;
use std::path::{Path, PathBuf};

use crate::Result;

/// Snapshot of the recorded master pid.
///
/// `pid: None` means "never started or pidfile unreadable", not
/// "confirmed stopped". Each command invocation captures one snapshot;
/// the file is not re-read automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessRecord {
    /// Recorded process id, if any.
    pub pid: Option<u32>,
}

/// Plain-text pidfile storage.
///
/// The file holds the decimal pid of the current master generation, or
/// an empty string to denote "no owner". Writes overwrite the file
/// wholesale; there is no locking or atomic rename, commands are
/// expected to be invoked serially by an operator or service manager.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Create a registry handle for the given path.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the recorded pid.
    ///
    /// A missing, unreadable or non-numeric file yields an absent pid
    /// rather than an error.
    pub fn load(&self) -> ProcessRecord {
        let pid = fs::read_to_string(&self.path)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok());
        ProcessRecord { pid }
    }

    /// Overwrite the file with the given pid.
    ///
    /// Writing `None` stores the empty string, marking "no owner yet".
    pub fn write(&self, pid: Option<u32>) -> Result<()> {
        let content = pid.map(|p| p.to_string()).unwrap_or_default();
        fs::write(&self.path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(dir: &tempfile::TempDir) -> PidFile {
        PidFile::new(dir.path().join("test.pid"))
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = registry(&dir);
        pidfile.write(Some(4321)).unwrap();
        assert_eq!(pidfile.load(), ProcessRecord { pid: Some(4321) });
    }

    #[test]
    fn empty_means_no_owner() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = registry(&dir);
        pidfile.write(None).unwrap();
        assert_eq!(pidfile.load().pid, None);
    }

    #[test]
    fn missing_file_yields_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(registry(&dir).load().pid, None);
    }

    #[test]
    fn garbage_yields_absent() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = registry(&dir);
        fs::write(pidfile.path(), "not-a-pid\n").unwrap();
        assert_eq!(pidfile.load().pid, None);
    }

    #[test]
    fn whitespace_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = registry(&dir);
        fs::write(pidfile.path(), " 99\n").unwrap();
        assert_eq!(pidfile.load().pid, Some(99));
    }

    #[test]
    fn write_overwrites_wholesale() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = registry(&dir);
        pidfile.write(Some(1000)).unwrap();
        pidfile.write(Some(7)).unwrap();
        assert_eq!(pidfile.load().pid, Some(7));
    }
}

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::process;

/// An exclusively locked pidfile. The lock outlives daemonization (it sits
/// on the open file description) and the file is removed on drop.
pub struct Pidfile {
    file: File,
    path: PathBuf,
}

impl Pidfile {
    /// Opens and locks the pidfile. A lock held elsewhere means another
    /// instance is already running, reported as `WouldBlock`.
    pub fn claim(path: PathBuf) -> io::Result<Pidfile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o600)
            .open(&path)?;

        file.try_lock_exclusive()?;

        Ok(Pidfile { file, path })
    }

    /// Records the pid. Called only after daemonization has settled on the
    /// final process.
    pub fn write_pid(&mut self) -> io::Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        writeln!(self.file, "{}", process::id())
    }
}

impl Drop for Pidfile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_claim_write_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("corespoold.pid");

        let mut pidfile = Pidfile::claim(path.clone()).unwrap();
        pidfile.write_pid().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim().parse::<u32>().unwrap(), process::id());

        drop(pidfile);
        assert!(!path.exists());
    }

    #[test]
    fn test_second_claim_is_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("corespoold.pid");

        let _held = Pidfile::claim(path.clone()).unwrap();

        let refused = Pidfile::claim(path);
        assert!(refused.is_err());
    }
}

//! Process-wide lock for shared archive/fstat directories.
//!
//! The server variant of o4 lets many processes populate the same `.o4`
//! cache; a lock file serializes the expensive populate step. The file body
//! holds the epoch second at which the lock was taken — a holder that is
//! older than the stale timeout is presumed dead and its lock is reclaimed.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fd_lock::RwLock;
use tracing::warn;

const LOCK_FILE: &str = "packagelock";
const STALE_AFTER: Duration = Duration::from_secs(90 * 60);

pub struct PackageLock {
    lock: RwLock<File>,
    path: PathBuf,
}

impl PackageLock {
    /// Open (creating if needed) the lock file under `o4_dir`.
    pub fn new(o4_dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(o4_dir)?;
        let path = o4_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(Self {
            lock: RwLock::new(file),
            path,
        })
    }

    /// Try to take the package lock.
    ///
    /// Returns `true` when this process now holds it — either it was free,
    /// or the previous holder went stale. `false` means another live holder
    /// has it.
    pub fn acquire(&mut self) -> io::Result<bool> {
        let now = epoch_seconds();
        let mut guard = self.lock.write()?;
        let mut body = String::new();
        guard.read_to_string(&mut body)?;
        let held_since: Option<u64> = body.trim().parse().ok();
        match held_since {
            None => {
                write_epoch(&mut guard, now)?;
                Ok(true)
            }
            Some(since) if now.saturating_sub(since) > STALE_AFTER.as_secs() => {
                warn!(lock = %self.path.display(), "reclaiming stale package lock");
                write_epoch(&mut guard, now)?;
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    /// Give the lock up: empty the body so the next taker sees it free.
    pub fn release(&mut self) -> io::Result<()> {
        let guard = self.lock.write()?;
        guard.set_len(0)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn write_epoch(file: &mut File, now: u64) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    write!(file, "{now}")?;
    file.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquire_release_cycle() {
        let dir = TempDir::new().unwrap();
        let mut lock = PackageLock::new(dir.path()).unwrap();
        assert!(lock.acquire().unwrap());
        // Same epoch body: a second taker is refused.
        let mut other = PackageLock::new(dir.path()).unwrap();
        drop(lock);
        assert!(!other.acquire().unwrap());
        other.release().unwrap();
        assert!(other.acquire().unwrap());
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOCK_FILE);
        std::fs::write(&path, "10").unwrap();
        let mut lock = PackageLock::new(dir.path()).unwrap();
        assert!(lock.acquire().unwrap());
    }
}

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_utils::Backoff;
use filetime::FileTime;
use tracing::{debug, warn};

use crate::error::{CacheError, CacheResult};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(0);

/// Exclusive lock on one storage key, held as a sibling `.lock` file.
///
/// The file holds a token unique to this guard. The guard removes the file
/// when it drops, but only while the token is still its own. A lock file
/// not touched for `stale_after` belongs to a writer that died without
/// dropping its guard and is broken by the next writer; live writers keep
/// theirs fresh through [`FileLock::refresh`].
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    token: String,
    file: File,
    touch_every: Duration,
    touched: Instant,
}

impl FileLock {
    /// Blocks until the lock at `path` is ours.
    pub fn acquire(path: PathBuf, stale_after: Duration) -> CacheResult<Self> {
        let token = unique_token();
        let backoff = Backoff::new();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(token.as_bytes())
                        .and_then(|()| file.sync_all())
                        .map_err(|err| CacheError::io(&path, err))?;
                    debug!(lock = %path.display(), "lock acquired");
                    return Ok(Self {
                        path,
                        token,
                        file,
                        touch_every: stale_after / 4,
                        touched: Instant::now(),
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if is_stale(&path, stale_after) {
                        match break_stale(&path, stale_after) {
                            Ok(true) => continue,
                            Ok(false) => {}
                            Err(err) => return Err(CacheError::io(path, err)),
                        }
                    }
                    if backoff.is_completed() {
                        thread::sleep(POLL_INTERVAL);
                    } else {
                        backoff.snooze();
                    }
                }
                Err(err) => return Err(CacheError::io(path, err)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bumps the lock file's modification time so waiters do not take a
    /// slow writer for a dead one. Cheap to call on every write.
    pub fn refresh(&mut self) {
        if self.touched.elapsed() < self.touch_every {
            return;
        }
        self.touched = Instant::now();
        // Through the handle: a lock broken meanwhile is no longer at `path`.
        if let Err(err) = filetime::set_file_handle_times(&self.file, None, Some(FileTime::now())) {
            warn!(lock = %self.path.display(), error = %err, "failed to refresh lock");
        }
    }

    fn is_held(&self) -> bool {
        fs::read_to_string(&self.path).is_ok_and(|content| content == self.token)
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if !self.is_held() {
            warn!(lock = %self.path.display(), "lock was broken while held; leaving the current one");
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(lock = %self.path.display(), "lock released"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(lock = %self.path.display(), error = %err, "failed to remove lock"),
        }
    }
}

fn unique_token() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_nanos());
    format!(
        "{}-{nanos}-{}",
        std::process::id(),
        NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)
    )
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > stale_after)
}

/// Moves the lock at `path` aside and deletes it if it is still stale.
/// Another waiter may have replaced it with a live lock since it was
/// judged stale; such a lock is put back. Returns whether a lock was broken.
fn break_stale(path: &Path, stale_after: Duration) -> io::Result<bool> {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let aside = path.with_file_name(format!(".{name}.{}.stale", unique_token()));
    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    }

    if is_stale(&aside, stale_after) {
        warn!(lock = %path.display(), "breaking stale lock");
        fs::remove_file(&aside)?;
        return Ok(true);
    }

    // `hard_link` never replaces a lock claimed in the meantime.
    match fs::hard_link(&aside, path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            warn!(lock = %path.display(), "live lock could not be restored; key claimed meanwhile");
        }
        Err(err) => {
            let _ = fs::remove_file(&aside);
            return Err(err);
        }
    }
    fs::remove_file(&aside)?;
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn age(path: &Path) -> CacheResult<()> {
        filetime::set_file_mtime(path, FileTime::from_unix_time(0, 0))
            .map_err(|err| CacheError::io(path, err))
    }

    fn lock_dir() -> CacheResult<tempfile::TempDir> {
        tempfile::tempdir().map_err(|err| CacheError::io("tempdir", err))
    }

    #[test]
    fn stale_lock_is_broken_and_fresh_lock_released_on_drop() -> CacheResult<()> {
        let dir = lock_dir()?;
        let path = dir.path().join("key.lock");
        fs::write(&path, "12345").map_err(|err| CacheError::io(&path, err))?;
        age(&path)?;

        let lock = FileLock::acquire(path.clone(), Duration::from_secs(60))?;
        assert!(path.exists());
        drop(lock);
        assert!(!path.exists());
        assert_eq!(fs::read_dir(dir.path()).map_err(|err| CacheError::io("dir", err))?.count(), 0);
        Ok(())
    }

    #[test]
    fn a_live_lock_survives_a_late_breaker() -> CacheResult<()> {
        let dir = lock_dir()?;
        let path = dir.path().join("key.lock");
        let lock = FileLock::acquire(path.clone(), Duration::from_secs(60))?;

        // A second waiter that judged the previous holder stale arrives late.
        assert!(!break_stale(&path, Duration::from_secs(60)).map_err(|err| CacheError::io(&path, err))?);
        assert!(lock.is_held());

        drop(lock);
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn drop_leaves_a_successor_lock_alone() -> CacheResult<()> {
        let dir = lock_dir()?;
        let path = dir.path().join("key.lock");
        let lock = FileLock::acquire(path.clone(), Duration::from_secs(60))?;

        fs::remove_file(&path).map_err(|err| CacheError::io(&path, err))?;
        fs::write(&path, "successor").map_err(|err| CacheError::io(&path, err))?;
        drop(lock);

        assert_eq!(
            fs::read_to_string(&path).map_err(|err| CacheError::io(&path, err))?,
            "successor"
        );
        Ok(())
    }

    #[test]
    fn refreshed_locks_are_not_stale() -> CacheResult<()> {
        let dir = lock_dir()?;
        let path = dir.path().join("key.lock");
        let mut lock = FileLock::acquire(path.clone(), Duration::ZERO)?;

        age(&path)?;
        assert!(is_stale(&path, Duration::from_secs(3600)));
        lock.refresh();
        assert!(!is_stale(&path, Duration::from_secs(3600)));
        Ok(())
    }
}

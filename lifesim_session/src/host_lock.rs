// Single-host advisory lock.
//
// Only one host may run per machine. `HostLock::acquire` opens the lock file
// and takes an exclusive, non-blocking lock on it: `flock` on unix, exclusive
// creation elsewhere. The handle is passed into `start_host` and owned by the
// running host; dropping it (normal stop, error path, or panic unwind)
// removes the file and releases the lock.
//
// The file is removed while the lock is still held. A process that opened
// the old file just before the removal can still lock it afterwards, so on
// unix a freshly taken lock is only kept if the path still names the locked
// file; otherwise acquisition starts over on whatever is at the path now.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::SessionError;

#[derive(Debug)]
pub struct HostLock {
    path: PathBuf,
    file: File,
}

impl HostLock {
    pub fn acquire(path: impl AsRef<Path>) -> Result<HostLock, SessionError> {
        let path = path.as_ref().to_owned();
        let file = open_locked(&path)?;
        debug!(path = %path.display(), "host lock acquired");
        Ok(HostLock { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the host's listening address into the lock file so other
    /// processes can see where the running host is.
    pub fn record(&mut self, addr: SocketAddr) -> Result<(), SessionError> {
        let lock_err = |source: io::Error| SessionError::Lock {
            path: self.path.clone(),
            source,
        };
        self.file.set_len(0).map_err(lock_err)?;
        self.file.seek(SeekFrom::Start(0)).map_err(lock_err)?;
        writeln!(self.file, "{addr}").map_err(lock_err)?;
        self.file.flush().map_err(lock_err)
    }
}

impl Drop for HostLock {
    fn drop(&mut self) {
        // Remove first; the lock itself goes away when `file` is closed.
        // Anyone left holding the unlinked file notices in `still_at_path`.
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "could not remove host lock file");
        }
        debug!(path = %self.path.display(), "host lock released");
    }
}

/// Lock attempts before giving up on a path that keeps being replaced.
#[cfg(unix)]
const LOCK_ATTEMPTS: usize = 8;

#[cfg(unix)]
fn open_locked(path: &Path) -> Result<File, SessionError> {
    use std::os::fd::AsRawFd;

    let lock_err = |source: io::Error| SessionError::Lock {
        path: path.to_owned(),
        source,
    };
    for _ in 0..LOCK_ATTEMPTS {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(lock_err)?;
        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret != 0 {
            let err = io::Error::last_os_error();
            return Err(if err.kind() == io::ErrorKind::WouldBlock {
                SessionError::HostLocked {
                    path: path.to_owned(),
                }
            } else {
                lock_err(err)
            });
        }
        if still_at_path(&file, path).map_err(lock_err)? {
            return Ok(file);
        }
        debug!(path = %path.display(), "lock file replaced while locking, retrying");
    }
    Err(SessionError::HostLocked {
        path: path.to_owned(),
    })
}

/// Whether `path` still names the file behind `file`.
#[cfg(unix)]
fn still_at_path(file: &File, path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(current) => Ok(current.dev() == held.dev() && current.ino() == held.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
fn open_locked(path: &Path) -> Result<File, SessionError> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|source| {
            if source.kind() == io::ErrorKind::AlreadyExists {
                SessionError::HostLocked {
                    path: path.to_owned(),
                }
            } else {
                SessionError::Lock {
                    path: path.to_owned(),
                    source,
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn second_acquire_is_refused_until_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("server.lock");

        let lock = HostLock::acquire(&path).unwrap();
        assert!(path.exists());
        assert!(matches!(
            HostLock::acquire(&path),
            Err(SessionError::HostLocked { .. })
        ));

        drop(lock);
        assert!(!path.exists());
        let again = HostLock::acquire(&path).unwrap();
        assert_eq!(again.path(), path.as_path());
    }

    #[test]
    fn record_writes_the_address() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("server.lock");
        let mut lock = HostLock::acquire(&path).unwrap();
        lock.record("127.0.0.1:5000".parse().unwrap()).unwrap();
        lock.record("127.0.0.1:5001".parse().unwrap()).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "127.0.0.1:5001\n");
    }

    #[cfg(unix)]
    #[test]
    fn unlinked_lock_file_is_told_apart_from_its_replacement() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("server.lock");
        let stale = File::create(&path).unwrap();
        assert!(still_at_path(&stale, &path).unwrap());

        std::fs::remove_file(&path).unwrap();
        assert!(!still_at_path(&stale, &path).unwrap());

        let fresh = File::create(&path).unwrap();
        assert!(!still_at_path(&stale, &path).unwrap());
        assert!(still_at_path(&fresh, &path).unwrap());
    }

    #[test]
    fn missing_directory_is_a_lock_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("no/such/dir/server.lock");
        assert!(matches!(
            HostLock::acquire(&path),
            Err(SessionError::Lock { .. })
        ));
    }
}

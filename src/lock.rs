//! Cross-process lock on an index directory.
//!
//! The controller keeps builds single-flight inside one process. This lock
//! extends that to separate `imgdex` processes (say, a `watch` session and
//! a one-off `index`) that would otherwise write the same artifacts.
//! Uses flock() for advisory locking; released when the guard drops.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Lock file name placed in the index directory
const LOCK_FILE_NAME: &str = "index.lock";

/// A held index lock that releases on drop
pub struct IndexLock {
    #[allow(dead_code)]
    file: File,
}

impl IndexLock {
    /// Take the lock on `index_dir` without waiting.
    /// Fails with `WouldBlock` if another process holds it.
    pub fn try_acquire(index_dir: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(index_dir.join(LOCK_FILE_NAME))?;

        Self::try_lock_exclusive(&file)?;

        Ok(IndexLock { file })
    }

    #[cfg(unix)]
    fn try_lock_exclusive(file: &File) -> io::Result<()> {
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock
                || err.raw_os_error() == Some(libc::EWOULDBLOCK)
                || err.raw_os_error() == Some(libc::EAGAIN)
            {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "index is being built by another imgdex process",
                ));
            }
            return Err(err);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock_exclusive(_file: &File) -> io::Result<()> {
        // no advisory locking here; in-process single-flight still applies
        Ok(())
    }
}

#[cfg(unix)]
impl Drop for IndexLock {
    fn drop(&mut self) {
        let fd = self.file.as_raw_fd();
        // closing the file would release it too; errors are irrelevant here
        unsafe { libc::flock(fd, libc::LOCK_UN) };
    }
}

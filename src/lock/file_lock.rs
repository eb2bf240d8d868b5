//! Advisory file locks for host-wide named locking.
//!
//! Each lock name maps to `<dir>/<name>.lock`. The lock is an OS advisory
//! lock on an open file description, so it excludes other processes and
//! other threads of this process that open the same file.
//!
//! # Safety
//! - Lock is released when `FileLock` is dropped
//! - Lock file is created if it doesn't exist and is never deleted
//! - Blocking acquisition retries on `EINTR`

use std::fs::{self, File, OpenOptions};
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};

use crate::error::{GateResult, LockError};

use super::{LockCoordinator, LockGuard};

/// Exclusive advisory lock on a single file.
///
/// The lock is held for the lifetime of this struct and automatically
/// released when dropped.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Blocks until an exclusive lock on `path` is held.
    ///
    /// # Errors
    /// - `PermissionDenied` if the lock file cannot be opened for writing
    pub fn acquire(path: &Path) -> IoResult<Self> {
        let file = open_lock_file(path)?;
        Self::lock(&file, true)?;
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    /// Attempts to lock `path` without blocking.
    ///
    /// Returns `Ok(None)` when another holder has it.
    pub fn try_acquire(path: &Path) -> IoResult<Option<Self>> {
        let file = open_lock_file(path)?;
        match Self::lock(&file, false) {
            Ok(()) => Ok(Some(Self {
                _file: file,
                path: path.to_path_buf(),
            })),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Returns the path to the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn lock(file: &File, blocking: bool) -> IoResult<()> {
        use std::os::unix::io::AsRawFd;

        let fd = file.as_raw_fd();
        let op = if blocking {
            libc::LOCK_EX
        } else {
            libc::LOCK_EX | libc::LOCK_NB
        };

        loop {
            let result = unsafe { libc::flock(fd, op) };
            if result == 0 {
                return Ok(());
            }

            let errno = IoError::last_os_error();
            match errno.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EWOULDBLOCK) => {
                    return Err(IoError::new(ErrorKind::WouldBlock, "lock is held by another owner"));
                }
                _ => return Err(errno),
            }
        }
    }

    #[cfg(windows)]
    fn lock(file: &File, blocking: bool) -> IoResult<()> {
        use std::os::windows::io::AsRawHandle;
        use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, HANDLE};
        use windows_sys::Win32::Storage::FileSystem::{
            LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
        };

        let handle = file.as_raw_handle() as HANDLE;
        let flags = if blocking {
            LOCKFILE_EXCLUSIVE_LOCK
        } else {
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY
        };
        let result = unsafe {
            let mut overlapped = std::mem::zeroed::<windows_sys::Win32::System::IO::OVERLAPPED>();
            LockFileEx(handle, flags, 0, 1, 0, &mut overlapped)
        };

        if result == 0 {
            let err = IoError::last_os_error();
            if err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
                return Err(IoError::new(ErrorKind::WouldBlock, "lock is held by another owner"));
            }
            return Err(err);
        }

        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn lock(_file: &File, _blocking: bool) -> IoResult<()> {
        Err(IoError::new(
            ErrorKind::Unsupported,
            "file locking not supported on this platform",
        ))
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Closing the file releases the advisory lock.
    }
}

fn open_lock_file(path: &Path) -> IoResult<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

/// Lock coordinator backed by advisory lock files in one directory.
///
/// Every context (thread or process) pointing at the same directory shares
/// the same set of named locks.
#[derive(Debug, Clone)]
pub struct FileLockCoordinator {
    dir: PathBuf,
}

impl FileLockCoordinator {
    /// Creates a coordinator rooted at `dir`, creating the directory if
    /// needed.
    pub fn new(dir: impl Into<PathBuf>) -> GateResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| LockError::Open {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    /// Directory holding the lock files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the lock file backing `name`.
    pub fn lock_path(&self, name: &str) -> GateResult<PathBuf> {
        if name.is_empty() {
            return Err(LockError::InvalidName {
                name: name.to_string(),
                reason: "lock name cannot be empty".to_string(),
            }
            .into());
        }

        let file_name: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
            .collect();
        Ok(self.dir.join(format!("{file_name}.lock")))
    }
}

impl LockCoordinator for FileLockCoordinator {
    fn acquire(&self, name: &str) -> GateResult<LockGuard> {
        let path = self.lock_path(name)?;
        tracing::debug!(lock = %name, path = %path.display(), "waiting for file lock");
        let lock = FileLock::acquire(&path).map_err(|source| LockError::Acquire {
            name: name.to_string(),
            source,
        })?;
        tracing::debug!(lock = %name, "acquired file lock");
        Ok(LockGuard::new(name, lock))
    }

    fn try_acquire(&self, name: &str) -> GateResult<Option<LockGuard>> {
        let path = self.lock_path(name)?;
        let lock = FileLock::try_acquire(&path).map_err(|source| LockError::Acquire {
            name: name.to_string(),
            source,
        })?;
        Ok(lock.map(|lock| LockGuard::new(name, lock)))
    }
}

//! Named, host-wide mutual exclusion.
//!
//! A `LockCoordinator` hands out `LockGuard`s for a lock name. Exactly one
//! guard per name exists at a time across every context that shares the
//! coordinator's backing primitive; the lock is released when the guard is
//! dropped, including during unwinding.
//!
//! ```text
//!   context A ──┐
//!   context B ──┼──► acquire("engine-fs-lock") ──► one holder ──► drop(guard)
//!   context C ──┘
//! ```

#[cfg(feature = "file-lock")]
mod file_lock;
mod process;

#[cfg(feature = "file-lock")]
pub use file_lock::{FileLock, FileLockCoordinator};
pub use process::ProcessLockCoordinator;

use std::any::Any;
use std::fmt;

use crate::error::GateResult;

/// Default lock name shared by the lifecycle manager and the dispatcher.
pub const DEFAULT_LOCK_NAME: &str = "engine-fs-lock";

/// Issues named exclusive locks.
///
/// Waiter ordering is whatever the backing primitive provides.
pub trait LockCoordinator: Send + Sync {
    /// Blocks until the named lock is held.
    fn acquire(&self, name: &str) -> GateResult<LockGuard>;

    /// Takes the named lock only if it is free right now.
    fn try_acquire(&self, name: &str) -> GateResult<Option<LockGuard>>;
}

/// RAII guard for a named lock.
///
/// Holds an implementation-specific release token; dropping the guard drops
/// the token, which releases the lock.
pub struct LockGuard {
    name: String,
    _token: Box<dyn Any + Send>,
}

impl LockGuard {
    /// Wraps a release token. The lock is released when `token` is dropped.
    pub fn new(name: impl Into<String>, token: impl Any + Send) -> Self {
        Self {
            name: name.into(),
            _token: Box::new(token),
        }
    }

    /// The lock name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        tracing::debug!(lock = %self.name, "released named lock");
    }
}

/// Runs `critical_section` while holding the named lock.
///
/// The lock is released whether the section returns `Ok`, `Err`, or
/// panics; its outcome is returned unchanged.
pub fn with_lock<T, F>(coordinator: &dyn LockCoordinator, name: &str, critical_section: F) -> GateResult<T>
where
    F: FnOnce(&LockGuard) -> GateResult<T>,
{
    let guard = coordinator.acquire(name)?;
    critical_section(&guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GateError;

    #[test]
    fn with_lock_releases_after_error() {
        let coordinator = ProcessLockCoordinator::new();

        let result: GateResult<()> = with_lock(&coordinator, "fs", |_| Err(GateError::operation("boom")));
        assert!(result.is_err());

        let guard = coordinator.try_acquire("fs").unwrap();
        assert!(guard.is_some());
    }

    #[test]
    fn with_lock_releases_after_panic() {
        let coordinator = ProcessLockCoordinator::new();

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: GateResult<()> = with_lock(&coordinator, "fs", |_| panic!("critical section blew up"));
        }));
        assert!(outcome.is_err());

        assert!(coordinator.try_acquire("fs").unwrap().is_some());
    }

    #[test]
    fn with_lock_returns_section_value() {
        let coordinator = ProcessLockCoordinator::new();
        let value = with_lock(&coordinator, "fs", |guard| {
            assert_eq!(guard.name(), "fs");
            Ok(42)
        })
        .unwrap();
        assert_eq!(value, 42);
    }
}

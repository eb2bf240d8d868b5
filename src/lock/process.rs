//! In-process named locks.
//!
//! Used when every context lives in one process. Each name owns a
//! `held` flag guarded by a mutex, with a condvar for waiters.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, OnceLock};

use crate::error::{GateResult, LockError};

use super::{LockCoordinator, LockGuard};

#[derive(Debug, Default)]
struct NamedSlot {
    held: Mutex<bool>,
    released: Condvar,
}

/// Release token stored inside the `LockGuard`.
struct SlotRelease {
    slot: Arc<NamedSlot>,
}

impl Drop for SlotRelease {
    fn drop(&mut self) {
        // A poisoned flag still has to be cleared or the name stays held forever.
        let mut held = match self.slot.held.lock() {
            Ok(held) => held,
            Err(poisoned) => poisoned.into_inner(),
        };
        *held = false;
        self.slot.released.notify_one();
    }
}

/// Registry of named locks shared by every holder of the same instance.
#[derive(Debug, Default, Clone)]
pub struct ProcessLockCoordinator {
    slots: Arc<Mutex<HashMap<String, Arc<NamedSlot>>>>,
}

impl ProcessLockCoordinator {
    /// Creates an isolated registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    ///
    /// Gates built without an explicit coordinator share this one, so they
    /// exclude each other on the same lock name.
    #[must_use]
    pub fn global() -> Self {
        static GLOBAL: OnceLock<ProcessLockCoordinator> = OnceLock::new();
        GLOBAL.get_or_init(ProcessLockCoordinator::new).clone()
    }

    fn slot(&self, name: &str) -> GateResult<Arc<NamedSlot>> {
        let mut slots = self.slots.lock().map_err(|_| LockError::Poisoned {
            name: name.to_string(),
        })?;
        Ok(Arc::clone(slots.entry(name.to_string()).or_default()))
    }
}

impl LockCoordinator for ProcessLockCoordinator {
    fn acquire(&self, name: &str) -> GateResult<LockGuard> {
        let slot = self.slot(name)?;
        {
            let held = slot.held.lock().map_err(|_| LockError::Poisoned {
                name: name.to_string(),
            })?;
            let mut held = slot
                .released
                .wait_while(held, |held| *held)
                .map_err(|_| LockError::Poisoned {
                    name: name.to_string(),
                })?;
            *held = true;
        }
        tracing::debug!(lock = %name, "acquired process lock");
        Ok(LockGuard::new(name, SlotRelease { slot }))
    }

    fn try_acquire(&self, name: &str) -> GateResult<Option<LockGuard>> {
        let slot = self.slot(name)?;
        {
            let mut held = slot.held.lock().map_err(|_| LockError::Poisoned {
                name: name.to_string(),
            })?;
            if *held {
                return Ok(None);
            }
            *held = true;
        }
        Ok(Some(LockGuard::new(name, SlotRelease { slot })))
    }
}

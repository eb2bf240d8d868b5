//! Engine lifecycle: lazy construction, flush-in, flush-out and rebuild.
//!
//! Every step that touches the engine filesystem runs inside the named lock.
//! The handle slot is only ever replaced while the lock is held, so a
//! critical section that read the slot sees a stable engine until it
//! releases the lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};

use crate::config::{merge_engine_args, EngineArgs, EngineLayout, EngineOverrides, GateConfig};
use crate::deps::{DependencyResolver, Resolution, ResolveContext};
use crate::engine::{EngineFactory, EngineHandle, NativeCall, SyncDirection};
use crate::error::{EngineError, GateError, GateResult};
use crate::ini::assemble_config;
use crate::io::{IoBuffers, StdioHooks};
use crate::lock::{LockCoordinator, LockGuard};

/// Owns the single engine handle and its initialization state.
pub struct EngineLifecycle {
    coordinator: Arc<dyn LockCoordinator>,
    factory: Arc<dyn EngineFactory>,
    resolver: Arc<dyn DependencyResolver>,
    lock_name: String,
    layout: EngineLayout,
    overrides: EngineOverrides,
    io: Arc<IoBuffers>,
    slot: RwLock<Option<EngineHandle>>,
    initialized: AtomicBool,
    generation: AtomicU64,
}

impl EngineLifecycle {
    /// Lifecycle with no engine built yet.
    pub fn new(
        config: &GateConfig,
        coordinator: Arc<dyn LockCoordinator>,
        factory: Arc<dyn EngineFactory>,
        resolver: Arc<dyn DependencyResolver>,
        io: Arc<IoBuffers>,
    ) -> Self {
        Self {
            coordinator,
            factory,
            resolver,
            lock_name: config.lock_name.clone(),
            layout: config.layout.clone(),
            overrides: config.engine.clone(),
            io,
            slot: RwLock::new(None),
            initialized: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    /// Name of the lock guarding the engine.
    #[must_use]
    pub fn lock_name(&self) -> &str {
        &self.lock_name
    }

    /// Coordinator that owns the lock.
    #[must_use]
    pub fn coordinator(&self) -> &Arc<dyn LockCoordinator> {
        &self.coordinator
    }

    /// Shared standard stream buffers.
    #[must_use]
    pub fn io(&self) -> &Arc<IoBuffers> {
        &self.io
    }

    /// Whether the first flush-in has happened.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// The current handle, if an engine has been built.
    pub fn current(&self) -> GateResult<Option<EngineHandle>> {
        let slot = self
            .slot
            .read()
            .map_err(|_| GateError::internal("engine slot lock poisoned"))?;
        Ok(slot.clone())
    }

    /// Returns a ready engine, building and populating it on first use.
    ///
    /// Concurrent first callers serialize on the named lock; exactly one of
    /// them performs the populate flush.
    pub fn ensure_ready(&self) -> GateResult<EngineHandle> {
        if self.is_initialized() {
            if let Some(handle) = self.current()? {
                return Ok(handle);
            }
        }

        let guard = self.coordinator.acquire(&self.lock_name)?;
        self.ready_locked(&guard)
    }

    /// `ensure_ready` for callers already holding the named lock.
    pub(crate) fn ready_locked(&self, guard: &LockGuard) -> GateResult<EngineHandle> {
        let (handle, built) = match self.current()? {
            Some(handle) => (handle, false),
            None => {
                let prepared = self.prepare()?;
                (self.construct_locked(guard, prepared)?, true)
            }
        };

        if !self.is_initialized() {
            // A handle built just now was initialized and populated during construction.
            if !built {
                self.run_init_hook(&handle)?;
                handle.sync_fs(SyncDirection::Populate)?;
            }
            self.initialized.store(true, Ordering::Release);
            tracing::info!(generation = handle.generation(), "engine filesystem initialized");
        }

        Ok(handle)
    }

    /// Flushes the virtual filesystem out to durable storage.
    ///
    /// A no-op when no engine has been built yet.
    pub fn finalize(&self) -> GateResult<()> {
        let guard = self.coordinator.acquire(&self.lock_name)?;
        self.finalize_locked(&guard)
    }

    pub(crate) fn finalize_locked(&self, _guard: &LockGuard) -> GateResult<()> {
        match self.current()? {
            Some(handle) => {
                handle.sync_fs(SyncDirection::Persist)?;
                tracing::debug!(generation = handle.generation(), "engine filesystem persisted");
                Ok(())
            }
            None => {
                tracing::debug!("persist skipped: no engine built yet");
                Ok(())
            }
        }
    }

    /// Builds a new engine and replaces the current handle.
    ///
    /// Runs inside the named lock, so it waits for any drain batch in
    /// progress and every unit started after it returns sees the new engine.
    pub fn refresh(&self) -> GateResult<EngineHandle> {
        let prepared = self.prepare()?;
        let guard = self.coordinator.acquire(&self.lock_name)?;
        self.construct_locked(&guard, prepared)
    }

    /// Runs `refresh` on a builder thread.
    pub fn refresh_in_background(self: &Arc<Self>) -> GateResult<PendingEngine> {
        let (tx, rx) = bounded::<GateResult<EngineHandle>>(1);
        let lifecycle = Arc::clone(self);
        thread::Builder::new()
            .name("engine-gate-refresh".to_string())
            .spawn(move || {
                let _ = tx.send(lifecycle.refresh());
            })
            .map_err(|e| GateError::internal(format!("failed to spawn refresh thread: {e}")))?;
        Ok(PendingEngine { rx })
    }

    fn run_init_hook(&self, handle: &EngineHandle) -> GateResult<()> {
        match &self.overrides.on_init {
            Some(hook) => hook(handle),
            None => Ok(()),
        }
    }

    fn prepare(&self) -> GateResult<(Resolution, EngineArgs)> {
        let resolution = self.resolver.resolve(
            &self.overrides.shared_libs,
            ResolveContext {
                preload_dir: &self.layout.preload_dir,
            },
        )?;
        let args = merge_engine_args(
            &self.overrides,
            StdioHooks::from_buffers(&self.io),
            resolution.url_libs.clone(),
        );
        Ok((resolution, args))
    }

    fn construct_locked(&self, _guard: &LockGuard, (resolution, args): (Resolution, EngineArgs)) -> GateResult<EngineHandle> {
        let layout = &self.layout;
        let engine = self.factory.construct(&args)?;

        engine.invoke(&NativeCall::new(&layout.storage_init_symbol).asynchronous(true))?;

        if !engine.exists(&layout.preload_dir) {
            engine.mkdir(&layout.preload_dir)?;
        }

        for file in self.overrides.files.iter().chain(&resolution.files) {
            engine.create_preloaded_file(file, true, false)?;
        }

        let config = assemble_config(&resolution.libs, self.overrides.ini.as_deref());
        engine.write_file(&layout.config_path, config.as_bytes())?;

        engine.sync_fs(SyncDirection::Populate)?;

        engine.invoke(&NativeCall::new(&layout.protocol_init_symbol).asynchronous(true))?;

        let generation = self.generation.load(Ordering::SeqCst) + 1;
        let handle = EngineHandle::new(engine, generation);
        self.run_init_hook(&handle)?;

        self.generation.store(generation, Ordering::SeqCst);
        {
            let mut slot = self
                .slot
                .write()
                .map_err(|_| GateError::internal("engine slot lock poisoned"))?;
            *slot = Some(handle.clone());
        }

        tracing::info!(
            generation,
            preloaded = self.overrides.files.len() + resolution.files.len(),
            extensions = resolution.libs.len(),
            "engine built"
        );
        Ok(handle)
    }
}

/// An engine being built on another thread.
#[derive(Debug)]
pub struct PendingEngine {
    rx: Receiver<GateResult<EngineHandle>>,
}

impl PendingEngine {
    /// Waits for the build to finish.
    pub fn wait(self) -> GateResult<EngineHandle> {
        self.rx
            .recv()
            .map_err(|_| GateError::Engine(EngineError::RefreshAbandoned))?
    }

    /// Waits for the build with a timeout.
    pub fn wait_timeout(self, timeout: Duration) -> GateResult<EngineHandle> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => GateError::Engine(EngineError::RefreshTimeout {
                duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            }),
            RecvTimeoutError::Disconnected => GateError::Engine(EngineError::RefreshAbandoned),
        })?
    }
}

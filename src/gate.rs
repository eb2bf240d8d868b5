//! Caller-facing gate.
//!
//! `EngineGate` wires one lifecycle manager and one dispatcher to a lock
//! coordinator, a dependency resolver and a transaction envelope.
//! Several gates sharing a lock directory (or the process-wide registry)
//! never touch their engines at the same time.

use std::fmt;
use std::sync::Arc;

use crate::config::GateConfig;
use crate::deps::{DependencyResolver, FlatResolver};
use crate::dispatch::{Dispatcher, DispatcherStats, Ticket};
use crate::engine::{EngineFactory, EngineHandle, NativeValue};
use crate::error::GateResult;
use crate::io::IoBuffers;
use crate::lifecycle::{EngineLifecycle, PendingEngine};
use crate::lock::{with_lock, LockCoordinator, ProcessLockCoordinator};
use crate::transaction::{NoTransaction, TransactionEnvelope};

/// Builder for [`EngineGate`].
pub struct EngineGateBuilder {
    factory: Arc<dyn EngineFactory>,
    config: GateConfig,
    coordinator: Option<Arc<dyn LockCoordinator>>,
    resolver: Arc<dyn DependencyResolver>,
    transaction: Arc<dyn TransactionEnvelope>,
    io: Arc<IoBuffers>,
}

impl EngineGateBuilder {
    /// Uses `config` instead of the defaults.
    #[must_use]
    pub fn config(mut self, config: GateConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides the coordinator derived from `GateConfig::lock_dir`.
    #[must_use]
    pub fn coordinator(mut self, coordinator: Arc<dyn LockCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Uses a custom dependency resolver.
    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn DependencyResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Uses `transaction` as the batch envelope.
    #[must_use]
    pub fn transaction(mut self, transaction: Arc<dyn TransactionEnvelope>) -> Self {
        self.transaction = transaction;
        self
    }

    /// Shares stdio buffers with another owner.
    #[must_use]
    pub fn io(mut self, io: Arc<IoBuffers>) -> Self {
        self.io = io;
        self
    }

    /// Validates the configuration and starts the drain worker.
    pub fn build(self) -> GateResult<EngineGate> {
        let config = self.config.validate()?;
        let coordinator = match self.coordinator {
            Some(coordinator) => coordinator,
            None => default_coordinator(&config)?,
        };

        let lifecycle = Arc::new(EngineLifecycle::new(
            &config,
            coordinator,
            self.factory,
            self.resolver,
            self.io,
        ));
        let dispatcher = Dispatcher::start(
            Arc::clone(&lifecycle),
            Arc::clone(&self.transaction),
            config.auto_transaction,
            config.drain,
        )?;

        tracing::debug!(
            lock = %config.lock_name,
            auto_transaction = config.auto_transaction,
            "engine gate started"
        );
        Ok(EngineGate {
            dispatcher,
            lifecycle,
            transaction: self.transaction,
        })
    }
}

#[cfg(feature = "file-lock")]
fn default_coordinator(config: &GateConfig) -> GateResult<Arc<dyn LockCoordinator>> {
    match &config.lock_dir {
        Some(dir) => Ok(Arc::new(crate::lock::FileLockCoordinator::new(dir)?)),
        None => Ok(Arc::new(ProcessLockCoordinator::global())),
    }
}

#[cfg(not(feature = "file-lock"))]
fn default_coordinator(config: &GateConfig) -> GateResult<Arc<dyn LockCoordinator>> {
    if config.lock_dir.is_some() {
        return Err(crate::error::ConfigError::Invalid {
            field: "lock_dir".to_string(),
            reason: "file locks require the `file-lock` feature".to_string(),
        }
        .into());
    }
    Ok(Arc::new(ProcessLockCoordinator::global()))
}

/// Exclusive, ordered access to one engine.
pub struct EngineGate {
    dispatcher: Dispatcher,
    lifecycle: Arc<EngineLifecycle>,
    transaction: Arc<dyn TransactionEnvelope>,
}

impl EngineGate {
    /// Starts a builder around `factory`, with every other part defaulted.
    #[must_use]
    pub fn builder(factory: Arc<dyn EngineFactory>) -> EngineGateBuilder {
        EngineGateBuilder {
            factory,
            config: GateConfig::default(),
            coordinator: None,
            resolver: Arc::new(FlatResolver),
            transaction: Arc::new(NoTransaction),
            io: Arc::new(IoBuffers::default()),
        }
    }

    /// Queues `operation` to run against the engine once every earlier unit
    /// has settled.
    pub fn enqueue<T, F>(&self, operation: F, arguments: Vec<NativeValue>) -> Ticket<T>
    where
        T: Send + 'static,
        F: FnOnce(&EngineHandle, Vec<NativeValue>) -> GateResult<T> + Send + 'static,
    {
        self.dispatcher.enqueue(operation, arguments)
    }

    /// Begins a transaction outside of auto-transaction mode.
    pub fn start_transaction(&self) -> GateResult<()> {
        with_lock(self.coordinator(), self.lifecycle.lock_name(), |guard| {
            let engine = self.lifecycle.ready_locked(guard)?;
            self.transaction.begin(&engine)
        })
    }

    /// Commits a transaction begun with `start_transaction`.
    pub fn commit_transaction(&self) -> GateResult<()> {
        with_lock(self.coordinator(), self.lifecycle.lock_name(), |guard| {
            let engine = self.lifecycle.ready_locked(guard)?;
            self.transaction.commit(&engine)
        })
    }

    /// Rebuilds the engine. See [`EngineLifecycle::refresh`].
    pub fn refresh(&self) -> GateResult<EngineHandle> {
        self.lifecycle.refresh()
    }

    /// Rebuilds the engine on a background thread.
    pub fn refresh_in_background(&self) -> GateResult<PendingEngine> {
        self.lifecycle.refresh_in_background()
    }

    /// Makes the engine ready before a request is handled.
    pub fn before_request(&self) -> GateResult<EngineHandle> {
        self.lifecycle.ensure_ready()
    }

    /// Persists the engine filesystem after a request was handled.
    pub fn after_request(&self) -> GateResult<()> {
        self.lifecycle.finalize()
    }

    /// Queues bytes for the engine's standard input.
    pub fn push_input(&self, bytes: &[u8]) {
        self.lifecycle.io().push_input(bytes);
    }

    /// Drains what the engine wrote to standard output.
    pub fn take_output(&self) -> Vec<u8> {
        self.lifecycle.io().take_output()
    }

    /// Drains what the engine wrote to standard error.
    pub fn take_error(&self) -> Vec<u8> {
        self.lifecycle.io().take_error()
    }

    /// Dispatcher counters.
    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        self.dispatcher.stats()
    }

    /// Message of the most recent failed drain.
    pub fn last_drain_failure(&self) -> Option<String> {
        self.dispatcher.last_drain_failure()
    }

    /// The engine currently published, if any.
    pub fn current_engine(&self) -> GateResult<Option<EngineHandle>> {
        self.lifecycle.current()
    }

    /// Underlying engine lifecycle.
    #[must_use]
    pub fn lifecycle(&self) -> &Arc<EngineLifecycle> {
        &self.lifecycle
    }

    fn coordinator(&self) -> &dyn LockCoordinator {
        self.lifecycle.coordinator().as_ref()
    }
}

impl fmt::Debug for EngineGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineGate")
            .field("lock_name", &self.lifecycle.lock_name())
            .field("initialized", &self.lifecycle.is_initialized())
            .field("stats", &self.dispatcher.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{DurableStore, MemoryEngineFactory};
    use crate::error::{GateError, TransactionError};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recording {
        events: Mutex<Vec<String>>,
        fail_begin: std::sync::atomic::AtomicBool,
    }

    impl TransactionEnvelope for Recording {
        fn begin(&self, engine: &EngineHandle) -> GateResult<()> {
            if self.fail_begin.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(TransactionError::Begin {
                    message: "database locked".to_string(),
                }
                .into());
            }
            self.events.lock().unwrap().push(format!("begin:{}", engine.generation()));
            Ok(())
        }

        fn commit(&self, engine: &EngineHandle) -> GateResult<()> {
            self.events.lock().unwrap().push(format!("commit:{}", engine.generation()));
            Ok(())
        }
    }

    fn gate() -> EngineGate {
        EngineGate::builder(Arc::new(MemoryEngineFactory::new(DurableStore::new())))
            .coordinator(Arc::new(ProcessLockCoordinator::new()))
            .build()
            .unwrap()
    }

    #[test]
    fn debug_names_lock() {
        let gate = gate();
        assert!(format!("{gate:?}").contains("engine-fs-lock"));
    }

    #[test]
    fn build_rejects_invalid_config() {
        let mut config = GateConfig::default();
        config.lock_name = "  ".to_string();
        let err = EngineGate::builder(Arc::new(MemoryEngineFactory::new(DurableStore::new())))
            .config(config)
            .build()
            .unwrap_err();
        assert!(matches!(err, GateError::Config(_)));

        let mut config = GateConfig::default();
        config.engine.persist = Some(vec![crate::config::PersistMount::new("/")]);
        let err = EngineGate::builder(Arc::new(MemoryEngineFactory::new(DurableStore::new())))
            .config(config)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("filesystem root"));
    }

    #[test]
    fn stdio_round_trips_through_engine() {
        let factory = MemoryEngineFactory::new(DurableStore::new()).with_native("echo", |engine, _| {
            let mut count = 0i64;
            while let Some(byte) = engine.read_stdin() {
                engine.write_stdout(&[byte.to_ascii_uppercase()]);
                count += 1;
            }
            engine.write_stderr(b"done");
            Ok(NativeValue::Int(count))
        });
        let gate = EngineGate::builder(Arc::new(factory))
            .coordinator(Arc::new(ProcessLockCoordinator::new()))
            .build()
            .unwrap();
        gate.push_input(b"hi");

        let ticket = gate.enqueue(
            |engine, _| engine.invoke(&crate::engine::NativeCall::new("echo")),
            Vec::new(),
        );
        assert_eq!(ticket.join_timeout(Duration::from_secs(5)).unwrap(), NativeValue::Int(2));
        assert_eq!(gate.take_output(), b"HI".to_vec());
        assert_eq!(gate.take_error(), b"done".to_vec());
        assert!(gate.take_output().is_empty());
    }

    #[test]
    fn manual_transaction_brackets_engine() {
        let recording = Arc::new(Recording::default());
        let gate = EngineGate::builder(Arc::new(MemoryEngineFactory::new(DurableStore::new())))
            .coordinator(Arc::new(ProcessLockCoordinator::new()))
            .transaction(Arc::clone(&recording) as Arc<dyn TransactionEnvelope>)
            .build()
            .unwrap();

        gate.start_transaction().unwrap();
        gate.commit_transaction().unwrap();
        assert_eq!(*recording.events.lock().unwrap(), vec!["begin:1", "commit:1"]);
        assert!(gate.lifecycle().is_initialized());
    }

    #[test]
    fn begin_failure_keeps_units_queued() {
        let recording = Arc::new(Recording::default());
        recording.fail_begin.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut config = GateConfig::default();
        config.auto_transaction = true;
        let gate = EngineGate::builder(Arc::new(MemoryEngineFactory::new(DurableStore::new())))
            .config(config)
            .coordinator(Arc::new(ProcessLockCoordinator::new()))
            .transaction(Arc::clone(&recording) as Arc<dyn TransactionEnvelope>)
            .build()
            .unwrap();

        let first = gate.enqueue(|_, _| Ok("first"), Vec::new());
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while gate.stats().drain_failures == 0 {
            assert!(std::time::Instant::now() < deadline, "drain never failed");
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(first.try_result().is_none());
        assert!(gate.last_drain_failure().unwrap().contains("database locked"));

        recording.fail_begin.store(false, std::sync::atomic::Ordering::SeqCst);
        let second = gate.enqueue(|_, _| Ok("second"), Vec::new());

        assert_eq!(first.join_timeout(Duration::from_secs(5)).unwrap(), "first");
        assert_eq!(second.join_timeout(Duration::from_secs(5)).unwrap(), "second");
    }

    #[test]
    fn after_request_persists() {
        let durable = DurableStore::new();
        let gate = EngineGate::builder(Arc::new(MemoryEngineFactory::new(Arc::clone(&durable))))
            .coordinator(Arc::new(ProcessLockCoordinator::new()))
            .build()
            .unwrap();

        let engine = gate.before_request().unwrap();
        engine.write_file("/config/site.json", b"{\"v\":1}").unwrap();
        gate.after_request().unwrap();

        assert!(durable.get("/config/site.json").unwrap().is_some());
        assert_eq!(gate.current_engine().unwrap().unwrap().generation(), 1);
    }
}

//! # engine-gate - Exclusive, ordered access to an embedded engine
//!
//! engine-gate serializes every interaction with a single embedded
//! interpreter engine that owns a persistable virtual filesystem. Work is
//! admitted through a FIFO queue, drained one unit at a time under a named
//! host-wide lock, and bracketed by populate/persist flushes of the virtual
//! filesystem.
//!
//! ## Core Concepts
//!
//! - **Lock Coordinator**: named mutual exclusion shared across contexts
//! - **Engine Lifecycle**: lazy construction, flush-in, flush-out and rebuild
//! - **Dispatcher**: FIFO queue drained by a worker holding the lock
//! - **Transaction Envelope**: optional begin/commit around each drained batch
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use engine_gate::{DurableStore, EngineGate, MemoryEngineFactory, NativeValue};
//!
//! let factory = Arc::new(MemoryEngineFactory::new(DurableStore::new()));
//! let gate = EngineGate::builder(factory).build()?;
//!
//! let ticket = gate.enqueue(
//!     |engine, args| {
//!         engine.write_file("/persist/last.txt", args[0].as_str().unwrap_or("").as_bytes())?;
//!         Ok(())
//!     },
//!     vec![NativeValue::from("hello")],
//! );
//! ticket.join()?;
//! gate.after_request()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod deps;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod gate;
pub mod ini;
pub mod io;
pub mod lifecycle;
pub mod lock;
pub mod transaction;

// Re-export primary types at crate root for convenience
pub use config::{
    merge_engine_args, DrainPolicy, EngineArgs, EngineLayout, EngineOverrides, GateConfig, InitHook, PersistMount,
};
pub use deps::{DependencyResolver, FlatResolver, LoadDirective, Resolution, SharedLib};
pub use dispatch::{Dispatcher, DispatcherStats, Ticket};
pub use engine::{
    DurableStore, Engine, EngineFactory, EngineHandle, MemoryEngine, MemoryEngineFactory, NativeCall,
    NativeValue, PreloadFile, SyncDirection, ValueType,
};
pub use error::{
    ConfigError, EngineError, ExecutionError, FlushError, GateError, GateResult, LockError, TransactionError,
};
pub use gate::{EngineGate, EngineGateBuilder};
pub use io::IoBuffers;
pub use lifecycle::{EngineLifecycle, PendingEngine};
#[cfg(feature = "file-lock")]
pub use lock::FileLockCoordinator;
pub use lock::{LockCoordinator, LockGuard, ProcessLockCoordinator, DEFAULT_LOCK_NAME};
pub use transaction::{NoTransaction, TransactionEnvelope};

//! Request queue and drain worker.
//!
//! Callers admit units through a channel and get a `Ticket` back.
//! A dedicated worker thread takes the named lock whenever work is queued
//! and drains the queue in admission order:
//!
//! ```text
//!  enqueue ──► [channel] ──► worker ──► acquire(lock)
//!                                         │ begin?          (auto-transaction)
//!                                         │ run unit, settle ticket
//!                                         │ recv_timeout(linger) ──► late unit? run it
//!                                         │ commit?
//!                                         └─► release(lock)
//! ```
//!
//! A failing unit settles only its own ticket. Failures of the shared
//! steps (lock, begin, commit) end the drain attempt, are logged and
//! counted, and leave unconsumed units queued for the next attempt.

mod unit;

pub use unit::{Ticket, WorkUnit};

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::config::DrainPolicy;
use crate::engine::{EngineHandle, NativeValue};
use crate::error::{GateError, GateResult, TransactionError};
use crate::lifecycle::EngineLifecycle;
use crate::transaction::TransactionEnvelope;

/// Point-in-time dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Drain attempts that ran to completion.
    pub drains: u64,
    /// Units that returned a value.
    pub units_completed: u64,
    /// Units that returned an error or panicked.
    pub units_failed: u64,
    /// Drain attempts aborted by a lock or transaction failure.
    pub drain_failures: u64,
    /// Whether a drain currently holds the named lock.
    pub draining: bool,
}

#[derive(Debug, Default)]
struct Counters {
    drains: AtomicU64,
    units_completed: AtomicU64,
    units_failed: AtomicU64,
    drain_failures: AtomicU64,
    draining: AtomicBool,
}

/// Clears the draining flag when the drain scope ends.
struct DrainingFlag<'a>(&'a AtomicBool);

impl<'a> DrainingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for DrainingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct DrainWorker {
    lifecycle: Arc<EngineLifecycle>,
    transaction: Arc<dyn TransactionEnvelope>,
    auto_transaction: bool,
    policy: DrainPolicy,
    counters: Arc<Counters>,
    last_failure: Arc<Mutex<Option<String>>>,
}

impl DrainWorker {
    fn run(self, rx: Receiver<WorkUnit>) {
        // Units taken off the channel but not yet executed, in admission order.
        let mut backlog: VecDeque<WorkUnit> = VecDeque::new();

        loop {
            if backlog.is_empty() {
                match rx.recv() {
                    Ok(unit) => backlog.push_back(unit),
                    Err(_) => break,
                }
            }

            let attempt = panic::catch_unwind(AssertUnwindSafe(|| self.drain(&rx, &mut backlog)))
                .unwrap_or_else(|payload| {
                    Err(GateError::internal(format!(
                        "drain panicked: {}",
                        unit::panic_message(payload.as_ref())
                    )))
                });

            if let Err(err) = attempt {
                tracing::error!(error = %err, queued = backlog.len(), "drain attempt failed");
                if let Ok(mut last) = self.last_failure.lock() {
                    *last = Some(err.to_string());
                }
                self.counters.drain_failures.fetch_add(1, Ordering::SeqCst);

                // Retry on the next admission, as a fresh enqueue would.
                match rx.recv() {
                    Ok(unit) => backlog.push_back(unit),
                    Err(_) => break,
                }
            }
        }

        for unit in backlog.drain(..) {
            unit.reject(GateError::internal("dispatcher stopped before the unit ran"));
        }
        tracing::debug!("drain worker exited");
    }

    fn drain(&self, rx: &Receiver<WorkUnit>, backlog: &mut VecDeque<WorkUnit>) -> GateResult<()> {
        let guard = self.lifecycle.coordinator().acquire(self.lifecycle.lock_name())?;
        if backlog.is_empty() {
            return Ok(());
        }
        let _draining = DrainingFlag::raise(&self.counters.draining);

        let envelope: Option<EngineHandle> = if self.auto_transaction {
            let engine = self.lifecycle.ready_locked(&guard)?;
            envelope_step(|| self.transaction.begin(&engine), |message| TransactionError::Begin { message })?;
            Some(engine)
        } else {
            None
        };

        let linger = self.policy.linger();
        let mut batch = 0usize;
        loop {
            let unit = match backlog.pop_front() {
                Some(unit) => unit,
                None => match rx.recv_timeout(linger) {
                    Ok(unit) => unit,
                    Err(_) => break,
                },
            };
            batch += 1;
            let sequence = unit.sequence();

            let status = match self.lifecycle.ready_locked(&guard) {
                Ok(engine) => unit.run(&engine),
                Err(err) => {
                    let message = err.to_string();
                    unit.reject(err);
                    Err(message)
                }
            };

            match status {
                Ok(()) => {
                    self.counters.units_completed.fetch_add(1, Ordering::SeqCst);
                }
                Err(message) => {
                    self.counters.units_failed.fetch_add(1, Ordering::SeqCst);
                    tracing::debug!(sequence, error = %message, "unit failed");
                }
            }
        }

        if let Some(engine) = envelope {
            envelope_step(|| self.transaction.commit(&engine), |message| TransactionError::Commit { message })?;
        }

        self.counters.drains.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(batch, "drain finished");
        Ok(())
    }
}

/// Runs a begin or commit hook; a panic becomes a transaction failure.
fn envelope_step<F, E>(step: F, failure: E) -> GateResult<()>
where
    F: FnOnce() -> GateResult<()>,
    E: FnOnce(String) -> TransactionError,
{
    panic::catch_unwind(AssertUnwindSafe(step)).unwrap_or_else(|payload| {
        Err(failure(format!("panicked: {}", unit::panic_message(payload.as_ref()))).into())
    })
}

/// Admits work units and drains them against the engine, one at a time.
pub struct Dispatcher {
    tx: Sender<WorkUnit>,
    // Next sequence number; held across the send so sequence order is queue order.
    admission: Mutex<u64>,
    counters: Arc<Counters>,
    last_failure: Arc<Mutex<Option<String>>>,
    worker: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Starts the drain worker.
    pub fn start(
        lifecycle: Arc<EngineLifecycle>,
        transaction: Arc<dyn TransactionEnvelope>,
        auto_transaction: bool,
        policy: DrainPolicy,
    ) -> GateResult<Self> {
        let (tx, rx) = unbounded::<WorkUnit>();
        let counters = Arc::new(Counters::default());
        let last_failure = Arc::new(Mutex::new(None));

        let worker = DrainWorker {
            lifecycle,
            transaction,
            auto_transaction,
            policy,
            counters: Arc::clone(&counters),
            last_failure: Arc::clone(&last_failure),
        };
        let handle = thread::Builder::new()
            .name("engine-gate-drain".to_string())
            .spawn(move || worker.run(rx))
            .map_err(|e| GateError::internal(format!("failed to spawn drain worker: {e}")))?;

        Ok(Self {
            tx,
            admission: Mutex::new(0),
            counters,
            last_failure,
            worker: Some(handle),
        })
    }

    /// Admits a unit at the tail of the queue.
    ///
    /// Never waits on the named lock and never fails at admission; the
    /// outcome arrives through the returned ticket.
    pub fn enqueue<T, F>(&self, operation: F, arguments: Vec<NativeValue>) -> Ticket<T>
    where
        T: Send + 'static,
        F: FnOnce(&EngineHandle, Vec<NativeValue>) -> GateResult<T> + Send + 'static,
    {
        let mut next = self.admission.lock().unwrap_or_else(PoisonError::into_inner);
        let sequence = *next;
        *next += 1;

        let (unit, ticket) = WorkUnit::new(sequence, operation, arguments);
        if let Err(rejected) = self.tx.send(unit) {
            // Worker is gone; dropping the unit disconnects the ticket.
            tracing::warn!(sequence, "unit admitted after drain worker exited");
            drop(rejected);
        }
        ticket
    }

    /// Units admitted but not yet picked up by the worker.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.tx.len()
    }

    /// Snapshot of the drain counters.
    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            drains: self.counters.drains.load(Ordering::SeqCst),
            units_completed: self.counters.units_completed.load(Ordering::SeqCst),
            units_failed: self.counters.units_failed.load(Ordering::SeqCst),
            drain_failures: self.counters.drain_failures.load(Ordering::SeqCst),
            draining: self.counters.draining.load(Ordering::SeqCst),
        }
    }

    /// Message of the most recent drain-level failure.
    pub fn last_drain_failure(&self) -> Option<String> {
        self.last_failure.lock().ok().and_then(|last| last.clone())
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what is queued, then exit.
        let (closed, _) = unbounded::<WorkUnit>();
        drop(std::mem::replace(&mut self.tx, closed));
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

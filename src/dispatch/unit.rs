//! Work units and their result tickets.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::engine::{EngineHandle, NativeValue};
use crate::error::{ExecutionError, GateError, GateResult};

/// Type-erased body of a unit: the operation, its arguments and its reply
/// channel.
trait UnitBody: Send {
    fn run(self: Box<Self>, engine: &EngineHandle) -> Result<(), String>;

    fn reject(self: Box<Self>, err: GateError);
}

struct TypedBody<T, F> {
    operation: F,
    arguments: Vec<NativeValue>,
    reply: Sender<GateResult<T>>,
}

impl<T, F> UnitBody for TypedBody<T, F>
where
    T: Send + 'static,
    F: FnOnce(&EngineHandle, Vec<NativeValue>) -> GateResult<T> + Send + 'static,
{
    fn run(self: Box<Self>, engine: &EngineHandle) -> Result<(), String> {
        let Self {
            operation,
            arguments,
            reply,
        } = *self;

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| operation(engine, arguments)))
            .unwrap_or_else(|payload| {
                Err(ExecutionError::Panicked {
                    message: panic_message(payload.as_ref()),
                }
                .into())
            });

        let status = outcome.as_ref().map(|_| ()).map_err(ToString::to_string);
        // The caller may have dropped its ticket; the outcome is still settled.
        let _ = reply.send(outcome);
        status
    }

    fn reject(self: Box<Self>, err: GateError) {
        let _ = self.reply.send(Err(err));
    }
}

pub(super) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// One queued operation paired with its result channel.
///
/// Consumed exactly once, by `run` or `reject`.
pub struct WorkUnit {
    sequence: u64,
    body: Box<dyn UnitBody>,
}

impl WorkUnit {
    /// Creates a unit and the ticket its caller waits on.
    pub(crate) fn new<T, F>(sequence: u64, operation: F, arguments: Vec<NativeValue>) -> (Self, Ticket<T>)
    where
        T: Send + 'static,
        F: FnOnce(&EngineHandle, Vec<NativeValue>) -> GateResult<T> + Send + 'static,
    {
        let (reply, rx) = bounded::<GateResult<T>>(1);
        let unit = Self {
            sequence,
            body: Box::new(TypedBody {
                operation,
                arguments,
                reply,
            }),
        };
        (unit, Ticket { sequence, rx })
    }

    /// Admission sequence number.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Runs the operation against `engine` and settles the ticket.
    ///
    /// Returns the failure message when the operation failed or panicked.
    pub(crate) fn run(self, engine: &EngineHandle) -> Result<(), String> {
        self.body.run(engine)
    }

    /// Settles the ticket with `err` without running the operation.
    pub(crate) fn reject(self, err: GateError) {
        self.body.reject(err);
    }
}

impl fmt::Debug for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkUnit")
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

/// Handle returned by `enqueue`.
#[derive(Debug)]
pub struct Ticket<T> {
    sequence: u64,
    rx: Receiver<GateResult<T>>,
}

impl<T> Ticket<T> {
    /// Admission order of the unit.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Waits for the unit to settle.
    pub fn join(self) -> GateResult<T> {
        let sequence = self.sequence;
        self.rx
            .recv()
            .map_err(|_| GateError::Execution(ExecutionError::Disconnected { sequence }))?
    }

    /// Waits for the unit to settle with a timeout.
    pub fn join_timeout(self, timeout: Duration) -> GateResult<T> {
        let sequence = self.sequence;
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => GateError::Execution(ExecutionError::Timeout {
                sequence,
                duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            }),
            RecvTimeoutError::Disconnected => GateError::Execution(ExecutionError::Disconnected { sequence }),
        })?
    }

    /// The outcome, if the unit has already settled.
    pub fn try_result(&self) -> Option<GateResult<T>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(GateError::Execution(ExecutionError::Disconnected {
                sequence: self.sequence,
            }))),
        }
    }
}

//! Standard stream plumbing between the gate and the engine.
//!
//! The gate owns one input queue and two output accumulators. Engines see
//! them only through `StdioHooks`, which are derived from the buffers on
//! every build and are never caller-overridable.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Input queue and output accumulators shared with the engine.
#[derive(Debug, Default)]
pub struct IoBuffers {
    input: Mutex<VecDeque<u8>>,
    output: Mutex<Vec<u8>>,
    error: Mutex<Vec<u8>>,
}

// Byte buffers stay consistent across a panic, so poisoning is ignored.
fn relock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

impl IoBuffers {
    /// Queues `bytes` for the engine to read.
    pub fn push_input(&self, bytes: &[u8]) {
        relock(&self.input).extend(bytes.iter().copied());
    }

    /// Next input byte, or `None` at end of input.
    pub fn read_input(&self) -> Option<u8> {
        relock(&self.input).pop_front()
    }

    /// Records one stdout byte.
    pub fn write_output(&self, byte: u8) {
        relock(&self.output).push(byte);
    }

    /// Records one stderr byte.
    pub fn write_error(&self, byte: u8) {
        relock(&self.error).push(byte);
    }

    /// Drains everything written to stdout so far.
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut *relock(&self.output))
    }

    /// Drains everything written to stderr so far.
    pub fn take_error(&self) -> Vec<u8> {
        std::mem::take(&mut *relock(&self.error))
    }

    /// Discards unread input.
    pub fn clear_input(&self) {
        relock(&self.input).clear();
    }
}

/// Callbacks wired into the engine's standard streams.
#[derive(Clone)]
pub struct StdioHooks {
    /// Next input byte, `None` at end of input.
    pub stdin: Arc<dyn Fn() -> Option<u8> + Send + Sync>,
    /// Receives each stdout byte.
    pub stdout: Arc<dyn Fn(u8) + Send + Sync>,
    /// Receives each stderr byte.
    pub stderr: Arc<dyn Fn(u8) + Send + Sync>,
}

impl StdioHooks {
    /// Derives hooks that read from and append to `buffers`.
    #[must_use]
    pub fn from_buffers(buffers: &Arc<IoBuffers>) -> Self {
        let input = Arc::clone(buffers);
        let output = Arc::clone(buffers);
        let error = Arc::clone(buffers);
        Self {
            stdin: Arc::new(move || input.read_input()),
            stdout: Arc::new(move |byte| output.write_output(byte)),
            stderr: Arc::new(move |byte| error.write_error(byte)),
        }
    }
}

impl fmt::Debug for StdioHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StdioHooks { .. }")
    }
}

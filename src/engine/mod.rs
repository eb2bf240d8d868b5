//! The engine boundary.
//!
//! The interpreter itself is opaque. This module defines the surface the
//! gate needs from it: a small virtual filesystem API, a flush primitive,
//! and a native-call entry point. `EngineFactory` builds engines from
//! merged `EngineArgs`.

mod memory;

pub use memory::{DurableStore, MemoryEngine, MemoryEngineFactory, NativeFn};

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::EngineArgs;
use crate::error::GateResult;

/// Direction of a filesystem synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Durable storage into the virtual filesystem.
    Populate,
    /// Virtual filesystem out to durable storage.
    Persist,
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Populate => f.write_str("populate"),
            Self::Persist => f.write_str("persist"),
        }
    }
}

/// Type tags for native call arguments and return values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    /// No value.
    Void,
    /// Numeric value.
    Number,
    /// UTF-8 string.
    String,
    /// Raw byte buffer.
    Bytes,
}

/// A value crossing the native call boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeValue {
    /// Absent value.
    Null,
    /// Floating point number.
    Number(f64),
    /// Integer number.
    Int(i64),
    /// UTF-8 string.
    Str(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl NativeValue {
    /// Type tag of this value; `Null` matches any type.
    #[must_use]
    pub const fn value_type(&self) -> Option<ValueType> {
        match self {
            Self::Null => None,
            Self::Number(_) | Self::Int(_) => Some(ValueType::Number),
            Self::Str(_) => Some(ValueType::String),
            Self::Bytes(_) => Some(ValueType::Bytes),
        }
    }

    /// Integer payload, if any.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            #[allow(clippy::cast_possible_truncation)]
            Self::Number(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    /// String payload, if any.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for NativeValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for NativeValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<&str> for NativeValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for NativeValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// A call into one of the engine's native entry points.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeCall {
    /// Entry point name.
    pub name: String,
    /// Declared return type.
    pub returns: ValueType,
    /// Declared argument types.
    pub arg_types: Vec<ValueType>,
    /// Argument values.
    pub args: Vec<NativeValue>,
    /// Whether the entry point may suspend inside the engine.
    pub asynchronous: bool,
}

impl NativeCall {
    /// A call with no arguments returning a number.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            returns: ValueType::Number,
            arg_types: Vec::new(),
            args: Vec::new(),
            asynchronous: false,
        }
    }

    /// Sets the return type.
    #[must_use]
    pub fn returns(mut self, returns: ValueType) -> Self {
        self.returns = returns;
        self
    }

    /// Appends one typed argument.
    #[must_use]
    pub fn arg(mut self, ty: ValueType, value: impl Into<NativeValue>) -> Self {
        self.arg_types.push(ty);
        self.args.push(value.into());
        self
    }

    /// Sets whether the call is asynchronous.
    #[must_use]
    pub fn asynchronous(mut self, asynchronous: bool) -> Self {
        self.asynchronous = asynchronous;
        self
    }
}

/// A file fetched from `url` into `parent/name` when the engine is built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PreloadFile {
    /// Directory the file lands in.
    pub parent: String,
    /// File name inside `parent`.
    pub name: String,
    /// Source url.
    pub url: String,
}

impl PreloadFile {
    /// Preload of `url` into `parent/name`.
    pub fn new(parent: impl Into<String>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            parent: parent.into(),
            name: name.into(),
            url: url.into(),
        }
    }

    /// Absolute virtual path of the file.
    #[must_use]
    pub fn path(&self) -> String {
        join_path(&self.parent, &self.name)
    }
}

/// Joins a virtual directory and an entry name with exactly one separator.
#[must_use]
pub fn join_path(parent: &str, name: &str) -> String {
    let parent = parent.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    format!("{parent}/{name}")
}

/// A running interpreter instance.
///
/// All methods may block. Callers mutate the engine only while holding the
/// gate's named lock.
pub trait Engine: Send + Sync {
    /// Whether `path` exists.
    fn exists(&self, path: &str) -> bool;

    /// Creates the directory `path`; its parent must exist.
    fn mkdir(&self, path: &str) -> GateResult<()>;

    /// Creates or replaces the file at `path`.
    fn write_file(&self, path: &str, data: &[u8]) -> GateResult<()>;

    /// Reads the file at `path`.
    fn read_file(&self, path: &str) -> GateResult<Vec<u8>>;

    /// Registers a file whose contents are fetched from `file.url`.
    fn create_preloaded_file(&self, file: &PreloadFile, can_read: bool, can_write: bool) -> GateResult<()>;

    /// Synchronizes the virtual filesystem with durable storage.
    ///
    /// Returns a `Flush` error when the underlying medium fails.
    fn sync_fs(&self, direction: SyncDirection) -> GateResult<()>;

    /// Invokes a native entry point.
    fn invoke(&self, call: &NativeCall) -> GateResult<NativeValue>;
}

/// Builds engines from merged construction arguments.
pub trait EngineFactory: Send + Sync {
    /// Builds a fresh engine.
    fn construct(&self, args: &EngineArgs) -> GateResult<Arc<dyn Engine>>;
}

/// Shared reference to the live engine, tagged with its build generation.
///
/// Generation 1 is the first engine; each refresh increments it.
#[derive(Clone)]
pub struct EngineHandle {
    engine: Arc<dyn Engine>,
    generation: u64,
}

impl EngineHandle {
    pub(crate) fn new(engine: Arc<dyn Engine>, generation: u64) -> Self {
        Self { engine, generation }
    }

    /// Build counter of the lifecycle that produced this handle.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns true if both handles point at the same engine instance.
    #[must_use]
    pub fn same_engine(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.engine, &other.engine)
    }

    /// Reads a UTF-8 file from the virtual filesystem.
    pub fn read_to_string(&self, path: &str) -> GateResult<String> {
        let bytes = self.engine.read_file(path)?;
        String::from_utf8(bytes).map_err(|e| {
            crate::error::EngineError::Filesystem {
                path: path.to_string(),
                message: format!("file is not valid UTF-8: {e}"),
            }
            .into()
        })
    }
}

impl Deref for EngineHandle {
    type Target = dyn Engine;

    fn deref(&self) -> &Self::Target {
        self.engine.as_ref()
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

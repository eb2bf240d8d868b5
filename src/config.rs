//! Gate configuration and engine argument assembly.
//!
//! `GateConfig` is plain data that can be loaded from JSON. Engine
//! construction arguments are assembled by [`merge_engine_args`] from three
//! layers with fixed precedence: caller overrides, then values derived by
//! the gate (stdio hooks, the per-build library url map), then defaults.
//! The derived stdio hooks cannot be overridden.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::deps::SharedLib;
use crate::engine::{EngineHandle, PreloadFile};
use crate::error::{ConfigError, GateResult};
use crate::io::StdioHooks;
use crate::lock::DEFAULT_LOCK_NAME;

/// Caller-supplied path resolver, consulted before the library url map.
pub type LocateFile = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Caller setup run against an engine before it serves units.
pub type InitHook = Arc<dyn Fn(&EngineHandle) -> GateResult<()> + Send + Sync>;

/// How long a drain lingers on an empty queue before releasing the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainPolicy {
    /// Length of one polling increment.
    pub poll_interval_ms: u64,
    /// Number of increments to wait before the drain exits.
    pub poll_attempts: u32,
}

impl Default for DrainPolicy {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5,
            poll_attempts: 5,
        }
    }
}

impl DrainPolicy {
    /// Total time a drain waits for a late unit.
    #[must_use]
    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.saturating_mul(u64::from(self.poll_attempts)))
    }
}

/// Virtual filesystem layout and native entry points used during a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineLayout {
    /// Where the assembled configuration file is written.
    pub config_path: String,
    /// Scratch directory for preloaded files.
    pub preload_dir: String,
    /// Entry point that initializes the engine's internal storage.
    pub storage_init_symbol: String,
    /// Entry point that initializes the request protocol layer.
    pub protocol_init_symbol: String,
}

impl Default for EngineLayout {
    fn default() -> Self {
        Self {
            config_path: "/php.ini".to_string(),
            preload_dir: "/preload".to_string(),
            storage_init_symbol: "pib_storage_init".to_string(),
            protocol_init_symbol: "wasm_sapi_cgi_init".to_string(),
        }
    }
}

/// A persisted mount point inside the virtual filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PersistMount {
    /// Absolute path of the mount inside the virtual filesystem.
    pub mount_path: String,
}

impl PersistMount {
    /// Mount persisted at `mount_path`.
    pub fn new(mount_path: impl Into<String>) -> Self {
        Self {
            mount_path: mount_path.into(),
        }
    }
}

/// Mounts used when the caller does not supply any.
#[must_use]
pub fn default_persist_mounts() -> Vec<PersistMount> {
    vec![PersistMount::new("/persist"), PersistMount::new("/config")]
}

/// Caller-supplied engine settings.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOverrides {
    /// Replaces the default persist mounts entirely when set.
    pub persist: Option<Vec<PersistMount>>,
    /// Raw configuration text appended after the extension lines.
    pub ini: Option<String>,
    /// Files to preload in addition to those produced by dependency resolution.
    pub files: Vec<PreloadFile>,
    /// Shared libraries to hand to the dependency resolver.
    pub shared_libs: Vec<SharedLib>,
    /// Engine-specific settings passed through verbatim.
    pub settings: BTreeMap<String, serde_json::Value>,
    /// Custom file locator consulted before the resolved url map.
    #[serde(skip)]
    pub locate_file: Option<LocateFile>,
    /// Runs as the last build step and again before a prebuilt engine's
    /// first populate.
    #[serde(skip)]
    pub on_init: Option<InitHook>,
}

impl fmt::Debug for EngineOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineOverrides")
            .field("persist", &self.persist)
            .field("ini", &self.ini)
            .field("files", &self.files)
            .field("shared_libs", &self.shared_libs)
            .field("settings", &self.settings)
            .field("locate_file", &self.locate_file.as_ref().map(|_| "<fn>"))
            .field("on_init", &self.on_init.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Resolves engine-requested paths to locations.
#[derive(Clone, Default)]
pub struct FileLocator {
    user: Option<LocateFile>,
    url_libs: HashMap<String, String>,
}

impl FileLocator {
    /// Wraps an optional user locator around the resolved url map.
    pub fn new(user: Option<LocateFile>, url_libs: HashMap<String, String>) -> Self {
        Self { user, url_libs }
    }

    /// Caller resolver first, then the library url map.
    #[must_use]
    pub fn locate(&self, path: &str) -> Option<String> {
        if let Some(located) = self.user.as_ref().and_then(|user| user(path)) {
            return Some(located);
        }
        self.url_libs.get(path).cloned()
    }
}

impl fmt::Debug for FileLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileLocator")
            .field("user", &self.user.as_ref().map(|_| "<fn>"))
            .field("url_libs", &self.url_libs)
            .finish()
    }
}

/// Fully merged engine construction arguments.
#[derive(Debug, Clone)]
pub struct EngineArgs {
    /// Mounts flushed in and out of durable storage.
    pub persist: Vec<PersistMount>,
    /// Locator for engine support files.
    pub locate_file: FileLocator,
    /// Standard stream callbacks.
    pub stdio: StdioHooks,
    /// Engine-specific settings.
    pub settings: BTreeMap<String, serde_json::Value>,
}

/// Merges caller overrides, derived values and defaults.
///
/// Precedence is caller > derived > default. `stdio` is always the derived
/// value.
#[must_use]
pub fn merge_engine_args(
    overrides: &EngineOverrides,
    stdio: StdioHooks,
    url_libs: HashMap<String, String>,
) -> EngineArgs {
    let persist = overrides
        .persist
        .clone()
        .unwrap_or_else(default_persist_mounts);

    EngineArgs {
        persist,
        locate_file: FileLocator::new(overrides.locate_file.clone(), url_libs),
        stdio,
        settings: overrides.settings.clone(),
    }
}

/// Top-level gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Name of the lock serializing every engine critical section.
    pub lock_name: String,
    /// Directory of lock files. When unset, locks are process-wide only.
    pub lock_dir: Option<PathBuf>,
    /// Wrap each drained batch in the transaction envelope.
    pub auto_transaction: bool,
    /// Linger policy of the drain worker.
    pub drain: DrainPolicy,
    /// Paths of the preload dir and config file.
    pub layout: EngineLayout,
    /// Caller overrides merged over the defaults.
    pub engine: EngineOverrides,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            lock_name: DEFAULT_LOCK_NAME.to_string(),
            lock_dir: None,
            auto_transaction: false,
            drain: DrainPolicy::default(),
            layout: EngineLayout::default(),
            engine: EngineOverrides::default(),
        }
    }
}

impl GateConfig {
    /// Parses a JSON configuration and validates it.
    pub fn from_json_str(json: &str) -> GateResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;
        config.validate()
    }

    /// Reads and parses a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> GateResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Checks the config, returning it unchanged when valid.
    pub fn validate(self) -> GateResult<Self> {
        if self.lock_name.trim().is_empty() {
            return Err(invalid("lock_name", "must not be empty"));
        }
        if self.drain.poll_attempts == 0 {
            return Err(invalid("drain.poll_attempts", "must be at least 1"));
        }
        for (field, path) in [
            ("layout.config_path", &self.layout.config_path),
            ("layout.preload_dir", &self.layout.preload_dir),
        ] {
            if !path.starts_with('/') {
                return Err(invalid(field, &format!("'{path}' must be an absolute virtual path")));
            }
        }
        if let Some(mounts) = &self.engine.persist {
            if let Some(bad) = mounts.iter().find(|m| !m.mount_path.starts_with('/')) {
                return Err(invalid(
                    "engine.persist",
                    &format!("mount '{}' must be an absolute virtual path", bad.mount_path),
                ));
            }
            // Populate clears each mount before restoring it.
            if let Some(bad) = mounts.iter().find(|m| m.mount_path.trim_end_matches('/').is_empty()) {
                return Err(invalid(
                    "engine.persist",
                    &format!("mount '{}' must not be the filesystem root", bad.mount_path),
                ));
            }
        }
        Ok(self)
    }
}

fn invalid(field: &str, reason: &str) -> crate::error::GateError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

//! In-memory engine.
//!
//! A reference implementation of the `Engine` trait: a virtual filesystem in
//! a map, a `DurableStore` standing in for durable storage, and native entry
//! points registered as closures. It is intended for embedded usage, tests,
//! and as a model for real engine bindings.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::config::{EngineArgs, EngineLayout};
use crate::error::{EngineError, GateError, GateResult};

use super::{Engine, EngineFactory, NativeCall, NativeValue, PreloadFile, SyncDirection};

/// A native entry point of a `MemoryEngine`.
pub type NativeFn = Arc<dyn Fn(&MemoryEngine, &[NativeValue]) -> GateResult<NativeValue> + Send + Sync>;

fn lock_err(context: &'static str) -> GateError {
    GateError::internal(format!("poisoned lock: {context}"))
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

fn under_mount(path: &str, mount: &str) -> bool {
    let mount = mount.trim_end_matches('/');
    path.len() > mount.len() && path.starts_with(mount) && path.as_bytes()[mount.len()] == b'/'
}

/// Durable storage shared by every engine built from the same factory.
///
/// Keys are absolute virtual paths below a persist mount.
#[derive(Debug, Default)]
pub struct DurableStore {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
    populates: AtomicUsize,
    persists: AtomicUsize,
    fail_populate: AtomicBool,
    fail_persist: AtomicBool,
}

impl DurableStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Stores `data` at `path`.
    pub fn put(&self, path: impl Into<String>, data: impl Into<Vec<u8>>) -> GateResult<()> {
        let mut files = self.files.write().map_err(|_| lock_err("durable.files"))?;
        files.insert(path.into(), data.into());
        Ok(())
    }

    /// Contents stored at `path`, if any.
    pub fn get(&self, path: &str) -> GateResult<Option<Vec<u8>>> {
        let files = self.files.read().map_err(|_| lock_err("durable.files"))?;
        Ok(files.get(path).cloned())
    }

    /// All stored paths, sorted.
    pub fn paths(&self) -> GateResult<Vec<String>> {
        let files = self.files.read().map_err(|_| lock_err("durable.files"))?;
        Ok(files.keys().cloned().collect())
    }

    /// Number of successful populate flushes.
    pub fn populate_count(&self) -> usize {
        self.populates.load(Ordering::SeqCst)
    }

    /// Number of successful persist flushes.
    pub fn persist_count(&self) -> usize {
        self.persists.load(Ordering::SeqCst)
    }

    /// Makes every flush in `direction` fail until reset.
    pub fn set_failing(&self, direction: SyncDirection, failing: bool) {
        match direction {
            SyncDirection::Populate => self.fail_populate.store(failing, Ordering::SeqCst),
            SyncDirection::Persist => self.fail_persist.store(failing, Ordering::SeqCst),
        }
    }

    fn failing(&self, direction: SyncDirection) -> bool {
        match direction {
            SyncDirection::Populate => self.fail_populate.load(Ordering::SeqCst),
            SyncDirection::Persist => self.fail_persist.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File { data: Vec<u8>, can_read: bool, can_write: bool },
}

/// An engine whose filesystem lives in memory.
pub struct MemoryEngine {
    nodes: RwLock<BTreeMap<String, Node>>,
    durable: Arc<DurableStore>,
    remote: Arc<HashMap<String, Vec<u8>>>,
    natives: HashMap<String, NativeFn>,
    args: EngineArgs,
    journal: Mutex<Vec<String>>,
}

impl fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("natives", &self.natives.keys().collect::<Vec<_>>())
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

impl MemoryEngine {
    fn new(
        args: EngineArgs,
        durable: Arc<DurableStore>,
        remote: Arc<HashMap<String, Vec<u8>>>,
        natives: HashMap<String, NativeFn>,
    ) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::Dir);
        for mount in &args.persist {
            nodes.insert(mount.mount_path.trim_end_matches('/').to_string(), Node::Dir);
        }
        Self {
            nodes: RwLock::new(nodes),
            durable,
            remote,
            natives,
            args,
            journal: Mutex::new(Vec::new()),
        }
    }

    /// Operations performed so far, in order (`"mkdir:/preload"`, `"sync:populate"`, ...).
    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().map(|j| j.clone()).unwrap_or_default()
    }

    fn record(&self, entry: String) {
        if let Ok(mut journal) = self.journal.lock() {
            journal.push(entry);
        }
    }

    /// The arguments this engine was built with.
    #[must_use]
    pub fn args(&self) -> &EngineArgs {
        &self.args
    }

    /// Resolves a path through the merged file locator.
    #[must_use]
    pub fn locate(&self, path: &str) -> Option<String> {
        self.args.locate_file.locate(path)
    }

    /// Reads the next byte from the gate's input queue.
    pub fn read_stdin(&self) -> Option<u8> {
        (self.args.stdio.stdin)()
    }

    /// Writes `bytes` to the stdout hook.
    pub fn write_stdout(&self, bytes: &[u8]) {
        for byte in bytes {
            (self.args.stdio.stdout)(*byte);
        }
    }

    /// Writes `bytes` to the stderr hook.
    pub fn write_stderr(&self, bytes: &[u8]) {
        for byte in bytes {
            (self.args.stdio.stderr)(*byte);
        }
    }

    fn require_dir(nodes: &BTreeMap<String, Node>, path: &str) -> GateResult<()> {
        match nodes.get(path) {
            Some(Node::Dir) => Ok(()),
            Some(Node::File { .. }) => Err(EngineError::Filesystem {
                path: path.to_string(),
                message: "not a directory".to_string(),
            }
            .into()),
            None => Err(EngineError::NotFound { path: path.to_string() }.into()),
        }
    }

    fn ensure_dirs(nodes: &mut BTreeMap<String, Node>, path: &str) {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            nodes.entry(current.clone()).or_insert(Node::Dir);
        }
    }

    fn populate(&self) -> GateResult<()> {
        let durable = self.durable.files.read().map_err(|_| lock_err("durable.files"))?;
        let mut nodes = self.nodes.write().map_err(|_| lock_err("engine.nodes"))?;

        for mount in &self.args.persist {
            let mount = mount.mount_path.trim_end_matches('/');
            nodes.retain(|path, _| !under_mount(path, mount));
            Self::ensure_dirs(&mut nodes, mount);
            for (path, data) in durable.iter().filter(|(path, _)| under_mount(path, mount)) {
                Self::ensure_dirs(&mut nodes, parent_of(path));
                nodes.insert(
                    path.clone(),
                    Node::File {
                        data: data.clone(),
                        can_read: true,
                        can_write: true,
                    },
                );
            }
        }
        Ok(())
    }

    fn persist(&self) -> GateResult<()> {
        let mut durable = self.durable.files.write().map_err(|_| lock_err("durable.files"))?;
        let nodes = self.nodes.read().map_err(|_| lock_err("engine.nodes"))?;

        for mount in &self.args.persist {
            let mount = mount.mount_path.trim_end_matches('/');
            durable.retain(|path, _| !under_mount(path, mount));
            for (path, node) in nodes.iter().filter(|(path, _)| under_mount(path, mount)) {
                if let Node::File { data, .. } = node {
                    durable.insert(path.clone(), data.clone());
                }
            }
        }
        Ok(())
    }
}

impl Engine for MemoryEngine {
    fn exists(&self, path: &str) -> bool {
        self.nodes.read().map(|nodes| nodes.contains_key(path)).unwrap_or(false)
    }

    fn mkdir(&self, path: &str) -> GateResult<()> {
        let mut nodes = self.nodes.write().map_err(|_| lock_err("engine.nodes"))?;
        if nodes.contains_key(path) {
            return Err(EngineError::Filesystem {
                path: path.to_string(),
                message: "already exists".to_string(),
            }
            .into());
        }
        Self::require_dir(&nodes, parent_of(path))?;
        nodes.insert(path.to_string(), Node::Dir);
        drop(nodes);
        self.record(format!("mkdir:{path}"));
        Ok(())
    }

    fn write_file(&self, path: &str, data: &[u8]) -> GateResult<()> {
        let mut nodes = self.nodes.write().map_err(|_| lock_err("engine.nodes"))?;
        Self::require_dir(&nodes, parent_of(path))?;
        match nodes.get(path) {
            Some(Node::Dir) => {
                return Err(EngineError::Filesystem {
                    path: path.to_string(),
                    message: "is a directory".to_string(),
                }
                .into());
            }
            Some(Node::File { can_write: false, .. }) => {
                return Err(EngineError::Filesystem {
                    path: path.to_string(),
                    message: "file is read-only".to_string(),
                }
                .into());
            }
            _ => {}
        }
        nodes.insert(
            path.to_string(),
            Node::File {
                data: data.to_vec(),
                can_read: true,
                can_write: true,
            },
        );
        drop(nodes);
        self.record(format!("write:{path}"));
        Ok(())
    }

    fn read_file(&self, path: &str) -> GateResult<Vec<u8>> {
        let nodes = self.nodes.read().map_err(|_| lock_err("engine.nodes"))?;
        match nodes.get(path) {
            Some(Node::File { data, can_read: true, .. }) => Ok(data.clone()),
            Some(Node::File { .. }) => Err(EngineError::Filesystem {
                path: path.to_string(),
                message: "file is not readable".to_string(),
            }
            .into()),
            Some(Node::Dir) => Err(EngineError::Filesystem {
                path: path.to_string(),
                message: "is a directory".to_string(),
            }
            .into()),
            None => Err(EngineError::NotFound { path: path.to_string() }.into()),
        }
    }

    fn create_preloaded_file(&self, file: &PreloadFile, can_read: bool, can_write: bool) -> GateResult<()> {
        let data = self.remote.get(&file.url).cloned().ok_or_else(|| EngineError::Filesystem {
            path: file.path(),
            message: format!("unable to fetch '{}'", file.url),
        })?;

        let path = file.path();
        let mut nodes = self.nodes.write().map_err(|_| lock_err("engine.nodes"))?;
        Self::require_dir(&nodes, parent_of(&path))?;
        nodes.insert(path.clone(), Node::File { data, can_read, can_write });
        drop(nodes);
        self.record(format!("preload:{path}"));
        Ok(())
    }

    fn sync_fs(&self, direction: SyncDirection) -> GateResult<()> {
        if self.durable.failing(direction) {
            return Err(GateError::flush(direction, "durable storage unavailable"));
        }
        match direction {
            SyncDirection::Populate => {
                self.populate()?;
                self.durable.populates.fetch_add(1, Ordering::SeqCst);
            }
            SyncDirection::Persist => {
                self.persist()?;
                self.durable.persists.fetch_add(1, Ordering::SeqCst);
            }
        }
        self.record(format!("sync:{direction}"));
        Ok(())
    }

    fn invoke(&self, call: &NativeCall) -> GateResult<NativeValue> {
        let native = self.natives.get(&call.name).ok_or_else(|| EngineError::Invoke {
            name: call.name.clone(),
            message: "no such entry point".to_string(),
        })?;

        if call.args.len() != call.arg_types.len() {
            return Err(EngineError::Invoke {
                name: call.name.clone(),
                message: format!("{} arguments but {} argument types", call.args.len(), call.arg_types.len()),
            }
            .into());
        }
        for (idx, (value, ty)) in call.args.iter().zip(&call.arg_types).enumerate() {
            if let Some(actual) = value.value_type() {
                if actual != *ty {
                    return Err(EngineError::Invoke {
                        name: call.name.clone(),
                        message: format!("argument {idx} is {actual:?}, declared {ty:?}"),
                    }
                    .into());
                }
            }
        }

        self.record(format!("invoke:{}", call.name));
        native(self, &call.args)
    }
}

#[allow(clippy::unnecessary_wraps)]
fn noop_native(_engine: &MemoryEngine, _args: &[NativeValue]) -> GateResult<NativeValue> {
    Ok(NativeValue::Int(0))
}

/// Builds `MemoryEngine`s sharing one `DurableStore`.
pub struct MemoryEngineFactory {
    durable: Arc<DurableStore>,
    remote: Arc<HashMap<String, Vec<u8>>>,
    natives: HashMap<String, NativeFn>,
    last: Mutex<Option<Arc<MemoryEngine>>>,
    builds: AtomicUsize,
    fail_construct: AtomicBool,
}

impl fmt::Debug for MemoryEngineFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryEngineFactory")
            .field("durable", &self.durable)
            .field("remote", &self.remote.keys().collect::<Vec<_>>())
            .field("natives", &self.natives.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl MemoryEngineFactory {
    /// A factory whose engines answer the default initializer entry points.
    #[must_use]
    pub fn new(durable: Arc<DurableStore>) -> Self {
        let layout = EngineLayout::default();
        let noop: NativeFn = Arc::new(noop_native);
        let mut natives = HashMap::new();
        natives.insert(layout.storage_init_symbol, Arc::clone(&noop));
        natives.insert(layout.protocol_init_symbol, noop);

        Self {
            durable,
            remote: Arc::new(HashMap::new()),
            natives,
            last: Mutex::new(None),
            builds: AtomicUsize::new(0),
            fail_construct: AtomicBool::new(false),
        }
    }

    /// Makes `url` fetchable by preloads.
    #[must_use]
    pub fn with_remote(mut self, url: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Arc::make_mut(&mut self.remote).insert(url.into(), data.into());
        self
    }

    /// Registers (or replaces) a native entry point.
    #[must_use]
    pub fn with_native<F>(mut self, name: impl Into<String>, native: F) -> Self
    where
        F: Fn(&MemoryEngine, &[NativeValue]) -> GateResult<NativeValue> + Send + Sync + 'static,
    {
        self.natives.insert(name.into(), Arc::new(native));
        self
    }

    /// Store shared by every engine this factory builds.
    #[must_use]
    pub fn durable(&self) -> &Arc<DurableStore> {
        &self.durable
    }

    /// Number of engines built so far.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// The most recently built engine.
    pub fn last_engine(&self) -> Option<Arc<MemoryEngine>> {
        self.last.lock().ok().and_then(|last| last.clone())
    }

    /// Makes subsequent `construct` calls fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.fail_construct.store(failing, Ordering::SeqCst);
    }
}

impl EngineFactory for MemoryEngineFactory {
    fn construct(&self, args: &EngineArgs) -> GateResult<Arc<dyn Engine>> {
        if self.fail_construct.load(Ordering::SeqCst) {
            return Err(EngineError::Construction {
                message: "engine binary unavailable".to_string(),
            }
            .into());
        }

        let engine = Arc::new(MemoryEngine::new(
            args.clone(),
            Arc::clone(&self.durable),
            Arc::clone(&self.remote),
            self.natives.clone(),
        ));
        *self.last.lock().map_err(|_| lock_err("factory.last"))? = Some(Arc::clone(&engine));
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(engine)
    }
}

//! Per-connection ownership of callback handles.
//!
//! Every registration on a connection stores its [`CallbackHandle`] here, keyed
//! the way SQLite keys the native registration. Replacing or removing a
//! registration disposes the previous handle; closing the connection disposes
//! them all.

use core::hash::{Hash, Hasher};
use core::ptr::NonNull;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error, warn};

use crate::error::Error;
use crate::handle::{CallbackHandle, HookKind};
use crate::lock;

/// Identifier compared the way SQLite compares function and collation names:
/// ASCII letters fold, every other byte must match exactly.
#[derive(Clone, Debug)]
pub struct HookName(String);

impl HookName {
    pub fn new(name: &str) -> Self {
        HookName(name.to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for HookName {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for HookName {}

impl Hash for HookName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for byte in self.0.bytes() {
            state.write_u8(byte.to_ascii_lowercase());
        }
        state.write_u8(0xff);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct FunctionKey {
    name: HookName,
    n_args: i32,
}

impl FunctionKey {
    fn new(name: &str, n_args: i32) -> Self {
        Self {
            name: HookName::new(name),
            n_args,
        }
    }
}

/// Where a registration lives inside a [`ConnectionHookSet`].
#[derive(Clone, Copy, Debug)]
pub(crate) enum HookKey<'a> {
    Collation(&'a str),
    Function(&'a str, i32),
    Hook(HookKind),
}

/// Handles owned by one connection.
pub struct ConnectionHookSet {
    db: usize,
    collations: HashMap<HookName, CallbackHandle>,
    // Scalars and aggregates share SQLite's (name, n_args) namespace.
    functions: HashMap<FunctionKey, CallbackHandle>,
    update: Option<CallbackHandle>,
    commit: Option<CallbackHandle>,
    rollback: Option<CallbackHandle>,
    trace: Option<CallbackHandle>,
    profile: Option<CallbackHandle>,
    progress: Option<CallbackHandle>,
    authorizer: Option<CallbackHandle>,
}

impl ConnectionHookSet {
    fn new(db: usize) -> Self {
        Self {
            db,
            collations: HashMap::new(),
            functions: HashMap::new(),
            update: None,
            commit: None,
            rollback: None,
            trace: None,
            profile: None,
            progress: None,
            authorizer: None,
        }
    }

    /// Address of the connection this set belongs to.
    pub fn db_addr(&self) -> usize {
        self.db
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.collations.len() + self.functions.len() + self.slots().into_iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn collation(&self, name: &str) -> Option<&CallbackHandle> {
        self.collations.get(&HookName::new(name))
    }

    /// Scalar or aggregate registered under `(name, n_args)`.
    pub fn function(&self, name: &str, n_args: i32) -> Option<&CallbackHandle> {
        self.functions.get(&FunctionKey::new(name, n_args))
    }

    /// Handle of a single-slot hook; `None` for named kinds.
    pub fn hook(&self, kind: HookKind) -> Option<&CallbackHandle> {
        match kind {
            HookKind::Update => self.update.as_ref(),
            HookKind::Commit => self.commit.as_ref(),
            HookKind::Rollback => self.rollback.as_ref(),
            HookKind::Trace => self.trace.as_ref(),
            HookKind::Profile => self.profile.as_ref(),
            HookKind::Progress => self.progress.as_ref(),
            HookKind::Authorizer => self.authorizer.as_ref(),
            _ => None,
        }
    }

    /// Dispose whatever is stored under `key`, then install `handle`.
    pub(crate) fn replace(&mut self, key: HookKey<'_>, handle: Option<CallbackHandle>) {
        match key {
            HookKey::Collation(name) => self.replace_collation(name, handle),
            HookKey::Function(name, n_args) => self.replace_function(name, n_args, handle),
            HookKey::Hook(kind) => self.replace_hook(kind, handle),
        }
    }

    /// Dispose any collation under `name`, then install `handle`.
    pub(crate) fn replace_collation(&mut self, name: &str, handle: Option<CallbackHandle>) {
        let key = HookName::new(name);
        if let Some(mut old) = self.collations.remove(&key) {
            old.dispose();
        }
        if let Some(handle) = handle {
            self.collations.insert(key, handle);
        }
    }

    /// Dispose any function under `(name, n_args)`, then install `handle`.
    pub(crate) fn replace_function(
        &mut self,
        name: &str,
        n_args: i32,
        handle: Option<CallbackHandle>,
    ) {
        let key = FunctionKey::new(name, n_args);
        if let Some(mut old) = self.functions.remove(&key) {
            old.dispose();
        }
        if let Some(handle) = handle {
            self.functions.insert(key, handle);
        }
    }

    /// Dispose the hook stored for `kind`, then install `handle`.
    pub(crate) fn replace_hook(&mut self, kind: HookKind, handle: Option<CallbackHandle>) {
        let slot = match kind {
            HookKind::Update => &mut self.update,
            HookKind::Commit => &mut self.commit,
            HookKind::Rollback => &mut self.rollback,
            HookKind::Trace => &mut self.trace,
            HookKind::Profile => &mut self.profile,
            HookKind::Progress => &mut self.progress,
            HookKind::Authorizer => &mut self.authorizer,
            _ => {
                error!(kind = %kind, "hook kind has no per-connection slot");
                return;
            }
        };
        if let Some(mut old) = slot.take() {
            old.dispose();
        }
        *slot = handle;
    }

    /// Dispose every handle; returns how many were live.
    pub(crate) fn dispose_all(&mut self) -> usize {
        let mut disposed = 0;
        let named = self.collations.drain().map(|(_, handle)| handle);
        for mut handle in named.chain(self.functions.drain().map(|(_, handle)| handle)) {
            disposed += usize::from(handle.dispose());
        }
        for slot in self.slots_mut() {
            if let Some(mut handle) = slot.take() {
                disposed += usize::from(handle.dispose());
            }
        }
        disposed
    }

    fn slots(&self) -> [Option<&CallbackHandle>; 7] {
        [
            self.update.as_ref(),
            self.commit.as_ref(),
            self.rollback.as_ref(),
            self.trace.as_ref(),
            self.profile.as_ref(),
            self.progress.as_ref(),
            self.authorizer.as_ref(),
        ]
    }

    fn slots_mut(&mut self) -> [&mut Option<CallbackHandle>; 7] {
        [
            &mut self.update,
            &mut self.commit,
            &mut self.rollback,
            &mut self.trace,
            &mut self.profile,
            &mut self.progress,
            &mut self.authorizer,
        ]
    }
}

/// Shared reference to one connection's [`ConnectionHookSet`].
#[derive(Clone)]
pub struct HookSetRef(Arc<Mutex<ConnectionHookSet>>);

impl HookSetRef {
    pub fn lock(&self) -> MutexGuard<'_, ConnectionHookSet> {
        lock(&self.0)
    }
}

/// Tuning for a [`HookRegistry`].
#[derive(Clone, Debug)]
pub struct RegistryOptions {
    /// Callback failures kept for [`HookRegistry::failures`]; older entries are evicted.
    pub failure_capacity: usize,
}

impl RegistryOptions {
    pub fn with_failure_capacity(mut self, capacity: usize) -> Self {
        self.failure_capacity = capacity;
        self
    }
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            failure_capacity: 64,
        }
    }
}

/// A callback that returned an error, panicked, or received undecodable input.
#[derive(Clone, Debug)]
pub struct CallbackFailure {
    pub kind: HookKind,
    /// Function or collation name, for named hooks.
    pub name: Option<String>,
    pub error: Error,
}

/// Bounded record of callback failures, shared with every adapter.
pub(crate) struct FailureLog {
    capacity: usize,
    entries: Mutex<VecDeque<CallbackFailure>>,
}

impl FailureLog {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn record(&self, kind: HookKind, name: Option<&str>, error: Error) {
        warn!(kind = %kind, name = name.unwrap_or_default(), error = %error, "sqlite callback failed");
        if self.capacity == 0 {
            return;
        }
        let mut entries = lock(&self.entries);
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(CallbackFailure {
            kind,
            name: name.map(str::to_owned),
            error,
        });
    }

    fn snapshot(&self) -> Vec<CallbackFailure> {
        lock(&self.entries).iter().cloned().collect()
    }

    fn drain(&self) -> Vec<CallbackFailure> {
        lock(&self.entries).drain(..).collect()
    }
}

/// Connection-keyed registry of hook sets plus the process-wide log hook.
pub struct HookRegistry {
    connections: Mutex<HashMap<usize, HookSetRef>>,
    pub(crate) log: Mutex<Option<CallbackHandle>>,
    failures: Arc<FailureLog>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::with_options(RegistryOptions::default())
    }

    pub fn with_options(options: RegistryOptions) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            log: Mutex::new(None),
            failures: Arc::new(FailureLog::new(options.failure_capacity)),
        }
    }

    /// Hook set for `db`, created empty on first use.
    pub fn get_or_create<T>(&self, db: NonNull<T>) -> HookSetRef {
        let key = db_key(db);
        lock(&self.connections)
            .entry(key)
            .or_insert_with(|| {
                debug!(db = key, "hook set created");
                HookSetRef(Arc::new(Mutex::new(ConnectionHookSet::new(key))))
            })
            .clone()
    }

    pub fn get<T>(&self, db: NonNull<T>) -> Option<HookSetRef> {
        lock(&self.connections).get(&db_key(db)).cloned()
    }

    pub fn contains<T>(&self, db: NonNull<T>) -> bool {
        lock(&self.connections).contains_key(&db_key(db))
    }

    /// Take the hook set for `db` out of the registry without disposing it.
    ///
    /// Its handles stay live until the caller disposes them; a connection that
    /// later gets the same address starts from an empty set.
    pub fn detach<T>(&self, db: NonNull<T>) -> Option<HookSetRef> {
        lock(&self.connections).remove(&db_key(db))
    }

    /// Drop the hook set for `db`, disposing every handle in it.
    ///
    /// Returns the number of handles disposed; zero when `db` had no set.
    pub fn remove<T>(&self, db: NonNull<T>) -> usize {
        let Some(set) = self.detach(db) else {
            return 0;
        };
        let disposed = set.lock().dispose_all();
        debug!(db = db_key(db), disposed, "hook set removed");
        disposed
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    /// Failures recorded so far, oldest first.
    pub fn failures(&self) -> Vec<CallbackFailure> {
        self.failures.snapshot()
    }

    /// Failures recorded so far; clears the record.
    pub fn take_failures(&self) -> Vec<CallbackFailure> {
        self.failures.drain()
    }

    pub(crate) fn failure_log(&self) -> Arc<FailureLog> {
        self.failures.clone()
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn db_key<T>(db: NonNull<T>) -> usize {
    db.as_ptr() as usize
}

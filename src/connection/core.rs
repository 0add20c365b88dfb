use core::ffi::c_void;
use core::ptr::NonNull;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::handle::CallbackHandle;
use crate::provider::{FeatureSet, Sqlite3Api};
use crate::registry::{HookKey, HookRegistry, HookSetRef};

/// `sqlite3*` connection whose callback registrations are owned by a [`HookRegistry`].
///
/// Closing (or dropping) the connection takes its hook set out of the registry,
/// closes the native handle while the handles are still live, so hooks that fire
/// during close (an implicit rollback, say) still resolve, then disposes them.
pub struct Connection<'p, P: Sqlite3Api> {
    pub(crate) api: &'p P,
    pub(crate) db: NonNull<P::Db>,
    pub(crate) registry: &'p HookRegistry,
    closed: bool,
}

impl<'p, P: Sqlite3Api> Connection<'p, P> {
    /// Open a connection through the provider.
    pub fn open(api: &'p P, registry: &'p HookRegistry, filename: &str) -> Result<Self> {
        let db = unsafe { api.open(filename)? };
        debug!(backend = api.backend_name(), filename, "connection opened");
        Ok(Self {
            api,
            db,
            registry,
            closed: false,
        })
    }

    /// Adopt a handle opened elsewhere. The connection closes it on drop.
    ///
    /// # Safety
    /// `db` must be a live connection of `api` not owned by anything else.
    pub unsafe fn from_raw(api: &'p P, registry: &'p HookRegistry, db: NonNull<P::Db>) -> Self {
        Self {
            api,
            db,
            registry,
            closed: false,
        }
    }

    pub fn raw_handle(&self) -> NonNull<P::Db> {
        self.db
    }

    pub fn registry(&self) -> &'p HookRegistry {
        self.registry
    }

    /// This connection's hook set, created on first use.
    pub fn hooks(&self) -> HookSetRef {
        self.registry.get_or_create(self.db)
    }

    /// Close the native handle and dispose every callback registered on it.
    pub fn close(mut self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // Detach first: once the native handle is freed its address may be
        // reused by a connection that must not see these handles.
        let hooks = self.registry.detach(self.db);
        let out = unsafe { self.api.close(self.db) };
        let disposed = hooks.map_or(0, |hooks| hooks.lock().dispose_all());
        match &out {
            Ok(()) => debug!(disposed, "connection closed"),
            Err(err) => warn!(disposed, error = %err, "connection close failed"),
        }
        out
    }

    pub(crate) fn require(&self, feature: FeatureSet, what: &'static str) -> Result<()> {
        if self.api.feature_set().contains(feature) {
            Ok(())
        } else {
            Err(Error::feature_unavailable(what))
        }
    }

    /// Swap the handle stored under `key` and tell SQLite about it.
    ///
    /// The previous handle is disposed before `register` runs. If `register`
    /// fails the new handle is disposed too.
    pub(crate) fn install(
        &self,
        key: HookKey<'_>,
        handle: Option<CallbackHandle>,
        register: impl FnOnce(*mut c_void) -> Result<()>,
    ) -> Result<()> {
        let user_data = handle
            .as_ref()
            .map_or(core::ptr::null_mut(), CallbackHandle::user_data);
        let hooks = self.hooks();
        let mut hooks = hooks.lock();
        hooks.replace(key, handle);
        let out = register(user_data);
        if let Err(err) = &out {
            warn!(key = ?key, error = %err, "native hook registration failed");
            hooks.replace(key, None);
        }
        out
    }
}

impl<'p, P: Sqlite3Api> Drop for Connection<'p, P> {
    fn drop(&mut self) {
        let _ = self.close_inner();
    }
}

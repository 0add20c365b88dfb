//! Process-wide SQLite error log (`SQLITE_CONFIG_LOG`).
//!
//! SQLite accepts this hook only before the library initializes, and may invoke
//! it from any thread for any connection.

use core::ffi::{c_char, c_void};

use tracing::debug;

use crate::codec::decode_required;
use crate::connection::{hook_state, settle};
use crate::error::Result;
use crate::handle::{CallbackHandle, HookKind, HookState, guard};
use crate::lock;
use crate::provider::{FeatureSet, Sqlite3Log};
use crate::registry::HookRegistry;

extern "C" fn log_trampoline<U, F>(user_data: *mut c_void, code: i32, message: *const c_char)
where
    U: Send + Sync + 'static,
    F: Fn(&U, i32, &str) + Send + Sync + 'static,
{
    let Some(state) = hook_state::<HookState<U, F>>(user_data, HookKind::Log) else {
        return;
    };
    let out = unsafe { decode_required(message, "log message") }.and_then(|message| {
        guard(|| {
            (state.callback)(&state.user_data, code, message);
            Ok(())
        })
    });
    settle(HookKind::Log, &state.failures, out, ());
}

impl HookRegistry {
    /// Install the process-wide error log callback, replacing any previous one.
    pub fn config_log<P, U, F>(&self, api: &P, user_data: U, f: F) -> Result<()>
    where
        P: Sqlite3Log,
        U: Send + Sync + 'static,
        F: Fn(&U, i32, &str) + Send + Sync + 'static,
    {
        if !api.feature_set().contains(FeatureSet::LOG) {
            return Err(crate::error::Error::feature_unavailable("config_log unsupported"));
        }
        let state = HookState::new(user_data, f, self.failure_log());
        let handle = CallbackHandle::new(HookKind::Log, state)?;
        let user_data = handle.user_data();
        let mut slot = lock(&self.log);
        if let Some(mut old) = slot.take() {
            old.dispose();
        }
        *slot = Some(handle);
        let out = unsafe { api.config_log(Some(log_trampoline::<U, F>), user_data) };
        match &out {
            Ok(()) => debug!(backend = api.backend_name(), "error log installed"),
            Err(_) => {
                slot.take();
            }
        }
        out
    }

    /// Remove the process-wide error log callback.
    pub fn clear_log<P: Sqlite3Log>(&self, api: &P) -> Result<()> {
        let mut slot = lock(&self.log);
        if let Some(mut old) = slot.take() {
            old.dispose();
        }
        unsafe { api.config_log(None, core::ptr::null_mut()) }
    }

    pub fn has_log(&self) -> bool {
        lock(&self.log).is_some()
    }
}

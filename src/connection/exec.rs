use core::ffi::{c_char, c_void};

use crate::codec::decode_array;
use crate::error::Result;
use crate::handle::{CallbackHandle, HookKind, HookState, guard};
use crate::provider::Sqlite3Hooks;

use super::core::Connection;
use super::hooks::{hook_state, settle};

/// Return code that stops `exec` when a row cannot be delivered.
const ABORT_ROWS: i32 = 1;

extern "C" fn exec_trampoline<U, F>(
    user_data: *mut c_void,
    n_cols: i32,
    values: *mut *mut c_char,
    names: *mut *mut c_char,
) -> i32
where
    U: Send + Sync + 'static,
    F: for<'a> Fn(&U, &[Option<&'a str>], &[Option<&'a str>]) -> i32 + Send + Sync + 'static,
{
    let Some(state) = hook_state::<HookState<U, F>>(user_data, HookKind::Exec) else {
        return ABORT_ROWS;
    };
    let out = (|| {
        let values = unsafe { decode_array(values, n_cols) }?;
        let names = unsafe { decode_array(names, n_cols) }?;
        guard(|| Ok((state.callback)(&state.user_data, values.as_slice(), names.as_slice())))
    })();
    settle(HookKind::Exec, &state.failures, out, ABORT_ROWS)
}

impl<'p, P: Sqlite3Hooks> Connection<'p, P> {
    /// Run one or more statements, discarding any rows.
    pub fn exec(&self, sql: &str) -> Result<()> {
        unsafe { self.api.exec(self.db, sql, None, core::ptr::null_mut()) }
    }

    /// Run one or more statements, calling `row` with each result row's text
    /// values and column names.
    ///
    /// A non-zero return from `row` stops execution and is reported by SQLite
    /// as an abort. The callback state lives only for the duration of this call.
    pub fn exec_with<U, F>(&self, sql: &str, user_data: U, row: F) -> Result<()>
    where
        U: Send + Sync + 'static,
        F: for<'a> Fn(&U, &[Option<&'a str>], &[Option<&'a str>]) -> i32 + Send + Sync + 'static,
    {
        let state = HookState::new(user_data, row, self.registry.failure_log());
        let mut handle = CallbackHandle::new(HookKind::Exec, state)?;
        let out = unsafe {
            self.api
                .exec(self.db, sql, Some(exec_trampoline::<U, F>), handle.user_data())
        };
        handle.dispose();
        out
    }
}

use core::cmp::Ordering;
use core::ffi::c_void;
use std::sync::Arc;

use tracing::debug;

use crate::codec::decode_len;
use crate::error::{Error, Result};
use crate::handle::{CallbackHandle, HookKind, guard};
use crate::provider::{FeatureSet, Sqlite3Api};
use crate::registry::{FailureLog, HookKey};

use super::core::Connection;
use super::hooks::hook_state;

struct CollationState<U, F> {
    user_data: U,
    cmp: F,
    name: String,
    failures: Arc<FailureLog>,
}

fn ordering_code(ordering: Ordering) -> i32 {
    match ordering {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }
}

fn operand_len(len: i32) -> Result<usize> {
    usize::try_from(len)
        .map_err(|_| Error::Marshaling(format!("negative collation operand length {len}")))
}

unsafe fn operand_text<'a>(len: i32, ptr: *const c_void) -> Result<&'a str> {
    let len = operand_len(len)?;
    match unsafe { decode_len(ptr, len) }? {
        Some(text) => Ok(text),
        None if len == 0 => Ok(""),
        None => Err(Error::Marshaling("null collation operand".to_owned())),
    }
}

unsafe fn operand_bytes<'a>(len: i32, ptr: *const c_void) -> &'a [u8] {
    match operand_len(len) {
        Ok(len) if !ptr.is_null() => unsafe { core::slice::from_raw_parts(ptr as *const u8, len) },
        _ => &[],
    }
}

extern "C" fn collation_trampoline<U, F>(
    user_data: *mut c_void,
    len1: i32,
    s1: *const c_void,
    len2: i32,
    s2: *const c_void,
) -> i32
where
    U: Send + Sync + 'static,
    F: Fn(&U, &str, &str) -> Ordering + Send + Sync + 'static,
{
    let Some(state) = hook_state::<CollationState<U, F>>(user_data, HookKind::Collation) else {
        return 0;
    };
    let out = (|| {
        let lhs = unsafe { operand_text(len1, s1) }?;
        let rhs = unsafe { operand_text(len2, s2) }?;
        guard(|| Ok((state.cmp)(&state.user_data, lhs, rhs)))
    })();
    match out {
        Ok(ordering) => ordering_code(ordering),
        Err(err) => {
            state
                .failures
                .record(HookKind::Collation, Some(&state.name), err);
            // Keep the sort total: fall back to byte order.
            let (lhs, rhs) = unsafe { (operand_bytes(len1, s1), operand_bytes(len2, s2)) };
            ordering_code(lhs.cmp(rhs))
        }
    }
}

impl<'p, P: Sqlite3Api> Connection<'p, P> {
    /// Register a UTF-8 collation sequence, replacing any collation of the same name.
    ///
    /// Names match ASCII case-insensitively, as SQLite matches them.
    pub fn create_collation<U, F>(&self, name: &str, user_data: U, cmp: F) -> Result<()>
    where
        U: Send + Sync + 'static,
        F: Fn(&U, &str, &str) -> Ordering + Send + Sync + 'static,
    {
        self.require(FeatureSet::COLLATION, "create_collation unsupported")?;
        let state = CollationState {
            user_data,
            cmp,
            name: name.to_owned(),
            failures: self.registry.failure_log(),
        };
        let handle = CallbackHandle::new(HookKind::Collation, state)?;
        self.install(HookKey::Collation(name), Some(handle), |ud| unsafe {
            self.api
                .create_collation(self.db, name, ud, Some(collation_trampoline::<U, F>))
        })?;
        debug!(name, "collation registered");
        Ok(())
    }

    pub fn remove_collation(&self, name: &str) -> Result<()> {
        self.require(FeatureSet::COLLATION, "create_collation unsupported")?;
        self.install(HookKey::Collation(name), None, |ud| unsafe {
            self.api.create_collation(self.db, name, ud, None)
        })
    }
}

use core::any::Any;
use core::ffi::{c_char, c_void};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::codec::decode_required;
use crate::error::Result;
use crate::handle::{CallbackHandle, HookKind, HookState, contract_violation, guard, resolve_state};
use crate::provider::{FeatureSet, Sqlite3Hooks};
use crate::registry::{FailureLog, HookKey};

use super::core::Connection;

/// Decision returned by commit and progress hooks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookAction {
    Continue,
    /// Turn the commit into a rollback, or interrupt the running statement.
    Abort,
}

impl HookAction {
    pub const fn into_code(self) -> i32 {
        match self {
            HookAction::Continue => 0,
            HookAction::Abort => 1,
        }
    }
}

/// Row change reported by the update hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateAction {
    Insert,
    Update,
    Delete,
    Unknown(i32),
}

impl UpdateAction {
    pub const fn from_code(code: i32) -> Self {
        match code {
            18 => UpdateAction::Insert,
            23 => UpdateAction::Update,
            9 => UpdateAction::Delete,
            other => UpdateAction::Unknown(other),
        }
    }
}

/// Arguments of one update-hook invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpdateEvent<'a> {
    pub action: UpdateAction,
    pub db_name: &'a str,
    pub table: &'a str,
    pub rowid: i64,
}

pub(crate) fn hook_state<S: Any + Send + Sync>(user_data: *mut c_void, kind: HookKind) -> Option<Arc<S>> {
    match resolve_state::<S>(user_data) {
        Ok(state) => Some(state),
        Err(err) => {
            contract_violation(kind, &err);
            None
        }
    }
}

/// Unwrap an adapter outcome, recording the failure and answering `fallback`.
pub(crate) fn settle<R>(kind: HookKind, failures: &FailureLog, out: Result<R>, fallback: R) -> R {
    out.unwrap_or_else(|err| {
        failures.record(kind, None, err);
        fallback
    })
}

extern "C" fn update_trampoline<U, F>(
    user_data: *mut c_void,
    op: i32,
    db_name: *const c_char,
    table: *const c_char,
    rowid: i64,
) where
    U: Send + Sync + 'static,
    F: for<'a> Fn(&U, UpdateEvent<'a>) + Send + Sync + 'static,
{
    let Some(state) = hook_state::<HookState<U, F>>(user_data, HookKind::Update) else {
        return;
    };
    let out = (|| {
        let event = UpdateEvent {
            action: UpdateAction::from_code(op),
            db_name: unsafe { decode_required(db_name, "update database name") }?,
            table: unsafe { decode_required(table, "update table name") }?,
            rowid,
        };
        guard(|| {
            (state.callback)(&state.user_data, event);
            Ok(())
        })
    })();
    settle(HookKind::Update, &state.failures, out, ());
}

extern "C" fn commit_trampoline<U, F>(user_data: *mut c_void) -> i32
where
    U: Send + Sync + 'static,
    F: Fn(&U) -> HookAction + Send + Sync + 'static,
{
    let Some(state) = hook_state::<HookState<U, F>>(user_data, HookKind::Commit) else {
        return HookAction::Abort.into_code();
    };
    let out = guard(|| Ok((state.callback)(&state.user_data)));
    // A failed commit hook rolls the transaction back.
    settle(HookKind::Commit, &state.failures, out, HookAction::Abort).into_code()
}

extern "C" fn rollback_trampoline<U, F>(user_data: *mut c_void)
where
    U: Send + Sync + 'static,
    F: Fn(&U) + Send + Sync + 'static,
{
    let Some(state) = hook_state::<HookState<U, F>>(user_data, HookKind::Rollback) else {
        return;
    };
    let out = guard(|| {
        (state.callback)(&state.user_data);
        Ok(())
    });
    settle(HookKind::Rollback, &state.failures, out, ());
}

extern "C" fn trace_trampoline<U, F>(user_data: *mut c_void, sql: *const c_char)
where
    U: Send + Sync + 'static,
    F: Fn(&U, &str) + Send + Sync + 'static,
{
    let Some(state) = hook_state::<HookState<U, F>>(user_data, HookKind::Trace) else {
        return;
    };
    let out = unsafe { decode_required(sql, "trace sql") }.and_then(|sql| {
        guard(|| {
            (state.callback)(&state.user_data, sql);
            Ok(())
        })
    });
    settle(HookKind::Trace, &state.failures, out, ());
}

extern "C" fn profile_trampoline<U, F>(user_data: *mut c_void, sql: *const c_char, elapsed_ns: u64)
where
    U: Send + Sync + 'static,
    F: Fn(&U, &str, Duration) + Send + Sync + 'static,
{
    let Some(state) = hook_state::<HookState<U, F>>(user_data, HookKind::Profile) else {
        return;
    };
    let out = unsafe { decode_required(sql, "profile sql") }.and_then(|sql| {
        guard(|| {
            (state.callback)(&state.user_data, sql, Duration::from_nanos(elapsed_ns));
            Ok(())
        })
    });
    settle(HookKind::Profile, &state.failures, out, ());
}

extern "C" fn progress_trampoline<U, F>(user_data: *mut c_void) -> i32
where
    U: Send + Sync + 'static,
    F: Fn(&U) -> HookAction + Send + Sync + 'static,
{
    let Some(state) = hook_state::<HookState<U, F>>(user_data, HookKind::Progress) else {
        return HookAction::Abort.into_code();
    };
    let out = guard(|| Ok((state.callback)(&state.user_data)));
    // Fail closed: a broken progress handler interrupts the statement.
    settle(HookKind::Progress, &state.failures, out, HookAction::Abort).into_code()
}

impl<'p, P: Sqlite3Hooks> Connection<'p, P> {
    pub(crate) fn install_hook<S: Any + Send + Sync>(
        &self,
        kind: HookKind,
        state: S,
        register: impl FnOnce(*mut c_void) -> Result<()>,
    ) -> Result<()> {
        let handle = CallbackHandle::new(kind, state)?;
        self.install(HookKey::Hook(kind), Some(handle), register)?;
        debug!(kind = %kind, "hook registered");
        Ok(())
    }

    pub(crate) fn clear_hook(
        &self,
        kind: HookKind,
        unregister: impl FnOnce(*mut c_void) -> Result<()>,
    ) -> Result<()> {
        self.install(HookKey::Hook(kind), None, unregister)
    }

    /// Observe row inserts, updates and deletes on rowid tables.
    pub fn set_update_hook<U, F>(&self, user_data: U, f: F) -> Result<()>
    where
        U: Send + Sync + 'static,
        F: for<'a> Fn(&U, UpdateEvent<'a>) + Send + Sync + 'static,
    {
        let state = HookState::new(user_data, f, self.registry.failure_log());
        self.install_hook(HookKind::Update, state, |ud| unsafe {
            self.api
                .update_hook(self.db, Some(update_trampoline::<U, F>), ud)
        })
    }

    pub fn clear_update_hook(&self) -> Result<()> {
        self.clear_hook(HookKind::Update, |ud| unsafe {
            self.api.update_hook(self.db, None, ud)
        })
    }

    /// Called before each commit; [`HookAction::Abort`] turns it into a rollback.
    pub fn set_commit_hook<U, F>(&self, user_data: U, f: F) -> Result<()>
    where
        U: Send + Sync + 'static,
        F: Fn(&U) -> HookAction + Send + Sync + 'static,
    {
        let state = HookState::new(user_data, f, self.registry.failure_log());
        self.install_hook(HookKind::Commit, state, |ud| unsafe {
            self.api
                .commit_hook(self.db, Some(commit_trampoline::<U, F>), ud)
        })
    }

    pub fn clear_commit_hook(&self) -> Result<()> {
        self.clear_hook(HookKind::Commit, |ud| unsafe {
            self.api.commit_hook(self.db, None, ud)
        })
    }

    pub fn set_rollback_hook<U, F>(&self, user_data: U, f: F) -> Result<()>
    where
        U: Send + Sync + 'static,
        F: Fn(&U) + Send + Sync + 'static,
    {
        let state = HookState::new(user_data, f, self.registry.failure_log());
        self.install_hook(HookKind::Rollback, state, |ud| unsafe {
            self.api
                .rollback_hook(self.db, Some(rollback_trampoline::<U, F>), ud)
        })
    }

    pub fn clear_rollback_hook(&self) -> Result<()> {
        self.clear_hook(HookKind::Rollback, |ud| unsafe {
            self.api.rollback_hook(self.db, None, ud)
        })
    }

    /// Receive the text of each statement as it starts running.
    pub fn set_trace<U, F>(&self, user_data: U, f: F) -> Result<()>
    where
        U: Send + Sync + 'static,
        F: Fn(&U, &str) + Send + Sync + 'static,
    {
        self.require(FeatureSet::TRACE, "trace unsupported")?;
        let state = HookState::new(user_data, f, self.registry.failure_log());
        self.install_hook(HookKind::Trace, state, |ud| unsafe {
            self.api.trace(self.db, Some(trace_trampoline::<U, F>), ud)
        })
    }

    pub fn clear_trace(&self) -> Result<()> {
        self.require(FeatureSet::TRACE, "trace unsupported")?;
        self.clear_hook(HookKind::Trace, |ud| unsafe {
            self.api.trace(self.db, None, ud)
        })
    }

    /// Receive each finished statement with its wall-clock run time.
    pub fn set_profile<U, F>(&self, user_data: U, f: F) -> Result<()>
    where
        U: Send + Sync + 'static,
        F: Fn(&U, &str, Duration) + Send + Sync + 'static,
    {
        self.require(FeatureSet::PROFILE, "profile unsupported")?;
        let state = HookState::new(user_data, f, self.registry.failure_log());
        self.install_hook(HookKind::Profile, state, |ud| unsafe {
            self.api
                .profile(self.db, Some(profile_trampoline::<U, F>), ud)
        })
    }

    pub fn clear_profile(&self) -> Result<()> {
        self.require(FeatureSet::PROFILE, "profile unsupported")?;
        self.clear_hook(HookKind::Profile, |ud| unsafe {
            self.api.profile(self.db, None, ud)
        })
    }

    /// Called every `n_ops` virtual machine instructions; [`HookAction::Abort`]
    /// interrupts the running statement.
    pub fn set_progress_handler<U, F>(&self, n_ops: i32, user_data: U, f: F) -> Result<()>
    where
        U: Send + Sync + 'static,
        F: Fn(&U) -> HookAction + Send + Sync + 'static,
    {
        self.require(FeatureSet::PROGRESS, "progress_handler unsupported")?;
        let state = HookState::new(user_data, f, self.registry.failure_log());
        self.install_hook(HookKind::Progress, state, |ud| unsafe {
            self.api
                .progress_handler(self.db, n_ops, Some(progress_trampoline::<U, F>), ud)
        })
    }

    pub fn clear_progress_handler(&self) -> Result<()> {
        self.require(FeatureSet::PROGRESS, "progress_handler unsupported")?;
        self.clear_hook(HookKind::Progress, |ud| unsafe {
            self.api.progress_handler(self.db, 0, None, ud)
        })
    }
}

use core::any::Any;
use core::ffi::c_void;
use core::fmt;
use core::panic::AssertUnwindSafe;
use std::sync::Arc;

use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::registry::FailureLog;
use crate::token::{Token, resolve_shared, shared_tokens};

/// Kind of native hook a [`CallbackHandle`] was created for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HookKind {
    Collation,
    Scalar,
    Aggregate,
    Update,
    Commit,
    Rollback,
    Trace,
    Profile,
    Progress,
    Authorizer,
    Log,
    Exec,
}

impl HookKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            HookKind::Collation => "collation",
            HookKind::Scalar => "scalar",
            HookKind::Aggregate => "aggregate",
            HookKind::Update => "update",
            HookKind::Commit => "commit",
            HookKind::Rollback => "rollback",
            HookKind::Trace => "trace",
            HookKind::Profile => "profile",
            HookKind::Progress => "progress",
            HookKind::Authorizer => "authorizer",
            HookKind::Log => "log",
            HookKind::Exec => "exec",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owner of one token in the process-wide table.
///
/// The token is what SQLite receives as `void*` user data. Disposing the handle
/// releases the token exactly once; later callbacks carrying it fail to resolve.
pub struct CallbackHandle {
    kind: HookKind,
    token: Option<Token>,
}

impl CallbackHandle {
    pub(crate) fn new<S: Any + Send + Sync>(kind: HookKind, state: S) -> Result<Self> {
        let token = shared_tokens().create(Arc::new(state))?;
        debug!(kind = %kind, token = %token, "callback handle created");
        Ok(Self {
            kind,
            token: Some(token),
        })
    }

    pub fn kind(&self) -> HookKind {
        self.kind
    }

    /// Token while the handle is live.
    pub fn token(&self) -> Option<Token> {
        self.token
    }

    /// Opaque user data to hand to SQLite; null once disposed.
    pub fn user_data(&self) -> *mut c_void {
        self.token
            .map_or(core::ptr::null_mut(), Token::as_user_data)
    }

    pub fn is_disposed(&self) -> bool {
        self.token.is_none()
    }

    /// Release the token. Returns `false` when already disposed.
    pub fn dispose(&mut self) -> bool {
        let Some(token) = self.token.take() else {
            return false;
        };
        match shared_tokens().release(token) {
            Ok(_) => {
                debug!(kind = %self.kind, token = %token, "callback handle disposed");
                true
            }
            Err(err) => {
                error!(kind = %self.kind, error = %err, "callback handle lost its token");
                false
            }
        }
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackHandle")
            .field("kind", &self.kind)
            .field("token", &self.token)
            .finish()
    }
}

/// State behind hooks that carry only user data and a closure.
pub(crate) struct HookState<U, F> {
    pub(crate) user_data: U,
    pub(crate) callback: F,
    pub(crate) failures: Arc<FailureLog>,
}

impl<U, F> HookState<U, F> {
    pub(crate) fn new(user_data: U, callback: F, failures: Arc<FailureLog>) -> Self {
        Self {
            user_data,
            callback,
            failures,
        }
    }
}

/// Resolve the `void*` SQLite passed back into the state registered under it.
pub(crate) fn resolve_state<S: Any + Send + Sync>(user_data: *mut c_void) -> Result<Arc<S>> {
    let token = Token::from_user_data(user_data)
        .ok_or_else(|| Error::Marshaling("null callback user data".to_owned()))?;
    resolve_shared(token)
}

/// Run user code, turning a panic into a callback error.
pub(crate) fn guard<R>(f: impl FnOnce() -> Result<R>) -> Result<R> {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(out) => out,
        Err(payload) => Err(Error::callback(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panic in sqlite callback: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panic in sqlite callback: {msg}")
    } else {
        "panic in sqlite callback".to_owned()
    }
}

/// Report a callback whose user data could not be resolved.
pub(crate) fn contract_violation(kind: HookKind, err: &Error) {
    error!(kind = %kind, error = %err, "sqlite invoked a callback with unusable user data");
}

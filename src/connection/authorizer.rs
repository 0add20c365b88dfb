use core::ffi::{c_char, c_void};

use crate::codec::decode;
use crate::error::Result;
use crate::handle::{HookKind, HookState, guard};
use crate::provider::{FeatureSet, Sqlite3Hooks};

use super::core::Connection;
use super::hooks::{hook_state, settle};

macro_rules! authorizer_actions {
    ($($name:ident = $code:literal,)*) => {
        /// Operation the authorizer is asked to approve while a statement is prepared.
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        pub enum AuthorizerAction {
            $($name,)*
            /// Action code added by a newer SQLite.
            Unknown(i32),
        }

        impl AuthorizerAction {
            pub const fn from_code(code: i32) -> Self {
                match code {
                    $($code => AuthorizerAction::$name,)*
                    other => AuthorizerAction::Unknown(other),
                }
            }

            pub const fn code(self) -> i32 {
                match self {
                    $(AuthorizerAction::$name => $code,)*
                    AuthorizerAction::Unknown(code) => code,
                }
            }
        }
    };
}

authorizer_actions! {
    CreateIndex = 1,
    CreateTable = 2,
    CreateTempIndex = 3,
    CreateTempTable = 4,
    CreateTempTrigger = 5,
    CreateTempView = 6,
    CreateTrigger = 7,
    CreateView = 8,
    Delete = 9,
    DropIndex = 10,
    DropTable = 11,
    DropTempIndex = 12,
    DropTempTable = 13,
    DropTempTrigger = 14,
    DropTempView = 15,
    DropTrigger = 16,
    DropView = 17,
    Insert = 18,
    Pragma = 19,
    Read = 20,
    Select = 21,
    Transaction = 22,
    Update = 23,
    Attach = 24,
    Detach = 25,
    AlterTable = 26,
    Reindex = 27,
    Analyze = 28,
    CreateVTable = 29,
    DropVTable = 30,
    Function = 31,
    Savepoint = 32,
    Recursive = 33,
}

/// Authorizer decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthorizerResult {
    Ok,
    /// Treat the column as NULL (reads) or skip the action silently.
    Ignore,
    /// Fail the statement with an authorization error.
    Deny,
}

impl AuthorizerResult {
    pub const fn into_code(self) -> i32 {
        match self {
            AuthorizerResult::Ok => 0,
            AuthorizerResult::Deny => 1,
            AuthorizerResult::Ignore => 2,
        }
    }
}

/// Arguments of one authorizer invocation. Which of the optional names are
/// present depends on the action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuthorizerEvent<'a> {
    pub action: AuthorizerAction,
    pub arg1: Option<&'a str>,
    pub arg2: Option<&'a str>,
    pub db_name: Option<&'a str>,
    /// Innermost trigger or view responsible for the access, if any.
    pub trigger_or_view: Option<&'a str>,
}

extern "C" fn authorizer_trampoline<U, F>(
    user_data: *mut c_void,
    action: i32,
    arg1: *const c_char,
    arg2: *const c_char,
    db_name: *const c_char,
    trigger_or_view: *const c_char,
) -> i32
where
    U: Send + Sync + 'static,
    F: for<'a> Fn(&U, AuthorizerEvent<'a>) -> AuthorizerResult + Send + Sync + 'static,
{
    let Some(state) = hook_state::<HookState<U, F>>(user_data, HookKind::Authorizer) else {
        return AuthorizerResult::Deny.into_code();
    };
    let out = (|| {
        let event = AuthorizerEvent {
            action: AuthorizerAction::from_code(action),
            arg1: unsafe { decode(arg1) }?,
            arg2: unsafe { decode(arg2) }?,
            db_name: unsafe { decode(db_name) }?,
            trigger_or_view: unsafe { decode(trigger_or_view) }?,
        };
        guard(|| Ok((state.callback)(&state.user_data, event)))
    })();
    // Fail closed.
    settle(HookKind::Authorizer, &state.failures, out, AuthorizerResult::Deny).into_code()
}

impl<'p, P: Sqlite3Hooks> Connection<'p, P> {
    /// Approve or refuse each operation while statements are prepared.
    ///
    /// A callback that panics, or arguments that fail to decode, deny the action.
    pub fn set_authorizer<U, F>(&self, user_data: U, f: F) -> Result<()>
    where
        U: Send + Sync + 'static,
        F: for<'a> Fn(&U, AuthorizerEvent<'a>) -> AuthorizerResult + Send + Sync + 'static,
    {
        self.require(FeatureSet::AUTHORIZER, "set_authorizer unsupported")?;
        let state = HookState::new(user_data, f, self.registry.failure_log());
        self.install_hook(HookKind::Authorizer, state, |ud| unsafe {
            self.api
                .set_authorizer(self.db, Some(authorizer_trampoline::<U, F>), ud)
        })
    }

    pub fn clear_authorizer(&self) -> Result<()> {
        self.require(FeatureSet::AUTHORIZER, "set_authorizer unsupported")?;
        self.clear_hook(HookKind::Authorizer, |ud| unsafe {
            self.api.set_authorizer(self.db, None, ud)
        })
    }
}

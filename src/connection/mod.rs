mod authorizer;
mod collation;
mod core;
mod exec;
mod hooks;

pub use self::authorizer::{AuthorizerAction, AuthorizerEvent, AuthorizerResult};
pub use self::core::Connection;
pub use self::hooks::{HookAction, UpdateAction, UpdateEvent};
pub(crate) use self::hooks::{hook_state, settle};

//! Bridge between Rust closures and SQLite's C callback hooks.
//!
//! SQLite hands every hook an opaque `void*` and echoes it back on each call.
//! This crate never passes a pointer to Rust state there. It passes a
//! generation-checked [`Token`] instead, owned by a [`CallbackHandle`] that a
//! per-connection [`HookRegistry`] entry disposes when the hook is replaced or
//! the connection closes. A late call carrying a released token fails to
//! resolve instead of reaching freed memory.
//!
//! Native entry points come from a provider implementing [`Sqlite3Api`],
//! [`Sqlite3Hooks`] and [`Sqlite3Log`]; `sqlite-hook-bridge-sqlite3` loads them
//! from the system libsqlite3.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod codec;
mod connection;
mod error;
mod error_log;
mod function;
mod handle;
mod provider;
mod registry;
mod token;
mod value;

pub use crate::connection::{
    AuthorizerAction, AuthorizerEvent, AuthorizerResult, Connection, HookAction, UpdateAction,
    UpdateEvent,
};
pub use crate::error::{Error, ErrorCode, Result};
pub use crate::function::{AggregateContext, Context};
pub use crate::handle::{CallbackHandle, HookKind};
pub use crate::provider::{
    AuthorizerCallback, CollationCallback, CommitCallback, ExecCallback, FeatureSet,
    FunctionFlags, LogCallback, ProfileCallback, ProgressCallback, RawBytes, RollbackCallback,
    Sqlite3Api, Sqlite3Hooks, Sqlite3Log, TraceCallback, UpdateCallback, ValueType,
};
pub use crate::registry::{
    CallbackFailure, ConnectionHookSet, HookName, HookRegistry, HookSetRef, RegistryOptions,
};
pub use crate::token::{Token, TokenTable, is_live};
pub use crate::value::{Value, ValueRef};

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

use core::ffi::{c_char, c_void};
use core::ptr::NonNull;

use crate::error::{Error, Result};

macro_rules! flag_set {
    ($(#[$meta:meta])* $name:ident { $($(#[$doc:meta])* $flag:ident = $bit:expr,)* }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
        pub struct $name {
            bits: u32,
        }

        impl $name {
            $($(#[$doc])* pub const $flag: $name = $name { bits: $bit };)*

            pub const fn empty() -> Self {
                Self { bits: 0 }
            }

            pub const fn all() -> Self {
                Self { bits: 0 $(| $bit)* }
            }

            pub const fn from_bits(bits: u32) -> Self {
                Self { bits }
            }

            pub const fn bits(self) -> u32 {
                self.bits
            }

            /// Return whether every flag in `other` is set here.
            pub const fn contains(self, other: $name) -> bool {
                (self.bits & other.bits) == other.bits
            }
        }

        impl core::ops::BitOr for $name {
            type Output = $name;

            fn bitor(self, rhs: $name) -> $name {
                $name { bits: self.bits | rhs.bits }
            }
        }

        impl core::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: $name) {
                self.bits |= rhs.bits;
            }
        }

        impl core::ops::BitAnd for $name {
            type Output = $name;

            fn bitand(self, rhs: $name) -> $name {
                $name { bits: self.bits & rhs.bits }
            }
        }
    };
}

flag_set! {
    /// Optional hook entry points the loaded backend exports.
    FeatureSet {
        /// `sqlite3_create_collation_v2`.
        COLLATION = 1 << 0,
        /// `sqlite3_trace`.
        TRACE = 1 << 1,
        /// `sqlite3_profile`.
        PROFILE = 1 << 2,
        /// `sqlite3_progress_handler`.
        PROGRESS = 1 << 3,
        /// `sqlite3_set_authorizer`.
        AUTHORIZER = 1 << 4,
        /// `sqlite3_config(SQLITE_CONFIG_LOG, ...)`.
        LOG = 1 << 5,
    }
}

flag_set! {
    /// Function flags passed through to `create_function_v2`.
    FunctionFlags {
        /// Same inputs always produce the same output.
        DETERMINISTIC = 1 << 0,
        /// Only callable from top-level SQL.
        DIRECT_ONLY = 1 << 1,
        /// No side effects; usable from schema and triggers.
        INNOCUOUS = 1 << 2,
    }
}

/// SQLite storage class for a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueType {
    Null,
    Integer,
    Float,
    Text,
    Blob,
}

impl ValueType {
    /// Decode SQLite's integer storage-class code.
    pub const fn from_code(code: i32) -> ValueType {
        match code {
            1 => ValueType::Integer,
            2 => ValueType::Float,
            3 => ValueType::Text,
            4 => ValueType::Blob,
            _ => ValueType::Null,
        }
    }

    pub const fn to_code(self) -> i32 {
        match self {
            ValueType::Integer => 1,
            ValueType::Float => 2,
            ValueType::Text => 3,
            ValueType::Blob => 4,
            ValueType::Null => 5,
        }
    }
}

/// Raw view into bytes owned by SQLite for the duration of one callback.
#[derive(Clone, Copy, Debug)]
pub struct RawBytes {
    pub ptr: *const u8,
    pub len: usize,
}

impl RawBytes {
    pub const fn empty() -> Self {
        Self {
            ptr: core::ptr::null(),
            len: 0,
        }
    }

    /// # Safety
    /// Caller must ensure the pointer/length remain valid for `'a`.
    pub unsafe fn as_slice<'a>(self) -> &'a [u8] {
        if self.ptr.is_null() {
            return &[];
        }
        unsafe { core::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// # Safety
    /// Caller must ensure the pointer/length remain valid for `'a`.
    pub unsafe fn as_str<'a>(self) -> Option<&'a str> {
        core::str::from_utf8(unsafe { self.as_slice() }).ok()
    }
}

/// `int xCompare(void*, int, const void*, int, const void*)`
pub type CollationCallback = extern "C" fn(*mut c_void, i32, *const c_void, i32, *const c_void) -> i32;
/// `void xUpdate(void*, int op, const char* db, const char* table, sqlite3_int64 rowid)`
pub type UpdateCallback = extern "C" fn(*mut c_void, i32, *const c_char, *const c_char, i64);
/// `int xCommit(void*)`; non-zero turns the commit into a rollback.
pub type CommitCallback = extern "C" fn(*mut c_void) -> i32;
pub type RollbackCallback = extern "C" fn(*mut c_void);
pub type TraceCallback = extern "C" fn(*mut c_void, *const c_char);
/// `void xProfile(void*, const char* sql, sqlite3_uint64 nanoseconds)`
pub type ProfileCallback = extern "C" fn(*mut c_void, *const c_char, u64);
/// `int xProgress(void*)`; non-zero interrupts the running statement.
pub type ProgressCallback = extern "C" fn(*mut c_void) -> i32;
/// `int xAuth(void*, int action, const char*, const char*, const char* db, const char* trigger)`
pub type AuthorizerCallback = extern "C" fn(
    *mut c_void,
    i32,
    *const c_char,
    *const c_char,
    *const c_char,
    *const c_char,
) -> i32;
/// `void xLog(void*, int code, const char* message)`
pub type LogCallback = extern "C" fn(*mut c_void, i32, *const c_char);
/// `int xRow(void*, int n, char** values, char** names)`
pub type ExecCallback = extern "C" fn(*mut c_void, i32, *mut *mut c_char, *mut *mut c_char) -> i32;

/// Core SQLite entry points the bridge registers callbacks through.
///
/// # Safety
/// Implementations must pass `user_data` back verbatim to every callback they
/// invoke, and must never free or dereference it: the bridge owns it.
pub unsafe trait Sqlite3Api: Send + Sync + 'static {
    /// Backend's opaque `sqlite3*` type.
    type Db;
    /// Backend's opaque `sqlite3_value*` type.
    type Value;
    /// Backend's opaque `sqlite3_context*` type.
    type Context;

    /// Stable backend identifier used in diagnostics.
    fn backend_name(&self) -> &'static str;
    /// Optional entry points available through this provider.
    fn feature_set(&self) -> FeatureSet;

    /// Open a read-write connection, creating the file if needed.
    unsafe fn open(&self, filename: &str) -> Result<NonNull<Self::Db>>;
    /// Close a connection handle.
    unsafe fn close(&self, db: NonNull<Self::Db>) -> Result<()>;

    /// Register, replace or remove (all callbacks `None`) a function under `(name, n_args)`.
    ///
    /// No destructor is passed: the bridge disposes `user_data` itself when the
    /// registration is replaced or the connection closes.
    unsafe fn create_function(
        &self,
        db: NonNull<Self::Db>,
        name: &str,
        n_args: i32,
        flags: FunctionFlags,
        user_data: *mut c_void,
        x_func: Option<extern "C" fn(*mut Self::Context, i32, *mut *mut Self::Value)>,
        x_step: Option<extern "C" fn(*mut Self::Context, i32, *mut *mut Self::Value)>,
        x_final: Option<extern "C" fn(*mut Self::Context)>,
    ) -> Result<()>;

    /// Register, replace or remove (`cmp == None`) a UTF-8 collation sequence.
    unsafe fn create_collation(
        &self,
        _db: NonNull<Self::Db>,
        _name: &str,
        _user_data: *mut c_void,
        _cmp: Option<CollationCallback>,
    ) -> Result<()> {
        Err(Error::feature_unavailable("create_collation unsupported"))
    }

    /// Per-invocation aggregate scratch memory, zeroed on first allocation.
    ///
    /// With `bytes == 0` an already-allocated buffer is returned, otherwise null.
    unsafe fn aggregate_context(&self, ctx: NonNull<Self::Context>, bytes: usize) -> *mut c_void;
    /// User data passed at function registration.
    unsafe fn user_data(ctx: NonNull<Self::Context>) -> *mut c_void;
    /// Error result for a call whose registered state could not be resolved,
    /// so no provider reference is at hand.
    unsafe fn result_error_detached(ctx: NonNull<Self::Context>, msg: &str, code: i32);

    unsafe fn result_null(&self, ctx: NonNull<Self::Context>);
    unsafe fn result_int64(&self, ctx: NonNull<Self::Context>, v: i64);
    unsafe fn result_double(&self, ctx: NonNull<Self::Context>, v: f64);
    /// Implementations must copy `v`.
    unsafe fn result_text(&self, ctx: NonNull<Self::Context>, v: &str);
    /// Implementations must copy `v`.
    unsafe fn result_blob(&self, ctx: NonNull<Self::Context>, v: &[u8]);
    unsafe fn result_error(&self, ctx: NonNull<Self::Context>, msg: &str);
    /// Override the result code of an error result.
    unsafe fn result_error_code(&self, ctx: NonNull<Self::Context>, code: i32);

    unsafe fn value_type(&self, v: NonNull<Self::Value>) -> ValueType;
    unsafe fn value_int64(&self, v: NonNull<Self::Value>) -> i64;
    unsafe fn value_double(&self, v: NonNull<Self::Value>) -> f64;
    /// Raw text bytes valid until the callback returns.
    unsafe fn value_text(&self, v: NonNull<Self::Value>) -> RawBytes;
    /// Raw blob bytes valid until the callback returns.
    unsafe fn value_blob(&self, v: NonNull<Self::Value>) -> RawBytes;
}

/// Per-connection hooks. Passing `None` unregisters.
///
/// # Safety
/// Same user-data contract as [`Sqlite3Api`].
pub unsafe trait Sqlite3Hooks: Sqlite3Api {
    unsafe fn update_hook(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<UpdateCallback>,
        user_data: *mut c_void,
    ) -> Result<()>;
    unsafe fn commit_hook(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<CommitCallback>,
        user_data: *mut c_void,
    ) -> Result<()>;
    unsafe fn rollback_hook(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<RollbackCallback>,
        user_data: *mut c_void,
    ) -> Result<()>;
    unsafe fn trace(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<TraceCallback>,
        user_data: *mut c_void,
    ) -> Result<()>;
    unsafe fn profile(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<ProfileCallback>,
        user_data: *mut c_void,
    ) -> Result<()>;
    /// Invoke `callback` every `n_ops` virtual machine instructions.
    unsafe fn progress_handler(
        &self,
        db: NonNull<Self::Db>,
        n_ops: i32,
        callback: Option<ProgressCallback>,
        user_data: *mut c_void,
    ) -> Result<()>;
    unsafe fn set_authorizer(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<AuthorizerCallback>,
        user_data: *mut c_void,
    ) -> Result<()>;
    /// Run `sql`, invoking `callback` once per result row.
    unsafe fn exec(
        &self,
        db: NonNull<Self::Db>,
        sql: &str,
        callback: Option<ExecCallback>,
        user_data: *mut c_void,
    ) -> Result<()>;
}

/// Process-wide error log, configured before the library initializes.
///
/// # Safety
/// Same user-data contract as [`Sqlite3Api`].
pub unsafe trait Sqlite3Log: Sqlite3Api {
    unsafe fn config_log(&self, callback: Option<LogCallback>, user_data: *mut c_void)
    -> Result<()>;
}

//! Dynamic `libsqlite3` backend for `sqlite-hook-bridge`.

#![allow(non_camel_case_types)]

use libc::{c_char, c_int, c_uchar, c_void};
use sqlite_hook_bridge::codec::encode_str;
use sqlite_hook_bridge::{
    AuthorizerCallback, CollationCallback, CommitCallback, Error, ErrorCode, ExecCallback,
    FeatureSet, FunctionFlags, ProfileCallback, ProgressCallback, Result, RollbackCallback,
    TraceCallback, UpdateCallback,
};
use std::ffi::CStr;
use std::ptr::{NonNull, null_mut};
use std::sync::OnceLock;
use tracing::debug;

mod core_impl;
mod hooks_impl;

#[cfg(target_os = "linux")]
#[link(name = "dl")]
unsafe extern "C" {}

const SQLITE_OK: i32 = 0;
const SQLITE_TOOBIG: i32 = 18;

const SQLITE_OPEN_READWRITE: i32 = 0x0000_0002;
const SQLITE_OPEN_CREATE: i32 = 0x0000_0004;
const SQLITE_OPEN_URI: i32 = 0x0000_0040;

const SQLITE_CONFIG_LOG: i32 = 16;

const SQLITE_UTF8: i32 = 0x0000_0001;
const SQLITE_DETERMINISTIC: i32 = 0x0000_0800;
const SQLITE_INNOCUOUS: i32 = 0x0002_0000;
const SQLITE_DIRECTONLY: i32 = 0x0008_0000;

type sqlite3 = c_void;
type sqlite3_value = c_void;
type sqlite3_context = c_void;

/// `SQLITE_TRANSIENT`: SQLite copies the buffer before the call returns.
const SQLITE_TRANSIENT: isize = -1;
type sqlite3_destructor_type = isize;

type OpenV2 =
    unsafe extern "C" fn(*const c_char, *mut *mut sqlite3, c_int, *const c_char) -> c_int;
type CloseV2 = unsafe extern "C" fn(*mut sqlite3) -> c_int;
type ErrMsg = unsafe extern "C" fn(*mut sqlite3) -> *const c_char;
type ExtendedErrCode = unsafe extern "C" fn(*mut sqlite3) -> c_int;
type Free = unsafe extern "C" fn(*mut c_void);

type CreateFunctionV2 = unsafe extern "C" fn(
    *mut sqlite3,
    *const c_char,
    c_int,
    c_int,
    *mut c_void,
    Option<extern "C" fn(*mut sqlite3_context, c_int, *mut *mut sqlite3_value)>,
    Option<extern "C" fn(*mut sqlite3_context, c_int, *mut *mut sqlite3_value)>,
    Option<extern "C" fn(*mut sqlite3_context)>,
    Option<extern "C" fn(*mut c_void)>,
) -> c_int;
type CreateCollationV2 = unsafe extern "C" fn(
    *mut sqlite3,
    *const c_char,
    c_int,
    *mut c_void,
    Option<CollationCallback>,
    Option<extern "C" fn(*mut c_void)>,
) -> c_int;

type AggregateContext = unsafe extern "C" fn(*mut sqlite3_context, c_int) -> *mut c_void;
type ResultNull = unsafe extern "C" fn(*mut sqlite3_context);
type ResultInt64 = unsafe extern "C" fn(*mut sqlite3_context, i64);
type ResultDouble = unsafe extern "C" fn(*mut sqlite3_context, f64);
type ResultText =
    unsafe extern "C" fn(*mut sqlite3_context, *const c_char, c_int, sqlite3_destructor_type);
type ResultBlob =
    unsafe extern "C" fn(*mut sqlite3_context, *const c_void, c_int, sqlite3_destructor_type);
type ResultError = unsafe extern "C" fn(*mut sqlite3_context, *const c_char, c_int);
type ResultErrorCode = unsafe extern "C" fn(*mut sqlite3_context, c_int);
type UserData = unsafe extern "C" fn(*mut sqlite3_context) -> *mut c_void;

type ValueTypeFn = unsafe extern "C" fn(*mut sqlite3_value) -> c_int;
type ValueInt64Fn = unsafe extern "C" fn(*mut sqlite3_value) -> i64;
type ValueDoubleFn = unsafe extern "C" fn(*mut sqlite3_value) -> f64;
type ValueTextFn = unsafe extern "C" fn(*mut sqlite3_value) -> *const c_uchar;
type ValueBlobFn = unsafe extern "C" fn(*mut sqlite3_value) -> *const c_void;
type ValueBytesFn = unsafe extern "C" fn(*mut sqlite3_value) -> c_int;

type UpdateHook =
    unsafe extern "C" fn(*mut sqlite3, Option<UpdateCallback>, *mut c_void) -> *mut c_void;
type CommitHook =
    unsafe extern "C" fn(*mut sqlite3, Option<CommitCallback>, *mut c_void) -> *mut c_void;
type RollbackHook =
    unsafe extern "C" fn(*mut sqlite3, Option<RollbackCallback>, *mut c_void) -> *mut c_void;
type Trace = unsafe extern "C" fn(*mut sqlite3, Option<TraceCallback>, *mut c_void) -> *mut c_void;
type Profile =
    unsafe extern "C" fn(*mut sqlite3, Option<ProfileCallback>, *mut c_void) -> *mut c_void;
type ProgressHandler =
    unsafe extern "C" fn(*mut sqlite3, c_int, Option<ProgressCallback>, *mut c_void);
type SetAuthorizer =
    unsafe extern "C" fn(*mut sqlite3, Option<AuthorizerCallback>, *mut c_void) -> c_int;
type Exec = unsafe extern "C" fn(
    *mut sqlite3,
    *const c_char,
    Option<ExecCallback>,
    *mut c_void,
    *mut *mut c_char,
) -> c_int;
type Config = unsafe extern "C" fn(c_int, ...) -> c_int;

struct LibHandle {
    handle: *mut c_void,
}

unsafe impl Send for LibHandle {}
unsafe impl Sync for LibHandle {}

impl LibHandle {
    unsafe fn open() -> Option<Self> {
        for name in lib_names() {
            let cstr = unsafe { CStr::from_bytes_with_nul_unchecked(name) };
            let handle = unsafe { libc::dlopen(cstr.as_ptr(), libc::RTLD_LAZY | libc::RTLD_LOCAL) };
            if !handle.is_null() {
                return Some(Self { handle });
            }
        }
        None
    }

    unsafe fn symbol<T>(&self, name: &'static [u8]) -> Option<T>
    where
        T: Copy,
    {
        let sym = unsafe { libc::dlsym(self.handle, name.as_ptr() as *const c_char) };
        if sym.is_null() {
            None
        } else {
            debug_assert_eq!(std::mem::size_of::<T>(), std::mem::size_of::<*mut c_void>());
            Some(unsafe { std::mem::transmute_copy(&sym) })
        }
    }
}

struct LibSqlite3Fns {
    open_v2: OpenV2,
    close_v2: CloseV2,
    errmsg: ErrMsg,
    extended_errcode: Option<ExtendedErrCode>,
    free: Free,
    create_function_v2: CreateFunctionV2,
    create_collation_v2: Option<CreateCollationV2>,
    aggregate_context: AggregateContext,
    result_null: ResultNull,
    result_int64: ResultInt64,
    result_double: ResultDouble,
    result_text: ResultText,
    result_blob: ResultBlob,
    result_error: ResultError,
    result_error_code: ResultErrorCode,
    user_data: UserData,
    value_type: ValueTypeFn,
    value_int64: ValueInt64Fn,
    value_double: ValueDoubleFn,
    value_text: ValueTextFn,
    value_blob: ValueBlobFn,
    value_bytes: ValueBytesFn,
    update_hook: UpdateHook,
    commit_hook: CommitHook,
    rollback_hook: RollbackHook,
    trace: Option<Trace>,
    profile: Option<Profile>,
    progress_handler: Option<ProgressHandler>,
    set_authorizer: Option<SetAuthorizer>,
    exec: Exec,
    config: Option<Config>,
}

impl LibSqlite3Fns {
    unsafe fn load(lib: &LibHandle) -> Option<Self> {
        unsafe {
            Some(Self {
                open_v2: lib.symbol(b"sqlite3_open_v2\0")?,
                close_v2: lib.symbol(b"sqlite3_close_v2\0")?,
                errmsg: lib.symbol(b"sqlite3_errmsg\0")?,
                extended_errcode: lib.symbol(b"sqlite3_extended_errcode\0"),
                free: lib.symbol(b"sqlite3_free\0")?,
                create_function_v2: lib.symbol(b"sqlite3_create_function_v2\0")?,
                create_collation_v2: lib.symbol(b"sqlite3_create_collation_v2\0"),
                aggregate_context: lib.symbol(b"sqlite3_aggregate_context\0")?,
                result_null: lib.symbol(b"sqlite3_result_null\0")?,
                result_int64: lib.symbol(b"sqlite3_result_int64\0")?,
                result_double: lib.symbol(b"sqlite3_result_double\0")?,
                result_text: lib.symbol(b"sqlite3_result_text\0")?,
                result_blob: lib.symbol(b"sqlite3_result_blob\0")?,
                result_error: lib.symbol(b"sqlite3_result_error\0")?,
                result_error_code: lib.symbol(b"sqlite3_result_error_code\0")?,
                user_data: lib.symbol(b"sqlite3_user_data\0")?,
                value_type: lib.symbol(b"sqlite3_value_type\0")?,
                value_int64: lib.symbol(b"sqlite3_value_int64\0")?,
                value_double: lib.symbol(b"sqlite3_value_double\0")?,
                value_text: lib.symbol(b"sqlite3_value_text\0")?,
                value_blob: lib.symbol(b"sqlite3_value_blob\0")?,
                value_bytes: lib.symbol(b"sqlite3_value_bytes\0")?,
                update_hook: lib.symbol(b"sqlite3_update_hook\0")?,
                commit_hook: lib.symbol(b"sqlite3_commit_hook\0")?,
                rollback_hook: lib.symbol(b"sqlite3_rollback_hook\0")?,
                trace: lib.symbol(b"sqlite3_trace\0"),
                profile: lib.symbol(b"sqlite3_profile\0"),
                progress_handler: lib.symbol(b"sqlite3_progress_handler\0"),
                set_authorizer: lib.symbol(b"sqlite3_set_authorizer\0"),
                exec: lib.symbol(b"sqlite3_exec\0")?,
                config: lib.symbol(b"sqlite3_config\0"),
            })
        }
    }

    fn features(&self) -> FeatureSet {
        let mut features = FeatureSet::empty();
        if self.create_collation_v2.is_some() {
            features |= FeatureSet::COLLATION;
        }
        if self.trace.is_some() {
            features |= FeatureSet::TRACE;
        }
        if self.profile.is_some() {
            features |= FeatureSet::PROFILE;
        }
        if self.progress_handler.is_some() {
            features |= FeatureSet::PROGRESS;
        }
        if self.set_authorizer.is_some() {
            features |= FeatureSet::AUTHORIZER;
        }
        if self.config.is_some() {
            features |= FeatureSet::LOG;
        }
        features
    }
}

static USER_DATA_FN: OnceLock<UserData> = OnceLock::new();
static INSTANCE: OnceLock<Option<LibSqlite3>> = OnceLock::new();

/// Dynamic `libsqlite3` backend loaded via `dlopen`.
pub struct LibSqlite3 {
    fns: LibSqlite3Fns,
    features: FeatureSet,
    _lib: LibHandle,
}

impl LibSqlite3 {
    /// Load `libsqlite3` once and return the process-wide backend.
    ///
    /// Returns `None` if the library or a required symbol is unavailable.
    pub fn load() -> Option<&'static LibSqlite3> {
        INSTANCE
            .get_or_init(|| unsafe {
                let lib = LibHandle::open()?;
                let fns = LibSqlite3Fns::load(&lib)?;
                let features = fns.features();
                let _ = USER_DATA_FN.set(fns.user_data);
                debug!(features = features.bits(), "libsqlite3 loaded");
                Some(LibSqlite3 {
                    fns,
                    features,
                    _lib: lib,
                })
            })
            .as_ref()
    }

    fn error_from_rc(&self, rc: i32, db: Option<NonNull<sqlite3>>) -> Error {
        let message = db
            .and_then(|db| unsafe { raw_cstr((self.fns.errmsg)(db.as_ptr())) })
            .map(|c| c.to_string_lossy().into_owned());
        let extended = db.and_then(|db| {
            self.fns
                .extended_errcode
                .map(|f| unsafe { f(db.as_ptr()) })
        });
        Error::from_code(rc, message, extended)
    }

    fn check(&self, rc: i32, db: Option<NonNull<sqlite3>>) -> Result<()> {
        if rc == SQLITE_OK {
            Ok(())
        } else {
            Err(self.error_from_rc(rc, db))
        }
    }

    // Take ownership of an sqlite3_malloc'd error string.
    unsafe fn take_message(&self, ptr: *mut c_char) -> Option<String> {
        let message = unsafe { raw_cstr(ptr) }.map(|c| c.to_string_lossy().into_owned());
        if !ptr.is_null() {
            unsafe { (self.fns.free)(ptr as *mut c_void) };
        }
        message
    }
}

/// NUL-terminated copy of `text` for SQLite, rejecting interior NULs.
fn c_text(text: &str, what: &'static str) -> Result<Vec<u8>> {
    if text.as_bytes().contains(&0) {
        return Err(Error::with_message(
            ErrorCode::Misuse,
            format!("{what} contains NUL"),
        ));
    }
    Ok(encode_str(text))
}

fn map_function_flags(flags: FunctionFlags) -> i32 {
    let mut out = SQLITE_UTF8;
    if flags.contains(FunctionFlags::DETERMINISTIC) {
        out |= SQLITE_DETERMINISTIC;
    }
    if flags.contains(FunctionFlags::DIRECT_ONLY) {
        out |= SQLITE_DIRECTONLY;
    }
    if flags.contains(FunctionFlags::INNOCUOUS) {
        out |= SQLITE_INNOCUOUS;
    }
    out
}

/// Byte length as SQLite's `int`; `None` past `i32::MAX`.
fn c_len(len: usize) -> Option<c_int> {
    c_int::try_from(len).ok()
}

unsafe fn raw_cstr<'a>(ptr: *const c_char) -> Option<&'a CStr> {
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { CStr::from_ptr(ptr) })
    }
}

fn lib_names() -> &'static [&'static [u8]] {
    #[cfg(target_os = "macos")]
    const NAMES: [&[u8]; 3] = [
        b"libsqlite3.dylib\0",
        b"libsqlite3.so.0\0",
        b"libsqlite3.so\0",
    ];
    #[cfg(not(target_os = "macos"))]
    const NAMES: [&[u8]; 2] = [b"libsqlite3.so.0\0", b"libsqlite3.so\0"];
    &NAMES
}

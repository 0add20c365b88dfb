use super::*;
use sqlite_hook_bridge::{RawBytes, Sqlite3Api, ValueType};

unsafe fn raw_value(ptr: *const u8, len: c_int) -> RawBytes {
    if ptr.is_null() {
        return RawBytes::empty();
    }
    RawBytes {
        ptr,
        len: usize::try_from(len).unwrap_or(0),
    }
}

#[allow(unsafe_op_in_unsafe_fn)]
unsafe impl Sqlite3Api for LibSqlite3 {
    type Db = sqlite3;
    type Value = sqlite3_value;
    type Context = sqlite3_context;

    fn backend_name(&self) -> &'static str {
        "libsqlite3"
    }

    fn feature_set(&self) -> FeatureSet {
        self.features
    }

    unsafe fn open(&self, filename: &str) -> Result<NonNull<Self::Db>> {
        let filename = c_text(filename, "filename")?;
        let mut db = null_mut();
        let flags = SQLITE_OPEN_READWRITE | SQLITE_OPEN_CREATE | SQLITE_OPEN_URI;
        let rc = (self.fns.open_v2)(
            filename.as_ptr() as *const c_char,
            &mut db,
            flags,
            std::ptr::null(),
        );
        if rc != SQLITE_OK {
            let err = self.error_from_rc(rc, NonNull::new(db));
            if !db.is_null() {
                let _ = (self.fns.close_v2)(db);
            }
            return Err(err);
        }
        NonNull::new(db).ok_or_else(|| Error::with_message(ErrorCode::CantOpen, "null handle"))
    }

    unsafe fn close(&self, db: NonNull<Self::Db>) -> Result<()> {
        let rc = (self.fns.close_v2)(db.as_ptr());
        self.check(rc, None)
    }

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
    ) -> Result<()> {
        let name = c_text(name, "function name")?;
        let rc = (self.fns.create_function_v2)(
            db.as_ptr(),
            name.as_ptr() as *const c_char,
            n_args,
            map_function_flags(flags),
            user_data,
            x_func,
            x_step,
            x_final,
            None,
        );
        self.check(rc, Some(db))
    }

    unsafe fn create_collation(
        &self,
        db: NonNull<Self::Db>,
        name: &str,
        user_data: *mut c_void,
        cmp: Option<CollationCallback>,
    ) -> Result<()> {
        let Some(create) = self.fns.create_collation_v2 else {
            return Err(Error::feature_unavailable("create_collation_v2 not available"));
        };
        let name = c_text(name, "collation name")?;
        let rc = create(
            db.as_ptr(),
            name.as_ptr() as *const c_char,
            SQLITE_UTF8,
            user_data,
            cmp,
            None,
        );
        self.check(rc, Some(db))
    }

    unsafe fn aggregate_context(&self, ctx: NonNull<Self::Context>, bytes: usize) -> *mut c_void {
        match c_len(bytes) {
            Some(bytes) => (self.fns.aggregate_context)(ctx.as_ptr(), bytes),
            None => null_mut(),
        }
    }

    unsafe fn user_data(ctx: NonNull<Self::Context>) -> *mut c_void {
        match USER_DATA_FN.get() {
            Some(f) => f(ctx.as_ptr()),
            None => null_mut(),
        }
    }

    unsafe fn result_error_detached(ctx: NonNull<Self::Context>, msg: &str, code: i32) {
        if let Some(Some(lib)) = INSTANCE.get() {
            lib.result_error(ctx, msg);
            lib.result_error_code(ctx, code);
        }
    }

    unsafe fn result_null(&self, ctx: NonNull<Self::Context>) {
        (self.fns.result_null)(ctx.as_ptr());
    }

    unsafe fn result_int64(&self, ctx: NonNull<Self::Context>, v: i64) {
        (self.fns.result_int64)(ctx.as_ptr(), v);
    }

    unsafe fn result_double(&self, ctx: NonNull<Self::Context>, v: f64) {
        (self.fns.result_double)(ctx.as_ptr(), v);
    }

    unsafe fn result_text(&self, ctx: NonNull<Self::Context>, v: &str) {
        let Some(len) = c_len(v.len()) else {
            return (self.fns.result_error_code)(ctx.as_ptr(), SQLITE_TOOBIG);
        };
        (self.fns.result_text)(
            ctx.as_ptr(),
            v.as_ptr() as *const c_char,
            len,
            SQLITE_TRANSIENT,
        );
    }

    unsafe fn result_blob(&self, ctx: NonNull<Self::Context>, v: &[u8]) {
        let Some(len) = c_len(v.len()) else {
            return (self.fns.result_error_code)(ctx.as_ptr(), SQLITE_TOOBIG);
        };
        (self.fns.result_blob)(
            ctx.as_ptr(),
            v.as_ptr() as *const c_void,
            len,
            SQLITE_TRANSIENT,
        );
    }

    unsafe fn result_error(&self, ctx: NonNull<Self::Context>, msg: &str) {
        let Some(len) = c_len(msg.len()) else {
            return (self.fns.result_error_code)(ctx.as_ptr(), SQLITE_TOOBIG);
        };
        (self.fns.result_error)(ctx.as_ptr(), msg.as_ptr() as *const c_char, len);
    }

    unsafe fn result_error_code(&self, ctx: NonNull<Self::Context>, code: i32) {
        (self.fns.result_error_code)(ctx.as_ptr(), code);
    }

    unsafe fn value_type(&self, v: NonNull<Self::Value>) -> ValueType {
        ValueType::from_code((self.fns.value_type)(v.as_ptr()))
    }

    unsafe fn value_int64(&self, v: NonNull<Self::Value>) -> i64 {
        (self.fns.value_int64)(v.as_ptr())
    }

    unsafe fn value_double(&self, v: NonNull<Self::Value>) -> f64 {
        (self.fns.value_double)(v.as_ptr())
    }

    unsafe fn value_text(&self, v: NonNull<Self::Value>) -> RawBytes {
        // value_bytes must follow value_text so the length matches the UTF-8 form.
        let ptr = (self.fns.value_text)(v.as_ptr()) as *const u8;
        raw_value(ptr, (self.fns.value_bytes)(v.as_ptr()))
    }

    unsafe fn value_blob(&self, v: NonNull<Self::Value>) -> RawBytes {
        let ptr = (self.fns.value_blob)(v.as_ptr()) as *const u8;
        raw_value(ptr, (self.fns.value_bytes)(v.as_ptr()))
    }
}

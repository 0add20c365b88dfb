use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::ffi::{CString, c_char, c_void};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlite_hook_bridge::*;

#[derive(Clone, Debug, PartialEq)]
enum MockValue {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
}

#[derive(Clone, Debug, PartialEq)]
enum MockResult {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
    Error(String),
}

/// Scratch memory SQLite keeps per aggregation instance, shared by every
/// `sqlite3_context*` it hands out for that instance.
#[derive(Default)]
struct Scratch {
    slot: Option<Box<usize>>,
}

struct MockContext {
    user_data: *mut c_void,
    scratch: *mut Scratch,
    result: Option<MockResult>,
    error_code: Option<i32>,
}

impl MockContext {
    fn new(user_data: *mut c_void, scratch: &mut Scratch) -> Self {
        Self {
            user_data,
            scratch,
            result: None,
            error_code: None,
        }
    }
}

#[derive(Clone, Copy)]
struct FunctionRegistration {
    x_func: Option<extern "C" fn(*mut MockContext, i32, *mut *mut MockValue)>,
    x_step: Option<extern "C" fn(*mut MockContext, i32, *mut *mut MockValue)>,
    x_final: Option<extern "C" fn(*mut MockContext)>,
    user_data: *mut c_void,
}

#[derive(Clone, Copy)]
struct Registration<F> {
    callback: F,
    user_data: *mut c_void,
}

#[derive(Default)]
struct MockDb {
    functions: HashMap<(String, i32), FunctionRegistration>,
    collations: HashMap<String, Registration<CollationCallback>>,
    update: Option<Registration<UpdateCallback>>,
    commit: Option<Registration<CommitCallback>>,
    rollback: Option<Registration<RollbackCallback>>,
    trace: Option<Registration<TraceCallback>>,
    profile: Option<Registration<ProfileCallback>>,
    progress: Option<(i32, Registration<ProgressCallback>)>,
    authorizer: Option<Registration<AuthorizerCallback>>,
}

impl MockDb {
    fn function(&self, name: &str, n_args: i32) -> FunctionRegistration {
        self.functions[&(name.to_ascii_lowercase(), n_args)]
    }

    fn collation(&self, name: &str) -> Registration<CollationCallback> {
        self.collations[&name.to_ascii_lowercase()]
    }
}

/// Runs inside `close` once the handle is gone, with the address SQLite is
/// free to hand to the next connection.
type Reopen = Box<dyn FnOnce(NonNull<MockDb>) + Send>;

struct MockApi {
    features: FeatureSet,
    fail_registration: Mutex<bool>,
    exec_rows: Mutex<Vec<Vec<Option<String>>>>,
    log: Mutex<Option<(LogCallback, usize)>>,
    closes: AtomicUsize,
    reopen_on_close: Mutex<Option<Reopen>>,
}

impl MockApi {
    fn new(features: FeatureSet) -> Self {
        Self {
            features,
            fail_registration: Mutex::new(false),
            exec_rows: Mutex::new(Vec::new()),
            log: Mutex::new(None),
            closes: AtomicUsize::new(0),
            reopen_on_close: Mutex::new(None),
        }
    }

    fn set_rows(&self, rows: Vec<Vec<Option<&str>>>) {
        *self.exec_rows.lock().unwrap() = rows
            .into_iter()
            .map(|row| row.into_iter().map(|v| v.map(str::to_owned)).collect())
            .collect();
    }

    fn registration_result(&self) -> Result<()> {
        if *self.fail_registration.lock().unwrap() {
            Err(Error::from_code(5, Some("database is locked".to_owned()), None))
        } else {
            Ok(())
        }
    }

    fn emit_log(&self, code: i32, message: &str) {
        let message = CString::new(message).unwrap();
        if let Some((callback, user_data)) = *self.log.lock().unwrap() {
            callback(user_data as *mut c_void, code, message.as_ptr());
        }
    }
}

unsafe fn db<'a>(db: NonNull<MockDb>) -> &'a mut MockDb {
    unsafe { &mut *db.as_ptr() }
}

unsafe fn ctx<'a>(ctx: NonNull<MockContext>) -> &'a mut MockContext {
    unsafe { &mut *ctx.as_ptr() }
}

fn registration<F>(callback: Option<F>, user_data: *mut c_void) -> Option<Registration<F>> {
    callback.map(|callback| Registration { callback, user_data })
}

unsafe impl Sqlite3Api for MockApi {
    type Db = MockDb;
    type Value = MockValue;
    type Context = MockContext;

    fn backend_name(&self) -> &'static str {
        "mock"
    }

    fn feature_set(&self) -> FeatureSet {
        self.features
    }

    unsafe fn open(&self, _filename: &str) -> Result<NonNull<Self::Db>> {
        Ok(NonNull::from(Box::leak(Box::new(MockDb::default()))))
    }

    unsafe fn close(&self, db: NonNull<Self::Db>) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        // Closing with an open transaction rolls it back.
        if let Some(rollback) = unsafe { self::db(db) }.rollback {
            (rollback.callback)(rollback.user_data);
        }
        let reopen = self.reopen_on_close.lock().unwrap().take();
        match reopen {
            // The allocator hands the same address to the next open.
            Some(reopen) => {
                unsafe { *db.as_ptr() = MockDb::default() };
                reopen(db);
            }
            None => drop(unsafe { Box::from_raw(db.as_ptr()) }),
        }
        Ok(())
    }

    unsafe fn create_function(
        &self,
        db: NonNull<Self::Db>,
        name: &str,
        n_args: i32,
        _flags: FunctionFlags,
        user_data: *mut c_void,
        x_func: Option<extern "C" fn(*mut Self::Context, i32, *mut *mut Self::Value)>,
        x_step: Option<extern "C" fn(*mut Self::Context, i32, *mut *mut Self::Value)>,
        x_final: Option<extern "C" fn(*mut Self::Context)>,
    ) -> Result<()> {
        self.registration_result()?;
        let db = unsafe { self::db(db) };
        let key = (name.to_ascii_lowercase(), n_args);
        if x_func.is_none() && x_step.is_none() {
            db.functions.remove(&key);
        } else {
            db.functions.insert(
                key,
                FunctionRegistration {
                    x_func,
                    x_step,
                    x_final,
                    user_data,
                },
            );
        }
        Ok(())
    }

    unsafe fn create_collation(
        &self,
        db: NonNull<Self::Db>,
        name: &str,
        user_data: *mut c_void,
        cmp: Option<CollationCallback>,
    ) -> Result<()> {
        self.registration_result()?;
        let db = unsafe { self::db(db) };
        let key = name.to_ascii_lowercase();
        match registration(cmp, user_data) {
            Some(reg) => db.collations.insert(key, reg),
            None => db.collations.remove(&key),
        };
        Ok(())
    }

    unsafe fn aggregate_context(&self, ctx: NonNull<Self::Context>, bytes: usize) -> *mut c_void {
        let scratch = unsafe { &mut *self::ctx(ctx).scratch };
        if scratch.slot.is_none() && bytes > 0 {
            scratch.slot = Some(Box::new(0));
        }
        scratch
            .slot
            .as_deref_mut()
            .map_or(std::ptr::null_mut(), |slot| slot as *mut usize as *mut c_void)
    }

    unsafe fn user_data(ctx: NonNull<Self::Context>) -> *mut c_void {
        unsafe { self::ctx(ctx).user_data }
    }

    unsafe fn result_error_detached(ctx: NonNull<Self::Context>, msg: &str, code: i32) {
        let ctx = unsafe { self::ctx(ctx) };
        ctx.result = Some(MockResult::Error(msg.to_owned()));
        ctx.error_code = Some(code);
    }

    unsafe fn result_null(&self, ctx: NonNull<Self::Context>) {
        unsafe { self::ctx(ctx).result = Some(MockResult::Null) }
    }

    unsafe fn result_int64(&self, ctx: NonNull<Self::Context>, v: i64) {
        unsafe { self::ctx(ctx).result = Some(MockResult::Integer(v)) }
    }

    unsafe fn result_double(&self, ctx: NonNull<Self::Context>, v: f64) {
        unsafe { self::ctx(ctx).result = Some(MockResult::Float(v)) }
    }

    unsafe fn result_text(&self, ctx: NonNull<Self::Context>, v: &str) {
        unsafe { self::ctx(ctx).result = Some(MockResult::Text(v.to_owned())) }
    }

    unsafe fn result_blob(&self, ctx: NonNull<Self::Context>, v: &[u8]) {
        unsafe { self::ctx(ctx).result = Some(MockResult::Blob(v.to_vec())) }
    }

    unsafe fn result_error(&self, ctx: NonNull<Self::Context>, msg: &str) {
        unsafe { self::ctx(ctx).result = Some(MockResult::Error(msg.to_owned())) }
    }

    unsafe fn result_error_code(&self, ctx: NonNull<Self::Context>, code: i32) {
        unsafe { self::ctx(ctx).error_code = Some(code) }
    }

    unsafe fn value_type(&self, v: NonNull<Self::Value>) -> ValueType {
        match unsafe { v.as_ref() } {
            MockValue::Null => ValueType::Null,
            MockValue::Integer(_) => ValueType::Integer,
            MockValue::Float(_) => ValueType::Float,
            MockValue::Text(_) => ValueType::Text,
            MockValue::Blob(_) => ValueType::Blob,
        }
    }

    unsafe fn value_int64(&self, v: NonNull<Self::Value>) -> i64 {
        match unsafe { v.as_ref() } {
            MockValue::Integer(v) => *v,
            _ => 0,
        }
    }

    unsafe fn value_double(&self, v: NonNull<Self::Value>) -> f64 {
        match unsafe { v.as_ref() } {
            MockValue::Float(v) => *v,
            MockValue::Integer(v) => *v as f64,
            _ => 0.0,
        }
    }

    unsafe fn value_text(&self, v: NonNull<Self::Value>) -> RawBytes {
        match unsafe { v.as_ref() } {
            MockValue::Text(v) => RawBytes {
                ptr: v.as_ptr(),
                len: v.len(),
            },
            _ => RawBytes::empty(),
        }
    }

    unsafe fn value_blob(&self, v: NonNull<Self::Value>) -> RawBytes {
        match unsafe { v.as_ref() } {
            MockValue::Blob(v) => RawBytes {
                ptr: v.as_ptr(),
                len: v.len(),
            },
            _ => RawBytes::empty(),
        }
    }
}

unsafe impl Sqlite3Hooks for MockApi {
    unsafe fn update_hook(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<UpdateCallback>,
        user_data: *mut c_void,
    ) -> Result<()> {
        unsafe { self::db(db).update = registration(callback, user_data) };
        Ok(())
    }

    unsafe fn commit_hook(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<CommitCallback>,
        user_data: *mut c_void,
    ) -> Result<()> {
        unsafe { self::db(db).commit = registration(callback, user_data) };
        Ok(())
    }

    unsafe fn rollback_hook(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<RollbackCallback>,
        user_data: *mut c_void,
    ) -> Result<()> {
        unsafe { self::db(db).rollback = registration(callback, user_data) };
        Ok(())
    }

    unsafe fn trace(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<TraceCallback>,
        user_data: *mut c_void,
    ) -> Result<()> {
        unsafe { self::db(db).trace = registration(callback, user_data) };
        Ok(())
    }

    unsafe fn profile(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<ProfileCallback>,
        user_data: *mut c_void,
    ) -> Result<()> {
        unsafe { self::db(db).profile = registration(callback, user_data) };
        Ok(())
    }

    unsafe fn progress_handler(
        &self,
        db: NonNull<Self::Db>,
        n_ops: i32,
        callback: Option<ProgressCallback>,
        user_data: *mut c_void,
    ) -> Result<()> {
        unsafe { self::db(db).progress = registration(callback, user_data).map(|reg| (n_ops, reg)) };
        Ok(())
    }

    unsafe fn set_authorizer(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<AuthorizerCallback>,
        user_data: *mut c_void,
    ) -> Result<()> {
        self.registration_result()?;
        unsafe { self::db(db).authorizer = registration(callback, user_data) };
        Ok(())
    }

    unsafe fn exec(
        &self,
        _db: NonNull<Self::Db>,
        _sql: &str,
        callback: Option<ExecCallback>,
        user_data: *mut c_void,
    ) -> Result<()> {
        let rows = std::mem::take(&mut *self.exec_rows.lock().unwrap());
        let Some(callback) = callback else {
            return Ok(());
        };
        for row in rows {
            let names: Vec<CString> = (0..row.len())
                .map(|i| CString::new(format!("c{i}")).unwrap())
                .collect();
            let values: Vec<Option<CString>> = row
                .iter()
                .map(|v| v.as_deref().map(|v| CString::new(v).unwrap()))
                .collect();
            let mut name_ptrs: Vec<*mut c_char> =
                names.iter().map(|n| n.as_ptr() as *mut c_char).collect();
            let mut value_ptrs: Vec<*mut c_char> = values
                .iter()
                .map(|v| v.as_ref().map_or(std::ptr::null_mut(), |v| v.as_ptr() as *mut c_char))
                .collect();
            let rc = callback(
                user_data,
                row.len() as i32,
                value_ptrs.as_mut_ptr(),
                name_ptrs.as_mut_ptr(),
            );
            if rc != 0 {
                return Err(Error::from_code(4, Some("query aborted".to_owned()), None));
            }
        }
        Ok(())
    }
}

unsafe impl Sqlite3Log for MockApi {
    unsafe fn config_log(&self, callback: Option<LogCallback>, user_data: *mut c_void) -> Result<()> {
        self.registration_result()?;
        *self.log.lock().unwrap() = callback.map(|callback| (callback, user_data as usize));
        Ok(())
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn open_conn<'p>(api: &'p MockApi, registry: &'p HookRegistry) -> Connection<'p, MockApi> {
    init_tracing();
    Connection::open(api, registry, ":memory:").unwrap()
}

fn mock_db<'a>(conn: &Connection<'_, MockApi>) -> &'a mut MockDb {
    unsafe { db(conn.raw_handle()) }
}

fn call_scalar(reg: FunctionRegistration, args: &mut [MockValue]) -> MockContext {
    let mut scratch = Scratch::default();
    let mut ctx = MockContext::new(reg.user_data, &mut scratch);
    let mut argv: Vec<*mut MockValue> = args.iter_mut().map(|v| v as *mut MockValue).collect();
    (reg.x_func.unwrap())(&mut ctx, argv.len() as i32, argv.as_mut_ptr());
    ctx
}

fn call_step(reg: FunctionRegistration, scratch: &mut Scratch, arg: MockValue) -> MockContext {
    let mut arg = arg;
    let mut argv = vec![&mut arg as *mut MockValue];
    let mut ctx = MockContext::new(reg.user_data, scratch);
    (reg.x_step.unwrap())(&mut ctx, 1, argv.as_mut_ptr());
    ctx
}

fn call_final(reg: FunctionRegistration, scratch: &mut Scratch) -> MockContext {
    let mut ctx = MockContext::new(reg.user_data, scratch);
    (reg.x_final.unwrap())(&mut ctx);
    ctx
}

fn token_of(conn: &Connection<'_, MockApi>, find: impl Fn(&ConnectionHookSet) -> Option<Token>) -> Token {
    find(&conn.hooks().lock()).unwrap()
}

fn register_total(conn: &Connection<'_, MockApi>) {
    conn.create_aggregate_function(
        "total",
        1,
        FunctionFlags::empty(),
        (),
        || 0i64,
        |agg, _, args| {
            *agg.state() += args[0].as_i64().unwrap_or(0);
            Ok(())
        },
        |agg, _| {
            let total = *agg.state();
            agg.sink().result_int64(total);
            Ok(())
        },
    )
    .unwrap();
}

#[test]
fn scalar_function_multiplies_by_user_data() {
    let api = MockApi::new(FeatureSet::all());
    let registry = HookRegistry::new();
    let conn = open_conn(&api, &registry);

    conn.create_scalar_function("double", 1, FunctionFlags::DETERMINISTIC, 2i64, |ctx, k, args| {
        ctx.result_int64(args[0].as_i64().unwrap_or(0) * k);
        Ok(())
    })
    .unwrap();

    let reg = mock_db(&conn).function("double", 1);
    assert_eq!(
        call_scalar(reg, &mut [MockValue::Integer(42)]).result,
        Some(MockResult::Integer(84))
    );
    assert_eq!(
        call_scalar(reg, &mut [MockValue::Integer(5)]).result,
        Some(MockResult::Integer(10))
    );
}

#[test]
fn scalar_receives_registered_user_data() {
    let api = MockApi::new(FeatureSet::all());
    let registry = HookRegistry::new();
    let conn = open_conn(&api, &registry);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = seen.clone();

    conn.create_scalar_function("double", 1, FunctionFlags::empty(), 42i64, move |ctx, ud, args| {
        recorder.lock().unwrap().push((*ud, args[0].to_owned()));
        ctx.result_int64(args[0].as_i64().unwrap_or(0) * 2);
        Ok(())
    })
    .unwrap();

    let ctx = call_scalar(mock_db(&conn).function("double", 1), &mut [MockValue::Integer(5)]);
    assert_eq!(ctx.result, Some(MockResult::Integer(10)));
    assert_eq!(*seen.lock().unwrap(), [(42, Value::Integer(5))]);
}

#[test]
fn scalar_arguments_decode_every_storage_class() {
    let api = MockApi::new(FeatureSet::all());
    let registry = HookRegistry::new();
    let conn = open_conn(&api, &registry);
    let seen = Arc::new(Mutex::new(Vec::new()));

    conn.create_scalar_function("echo", -1, FunctionFlags::empty(), seen.clone(), |ctx, seen, args| {
        seen.lock().unwrap().extend(args.iter().map(ValueRef::to_owned));
        ctx.result_value(args.last().map_or(Value::Null, ValueRef::to_owned));
        Ok(())
    })
    .unwrap();

    let reg = mock_db(&conn).function("echo", -1);
    let ctx = call_scalar(
        reg,
        &mut [
            MockValue::Null,
            MockValue::Integer(1),
            MockValue::Float(1.5),
            MockValue::Text("héllo".to_owned()),
            MockValue::Blob(vec![0, 1, 2]),
        ],
    );
    assert_eq!(ctx.result, Some(MockResult::Blob(vec![0, 1, 2])));
    assert_eq!(
        *seen.lock().unwrap(),
        [
            Value::Null,
            Value::Integer(1),
            Value::Float(1.5),
            Value::Text("héllo".to_owned()),
            Value::Blob(vec![0, 1, 2]),
        ]
    );
}

#[test]
fn scalar_failure_sets_error_result() {
    let api = MockApi::new(FeatureSet::all());
    let registry = HookRegistry::new();
    let conn = open_conn(&api, &registry);

    conn.create_scalar_function("fail", 0, FunctionFlags::empty(), (), |_, _, _| {
        Err(Error::callback_with_code(ErrorCode::Constraint, "nope"))
    })
    .unwrap();
    conn.create_scalar_function("panics", 0, FunctionFlags::empty(), (), |_, _, _| {
        panic!("kaboom")
    })
    .unwrap();

    let ctx = call_scalar(mock_db(&conn).function("fail", 0), &mut []);
    assert!(matches!(ctx.result, Some(MockResult::Error(ref msg)) if msg.contains("nope")));
    assert_eq!(ctx.error_code, Some(ErrorCode::Constraint.code()));

    let ctx = call_scalar(mock_db(&conn).function("panics", 0), &mut []);
    assert!(matches!(ctx.result, Some(MockResult::Error(ref msg)) if msg.contains("kaboom")));

    let failures = registry.take_failures();
    assert_eq!(failures.len(), 2);
    assert_eq!(failures[0].kind, HookKind::Scalar);
    assert_eq!(failures[0].name.as_deref(), Some("fail"));
    assert!(registry.failures().is_empty());
}

#[test]
fn aggregate_rebinds_context_across_calls() {
    let api = MockApi::new(FeatureSet::all());
    let registry = HookRegistry::new();
    let conn = open_conn(&api, &registry);
    // Address of the aggregate context each call receives.
    let seen = Arc::new(Mutex::new(Vec::<usize>::new()));
    conn.create_aggregate_function(
        "total",
        1,
        FunctionFlags::empty(),
        seen.clone(),
        || 0i64,
        |agg, seen, args| {
            seen.lock().unwrap().push(agg as *const _ as usize);
            *agg.state() += args[0].as_i64().unwrap_or(0);
            Ok(())
        },
        |agg, seen| {
            seen.lock().unwrap().push(agg as *const _ as usize);
            let total = *agg.state();
            agg.sink().result_int64(total);
            Ok(())
        },
    )
    .unwrap();

    let reg = mock_db(&conn).function("total", 1);
    let mut scratch = Scratch::default();
    // A fresh sqlite3_context* per call, one scratch slot for the instance.
    for v in [1, 2, 3] {
        let ctx = call_step(reg, &mut scratch, MockValue::Integer(v));
        assert_eq!(ctx.result, None);
    }
    let token = Token::from_raw(**scratch.slot.as_ref().unwrap()).unwrap();
    assert!(is_live(token));

    let ctx = call_final(reg, &mut scratch);
    assert_eq!(ctx.result, Some(MockResult::Integer(6)));
    assert!(!is_live(token));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 4);
    assert!(seen.iter().all(|&agg| agg == seen[0]));
}

#[test]
fn aggregate_instances_are_independent() {
    let api = MockApi::new(FeatureSet::all());
    let registry = HookRegistry::new();
    let conn = open_conn(&api, &registry);
    register_total(&conn);

    let reg = mock_db(&conn).function("total", 1);
    let mut a = Scratch::default();
    let mut b = Scratch::default();
    call_step(reg, &mut a, MockValue::Integer(10));
    call_step(reg, &mut b, MockValue::Integer(1));
    call_step(reg, &mut a, MockValue::Integer(5));

    assert_eq!(call_final(reg, &mut b).result, Some(MockResult::Integer(1)));
    assert_eq!(call_final(reg, &mut a).result, Some(MockResult::Integer(15)));
}

#[test]
fn aggregate_final_without_rows_uses_initial_state() {
    let api = MockApi::new(FeatureSet::all());
    let registry = HookRegistry::new();
    let conn = open_conn(&api, &registry);
    register_total(&conn);

    let reg = mock_db(&conn).function("total", 1);
    let mut scratch = Scratch::default();
    assert_eq!(call_final(reg, &mut scratch).result, Some(MockResult::Integer(0)));
}

#[test]
fn aggregate_second_final_reports_invalid_token() {
    let api = MockApi::new(FeatureSet::all());
    let registry = HookRegistry::new();
    let conn = open_conn(&api, &registry);
    register_total(&conn);

    let reg = mock_db(&conn).function("total", 1);
    let mut scratch = Scratch::default();
    call_step(reg, &mut scratch, MockValue::Integer(4));
    assert_eq!(call_final(reg, &mut scratch).result, Some(MockResult::Integer(4)));

    let ctx = call_final(reg, &mut scratch);
    assert!(matches!(ctx.result, Some(MockResult::Error(_))));
    assert_eq!(ctx.error_code, Some(ErrorCode::Misuse.code()));

    let ctx = call_step(reg, &mut scratch, MockValue::Integer(1));
    assert!(matches!(ctx.result, Some(MockResult::Error(_))));

    let failures = registry.take_failures();
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().all(|f| f.error.is_invalid_token()));
    assert!(failures.iter().all(|f| f.kind == HookKind::Aggregate));
}

#[test]
fn aggregate_step_failure_surfaces_error() {
    let api = MockApi::new(FeatureSet::all());
    let registry = HookRegistry::new();
    let conn = open_conn(&api, &registry);
    conn.create_aggregate_function(
        "strict",
        1,
        FunctionFlags::empty(),
        (),
        Vec::<String>::new,
        |agg, _, args| match args[0].as_str() {
            Some(s) => {
                agg.state().push(s.to_owned());
                Ok(())
            }
            None => Err(Error::callback("text required")),
        },
        |agg, _| {
            agg.sink().result_text(&agg.state().join(","));
            Ok(())
        },
    )
    .unwrap();

    let reg = mock_db(&conn).function("strict", 1);
    let mut scratch = Scratch::default();
    call_step(reg, &mut scratch, MockValue::Text("a".to_owned()));
    let ctx = call_step(reg, &mut scratch, MockValue::Integer(1));
    assert_eq!(ctx.result, Some(MockResult::Error("text required".to_owned())));
    call_step(reg, &mut scratch, MockValue::Text("b".to_owned()));
    assert_eq!(
        call_final(reg, &mut scratch).result,
        Some(MockResult::Text("a,b".to_owned()))
    );
}

#[test]
fn functions_share_one_namespace_per_arity() {
    let api = MockApi::new(FeatureSet::all());
    let registry = HookRegistry::new();
    let conn = open_conn(&api, &registry);

    conn.create_scalar_function("total", 1, FunctionFlags::empty(), (), |ctx, _, _| {
        ctx.result_null();
        Ok(())
    })
    .unwrap();
    let scalar = token_of(&conn, |set| set.function("total", 1)?.token());
    register_total(&conn);
    let aggregate = token_of(&conn, |set| set.function("TOTAL", 1)?.token());

    assert!(!is_live(scalar));
    assert!(is_live(aggregate));
    assert_eq!(conn.hooks().lock().function("total", 1).unwrap().kind(), HookKind::Aggregate);

    conn.create_scalar_function("total", 2, FunctionFlags::empty(), (), |ctx, _, _| {
        ctx.result_null();
        Ok(())
    })
    .unwrap();
    assert!(is_live(aggregate));
    assert_eq!(conn.hooks().lock().len(), 2);
}

#[test]
fn remove_function_disposes_handle() {
    let api = MockApi::new(FeatureSet::all());
    let registry = HookRegistry::new();
    let conn = open_conn(&api, &registry);
    register_total(&conn);
    let token = token_of(&conn, |set| set.function("total", 1)?.token());

    conn.remove_function("Total", 1).unwrap();
    assert!(!is_live(token));
    assert!(conn.hooks().lock().is_empty());
    assert!(mock_db(&conn).functions.is_empty());
}

#[test]
fn stale_function_call_fails_safely() {
    let api = MockApi::new(FeatureSet::all());
    let registry = HookRegistry::new();
    let conn = open_conn(&api, &registry);
    conn.create_scalar_function("f", 0, FunctionFlags::empty(), (), |ctx, _, _| {
        ctx.result_int64(1);
        Ok(())
    })
    .unwrap();
    let stale = mock_db(&conn).function("f", 0);
    conn.remove_function("f", 0).unwrap();

    // SQLite still holding the old user data must not reach freed state.
    let ctx = call_scalar(stale, &mut []);
    assert!(matches!(ctx.result, Some(MockResult::Error(ref msg)) if msg.contains("invalid")));
    assert_eq!(ctx.error_code, Some(ErrorCode::Misuse.code()));
}

#[test]
fn stale_aggregate_call_reports_misuse() {
    let api = MockApi::new(FeatureSet::all());
    let registry = HookRegistry::new();
    let conn = open_conn(&api, &registry);
    register_total(&conn);
    let stale = mock_db(&conn).function("total", 1);
    conn.remove_function("total", 1).unwrap();

    let mut scratch = Scratch::default();
    let ctx = call_step(stale, &mut scratch, MockValue::Integer(1));
    assert_eq!(ctx.error_code, Some(ErrorCode::Misuse.code()));
    assert!(scratch.slot.is_none());
    let ctx = call_final(stale, &mut scratch);
    assert!(matches!(ctx.result, Some(MockResult::Error(_))));
    assert_eq!(ctx.error_code, Some(ErrorCode::Misuse.code()));
}

#[test]
fn collation_replacement_invalidates_previous_token() {
    let api = MockApi::new(FeatureSet::all());
    let registry = HookRegistry::new();
    let conn = open_conn(&api, &registry);

    conn.create_collation("nocase2", (), |_, a: &str, b: &str| {
        a.to_lowercase().cmp(&b.to_lowercase())
    })
    .unwrap();
    let first = token_of(&conn, |set| set.collation("NOCASE2")?.token());
    let stale = mock_db(&conn).collation("nocase2");

    conn.create_collation("NoCase2", (), |_, a: &str, b: &str| b.cmp(a))
        .unwrap();
    let second = token_of(&conn, |set| set.collation("nocase2")?.token());
    assert_ne!(first, second);
    assert!(!is_live(first));
    assert!(is_live(second));
    assert_eq!(conn.hooks().lock().len(), 1);

    let reg = mock_db(&conn).collation("nocase2");
    let (a, b) = ("a", "b");
    let cmp = (reg.callback)(
        reg.user_data,
        a.len() as i32,
        a.as_ptr() as *const c_void,
        b.len() as i32,
        b.as_ptr() as *const c_void,
    );
    assert_eq!(cmp, 1);

    // The stale token no longer resolves; ordering falls back without panicking.
    let _ = (stale.callback)(
        stale.user_data,
        a.len() as i32,
        a.as_ptr() as *const c_void,
        b.len() as i32,
        b.as_ptr() as *const c_void,
    );
}

#[test]
fn collation_panic_falls_back_to_byte_order() {
    let api = MockApi::new(FeatureSet::all());
    let registry = HookRegistry::new();
    let conn = open_conn(&api, &registry);
    conn.create_collation("broken", (), |_, _: &str, _: &str| -> CmpOrdering {
        panic!("no order")
    })
    .unwrap();

    let reg = mock_db(&conn).collation("broken");
    let (a, b) = ("abc", "abd");
    let cmp = (reg.callback)(
        reg.user_data,
        a.len() as i32,
        a.as_ptr() as *const c_void,
        b.len() as i32,
        b.as_ptr() as *const c_void,
    );
    assert_eq!(cmp, -1);
    let failures = registry.take_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].kind, HookKind::Collation);
    assert_eq!(failures[0].name.as_deref(), Some("broken"));
}

#[test]
fn collation_requires_feature() {
    let api = MockApi::new(FeatureSet::empty());
    let registry = HookRegistry::new();
    let conn = open_conn(&api, &registry);
    let err = conn
        .create_collation("x", (), |_, a: &str, b: &str| a.cmp(b))
        .unwrap_err();
    assert!(matches!(err, Error::FeatureUnavailable(_)));
    assert!(conn.hooks().lock().is_empty());
}

#[test]
fn failed_registration_disposes_new_handle() {
    let api = MockApi::new(FeatureSet::all());
    let registry = HookRegistry::new();
    let conn = open_conn(&api, &registry);
    *api.fail_registration.lock().unwrap() = true;

    let err = conn
        .create_scalar_function("f", 0, FunctionFlags::empty(), (), |_, _, _| Ok(()))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Busy);
    assert!(conn.hooks().lock().function("f", 0).is_none());
    assert!(conn.hooks().lock().is_empty());
}

#[test]
fn close_disposes_every_handle() {
    let api = MockApi::new(FeatureSet::all());
    let registry = HookRegistry::new();
    let conn = open_conn(&api, &registry);
    register_total(&conn);
    conn.create_collation("c", (), |_, a: &str, b: &str| a.cmp(b))
        .unwrap();
    conn.set_commit_hook((), |_| HookAction::Continue).unwrap();
    conn.set_trace((), |_, _| {}).unwrap();

    let tokens: Vec<Token> = {
        let hooks = conn.hooks();
        let set = hooks.lock();
        vec![
            set.function("total", 1).and_then(CallbackHandle::token).unwrap(),
            set.collation("c").and_then(CallbackHandle::token).unwrap(),
            set.hook(HookKind::Commit).and_then(CallbackHandle::token).unwrap(),
            set.hook(HookKind::Trace).and_then(CallbackHandle::token).unwrap(),
        ]
    };
    assert_eq!(registry.connection_count(), 1);

    conn.close().unwrap();
    assert!(tokens.iter().all(|&t| !is_live(t)));
    assert_eq!(registry.connection_count(), 0);
    assert_eq!(api.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn close_leaves_reused_address_to_the_next_connection() {
    init_tracing();
    let api: &'static MockApi = Box::leak(Box::new(MockApi::new(FeatureSet::all())));
    let registry: &'static HookRegistry = Box::leak(Box::new(HookRegistry::new()));
    let old = Connection::open(api, registry, ":memory:").unwrap();
    old.set_commit_hook((), |_| HookAction::Continue).unwrap();
    let old_token = token_of(&old, |set| set.hook(HookKind::Commit)?.token());
    let addr = old.raw_handle();

    // Another connection opens at the freed address before close finishes.
    *api.reopen_on_close.lock().unwrap() = Some(Box::new(move |db| {
        let next = unsafe { Connection::from_raw(api, registry, db) };
        next.set_commit_hook((), |_| HookAction::Abort).unwrap();
        std::mem::forget(next);
    }));
    old.close().unwrap();

    assert!(!is_live(old_token));
    assert_eq!(registry.connection_count(), 1);
    let new_token = registry
        .get(addr)
        .unwrap()
        .lock()
        .hook(HookKind::Commit)
        .and_then(CallbackHandle::token)
        .unwrap();
    assert!(is_live(new_token));
    let commit = unsafe { db(addr) }.commit.unwrap();
    assert_eq!((commit.callback)(commit.user_data), 1);

    unsafe { Connection::from_raw(api, registry, addr) }
        .close()
        .unwrap();
    assert!(!is_live(new_token));
    assert_eq!(registry.connection_count(), 0);
}

#[test]
fn drop_closes_once_and_hooks_run_during_close() {
    let api = MockApi::new(FeatureSet::all());
    let registry = HookRegistry::new();
    let rollbacks = Arc::new(AtomicUsize::new(0));
    {
        let conn = open_conn(&api, &registry);
        conn.set_rollback_hook(rollbacks.clone(), |n| {
            n.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
    assert_eq!(api.closes.load(Ordering::SeqCst), 1);
    assert_eq!(registry.connection_count(), 0);
    assert!(registry.failures().is_empty());
}

#[test]
fn connections_keep_separate_hook_sets() {
    let api = MockApi::new(FeatureSet::all());
    let registry = HookRegistry::new();
    let a = open_conn(&api, &registry);
    let b = open_conn(&api, &registry);
    register_total(&a);
    register_total(&b);
    let token_b = token_of(&b, |set| set.function("total", 1)?.token());

    a.close().unwrap();
    assert!(is_live(token_b));
    assert_eq!(registry.connection_count(), 1);
    assert!(registry.contains(b.raw_handle()));
}

#[test]
fn commit_hook_panic_aborts() {
    let api = MockApi::new(FeatureSet::all());
    let registry = HookRegistry::new();
    let conn = open_conn(&api, &registry);
    let commits = Arc::new(AtomicUsize::new(0));

    conn.set_commit_hook(commits.clone(), |n| {
        n.fetch_add(1, Ordering::SeqCst);
        HookAction::Continue
    })
    .unwrap();
    let hook = mock_db(&conn).commit.unwrap();
    assert_eq!((hook.callback)(hook.user_data), 0);
    assert_eq!(commits.load(Ordering::SeqCst), 1);

    conn.set_commit_hook((), |_| panic!("commit hook")).unwrap();
    let hook = mock_db(&conn).commit.unwrap();
    assert_eq!((hook.callback)(hook.user_data), 1);
    assert_eq!(registry.take_failures()[0].kind, HookKind::Commit);

    conn.clear_commit_hook().unwrap();
    assert!(mock_db(&conn).commit.is_none());
    assert!(conn.hooks().lock().hook(HookKind::Commit).is_none());
}

#[test]
fn authorizer_fails_closed() {
    let api = MockApi::new(FeatureSet::all());
    let registry = HookRegistry::new();
    let conn = open_conn(&api, &registry);
    let seen = Arc::new(Mutex::new(Vec::new()));

    conn.set_authorizer(seen.clone(), |seen, event| {
        seen.lock().unwrap().push((event.action, event.arg1.map(str::to_owned), event.db_name.map(str::to_owned)));
        if event.arg1 == Some("secret") {
            AuthorizerResult::Deny
        } else if event.arg1 == Some("boom") {
            panic!("authorizer")
        } else {
            AuthorizerResult::Ignore
        }
    })
    .unwrap();
    let auth = mock_db(&conn).authorizer.unwrap();
    let table = |name: &str| CString::new(name).unwrap();
    let main = table("main");
    let call = |arg1: &CString| {
        (auth.callback)(
            auth.user_data,
            AuthorizerAction::Read.code(),
            arg1.as_ptr(),
            std::ptr::null(),
            main.as_ptr(),
            std::ptr::null(),
        )
    };

    assert_eq!(call(&table("plain")), AuthorizerResult::Ignore.into_code());
    assert_eq!(call(&table("secret")), AuthorizerResult::Deny.into_code());
    assert_eq!(call(&table("boom")), AuthorizerResult::Deny.into_code());
    assert_eq!(
        seen.lock().unwrap()[0],
        (AuthorizerAction::Read, Some("plain".to_owned()), Some("main".to_owned()))
    );
    assert_eq!(registry.take_failures().len(), 1);

    conn.clear_authorizer().unwrap();
    assert!(mock_db(&conn).authorizer.is_none());
}

#[test]
fn progress_handler_can_interrupt() {
    let api = MockApi::new(FeatureSet::all());
    let registry = HookRegistry::new();
    let conn = open_conn(&api, &registry);
    let ticks = Arc::new(AtomicUsize::new(0));

    conn.set_progress_handler(100, ticks.clone(), |ticks| {
        if ticks.fetch_add(1, Ordering::SeqCst) >= 2 {
            HookAction::Abort
        } else {
            HookAction::Continue
        }
    })
    .unwrap();
    let (n_ops, hook) = mock_db(&conn).progress.unwrap();
    assert_eq!(n_ops, 100);
    let codes: Vec<i32> = (0..3).map(|_| (hook.callback)(hook.user_data)).collect();
    assert_eq!(codes, [0, 0, 1]);

    conn.clear_progress_handler().unwrap();
    assert!(mock_db(&conn).progress.is_none());
}

#[test]
fn update_trace_and_profile_decode_arguments() {
    let api = MockApi::new(FeatureSet::all());
    let registry = HookRegistry::new();
    let conn = open_conn(&api, &registry);
    let events = Arc::new(Mutex::new(Vec::new()));

    conn.set_update_hook(events.clone(), |events, event| {
        events.lock().unwrap().push(format!(
            "{:?} {}.{} {}",
            event.action, event.db_name, event.table, event.rowid
        ));
    })
    .unwrap();
    conn.set_trace(events.clone(), |events, sql| {
        events.lock().unwrap().push(format!("trace {sql}"));
    })
    .unwrap();
    conn.set_profile(events.clone(), |events, sql, elapsed| {
        assert_eq!(elapsed, Duration::from_micros(3));
        events.lock().unwrap().push(format!("profile {sql}"));
    })
    .unwrap();

    let db = mock_db(&conn);
    let main = CString::new("main").unwrap();
    let users = CString::new("users").unwrap();
    let sql = CString::new("DELETE FROM users").unwrap();
    let update = db.update.unwrap();
    (update.callback)(update.user_data, 9, main.as_ptr(), users.as_ptr(), 42);
    (update.callback)(update.user_data, 18, main.as_ptr(), users.as_ptr(), 43);
    let trace = db.trace.unwrap();
    (trace.callback)(trace.user_data, sql.as_ptr());
    let profile = db.profile.unwrap();
    (profile.callback)(profile.user_data, sql.as_ptr(), 3_000);
    // A null table name is a contract violation: recorded, not delivered.
    (update.callback)(update.user_data, 23, main.as_ptr(), std::ptr::null(), 44);

    assert_eq!(
        *events.lock().unwrap(),
        [
            "Delete main.users 42",
            "Insert main.users 43",
            "trace DELETE FROM users",
            "profile DELETE FROM users",
        ]
    );
    let failures = registry.take_failures();
    assert_eq!(failures.len(), 1);
    assert!(matches!(failures[0].error, Error::Marshaling(_)));

    conn.clear_update_hook().unwrap();
    conn.clear_trace().unwrap();
    conn.clear_profile().unwrap();
    assert!(conn.hooks().lock().is_empty());
}

#[test]
fn optional_hooks_require_features() {
    let api = MockApi::new(FeatureSet::COLLATION);
    let registry = HookRegistry::new();
    let conn = open_conn(&api, &registry);

    assert!(matches!(conn.set_trace((), |_, _| {}), Err(Error::FeatureUnavailable(_))));
    assert!(matches!(
        conn.set_profile((), |_, _, _| {}),
        Err(Error::FeatureUnavailable(_))
    ));
    assert!(matches!(
        conn.set_progress_handler(1, (), |_| HookAction::Continue),
        Err(Error::FeatureUnavailable(_))
    ));
    assert!(matches!(
        conn.set_authorizer((), |_, _| AuthorizerResult::Ok),
        Err(Error::FeatureUnavailable(_))
    ));
    assert!(matches!(
        registry.config_log(&api, (), |_, _, _| {}),
        Err(Error::FeatureUnavailable(_))
    ));
    // Core hooks need no optional entry point.
    conn.set_update_hook((), |_, _| {}).unwrap();
}

#[test]
fn exec_delivers_rows_and_propagates_abort() {
    let api = MockApi::new(FeatureSet::all());
    let registry = HookRegistry::new();
    let conn = open_conn(&api, &registry);
    let rows = Arc::new(Mutex::new(Vec::new()));

    api.set_rows(vec![vec![Some("1"), None], vec![Some("2"), Some("b")]]);
    conn.exec_with("SELECT id, name FROM t", rows.clone(), |rows, values, names| {
        assert_eq!(names, [Some("c0"), Some("c1")]);
        rows.lock()
            .unwrap()
            .push(values.iter().map(|v| v.map(str::to_owned)).collect::<Vec<_>>());
        0
    })
    .unwrap();
    assert_eq!(
        *rows.lock().unwrap(),
        [
            vec![Some("1".to_owned()), None],
            vec![Some("2".to_owned()), Some("b".to_owned())],
        ]
    );

    let calls = Arc::new(AtomicUsize::new(0));
    api.set_rows(vec![vec![Some("x")], vec![Some("y")]]);
    let err = conn
        .exec_with("SELECT v FROM t", calls.clone(), |calls, _, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            1
        })
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Abort);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // The row callback state is transient.
    assert_eq!(Arc::strong_count(&calls), 1);
    assert!(conn.hooks().lock().is_empty());
}

#[test]
fn exec_row_panic_stops_execution() {
    let api = MockApi::new(FeatureSet::all());
    let registry = HookRegistry::new();
    let conn = open_conn(&api, &registry);
    api.set_rows(vec![vec![Some("x")]]);

    let err = conn
        .exec_with("SELECT v FROM t", (), |_, _, _| panic!("row"))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Abort);
    assert_eq!(registry.take_failures()[0].kind, HookKind::Exec);
}

#[test]
fn log_hook_replaces_and_clears() {
    let api = MockApi::new(FeatureSet::all());
    let registry = HookRegistry::new();
    let first = Arc::new(Mutex::new(Vec::new()));
    let second = Arc::new(Mutex::new(Vec::new()));

    registry
        .config_log(&api, first.clone(), |log, code, msg| {
            log.lock().unwrap().push((code, msg.to_owned()));
        })
        .unwrap();
    api.emit_log(14, "cannot open file");

    registry
        .config_log(&api, second.clone(), |log, code, msg| {
            log.lock().unwrap().push((code, msg.to_owned()));
        })
        .unwrap();
    api.emit_log(28, "schema changed");
    assert_eq!(Arc::strong_count(&first), 1);

    assert_eq!(*first.lock().unwrap(), [(14, "cannot open file".to_owned())]);
    assert_eq!(*second.lock().unwrap(), [(28, "schema changed".to_owned())]);

    assert!(registry.has_log());
    registry.clear_log(&api).unwrap();
    assert!(!registry.has_log());
    assert!(api.log.lock().unwrap().is_none());
    assert_eq!(Arc::strong_count(&second), 1);
}

#[test]
fn failure_log_is_bounded() {
    let api = MockApi::new(FeatureSet::all());
    let registry = HookRegistry::with_options(RegistryOptions::default().with_failure_capacity(2));
    let conn = open_conn(&api, &registry);
    conn.create_scalar_function("fail", 1, FunctionFlags::empty(), (), |_, _, args| {
        Err(Error::callback(format!("bad {}", args[0].as_i64().unwrap_or(0))))
    })
    .unwrap();

    let reg = mock_db(&conn).function("fail", 1);
    for v in 0..5 {
        call_scalar(reg, &mut [MockValue::Integer(v)]);
    }
    let failures = registry.failures();
    assert_eq!(failures.len(), 2);
    assert_eq!(failures[1].error.to_string(), "bad 4");
}

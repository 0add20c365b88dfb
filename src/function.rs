use core::any::Any;
use core::marker::PhantomData;
use core::mem::size_of;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use smallvec::SmallVec;
use tracing::{debug, error, trace};

use crate::connection::Connection;
use crate::error::{Error, ErrorCode, Result};
use crate::handle::{CallbackHandle, HookKind, contract_violation, guard, resolve_state};
use crate::lock;
use crate::provider::{FunctionFlags, Sqlite3Api, ValueType};
use crate::registry::{FailureLog, HookKey};
use crate::token::{SharedState, Token, is_live, resolve_shared, shared_tokens};
use crate::value::{Value, ValueRef};

/// Result sink bound to the native context pointer of one call.
pub struct Context<'a, P: Sqlite3Api> {
    api: &'a P,
    ctx: NonNull<P::Context>,
}

impl<'a, P: Sqlite3Api> Context<'a, P> {
    pub(crate) fn new(api: &'a P, ctx: NonNull<P::Context>) -> Self {
        Self { api, ctx }
    }

    /// Native context pointer this sink writes to.
    pub fn raw_context(&self) -> NonNull<P::Context> {
        self.ctx
    }

    pub fn result_null(&self) {
        unsafe { self.api.result_null(self.ctx) }
    }

    pub fn result_int64(&self, v: i64) {
        unsafe { self.api.result_int64(self.ctx, v) }
    }

    pub fn result_double(&self, v: f64) {
        unsafe { self.api.result_double(self.ctx, v) }
    }

    pub fn result_text(&self, v: &str) {
        unsafe { self.api.result_text(self.ctx, v) }
    }

    pub fn result_blob(&self, v: &[u8]) {
        unsafe { self.api.result_blob(self.ctx, v) }
    }

    pub fn result_error(&self, msg: &str) {
        unsafe { self.api.result_error(self.ctx, msg) }
    }

    pub fn result_error_code(&self, code: ErrorCode) {
        unsafe { self.api.result_error_code(self.ctx, code.code()) }
    }

    pub fn result_value(&self, value: Value) {
        match value {
            Value::Null => self.result_null(),
            Value::Integer(v) => self.result_int64(v),
            Value::Float(v) => self.result_double(v),
            Value::Text(v) => self.result_text(&v),
            Value::Blob(v) => self.result_blob(&v),
        }
    }

    /// Surface `err` as the error of the query that invoked the function.
    pub(crate) fn result_failure(&self, err: &Error) {
        self.result_error(&err.to_string());
        self.result_error_code(err.code());
    }
}

/// Provider reference stored in callback state that must be `'static`.
///
/// The connection that registered the state borrows the provider for at least
/// as long as the registration lives.
pub(crate) struct ApiPtr<P>(NonNull<P>);

impl<P> ApiPtr<P> {
    pub(crate) fn new(api: &P) -> Self {
        ApiPtr(NonNull::from(api))
    }

    /// # Safety
    /// The provider must still be alive.
    pub(crate) unsafe fn get<'a>(&self) -> &'a P {
        unsafe { self.0.as_ref() }
    }
}

impl<P> Clone for ApiPtr<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P> Copy for ApiPtr<P> {}

unsafe impl<P: Sync> Send for ApiPtr<P> {}
unsafe impl<P: Sync> Sync for ApiPtr<P> {}

type Args<'a> = SmallVec<[ValueRef<'a>; 8]>;

unsafe fn value_ref_from_raw<'a, P: Sqlite3Api>(api: &P, value: NonNull<P::Value>) -> ValueRef<'a> {
    match unsafe { api.value_type(value) } {
        ValueType::Null => ValueRef::Null,
        ValueType::Integer => ValueRef::Integer(unsafe { api.value_int64(value) }),
        ValueType::Float => ValueRef::Float(unsafe { api.value_double(value) }),
        ValueType::Text => unsafe { ValueRef::from_raw_text(api.value_text(value)) },
        ValueType::Blob => unsafe { ValueRef::from_raw_blob(api.value_blob(value)) },
    }
}

/// Decode `argv[..argc]`; null entries read as SQL NULL.
unsafe fn args_from_raw<'a, P: Sqlite3Api>(
    api: &P,
    argc: i32,
    argv: *mut *mut P::Value,
) -> Args<'a> {
    let argc = usize::try_from(argc).unwrap_or(0);
    if argc == 0 || argv.is_null() {
        return Args::new();
    }
    let values = unsafe { core::slice::from_raw_parts(argv, argc) };
    values
        .iter()
        .map(|&value| match NonNull::new(value) {
            Some(value) => unsafe { value_ref_from_raw(api, value) },
            None => ValueRef::Null,
        })
        .collect()
}

/// State registered for one function; resolved from `sqlite3_user_data`.
///
/// An unresolvable token becomes the error of the invoking query.
fn function_state<P: Sqlite3Api, S: Any + Send + Sync>(
    ctx: NonNull<P::Context>,
    kind: HookKind,
) -> Option<Arc<S>> {
    match resolve_state::<S>(unsafe { P::user_data(ctx) }) {
        Ok(state) => Some(state),
        Err(err) => {
            contract_violation(kind, &err);
            unsafe { P::result_error_detached(ctx, &err.to_string(), err.code().code()) };
            None
        }
    }
}

fn report<P: Sqlite3Api>(
    context: &Context<'_, P>,
    kind: HookKind,
    name: &str,
    failures: &FailureLog,
    err: Error,
) {
    if err.is_invalid_token() {
        contract_violation(kind, &err);
    }
    context.result_failure(&err);
    failures.record(kind, Some(name), err);
}

struct ScalarState<P, U, F> {
    api: ApiPtr<P>,
    user_data: U,
    func: F,
    name: String,
    failures: Arc<FailureLog>,
}

extern "C" fn scalar_trampoline<P, U, F>(ctx: *mut P::Context, argc: i32, argv: *mut *mut P::Value)
where
    P: Sqlite3Api,
    U: Send + Sync + 'static,
    F: for<'a> Fn(&Context<'a, P>, &U, &[ValueRef<'a>]) -> Result<()> + Send + Sync + 'static,
{
    let Some(ctx) = NonNull::new(ctx) else {
        return;
    };
    let Some(state) = function_state::<P, ScalarState<P, U, F>>(ctx, HookKind::Scalar) else {
        return;
    };
    let api = unsafe { state.api.get() };
    let context = Context::new(api, ctx);
    let args = unsafe { args_from_raw(api, argc, argv) };
    if let Err(err) = guard(|| (state.func)(&context, &state.user_data, args.as_slice())) {
        report(&context, HookKind::Scalar, &state.name, &state.failures, err);
    }
}

/// Managed state of one aggregation, shared by every step call and the final call.
///
/// SQLite may pass a different `sqlite3_context*` on each call for the same
/// aggregation; [`AggregateContext::sink`] always targets the current call's pointer.
pub struct AggregateContext<P: Sqlite3Api, T> {
    api: ApiPtr<P>,
    native: AtomicPtr<P::Context>,
    state: Mutex<T>,
}

impl<P: Sqlite3Api, T> AggregateContext<P, T> {
    fn new(api: ApiPtr<P>, native: NonNull<P::Context>, state: T) -> Self {
        Self {
            api,
            native: AtomicPtr::new(native.as_ptr()),
            state: Mutex::new(state),
        }
    }

    fn rebind(&self, native: NonNull<P::Context>) {
        self.native.store(native.as_ptr(), Ordering::Release);
    }

    /// Native context pointer of the call currently being served.
    pub fn native_context(&self) -> NonNull<P::Context> {
        let ptr = self.native.load(Ordering::Acquire);
        // Only ever stored from a NonNull.
        unsafe { NonNull::new_unchecked(ptr) }
    }

    /// Accumulator created by the aggregate's init function.
    pub fn state(&self) -> MutexGuard<'_, T> {
        lock(&self.state)
    }

    /// Result sink for the current call.
    pub fn sink(&self) -> Context<'_, P> {
        Context::new(unsafe { self.api.get() }, self.native_context())
    }
}

/// Where one aggregation instance stands, as recorded in its scratch slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AggregatePhase {
    /// Slot still zeroed: no step has run yet.
    Uninitialized,
    Active(Token),
    /// Final already ran and released the token.
    Consumed(Token),
}

const SLOT_BYTES: usize = size_of::<usize>();

/// Pointer-sized scratch slot SQLite keeps for one aggregation instance.
#[derive(Clone, Copy)]
struct AggregateSlot(NonNull<usize>);

impl AggregateSlot {
    unsafe fn for_context<P: Sqlite3Api>(api: &P, ctx: NonNull<P::Context>) -> Result<Self> {
        let raw = unsafe { api.aggregate_context(ctx, SLOT_BYTES) } as *mut usize;
        NonNull::new(raw).map(AggregateSlot).ok_or_else(|| {
            Error::with_message(ErrorCode::NoMem, "sqlite3_aggregate_context returned null")
        })
    }

    fn phase(self) -> AggregatePhase {
        match Token::from_raw(unsafe { self.0.as_ptr().read_unaligned() }) {
            None => AggregatePhase::Uninitialized,
            Some(token) if is_live(token) => AggregatePhase::Active(token),
            Some(token) => AggregatePhase::Consumed(token),
        }
    }

    fn store(self, token: Token) {
        unsafe { self.0.as_ptr().write_unaligned(token.into_raw()) }
    }
}

struct AggregateState<P, U, T, I, S, F> {
    api: ApiPtr<P>,
    user_data: U,
    init: I,
    step: S,
    final_fn: F,
    name: String,
    failures: Arc<FailureLog>,
    _state: PhantomData<fn() -> T>,
}

impl<P, U, T, I, S, F> AggregateState<P, U, T, I, S, F>
where
    P: Sqlite3Api,
    T: Send + 'static,
    I: Fn() -> T,
{
    /// Resolve the aggregation behind `slot`, creating it on first use, and
    /// point it at this call's native context.
    fn bind(
        &self,
        ctx: NonNull<P::Context>,
        slot: AggregateSlot,
    ) -> Result<Arc<AggregateContext<P, T>>> {
        let aggregate = match slot.phase() {
            AggregatePhase::Uninitialized => {
                let init = guard(|| Ok((self.init)()))?;
                let aggregate = Arc::new(AggregateContext::new(self.api, ctx, init));
                let shared: Arc<SharedState> = aggregate.clone();
                let token = shared_tokens().create(shared)?;
                slot.store(token);
                trace!(name = %self.name, token = %token, "aggregate context created");
                aggregate
            }
            AggregatePhase::Active(token) => resolve_shared::<AggregateContext<P, T>>(token)?,
            AggregatePhase::Consumed(token) => return Err(Error::InvalidToken(token)),
        };
        aggregate.rebind(ctx);
        Ok(aggregate)
    }

    fn release(&self, slot: AggregateSlot) {
        if let AggregatePhase::Active(token) = slot.phase() {
            if let Err(err) = shared_tokens().release(token) {
                error!(name = %self.name, error = %err, "aggregate context release failed");
            }
        }
    }
}

extern "C" fn aggregate_step_trampoline<P, U, T, I, S, F>(
    ctx: *mut P::Context,
    argc: i32,
    argv: *mut *mut P::Value,
) where
    P: Sqlite3Api,
    U: Send + Sync + 'static,
    T: Send + 'static,
    I: Fn() -> T + Send + Sync + 'static,
    S: for<'a> Fn(&AggregateContext<P, T>, &U, &[ValueRef<'a>]) -> Result<()> + Send + Sync + 'static,
    F: Fn(&AggregateContext<P, T>, &U) -> Result<()> + Send + Sync + 'static,
{
    let Some(ctx) = NonNull::new(ctx) else {
        return;
    };
    let Some(state) =
        function_state::<P, AggregateState<P, U, T, I, S, F>>(ctx, HookKind::Aggregate)
    else {
        return;
    };
    let api = unsafe { state.api.get() };
    let context = Context::new(api, ctx);
    let out = unsafe { AggregateSlot::for_context(api, ctx) }
        .and_then(|slot| state.bind(ctx, slot))
        .and_then(|aggregate| {
            let args = unsafe { args_from_raw(api, argc, argv) };
            guard(|| (state.step)(&*aggregate, &state.user_data, args.as_slice()))
        });
    if let Err(err) = out {
        report(&context, HookKind::Aggregate, &state.name, &state.failures, err);
    }
}

extern "C" fn aggregate_final_trampoline<P, U, T, I, S, F>(ctx: *mut P::Context)
where
    P: Sqlite3Api,
    U: Send + Sync + 'static,
    T: Send + 'static,
    I: Fn() -> T + Send + Sync + 'static,
    S: for<'a> Fn(&AggregateContext<P, T>, &U, &[ValueRef<'a>]) -> Result<()> + Send + Sync + 'static,
    F: Fn(&AggregateContext<P, T>, &U) -> Result<()> + Send + Sync + 'static,
{
    let Some(ctx) = NonNull::new(ctx) else {
        return;
    };
    let Some(state) =
        function_state::<P, AggregateState<P, U, T, I, S, F>>(ctx, HookKind::Aggregate)
    else {
        return;
    };
    let api = unsafe { state.api.get() };
    let context = Context::new(api, ctx);
    // Zero-row aggregates reach final without a step; bind creates the context then.
    let out = unsafe { AggregateSlot::for_context(api, ctx) }.and_then(|slot| {
        let aggregate = state.bind(ctx, slot)?;
        let out = guard(|| (state.final_fn)(&*aggregate, &state.user_data));
        state.release(slot);
        out
    });
    if let Err(err) = out {
        report(&context, HookKind::Aggregate, &state.name, &state.failures, err);
    }
}

impl<'p, P: Sqlite3Api> Connection<'p, P> {
    /// Register a scalar function, replacing any function under `(name, n_args)`.
    ///
    /// `func` writes its result through the [`Context`] it receives; an `Err`
    /// or a panic becomes the error of the invoking query.
    pub fn create_scalar_function<U, F>(
        &self,
        name: &str,
        n_args: i32,
        flags: FunctionFlags,
        user_data: U,
        func: F,
    ) -> Result<()>
    where
        U: Send + Sync + 'static,
        F: for<'a> Fn(&Context<'a, P>, &U, &[ValueRef<'a>]) -> Result<()> + Send + Sync + 'static,
    {
        let state = ScalarState {
            api: ApiPtr::new(self.api),
            user_data,
            func,
            name: name.to_owned(),
            failures: self.registry.failure_log(),
        };
        let handle = CallbackHandle::new(HookKind::Scalar, state)?;
        self.install(HookKey::Function(name, n_args), Some(handle), |user_data| unsafe {
            self.api.create_function(
                self.db,
                name,
                n_args,
                flags,
                user_data,
                Some(scalar_trampoline::<P, U, F>),
                None,
                None,
            )
        })?;
        debug!(name, n_args, "scalar function registered");
        Ok(())
    }

    /// Register an aggregate function, replacing any function under `(name, n_args)`.
    ///
    /// `init` builds the accumulator for each aggregation instance, `step` runs
    /// once per row and `final_fn` writes the result through
    /// [`AggregateContext::sink`].
    pub fn create_aggregate_function<U, T, I, S, F>(
        &self,
        name: &str,
        n_args: i32,
        flags: FunctionFlags,
        user_data: U,
        init: I,
        step: S,
        final_fn: F,
    ) -> Result<()>
    where
        U: Send + Sync + 'static,
        T: Send + 'static,
        I: Fn() -> T + Send + Sync + 'static,
        S: for<'a> Fn(&AggregateContext<P, T>, &U, &[ValueRef<'a>]) -> Result<()>
            + Send
            + Sync
            + 'static,
        F: Fn(&AggregateContext<P, T>, &U) -> Result<()> + Send + Sync + 'static,
    {
        let state = AggregateState {
            api: ApiPtr::new(self.api),
            user_data,
            init,
            step,
            final_fn,
            name: name.to_owned(),
            failures: self.registry.failure_log(),
            _state: PhantomData::<fn() -> T>,
        };
        let handle = CallbackHandle::new(HookKind::Aggregate, state)?;
        self.install(HookKey::Function(name, n_args), Some(handle), |user_data| unsafe {
            self.api.create_function(
                self.db,
                name,
                n_args,
                flags,
                user_data,
                None,
                Some(aggregate_step_trampoline::<P, U, T, I, S, F>),
                Some(aggregate_final_trampoline::<P, U, T, I, S, F>),
            )
        })?;
        debug!(name, n_args, "aggregate function registered");
        Ok(())
    }

    /// Remove the scalar or aggregate function under `(name, n_args)`.
    pub fn remove_function(&self, name: &str, n_args: i32) -> Result<()> {
        self.install(HookKey::Function(name, n_args), None, |user_data| unsafe {
            self.api.create_function(
                self.db,
                name,
                n_args,
                FunctionFlags::empty(),
                user_data,
                None,
                None,
                None,
            )
        })
    }
}

//! Generation-checked table that turns shared Rust state into opaque `void*` user data.
//!
//! A [`Token`] packs a slot index and the slot's generation into one pointer-sized
//! integer. Releasing a slot bumps its generation, so any copy of the old token still
//! held by SQLite fails to resolve instead of reaching freed or reused state.

use core::any::Any;
use core::ffi::c_void;
use core::fmt;
use std::sync::{Arc, Mutex};

use crate::error::{Error, ErrorCode, Result};
use crate::lock;

const INDEX_BITS: u32 = usize::BITS / 2;
const INDEX_MASK: usize = (1 << INDEX_BITS) - 1;
const GENERATION_MASK: usize = usize::MAX >> INDEX_BITS;

/// Opaque, non-zero, pointer-sized identifier for state held in a [`TokenTable`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(usize);

impl Token {
    fn new(index: usize, generation: usize) -> Self {
        // index + 1 keeps the packed value non-zero.
        Token(((generation & GENERATION_MASK) << INDEX_BITS) | (index + 1))
    }

    /// Rebuild a token from its raw integer. Zero is never a token.
    pub fn from_raw(raw: usize) -> Option<Self> {
        (raw != 0).then_some(Token(raw))
    }

    pub fn into_raw(self) -> usize {
        self.0
    }

    /// Rebuild a token from the `void*` user data SQLite passes back.
    pub fn from_user_data(ptr: *mut c_void) -> Option<Self> {
        Self::from_raw(ptr as usize)
    }

    /// The token as `void*` user data for a native registration.
    pub fn as_user_data(self) -> *mut c_void {
        self.0 as *mut c_void
    }

    fn index(self) -> Option<usize> {
        (self.0 & INDEX_MASK).checked_sub(1)
    }

    fn generation(self) -> usize {
        self.0 >> INDEX_BITS
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("index", &self.index())
            .field("generation", &self.generation())
            .finish()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

struct Slot<T: ?Sized> {
    generation: usize,
    value: Option<Arc<T>>,
}

struct Slots<T: ?Sized> {
    entries: Vec<Slot<T>>,
    free: Vec<usize>,
    live: usize,
}

impl<T: ?Sized> Slots<T> {
    fn occupied(&self, token: Token) -> Option<usize> {
        let index = token.index()?;
        let slot = self.entries.get(index)?;
        (slot.generation == token.generation() && slot.value.is_some()).then_some(index)
    }
}

/// Slot arena mapping tokens to shared state.
///
/// Resolution hands out an `Arc` clone, so a callback that is running while its
/// handle is released keeps the state alive until it returns.
///
/// A slot whose generation reaches the largest value a token can carry (`2^16 - 1`
/// on 32-bit targets) is retired instead of wrapping, so a released token never
/// resolves again.
pub struct TokenTable<T: ?Sized> {
    slots: Mutex<Slots<T>>,
    max_generation: usize,
}

impl<T: ?Sized> TokenTable<T> {
    pub const fn new() -> Self {
        Self::with_max_generation(GENERATION_MASK)
    }

    const fn with_max_generation(max_generation: usize) -> Self {
        Self {
            slots: Mutex::new(Slots {
                entries: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
            max_generation,
        }
    }

    /// Store `value` and return a fresh token for it.
    pub fn create(&self, value: Arc<T>) -> Result<Token> {
        let mut slots = lock(&self.slots);
        let index = match slots.free.pop() {
            Some(index) => index,
            None => {
                let index = slots.entries.len();
                if index >= INDEX_MASK {
                    return Err(Error::with_message(
                        ErrorCode::NoMem,
                        "callback token table exhausted",
                    ));
                }
                slots.entries.push(Slot {
                    generation: 0,
                    value: None,
                });
                index
            }
        };
        let slot = &mut slots.entries[index];
        slot.value = Some(value);
        let token = Token::new(index, slot.generation);
        slots.live += 1;
        Ok(token)
    }

    /// Look up the state behind `token`.
    pub fn resolve(&self, token: Token) -> Result<Arc<T>> {
        let slots = lock(&self.slots);
        slots
            .occupied(token)
            .and_then(|index| slots.entries[index].value.clone())
            .ok_or(Error::InvalidToken(token))
    }

    /// Remove the state behind `token`. Later resolves of the same token fail.
    pub fn release(&self, token: Token) -> Result<Arc<T>> {
        let mut slots = lock(&self.slots);
        let index = slots.occupied(token).ok_or(Error::InvalidToken(token))?;
        let slot = &mut slots.entries[index];
        let value = slot.value.take().ok_or(Error::InvalidToken(token))?;
        if slot.generation < self.max_generation {
            slot.generation += 1;
            slots.free.push(index);
        }
        slots.live -= 1;
        Ok(value)
    }

    pub fn contains(&self, token: Token) -> bool {
        lock(&self.slots).occupied(token).is_some()
    }

    /// Number of live tokens.
    pub fn len(&self) -> usize {
        lock(&self.slots).live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: ?Sized> Default for TokenTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) type SharedState = dyn Any + Send + Sync;

static SHARED_TOKENS: TokenTable<SharedState> = TokenTable::new();

/// Process-wide table behind every callback handle.
pub(crate) fn shared_tokens() -> &'static TokenTable<SharedState> {
    &SHARED_TOKENS
}

/// Resolve `token` in the process-wide table as state of type `S`.
pub(crate) fn resolve_shared<S: Any + Send + Sync>(token: Token) -> Result<Arc<S>> {
    shared_tokens()
        .resolve(token)?
        .downcast::<S>()
        .map_err(|_| Error::InvalidToken(token))
}

/// Whether `token` still refers to live callback state.
pub fn is_live(token: Token) -> bool {
    shared_tokens().contains(token)
}

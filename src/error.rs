use crate::token::Token;

/// Result alias used across the crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Error raised by the bridge, by a user callback, or by the native library.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    /// A token was resolved or released after its handle was disposed.
    #[error("invalid callback token {0}")]
    InvalidToken(Token),
    /// Text crossing the C boundary was not valid UTF-8, or a required pointer was null.
    #[error("marshaling error: {0}")]
    Marshaling(String),
    /// A user callback returned an error or panicked.
    #[error("{message}")]
    Callback { code: ErrorCode, message: String },
    /// The native library reported a failure.
    #[error("{}", sqlite_message(.code, .message))]
    Sqlite {
        code: ErrorCode,
        extended: Option<i32>,
        message: Option<String>,
    },
    /// The loaded backend does not export an optional entry point.
    #[error("feature unavailable: {0}")]
    FeatureUnavailable(&'static str),
}

fn sqlite_message(code: &ErrorCode, message: &Option<String>) -> String {
    match (code, message) {
        (_, Some(message)) => message.clone(),
        (ErrorCode::Unknown(code), None) => format!("sqlite error code {code}"),
        (code, None) => format!("sqlite error {code:?}"),
    }
}

macro_rules! error_codes {
    ($($(#[$doc:meta])* $name:ident = $code:literal,)*) => {
        /// Primary SQLite result codes the bridge produces or inspects.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum ErrorCode {
            $($(#[$doc])* $name,)*
            /// Any other primary or extended code, kept verbatim.
            Unknown(i32),
        }

        impl ErrorCode {
            /// Map a raw result code. Extended codes map by their primary low byte.
            pub const fn from_code(code: i32) -> Self {
                match code & 0xff {
                    $($code => ErrorCode::$name,)*
                    _ => ErrorCode::Unknown(code),
                }
            }

            /// Raw primary result code.
            pub const fn code(self) -> i32 {
                match self {
                    $(ErrorCode::$name => $code,)*
                    ErrorCode::Unknown(code) => code,
                }
            }
        }
    };
}

error_codes! {
    /// `SQLITE_OK`.
    Ok = 0,
    /// Generic failure, also used for callback errors.
    Error = 1,
    Internal = 2,
    Perm = 3,
    /// Callback requested that the operation stop.
    Abort = 4,
    Busy = 5,
    Locked = 6,
    /// Allocation failed, including a null aggregate scratch slot.
    NoMem = 7,
    ReadOnly = 8,
    Interrupt = 9,
    IoErr = 10,
    Corrupt = 11,
    Full = 13,
    CantOpen = 14,
    Schema = 17,
    TooBig = 18,
    Constraint = 19,
    Mismatch = 20,
    /// API misuse, including stale tokens.
    Misuse = 21,
    /// Authorizer denied the statement.
    Auth = 23,
    Range = 25,
    NotADb = 26,
}

impl Error {
    /// Failure reported by a user callback with the generic error code.
    pub fn callback(message: impl Into<String>) -> Self {
        Self::callback_with_code(ErrorCode::Error, message)
    }

    /// Failure reported by a user callback with an explicit result code.
    pub fn callback_with_code(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::Callback {
            code,
            message: message.into(),
        }
    }

    /// Native failure with a primary code and owned message text.
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::Sqlite {
            code,
            extended: None,
            message: Some(message.into()),
        }
    }

    /// Native failure from raw result code fields.
    pub fn from_code(code: i32, message: Option<String>, extended: Option<i32>) -> Self {
        Error::Sqlite {
            code: ErrorCode::from_code(code),
            extended,
            message,
        }
    }

    /// Capability error when the backend lacks an optional entry point.
    pub fn feature_unavailable(msg: &'static str) -> Self {
        Error::FeatureUnavailable(msg)
    }

    /// Result code reported to SQLite when this error crosses back into C.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidToken(_) | Error::Marshaling(_) => ErrorCode::Misuse,
            Error::Callback { code, .. } | Error::Sqlite { code, .. } => *code,
            Error::FeatureUnavailable(_) => ErrorCode::Error,
        }
    }

    pub fn is_invalid_token(&self) -> bool {
        matches!(self, Error::InvalidToken(_))
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorCode};

    #[test]
    fn error_code_mapping() {
        assert_eq!(ErrorCode::from_code(0), ErrorCode::Ok);
        assert_eq!(ErrorCode::from_code(19), ErrorCode::Constraint);
        // Extended result codes map by primary low byte.
        assert_eq!(ErrorCode::from_code((8 << 8) | 19), ErrorCode::Constraint);
        assert_eq!(ErrorCode::from_code(999), ErrorCode::Unknown(999));
        assert_eq!(ErrorCode::Abort.code(), 4);
        assert_eq!(ErrorCode::Unknown(999).code(), 999);
    }

    #[test]
    fn callback_errors_keep_their_code() {
        let err = Error::callback_with_code(ErrorCode::Constraint, "bad row");
        assert_eq!(err.code(), ErrorCode::Constraint);
        assert_eq!(err.to_string(), "bad row");
        assert_eq!(Error::callback("x").code(), ErrorCode::Error);
    }

    #[test]
    fn sqlite_display_falls_back_to_code() {
        assert_eq!(Error::from_code(5, None, None).to_string(), "sqlite error Busy");
        assert_eq!(
            Error::from_code(250, None, None).to_string(),
            "sqlite error code 250"
        );
        assert_eq!(
            Error::with_message(ErrorCode::Misuse, "closed").to_string(),
            "closed"
        );
    }

    #[test]
    fn bridge_failures_map_to_misuse() {
        assert_eq!(
            Error::Marshaling("bad utf-8".into()).code(),
            ErrorCode::Misuse
        );
        assert_eq!(
            Error::feature_unavailable("trace").to_string(),
            "feature unavailable: trace"
        );
    }
}

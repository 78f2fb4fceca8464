//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;

/// Customized error type for Geomys. Every error belongs to one of five
/// flat categories; the payload is a human-readable message surfaced to
/// clients in `{status:"ERROR", message}` responses.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum GeomysError {
    /// Empty key/value, missing required field, or malformed request frame.
    InvalidArgument(String),

    /// Key absent, expired, or list missing/empty.
    NotFound(String),

    /// Operation applied to a value of the wrong shape, e.g. INCR on a
    /// non-integer value or a list op on a string-bound key.
    TypeMismatch(String),

    /// RPC timeout, connection refused, codec or channel failure. Retried
    /// where a retry loop exists, surfaced to the client otherwise.
    Transient(String),

    /// Unrecoverable failure that aborts startup.
    Fatal(String),
}

impl GeomysError {
    /// Creates a transient error from anything printable.
    pub fn msg(m: impl ToString) -> Self {
        GeomysError::Transient(m.to_string())
    }

    /// The human-readable message carried by this error.
    pub fn message(&self) -> &str {
        match self {
            GeomysError::InvalidArgument(m)
            | GeomysError::NotFound(m)
            | GeomysError::TypeMismatch(m)
            | GeomysError::Transient(m)
            | GeomysError::Fatal(m) => m,
        }
    }
}

impl fmt::Display for GeomysError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message()) // do not display literal quotes
    }
}

impl std::error::Error for GeomysError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `GeomysError`. Such
// conversions land in the transient category.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for GeomysError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                GeomysError::Transient(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(tokio::time::error::Elapsed);

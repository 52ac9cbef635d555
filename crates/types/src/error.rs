use serde::Serialize;
use std::fmt;

/// Coarse classification shared by every service error.
///
/// Library crates keep their own `thiserror` enums; each exposes `kind()` so the
/// HTTP binding and the logs can treat failures uniformly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unknown username, object, session or token.
    NotFound,
    /// Duplicate username.
    Conflict,
    /// Bad password, invalid or expired token.
    Unauthorized,
    /// Malformed timestamp, token encoding or request field.
    Invalid,
    /// Object created but its bytes were never uploaded, or a stale request.
    Precondition,
    /// Store, serialization or blob I/O failure.
    Internal,
}

impl ErrorKind {
    pub fn is_internal(&self) -> bool {
        matches!(self, ErrorKind::Internal)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Invalid => "invalid",
            ErrorKind::Precondition => "precondition",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

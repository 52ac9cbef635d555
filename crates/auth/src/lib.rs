//! Accounts and access tokens.
//!
//! [`UserDirectory`] owns the `users` collection: registration, password checks and
//! the per-user owner index. [`TokenService`] issues time-limited tokens after a
//! password check and validates them on every authenticated request.

pub mod password;
pub mod tokens;
pub mod users;

pub use password::{verify_password, PasswordError, PasswordPolicy};
pub use tokens::{
    derive_token_id, InvalidTokenReason, TokenError, TokenPolicy, TokenService, NONCE_LEN,
    REQUEST_SKEW_SECS, TOKEN_LIFETIME_HOURS,
};
pub use users::{UserDirectory, UserError, MAX_USERNAME_LEN};

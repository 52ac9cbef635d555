use crate::timestamp::Timestamp;
use crate::user::User;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Token ids are SHA-512 digests.
pub const TOKEN_ID_BYTES: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenIdError {
    #[error("token id must be 128 hex characters, got {0}")]
    InvalidLength(usize),
    #[error("token id must be valid hex: {0}")]
    InvalidHex(String),
}

/// Key of a stored token. Derived, never transmitted by the server.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TokenId([u8; TOKEN_ID_BYTES]);

impl TokenId {
    pub fn from_bytes(bytes: [u8; TOKEN_ID_BYTES]) -> Self {
        TokenId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_ID_BYTES] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(value: &str) -> Result<Self, TokenIdError> {
        if value.len() != TOKEN_ID_BYTES * 2 {
            return Err(TokenIdError::InvalidLength(value.len()));
        }
        let mut bytes = [0u8; TOKEN_ID_BYTES];
        hex::decode_to_slice(value, &mut bytes)
            .map_err(|err| TokenIdError::InvalidHex(err.to_string()))?;
        Ok(TokenId(bytes))
    }
}

// Token ids are bearer credentials; keep them out of debug output.
impl fmt::Debug for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenId({}..)", &self.to_hex()[..8])
    }
}

impl TryFrom<String> for TokenId {
    type Error = TokenIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        TokenId::from_hex(&value)
    }
}

impl From<TokenId> for String {
    fn from(value: TokenId) -> Self {
        value.to_hex()
    }
}

/// Persisted authentication token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub token_id: TokenId,

    /// Snapshot of the user at issuance; may be stale and has no password hash.
    pub user: User,

    pub expiration: Timestamp,
}

/// What the client receives after authenticating. The token id is recomputed
/// client-side from these two values plus the username.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub nonce: String,

    #[serde(rename = "expdate")]
    pub expiration: Timestamp,
}

use crate::users::{UserDirectory, UserError};
use chrono::Duration;
use piedpiper_storage::{
    Collection, KvStore, KvStoreExt, ReadTxnExt, StoreError, WriteTxnExt,
};
use piedpiper_types::{
    random_alphanumeric, Clock, ErrorKind, Timestamp, TimestampError, Token, TokenId,
    TokenResponse, TOKEN_ID_BYTES,
};
use sha2::{Digest, Sha512};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const TOKEN_LIFETIME_HOURS: i64 = 144;
pub const REQUEST_SKEW_SECS: i64 = 300;
pub const NONCE_LEN: usize = 24;

/// Why a presented token id was rejected before any expiry check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidTokenReason {
    /// Not 128 hex characters.
    Malformed,
    /// Well-formed but no such token is stored.
    Unknown,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("bad credentials")]
    BadCredentials,
    #[error("bad request timestamp: {0}")]
    BadTimestamp(#[from] TimestampError),
    #[error("request timestamp {client} is outside the allowed window of {window_secs}s")]
    StaleRequest { client: Timestamp, window_secs: i64 },
    #[error("invalid token: {0:?}")]
    InvalidToken(InvalidTokenReason),
    #[error("token expired")]
    ExpiredToken,
    #[error("token expiration is out of range")]
    ExpirationOverflow,
    #[error(transparent)]
    User(#[from] UserError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TokenError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TokenError::BadCredentials | TokenError::ExpiredToken => ErrorKind::Unauthorized,
            TokenError::BadTimestamp(_) => ErrorKind::Invalid,
            TokenError::StaleRequest { .. } => ErrorKind::Precondition,
            TokenError::InvalidToken(InvalidTokenReason::Malformed) => ErrorKind::Invalid,
            TokenError::InvalidToken(InvalidTokenReason::Unknown) => ErrorKind::Unauthorized,
            TokenError::User(err) => err.kind(),
            TokenError::ExpirationOverflow | TokenError::Store(_) => ErrorKind::Internal,
        }
    }
}

/// Token lifetime and the accepted distance between client and server clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenPolicy {
    pub lifetime: Duration,
    pub request_skew: Duration,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            lifetime: Duration::hours(TOKEN_LIFETIME_HOURS),
            request_skew: Duration::seconds(REQUEST_SKEW_SECS),
        }
    }
}

/// SHA-512 over `username || nonce || expiration`. Clients compute the same value from
/// the authentication response and present it as hex.
pub fn derive_token_id(username: &str, nonce: &str, expiration: &Timestamp) -> TokenId {
    let mut hasher = Sha512::new();
    hasher.update(username.as_bytes());
    hasher.update(nonce.as_bytes());
    hasher.update(expiration.to_string().as_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; TOKEN_ID_BYTES];
    bytes.copy_from_slice(&digest);
    TokenId::from_bytes(bytes)
}

/// Issues and validates access tokens.
///
/// A token moves from issued to either valid or expired; there is no revocation.
/// Expired tokens are deleted the first time validation notices them.
pub struct TokenService {
    store: Arc<dyn KvStore>,
    users: Arc<UserDirectory>,
    clock: Arc<dyn Clock>,
    policy: TokenPolicy,
}

impl TokenService {
    pub fn new(
        store: Arc<dyn KvStore>,
        users: Arc<UserDirectory>,
        clock: Arc<dyn Clock>,
        policy: TokenPolicy,
    ) -> Self {
        Self {
            store,
            users,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &TokenPolicy {
        &self.policy
    }

    /// Checks the password and the client's request time, then issues a token.
    ///
    /// The token is stored before this returns, so the nonce handed back always refers
    /// to a persisted token.
    pub fn authenticate(
        &self,
        username: &str,
        password: &str,
        client_timestamp: &str,
    ) -> Result<TokenResponse, TokenError> {
        let user = self
            .users
            .check_credentials(username, password)?
            .ok_or_else(|| {
                warn!("Rejected credentials for {}", username);
                TokenError::BadCredentials
            })?;

        let client = Timestamp::parse(client_timestamp)?;
        let now = Timestamp::from_datetime(self.clock.now());
        let skew = client.signed_since(now.as_datetime());
        if skew.abs() > self.policy.request_skew {
            warn!(
                "Stale authentication request from {}: client={} server={}",
                username, client, now
            );
            return Err(TokenError::StaleRequest {
                client,
                window_secs: self.policy.request_skew.num_seconds(),
            });
        }

        let nonce = random_alphanumeric(NONCE_LEN);
        let expiration = now
            .checked_add(self.policy.lifetime)
            .ok_or(TokenError::ExpirationOverflow)?;
        let token = Token {
            token_id: derive_token_id(username, &nonce, &expiration),
            user: user.snapshot(),
            expiration,
        };

        self.store.with_write(|tx| {
            tx.put_json(Collection::Tokens, token.token_id.as_bytes(), &token)
        })?;

        info!("Issued token for {} expiring {}", username, expiration);
        Ok(TokenResponse { nonce, expiration })
    }

    /// Resolves a hex token id to its stored token, deleting it if it has expired.
    pub fn validate_token(&self, token_hex: &str) -> Result<Token, TokenError> {
        let token_id = TokenId::from_hex(token_hex)
            .map_err(|_| TokenError::InvalidToken(InvalidTokenReason::Malformed))?;

        let token: Token = self
            .store
            .with_read(|tx| tx.get_json(Collection::Tokens, token_id.as_bytes()))?
            .ok_or_else(|| {
                warn!("Unknown token {:?}", token_id);
                TokenError::InvalidToken(InvalidTokenReason::Unknown)
            })?;

        if self.is_expired(&token) {
            self.store
                .with_write(|tx| tx.delete(Collection::Tokens, token_id.as_bytes()))?;
            debug!("Deleted expired token {:?} of {}", token_id, token.user.username);
            return Err(TokenError::ExpiredToken);
        }

        Ok(token)
    }

    fn is_expired(&self, token: &Token) -> bool {
        let now = self.clock.now();
        let remaining = token.expiration.signed_since(now);
        if remaining < Duration::zero() {
            return true;
        }
        if remaining > self.policy.lifetime {
            // Expiring further out than any token we issue means the clock moved
            // backwards; refuse the token.
            warn!(
                "Token of {} expires {} but server time is {}; treating as expired",
                token.user.username,
                token.expiration,
                Timestamp::from_datetime(now)
            );
            return true;
        }
        false
    }
}

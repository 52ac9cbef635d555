use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier, Version};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("invalid argon2 parameters: {0}")]
    Params(String),
    #[error("password hashing failed: {0}")]
    Hash(String),
    #[error("stored password hash is malformed: {0}")]
    MalformedHash(String),
}

/// Argon2id cost parameters used for new hashes. Existing hashes are verified with the
/// parameters embedded in their PHC string, so changing these never locks users out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordPolicy {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            memory_kib: Params::DEFAULT_M_COST,
            iterations: Params::DEFAULT_T_COST,
            parallelism: Params::DEFAULT_P_COST,
        }
    }
}

impl PasswordPolicy {
    /// Cheapest parameters argon2 accepts. Only for tests.
    pub fn insecure_fast() -> Self {
        Self {
            memory_kib: Params::MIN_M_COST,
            iterations: Params::MIN_T_COST,
            parallelism: 1,
        }
    }

    fn hasher(&self) -> Result<Argon2<'static>, PasswordError> {
        let params = Params::new(self.memory_kib, self.iterations, self.parallelism, None)
            .map_err(|e| PasswordError::Params(e.to_string()))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }

    pub fn validate(&self) -> Result<(), PasswordError> {
        self.hasher().map(|_| ())
    }

    /// Salted hash of `password || username`, as a PHC string.
    pub fn hash(&self, password: &str, username: &str) -> Result<String, PasswordError> {
        let salt = SaltString::generate(&mut OsRng);
        let input = secret_input(password, username);
        let hash = self
            .hasher()?
            .hash_password(&input, &salt)
            .map_err(|e| PasswordError::Hash(e.to_string()))?;
        Ok(hash.to_string())
    }
}

/// Checks `password || username` against a PHC string produced by [`PasswordPolicy::hash`].
pub fn verify_password(password: &str, username: &str, hash: &str) -> Result<bool, PasswordError> {
    let parsed = PasswordHash::new(hash).map_err(|e| PasswordError::MalformedHash(e.to_string()))?;
    let input = secret_input(password, username);
    Ok(Argon2::default().verify_password(&input, &parsed).is_ok())
}

fn secret_input(password: &str, username: &str) -> Vec<u8> {
    let mut input = Vec::with_capacity(password.len() + username.len());
    input.extend_from_slice(password.as_bytes());
    input.extend_from_slice(username.as_bytes());
    input
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let policy = PasswordPolicy::insecure_fast();
        let hash = policy.hash("pw1", "alice").unwrap();

        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("pw1", "alice", &hash).unwrap());
        assert!(!verify_password("pw2", "alice", &hash).unwrap());
    }

    #[test]
    fn test_hash_is_bound_to_username() {
        let policy = PasswordPolicy::insecure_fast();
        let hash = policy.hash("pw1", "alice").unwrap();
        assert!(!verify_password("pw1", "bob", &hash).unwrap());
    }

    #[test]
    fn test_salts_differ() {
        let policy = PasswordPolicy::insecure_fast();
        assert_ne!(
            policy.hash("pw1", "alice").unwrap(),
            policy.hash("pw1", "alice").unwrap()
        );
    }

    #[test]
    fn test_verification_uses_stored_parameters() {
        let hash = PasswordPolicy::insecure_fast().hash("pw1", "alice").unwrap();
        // A stronger current policy must still accept older, cheaper hashes.
        PasswordPolicy::default().validate().unwrap();
        assert!(verify_password("pw1", "alice", &hash).unwrap());
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let policy = PasswordPolicy {
            memory_kib: 1,
            iterations: 0,
            parallelism: 0,
        };
        assert!(matches!(policy.validate(), Err(PasswordError::Params(_))));
        assert!(matches!(
            verify_password("pw", "alice", "not-a-phc-string"),
            Err(PasswordError::MalformedHash(_))
        ));
    }
}

use rand::rngs::OsRng;
use rand::Rng;

/// Alphabet for nonces and blob local references.
pub const ALPHANUMERIC: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ1234567890";

/// Draw `len` characters uniformly from [`ALPHANUMERIC`] using the OS CSPRNG.
pub fn random_alphanumeric(len: usize) -> String {
    let mut rng = OsRng;
    (0..len)
        .map(|_| ALPHANUMERIC[rng.gen_range(0..ALPHANUMERIC.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_and_alphabet() {
        let value = random_alphanumeric(36);
        assert_eq!(value.len(), 36);
        assert!(value.bytes().all(|b| ALPHANUMERIC.contains(&b)));
    }

    #[test]
    fn test_values_differ() {
        assert_ne!(random_alphanumeric(24), random_alphanumeric(24));
    }
}

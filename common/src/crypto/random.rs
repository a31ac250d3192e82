/// Cryptographically secure random number generation
///
/// All identity and reseed material MUST come from OsRng, not thread_rng():
/// OsRng uses OS-provided entropy (e.g., /dev/urandom on Unix) while
/// thread_rng() is not suitable for identity generation.
use rand::rngs::OsRng;
use rand::RngCore;

/// Generate cryptographically secure random bytes
pub fn secure_random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Generate cryptographically secure random u64
pub fn secure_random_u64() -> u64 {
    OsRng.next_u64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secure_random_bytes() {
        let bytes1 = secure_random_bytes::<32>();
        let bytes2 = secure_random_bytes::<32>();

        // Random bytes should be different each time
        assert_ne!(bytes1, bytes2);
        assert_eq!(bytes1.len(), 32);
    }

    #[test]
    fn test_secure_random_u64() {
        let n1 = secure_random_u64();
        let n2 = secure_random_u64();

        assert_ne!(n1, n2);
    }
}

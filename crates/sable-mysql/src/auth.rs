//! Authentication scrambles.
//!
//! Implements the password scrambles for the two common plugins:
//! - `mysql_native_password`: SHA1-based (pre-8.0 default)
//! - `caching_sha2_password`: SHA256-based fast path (8.0+ default)
//!
//! `caching_sha2_password` full authentication needs TLS or RSA key
//! exchange and is not supported; a server demanding it gets a typed
//! authentication error from the driver.

use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Well-known authentication plugin names.
pub mod plugins {
    /// SHA1-based authentication (legacy default)
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    /// SHA256-based authentication (MySQL 8.0+ default)
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
}

/// Response codes in the caching_sha2_password exchange.
pub mod caching_sha2 {
    /// Fast auth success
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    /// Full auth needed (secure channel or RSA)
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

/// Compute the mysql_native_password response.
///
/// `SHA1(password) XOR SHA1(seed + SHA1(SHA1(password)))`, 20 bytes,
/// or empty for an empty password.
pub fn mysql_native_password(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }

    // the scramble is the first 20 bytes of the seed
    let seed = if auth_data.len() > 20 {
        &auth_data[..20]
    } else {
        auth_data
    };

    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    let stage1: [u8; 20] = hasher.finalize().into();

    let mut hasher = Sha1::new();
    hasher.update(stage1);
    let stage2: [u8; 20] = hasher.finalize().into();

    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(stage2);
    let stage3: [u8; 20] = hasher.finalize().into();

    stage1
        .iter()
        .zip(stage3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Compute the caching_sha2_password fast-path response.
///
/// `XOR(SHA256(password), SHA256(SHA256(SHA256(password)) + seed))`,
/// 32 bytes, or empty for an empty password.
pub fn caching_sha2_password(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }

    // servers send a 20-byte scramble plus trailing NUL; strip only that
    // exact shape so a genuine 21-byte seed is left alone
    let seed = if auth_data.len() == 21 && auth_data.last() == Some(&0) {
        &auth_data[..20]
    } else {
        auth_data
    };

    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    let password_hash: [u8; 32] = hasher.finalize().into();

    let mut hasher = Sha256::new();
    hasher.update(password_hash);
    let password_hash_hash: [u8; 32] = hasher.finalize().into();

    let mut hasher = Sha256::new();
    hasher.update(password_hash_hash);
    hasher.update(seed);
    let scramble: [u8; 32] = hasher.finalize().into();

    password_hash
        .iter()
        .zip(scramble.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_password_empty() {
        assert!(mysql_native_password("", &[0; 20]).is_empty());
    }

    #[test]
    fn native_password_shape() {
        let seed = [
            0x3d, 0x4c, 0x5e, 0x2f, 0x1a, 0x0b, 0x7c, 0x8d, 0x9e, 0xaf, 0x10, 0x21, 0x32, 0x43,
            0x54, 0x65, 0x76, 0x87, 0x98, 0xa9,
        ];

        let result = mysql_native_password("mypassword", &seed);
        assert_eq!(result.len(), 20);
        assert_eq!(result, mysql_native_password("mypassword", &seed));
        assert_ne!(result, mysql_native_password("otherpassword", &seed));
    }

    #[test]
    fn caching_sha2_empty() {
        assert!(caching_sha2_password("", &[0; 20]).is_empty());
    }

    #[test]
    fn caching_sha2_shape() {
        let result = caching_sha2_password("secret", &[0u8; 20]);
        assert_eq!(result.len(), 32);
        assert_eq!(result, caching_sha2_password("secret", &[0u8; 20]));
    }

    #[test]
    fn caching_sha2_strips_trailing_nul() {
        let mut seed = vec![7u8; 20];
        seed.push(0);
        assert_eq!(
            caching_sha2_password("secret", &seed),
            caching_sha2_password("secret", &seed[..20])
        );
    }
}

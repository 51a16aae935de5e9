//! MySQL authentication mechanisms.
//!
//! - `mysql_native_password`: SHA1 challenge-response
//! - `mysql_clear_password`: the password itself, NUL-terminated
//!
//! # mysql_native_password
//!
//! ```text
//! SHA1(password) XOR SHA1(seed + SHA1(SHA1(password)))
//! ```
//!
//! Any other mechanism the server asks for is rejected by the handshake.

use sha1::{Digest, Sha1};

/// Well-known authentication plugin names.
pub mod plugins {
    /// SHA1-based challenge-response
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    /// Password sent as-is; only sensible over TLS
    pub const MYSQL_CLEAR_PASSWORD: &str = "mysql_clear_password";
}

/// Length of a native password scramble and of the full server seed.
pub const SCRAMBLE_LEN: usize = 20;

/// Compute the `mysql_native_password` response for `seed`.
///
/// Seeds longer than 20 bytes (auth-switch data carries a trailing NUL)
/// are cut to 20.
pub fn scramble_native_password(password: &[u8], seed: &[u8]) -> [u8; SCRAMBLE_LEN] {
    let seed = &seed[..seed.len().min(SCRAMBLE_LEN)];

    let stage1: [u8; SCRAMBLE_LEN] = Sha1::digest(password).into();
    let stage2: [u8; SCRAMBLE_LEN] = Sha1::digest(stage1).into();

    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(stage2);
    let mut scramble: [u8; SCRAMBLE_LEN] = hasher.finalize().into();

    for (out, mask) in scramble.iter_mut().zip(stage1) {
        *out ^= mask;
    }
    scramble
}

/// Auth response for `mysql_native_password`; empty for an empty password.
pub fn native_password_response(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        Vec::new()
    } else {
        scramble_native_password(password.as_bytes(), seed).to_vec()
    }
}

/// Auth response for `mysql_clear_password`.
pub fn clear_password_response(password: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(password.len() + 1);
    data.extend_from_slice(password.as_bytes());
    data.push(0);
    data
}

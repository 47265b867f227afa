//! Password hashing utilities using Argon2id
//!
//! Used for account passwords and for session and operator passwords, which
//! are stored in the session history as hashes.
//!
//! # Fast Mode
//!
//! When `fast: true` is passed to `hash_password`, it produces a simple hash
//! with the format `$FAST$<password>`. This is detected automatically by
//! `verify_password` for instant verification.
//!
//! **Never use fast mode in production** - it stores passwords in plaintext.

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use easel_common::validators;
use thiserror::Error;

/// Prefix for fast (test-only) password hashes
const FAST_HASH_PREFIX: &str = "$FAST$";

/// Error type for password operations
#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("invalid password: {0:?}")]
    Validation(validators::PasswordError),
    #[error("{0}")]
    Hash(#[from] argon2::password_hash::Error),
}

/// Hash a password
///
/// # Returns
///
/// * `Ok(String)` - The password hash
///   - Fast mode: `$FAST$<password>` (plaintext, for testing only)
///   - Normal mode: Argon2id hash in PHC string format
/// * `Err` - If validation or hashing fails
pub fn hash_password(password: &str, fast: bool) -> Result<String, PasswordError> {
    validators::validate_password(password).map_err(PasswordError::Validation)?;

    if fast {
        Ok(format!("{}{}", FAST_HASH_PREFIX, password))
    } else {
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::default();
        let password_hash = argon2.hash_password(password.as_bytes(), &salt)?;
        Ok(password_hash.to_string())
    }
}

/// Verify a password against a stored hash
///
/// Hashes starting with `$FAST$` are compared directly, all others go
/// through Argon2. Both comparisons take the same time whether the first
/// or the last byte differs.
///
/// # Returns
///
/// * `Ok(true)` - Password matches the hash
/// * `Ok(false)` - Password does not match the hash
/// * `Err` - If the hash is malformed or verification fails for technical reasons
pub fn verify_password(password: &str, password_hash: &str) -> Result<bool, PasswordError> {
    // Empty input is fine here: the caller decides what an empty password means
    validators::validate_password_input(password).map_err(PasswordError::Validation)?;

    if let Some(stored) = password_hash.strip_prefix(FAST_HASH_PREFIX) {
        return Ok(constant_time_eq(stored.as_bytes(), password.as_bytes()));
    }

    let parsed_hash = PasswordHash::new(password_hash)?;
    let argon2 = Argon2::default();

    match argon2.verify_password(password.as_bytes(), &parsed_hash) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(PasswordError::Hash(e)),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

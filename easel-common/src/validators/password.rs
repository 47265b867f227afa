//! Password validation
//!
//! Used for account passwords, session passwords and operator passwords:
//! - `validate_password_input` - for login and join (empty allowed, auth decides)
//! - `validate_password` - for setting a password (must not be empty)

/// Maximum length for passwords in bytes
///
/// Bounds the Argon2 work an unauthenticated client can trigger.
pub const MAX_PASSWORD_LENGTH: usize = 256;

/// Validation error for passwords
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PasswordError {
    /// Password is empty
    Empty,
    /// Password exceeds maximum length
    TooLong,
}

/// Validate a password supplied during login or join
///
/// Empty passwords pass; whether an empty password is acceptable is decided
/// by the account or session it is checked against.
///
/// # Errors
///
/// Returns `PasswordError::TooLong` when the password exceeds 256 bytes.
pub fn validate_password_input(password: &str) -> Result<(), PasswordError> {
    if password.len() > MAX_PASSWORD_LENGTH {
        return Err(PasswordError::TooLong);
    }
    Ok(())
}

/// Validate a password that is about to be hashed and stored
///
/// # Errors
///
/// Returns a `PasswordError` variant describing the validation failure.
pub fn validate_password(password: &str) -> Result<(), PasswordError> {
    if password.is_empty() {
        return Err(PasswordError::Empty);
    }
    validate_password_input(password)
}

//! Username validation

/// Maximum length for usernames in characters
pub const MAX_USERNAME_LENGTH: usize = 32;

/// Characters that would break chat commands or log lines
const FORBIDDEN_CHARS: &[char] = &['"', '<', '>', '\\'];

/// Validation error for usernames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsernameError {
    /// Username is empty or only whitespace
    Empty,
    /// Username exceeds maximum length
    TooLong,
    /// Username contains invalid characters or surrounding whitespace
    InvalidCharacters,
}

/// Validate a username
///
/// Checks:
/// - Not empty or all whitespace
/// - At most 32 characters
/// - No control characters, no `"` `<` `>` `\`
/// - No leading or trailing whitespace (inner spaces are fine)
///
/// # Errors
///
/// Returns a `UsernameError` variant describing the validation failure.
pub fn validate_username(username: &str) -> Result<(), UsernameError> {
    if username.trim().is_empty() {
        return Err(UsernameError::Empty);
    }
    if username.chars().count() > MAX_USERNAME_LENGTH {
        return Err(UsernameError::TooLong);
    }
    if username.trim() != username {
        return Err(UsernameError::InvalidCharacters);
    }
    if username
        .chars()
        .any(|ch| ch.is_control() || FORBIDDEN_CHARS.contains(&ch))
    {
        return Err(UsernameError::InvalidCharacters);
    }
    Ok(())
}

//! Session ID and alias validation
//!
//! Session IDs are either server-generated UUIDs or client-chosen vanity IDs.
//! Both use the character set `[a-zA-Z0-9:-]` and are at most 64 characters.
//! Aliases use the same character set but must not look like a UUID, so an
//! alias can never shadow a generated ID.

/// Maximum length of a session ID or alias
pub const MAX_SESSION_ID_LENGTH: usize = 64;

/// Validation error for session IDs and aliases
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionIdError {
    Empty,
    TooLong,
    InvalidCharacters,
    /// Alias has the shape of a generated session ID
    LooksLikeUuid,
}

fn is_session_id_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == ':' || ch == '-'
}

/// Validate a session ID
///
/// # Errors
///
/// Returns a `SessionIdError` variant describing the validation failure.
pub fn validate_session_id(id: &str) -> Result<(), SessionIdError> {
    if id.is_empty() {
        return Err(SessionIdError::Empty);
    }
    if id.len() > MAX_SESSION_ID_LENGTH {
        return Err(SessionIdError::TooLong);
    }
    if !id.chars().all(is_session_id_char) {
        return Err(SessionIdError::InvalidCharacters);
    }
    Ok(())
}

/// Validate a session alias
///
/// # Errors
///
/// Returns a `SessionIdError` variant describing the validation failure.
pub fn validate_session_alias(alias: &str) -> Result<(), SessionIdError> {
    validate_session_id(alias)?;
    if looks_like_uuid(alias) {
        return Err(SessionIdError::LooksLikeUuid);
    }
    Ok(())
}

/// 8-4-4-4-12 hex groups
fn looks_like_uuid(s: &str) -> bool {
    let groups: Vec<&str> = s.split('-').collect();
    let lengths = [8, 4, 4, 4, 12];
    groups.len() == lengths.len()
        && groups
            .iter()
            .zip(lengths)
            .all(|(g, len)| g.len() == len && g.chars().all(|c| c.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_ids() {
        assert!(validate_session_id("abc").is_ok());
        assert!(validate_session_id("my-session:2").is_ok());
        assert!(validate_session_id("5f0b3c1e-8d2a-4c4e-9a57-0e6b2d1f9c3a").is_ok());
        assert!(validate_session_id(&"x".repeat(MAX_SESSION_ID_LENGTH)).is_ok());
    }

    #[test]
    fn test_invalid_ids() {
        assert_eq!(validate_session_id(""), Err(SessionIdError::Empty));
        assert_eq!(
            validate_session_id(&"x".repeat(MAX_SESSION_ID_LENGTH + 1)),
            Err(SessionIdError::TooLong)
        );
        assert_eq!(
            validate_session_id("has space"),
            Err(SessionIdError::InvalidCharacters)
        );
        assert_eq!(
            validate_session_id("../etc"),
            Err(SessionIdError::InvalidCharacters)
        );
    }

    #[test]
    fn test_alias_rejects_uuid_shape() {
        assert!(validate_session_alias("drawing-night").is_ok());
        assert_eq!(
            validate_session_alias("5f0b3c1e-8d2a-4c4e-9a57-0e6b2d1f9c3a"),
            Err(SessionIdError::LooksLikeUuid)
        );
    }
}

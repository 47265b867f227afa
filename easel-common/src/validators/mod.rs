//! Input validation functions
//!
//! Validators shared between client and server. Clients can use them for
//! pre-validation, the server uses them for enforcement during login.

mod password;
mod session_id;
mod username;

pub use password::{
    MAX_PASSWORD_LENGTH, PasswordError, validate_password, validate_password_input,
};
pub use session_id::{
    MAX_SESSION_ID_LENGTH, SessionIdError, validate_session_alias, validate_session_id,
};
pub use username::{MAX_USERNAME_LENGTH, UsernameError, validate_username};

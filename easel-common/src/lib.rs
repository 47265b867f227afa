//! Easel Common Library
//!
//! Shared protocol types, validators and line I/O for the Easel
//! collaboration server and its clients.

pub mod io;
pub mod protocol;
pub mod validators;
pub mod version;

pub use version::{ProtocolVersion, ProtocolVersionError};

/// Default port for Easel connections
pub const DEFAULT_PORT: u16 = 27750;

/// Protocol namespace spoken by this server
pub const PROTOCOL_NAMESPACE: &str = "easel";

/// Server-level protocol version
///
/// Clients with a different server version cannot log in at all.
pub const SERVER_PROTOCOL_VERSION: u32 = 4;

/// Highest canvas protocol major version this server can host
pub const CURRENT_MAJOR_VERSION: u32 = 24;

/// Lowest canvas protocol major version this server can host
pub const MINIMUM_MAJOR_VERSION: u32 = 21;

/// Maximum number of users in a single session (user ids are one byte, 0 and 255 reserved)
pub const MAX_SESSION_USERS: u8 = 254;

/// Server feature flags advertised in the greeting
///
/// - `MULTI`: multiple sessions supported
/// - `TLS`: encryption upgrade available
/// - `SECURE`: encryption upgrade required before login
/// - `PERSIST`: persistent sessions supported
/// - `IDENT`: non-guest (password) login supported
/// - `NOGUEST`: guest login disabled
/// - `EXTAUTH`: external authentication available
/// - `LOOKUP`: session lookup required before identification
pub const FEATURE_MULTI: &str = "MULTI";
pub const FEATURE_TLS: &str = "TLS";
pub const FEATURE_SECURE: &str = "SECURE";
pub const FEATURE_PERSIST: &str = "PERSIST";
pub const FEATURE_IDENT: &str = "IDENT";
pub const FEATURE_NOGUEST: &str = "NOGUEST";
pub const FEATURE_EXTAUTH: &str = "EXTAUTH";
pub const FEATURE_LOOKUP: &str = "LOOKUP";

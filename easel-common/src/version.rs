//! Protocol version value type
//!
//! A protocol version is written as `namespace:server.major.minor`, for
//! example `easel:4.24.0`. The server number must match exactly for a client
//! to talk to the server at all; the major number decides whether a session
//! can be hosted or joined.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::{CURRENT_MAJOR_VERSION, MINIMUM_MAJOR_VERSION, PROTOCOL_NAMESPACE, SERVER_PROTOCOL_VERSION};

/// Maximum length of a namespace string
const MAX_NAMESPACE_LENGTH: usize = 32;

/// Error parsing a protocol version string
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolVersionError {
    #[error("missing namespace separator")]
    MissingNamespace,
    #[error("invalid namespace")]
    InvalidNamespace,
    #[error("expected server.major.minor")]
    InvalidFormat,
}

/// Full protocol version of a session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProtocolVersion {
    namespace: String,
    server: u32,
    major: u32,
    minor: u32,
}

impl ProtocolVersion {
    /// Create a new protocol version
    pub fn new(namespace: impl Into<String>, server: u32, major: u32, minor: u32) -> Self {
        Self {
            namespace: namespace.into(),
            server,
            major,
            minor,
        }
    }

    /// The version this server speaks natively
    pub fn current() -> Self {
        Self::new(PROTOCOL_NAMESPACE, SERVER_PROTOCOL_VERSION, CURRENT_MAJOR_VERSION, 0)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn server(&self) -> u32 {
        self.server
    }

    pub fn major(&self) -> u32 {
        self.major
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    /// Can sessions of this version be hosted on this server?
    #[must_use]
    pub fn is_hostable(&self) -> bool {
        self.namespace == PROTOCOL_NAMESPACE
            && self.server == SERVER_PROTOCOL_VERSION
            && (MINIMUM_MAJOR_VERSION..=CURRENT_MAJOR_VERSION).contains(&self.major)
    }

    /// Is this the same protocol family as `other` (namespace and server match)?
    #[must_use]
    pub fn is_compatible(&self, other: &ProtocolVersion) -> bool {
        self.namespace == other.namespace && self.server == other.server && self.major == other.major
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}.{}.{}",
            self.namespace, self.server, self.major, self.minor
        )
    }
}

impl FromStr for ProtocolVersion {
    type Err = ProtocolVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, numbers) = s
            .split_once(':')
            .ok_or(ProtocolVersionError::MissingNamespace)?;

        if namespace.is_empty()
            || namespace.len() > MAX_NAMESPACE_LENGTH
            || !namespace.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(ProtocolVersionError::InvalidNamespace);
        }

        let parts: Vec<u32> = numbers
            .split('.')
            .map(|p| p.parse::<u32>())
            .collect::<Result<_, _>>()
            .map_err(|_| ProtocolVersionError::InvalidFormat)?;

        match parts.as_slice() {
            [server, major, minor] => Ok(Self::new(namespace, *server, *major, *minor)),
            _ => Err(ProtocolVersionError::InvalidFormat),
        }
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let v: ProtocolVersion = "easel:4.24.1".parse().unwrap();
        assert_eq!(v.namespace(), "easel");
        assert_eq!(v.server(), 4);
        assert_eq!(v.major(), 24);
        assert_eq!(v.minor(), 1);
        assert_eq!(v.to_string(), "easel:4.24.1");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            "4.24.0".parse::<ProtocolVersion>(),
            Err(ProtocolVersionError::MissingNamespace)
        );
        assert_eq!(
            ":4.24.0".parse::<ProtocolVersion>(),
            Err(ProtocolVersionError::InvalidNamespace)
        );
        assert_eq!(
            "easel:4.24".parse::<ProtocolVersion>(),
            Err(ProtocolVersionError::InvalidFormat)
        );
        assert_eq!(
            "easel:4.x.0".parse::<ProtocolVersion>(),
            Err(ProtocolVersionError::InvalidFormat)
        );
    }

    #[test]
    fn test_hostable() {
        assert!(ProtocolVersion::current().is_hostable());
        assert!(ProtocolVersion::new("easel", 4, MINIMUM_MAJOR_VERSION, 3).is_hostable());
        assert!(!ProtocolVersion::new("easel", 4, MINIMUM_MAJOR_VERSION - 1, 0).is_hostable());
        assert!(!ProtocolVersion::new("easel", 3, CURRENT_MAJOR_VERSION, 0).is_hostable());
        assert!(!ProtocolVersion::new("other", 4, CURRENT_MAJOR_VERSION, 0).is_hostable());
    }

    #[test]
    fn test_serde_as_string() {
        let v = ProtocolVersion::current();
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, format!("\"{}\"", v));
        let back: ProtocolVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
        assert!(serde_json::from_str::<ProtocolVersion>("\"garbage\"").is_err());
    }
}

//! Server configuration

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use easel_common::DEFAULT_PORT;

use crate::history::HistoryStorage;
use crate::login::LoginPolicy;
use crate::sessions::SessionLimits;

/// Default history size limit (15 MiB)
pub const DEFAULT_SESSION_SIZE_LIMIT: u64 = 15 * 1024 * 1024;

/// Default maximum number of live sessions
pub const DEFAULT_MAX_SESSIONS: usize = 20;

/// Default per-IP connection limit
pub const DEFAULT_MAX_CONNECTIONS_PER_IP: usize = 5;

/// Settings the server runs with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub database: Option<PathBuf>,
    /// Persistent session directory; `None` keeps sessions in memory
    pub sessions_dir: Option<PathBuf>,
    pub archive: bool,
    pub session_size_limit: u64,
    pub autoreset_threshold: u64,
    pub max_sessions: usize,
    pub allow_guests: bool,
    pub allow_guest_hosts: bool,
    pub mandatory_lookup: bool,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub require_tls: bool,
    pub max_connections_per_ip: usize,
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            database: None,
            sessions_dir: None,
            archive: false,
            session_size_limit: DEFAULT_SESSION_SIZE_LIMIT,
            autoreset_threshold: 0,
            max_sessions: DEFAULT_MAX_SESSIONS,
            allow_guests: true,
            allow_guest_hosts: true,
            mandatory_lookup: false,
            tls_cert: None,
            tls_key: None,
            require_tls: false,
            max_connections_per_ip: DEFAULT_MAX_CONNECTIONS_PER_IP,
            debug: false,
        }
    }
}

impl ServerConfig {
    /// Both halves of a TLS identity were configured
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    pub fn history_storage(&self) -> HistoryStorage {
        match &self.sessions_dir {
            Some(dir) => HistoryStorage::Journaled {
                dir: dir.clone(),
                archive: self.archive,
            },
            None => HistoryStorage::Memory,
        }
    }

    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            max_sessions: self.max_sessions,
            size_limit: self.session_size_limit,
            auto_reset_threshold: self.autoreset_threshold,
        }
    }

    pub fn login_policy(&self) -> LoginPolicy {
        let tls_available = self.tls_enabled();
        LoginPolicy {
            allow_guests: self.allow_guests,
            allow_guest_hosts: self.allow_guest_hosts,
            mandatory_lookup: self.mandatory_lookup,
            tls_available,
            tls_required: tls_available && self.require_tls,
            persistence: self.sessions_dir.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_memory_only_and_open() {
        let config = ServerConfig::default();
        assert_eq!(config.history_storage(), HistoryStorage::Memory);

        let policy = config.login_policy();
        assert!(policy.allow_guests);
        assert!(!policy.tls_available);
        assert!(!policy.persistence);
    }

    #[test]
    fn test_sessions_dir_enables_persistence() {
        let config = ServerConfig {
            sessions_dir: Some(PathBuf::from("/var/lib/easel")),
            archive: true,
            ..ServerConfig::default()
        };
        assert_eq!(
            config.history_storage(),
            HistoryStorage::Journaled {
                dir: PathBuf::from("/var/lib/easel"),
                archive: true,
            }
        );
        assert!(config.login_policy().persistence);
    }

    #[test]
    fn test_require_tls_ignored_without_certificate() {
        let config = ServerConfig {
            require_tls: true,
            ..ServerConfig::default()
        };
        assert!(!config.login_policy().tls_required);

        let config = ServerConfig {
            require_tls: true,
            tls_cert: Some(PathBuf::from("cert.pem")),
            tls_key: Some(PathBuf::from("key.pem")),
            ..ServerConfig::default()
        };
        let policy = config.login_policy();
        assert!(policy.tls_available);
        assert!(policy.tls_required);
    }

    #[test]
    fn test_session_limits() {
        let config = ServerConfig {
            max_sessions: 3,
            session_size_limit: 1000,
            autoreset_threshold: 800,
            ..ServerConfig::default()
        };
        let limits = config.session_limits();
        assert_eq!(limits.max_sessions, 3);
        assert_eq!(limits.size_limit, 1000);
        assert_eq!(limits.auto_reset_threshold, 800);
    }
}

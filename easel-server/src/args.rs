//! Command-line argument parsing

use clap::Parser;
use easel_common::DEFAULT_PORT;
use easel_server::config::{
    DEFAULT_MAX_CONNECTIONS_PER_IP, DEFAULT_MAX_SESSIONS, DEFAULT_SESSION_SIZE_LIMIT, ServerConfig,
};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

/// Get default database path help text for current platform
fn default_database_help() -> String {
    #[cfg(target_os = "linux")]
    return "Database file path (default: ~/.local/share/easel/easel.db)".to_string();

    #[cfg(target_os = "macos")]
    return "Database file path (default: ~/Library/Application Support/easel/easel.db)"
        .to_string();

    #[cfg(target_os = "windows")]
    return "Database file path (default: %APPDATA%\\easel\\easel.db)".to_string();

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    return "Database file path (overrides platform default)".to_string();
}

/// Easel collaborative canvas server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// IP address to bind to (IPv4 or IPv6)
    #[arg(short, long, default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Database file path (overrides platform default)
    #[arg(short, long, help = default_database_help())]
    pub database: Option<PathBuf>,

    /// Directory for persistent session recordings (sessions stay in memory without it)
    #[arg(short = 's', long = "sessions")]
    pub sessions_dir: Option<PathBuf>,

    /// Keep the files of terminated sessions instead of deleting them
    #[arg(long, default_value = "false")]
    pub archive: bool,

    /// Maximum session history size in bytes (0 for unlimited)
    #[arg(long, default_value_t = DEFAULT_SESSION_SIZE_LIMIT)]
    pub session_size_limit: u64,

    /// Default history size that triggers an automatic reset (0 to disable)
    #[arg(long, default_value_t = 0)]
    pub autoreset_threshold: u64,

    /// Maximum number of concurrent sessions (0 for unlimited)
    #[arg(long, default_value_t = DEFAULT_MAX_SESSIONS)]
    pub max_sessions: usize,

    /// Refuse guest logins (an account is required)
    #[arg(long, default_value = "false")]
    pub no_guests: bool,

    /// Only users with the HOST flag may create sessions
    #[arg(long, default_value = "false")]
    pub no_guest_hosts: bool,

    /// Clients must look up a session before identifying
    #[arg(long, default_value = "false")]
    pub mandatory_lookup: bool,

    /// TLS certificate chain (PEM); enables STARTTLS together with --tls-key
    #[arg(long, requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    /// Refuse logins on connections that have not upgraded to TLS
    #[arg(long, default_value = "false", requires = "tls_cert")]
    pub require_tls: bool,

    /// Maximum simultaneous connections from one IP address (0 for unlimited)
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS_PER_IP)]
    pub max_connections_per_ip: usize,

    /// Enable debug logging (shows connection and login details)
    #[arg(long, default_value = "false")]
    pub debug: bool,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            bind: SocketAddr::new(args.bind, args.port),
            database: args.database,
            sessions_dir: args.sessions_dir,
            archive: args.archive,
            session_size_limit: args.session_size_limit,
            autoreset_threshold: args.autoreset_threshold,
            max_sessions: args.max_sessions,
            allow_guests: !args.no_guests,
            allow_guest_hosts: !args.no_guest_hosts,
            mandatory_lookup: args.mandatory_lookup,
            tls_cert: args.tls_cert,
            tls_key: args.tls_key,
            require_tls: args.require_tls,
            max_connections_per_ip: args.max_connections_per_ip,
            debug: args.debug,
        }
    }
}

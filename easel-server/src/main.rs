//! Easel collaborative canvas server

mod args;

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use args::Args;
use easel_server::config::ServerConfig;
use easel_server::connection::{ConnectionParams, handle_connection};
use easel_server::connection_tracker::ConnectionTracker;
use easel_server::db::{self, Database, DbLog};
use easel_server::history::BLOCK_MAX_AGE;
use easel_server::login::{DirectoryLookup, LoginServices, SessionsDirectory};
use easel_server::server_log::{LogEntry, LogLevel, LogTopic, ServerLog, emit};
use easel_server::sessions::SessionServer;
use easel_server::tls::load_tls_acceptor;

/// Server log entries older than this are purged at startup
const LOG_RETENTION_DAYS: i64 = 30;

/// How long shutdown waits for buffered log entries to be written
const LOG_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    let config = Arc::new(ServerConfig::from(Args::parse()));
    init_tracing(config.debug);

    info!("Easel server v{}", env!("CARGO_PKG_VERSION"));

    let database = setup_db(config.database.clone()).await;
    match database
        .log
        .purge_before(Utc::now() - ChronoDuration::days(LOG_RETENTION_DAYS))
        .await
    {
        Ok(0) => {}
        Ok(purged) => info!(purged, "purged old server log entries"),
        Err(e) => warn!("could not purge server log: {e}"),
    }

    let (db_log, log_writer) = DbLog::spawn(database.log.clone());
    let server_log: Arc<dyn ServerLog> = Arc::new(db_log);

    let sessions = Arc::new(SessionServer::new(
        config.history_storage(),
        config.session_limits(),
        Arc::clone(&server_log),
    ));
    setup_sessions(&config, &sessions);
    let block_sealer = sessions.spawn_block_sealer(BLOCK_MAX_AGE);

    let tls_acceptor = setup_tls(&config);
    let login = login_services(&config, &database, &sessions, &server_log);
    let connection_tracker = Arc::new(ConnectionTracker::new(config.max_connections_per_ip));

    let listener = match TcpListener::bind(config.bind).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("could not bind {}: {e}", config.bind);
            std::process::exit(1);
        }
    };
    info!("listening on {}", config.bind);
    emit(
        server_log.as_ref(),
        LogEntry::new(LogLevel::Info, LogTopic::Status, "server started"),
    );

    let debug = config.debug;
    tokio::select! {
        _ = setup_shutdown_signal() => {
            info!("shutdown signal received");
        }
        _ = async {
            loop {
                match listener.accept().await {
                    Ok((socket, peer_addr)) => {
                        let Some(connection_guard) = connection_tracker.try_acquire(peer_addr.ip()) else {
                            if debug {
                                debug!(peer = %peer_addr, "connection limit reached");
                            }
                            // Just drop the socket - client will see connection reset
                            continue;
                        };

                        if let Err(e) = socket.set_nodelay(true) {
                            debug!(peer = %peer_addr, "could not set TCP_NODELAY: {e}");
                        }

                        let params = ConnectionParams {
                            peer_addr,
                            login: Arc::clone(&login),
                            sessions: Arc::clone(&sessions),
                            tls_acceptor: tls_acceptor.clone(),
                            debug,
                        };

                        tokio::spawn(async move {
                            // Hold the guard for the lifetime of the connection
                            let _guard = connection_guard;
                            if let Err(e) = handle_connection(socket, params).await {
                                log_connection_error(&e, peer_addr, debug);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("accept failed: {e}");
                    }
                }
            }
        } => {}
    }

    block_sealer.abort();
    sessions.close_blocks().await;
    emit(
        server_log.as_ref(),
        LogEntry::new(LogLevel::Info, LogTopic::Status, "server stopped"),
    );

    // The writer task ends once every log handle is gone; open connections
    // still hold one, so only wait briefly
    drop(login);
    drop(sessions);
    drop(server_log);
    match tokio::time::timeout(LOG_FLUSH_TIMEOUT, log_writer).await {
        Ok(Err(e)) => warn!("server log writer failed: {e}"),
        Err(_) => debug!("server log writer still busy at exit"),
        Ok(Ok(())) => {}
    }
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Set secure file permissions (0o600 - owner read/write only)
/// Unix only - Windows uses NTFS ACLs by default
#[cfg(unix)]
fn set_secure_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_mode(0o600);
    fs::set_permissions(path, permissions)
}

/// Open the database, exiting on failure
async fn setup_db(database_path: Option<PathBuf>) -> Database {
    // Determine database path (use provided path or platform default)
    let db_path = database_path.unwrap_or_else(|| match db::default_database_path() {
        Ok(path) => path,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    });

    let pool = match db::init_db(&db_path).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("could not open database {}: {e}", db_path.display());
            std::process::exit(1);
        }
    };
    info!("database: {}", db_path.display());

    #[cfg(unix)]
    if let Err(e) = set_secure_permissions(&db_path) {
        error!("could not set database permissions: {e}");
        std::process::exit(1);
    }

    Database::new(pool)
}

/// Prepare the sessions directory and load persisted sessions
fn setup_sessions(config: &ServerConfig, sessions: &SessionServer) {
    let Some(dir) = &config.sessions_dir else {
        info!("sessions are kept in memory only");
        return;
    };
    if let Err(e) = fs::create_dir_all(dir) {
        error!("could not create sessions directory {}: {e}", dir.display());
        std::process::exit(1);
    }
    match sessions.load_persisted() {
        Ok(count) => info!("loaded {count} persistent session(s) from {}", dir.display()),
        Err(e) => {
            error!("could not read sessions directory {}: {e}", dir.display());
            std::process::exit(1);
        }
    }
}

fn setup_tls(config: &ServerConfig) -> Option<TlsAcceptor> {
    let (Some(cert), Some(key)) = (&config.tls_cert, &config.tls_key) else {
        return None;
    };
    match load_tls_acceptor(cert, key) {
        Ok(acceptor) => {
            info!("STARTTLS enabled with {}", cert.display());
            Some(acceptor)
        }
        Err(e) => {
            error!("TLS setup failed: {e}");
            std::process::exit(1);
        }
    }
}

fn login_services(
    config: &ServerConfig,
    database: &Database,
    sessions: &Arc<SessionServer>,
    server_log: &Arc<dyn ServerLog>,
) -> Arc<LoginServices> {
    let directory: Arc<dyn SessionsDirectory> = sessions.clone();
    Arc::new(LoginServices {
        policy: config.login_policy(),
        sessions: Arc::clone(&directory),
        accounts: Some(Arc::new(database.accounts.clone())),
        ext_auth: None,
        lookup: Arc::new(DirectoryLookup::new(directory)),
        log: Arc::clone(server_log),
    })
}

/// Log connection errors, filtering out benign TLS warnings
///
/// Filters out:
/// - TLS close_notify warnings (clients disconnecting abruptly)
/// - TLS handshake failures (only logged in debug mode)
fn log_connection_error(error: &io::Error, peer_addr: SocketAddr, debug: bool) {
    let error_msg = error.to_string();

    if error_msg.contains("close_notify") {
        return;
    }

    if error_msg.starts_with("TLS handshake failed") {
        if debug {
            debug!(peer = %peer_addr, "{error}");
        }
        return;
    }

    warn!(peer = %peer_addr, "connection error: {error}");
}

/// Wait for a shutdown signal (Ctrl+C, or SIGTERM on Unix)
async fn setup_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let (Ok(mut sigterm), Ok(mut sigint)) = (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) else {
            error!("could not install signal handlers");
            std::future::pending::<()>().await;
            return;
        };

        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("could not listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    }
}

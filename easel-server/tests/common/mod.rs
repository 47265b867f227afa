//! Shared helpers for integration tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use easel_common::ProtocolVersion;
use easel_server::history::{HistoryStorage, SessionHistory, SessionMetadata};
use easel_server::login::{DirectoryLookup, LoginPolicy, LoginServices, SessionsDirectory};
use easel_server::server_log::MemoryLog;
use easel_server::sessions::{SessionLimits, SessionServer};

pub fn protocol() -> ProtocolVersion {
    "easel:4.24.0".parse().unwrap()
}

pub fn metadata(id: &str) -> SessionMetadata {
    SessionMetadata::new(id, Some(format!("{id}-alias")), protocol(), "founder")
}

/// A durable session history stored in `dir`
pub fn journaled(dir: &Path, id: &str) -> SessionHistory {
    let storage = HistoryStorage::Journaled {
        dir: dir.to_path_buf(),
        archive: false,
    };
    SessionHistory::create(&storage, metadata(id)).unwrap()
}

/// A memory-backed session server and login services around it
pub fn login_services(policy: LoginPolicy) -> (Arc<SessionServer>, Arc<LoginServices>, Arc<MemoryLog>) {
    let log = Arc::new(MemoryLog::new());
    let sessions = Arc::new(SessionServer::new(
        HistoryStorage::Memory,
        SessionLimits::default(),
        log.clone(),
    ));
    let directory: Arc<dyn SessionsDirectory> = sessions.clone();
    let services = Arc::new(LoginServices {
        policy,
        sessions: directory.clone(),
        accounts: None,
        ext_auth: None,
        lookup: Arc::new(DirectoryLookup::new(directory)),
        log: log.clone(),
    });
    (sessions, services, log)
}

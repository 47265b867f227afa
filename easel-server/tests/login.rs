//! End-to-end login tests over an in-memory connection
//!
//! A real sqlite account database sits behind the login, and every
//! exchange goes through the line protocol the way a client sees it.

mod common;

use std::sync::Arc;

use common::login_services;
use easel_common::io::{read_message, write_message};
use easel_common::protocol::{ClientMessage, IdentIntent, ServerMessage};
use easel_server::connection::{ConnectionParams, handle_connection};
use easel_server::db::{self, Database, hash_password};
use easel_server::login::{LoginPolicy, LoginServices, MAX_PASSWORD_ATTEMPTS};
use easel_server::sessions::SessionServer;
use tempfile::TempDir;
use tokio::io::{BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

// ============================================================================
// Helper Functions
// ============================================================================

struct TestClient {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    task: JoinHandle<std::io::Result<()>>,
}

impl TestClient {
    fn connect(sessions: &Arc<SessionServer>, login: &Arc<LoginServices>) -> Self {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let params = ConnectionParams {
            peer_addr: "198.51.100.4:50000".parse().unwrap(),
            login: Arc::clone(login),
            sessions: Arc::clone(sessions),
            tls_acceptor: None,
            debug: false,
        };
        let task = tokio::spawn(handle_connection(server, params));
        let (reader, writer) = tokio::io::split(client);
        Self {
            reader: BufReader::new(reader),
            writer,
            task,
        }
    }

    async fn send(&mut self, message: ClientMessage) {
        write_message(&mut self.writer, &message).await.unwrap();
    }

    async fn recv(&mut self) -> Option<ServerMessage> {
        read_message(&mut self.reader).await.unwrap()
    }

    async fn expect_error(&mut self) -> String {
        match self.recv().await {
            Some(ServerMessage::Error { code, .. }) => code,
            other => panic!("expected an error, got {other:?}"),
        }
    }
}

fn auth(username: &str, password: &str) -> ClientMessage {
    ClientMessage::Ident {
        username: username.to_string(),
        password: Some(password.to_string()),
        ext_auth: None,
        intent: Some(IdentIntent::Auth),
    }
}

/// Login services backed by a fresh sqlite database holding one account
async fn with_account(
    dir: &TempDir,
    username: &str,
    password: &str,
) -> (Arc<SessionServer>, Arc<LoginServices>) {
    let pool = db::init_db(&dir.path().join("easel.db")).await.unwrap();
    let database = Database::new(pool);
    let hash = hash_password(password, true).unwrap();
    database
        .accounts
        .create_account(username, &hash, &["HOST"])
        .await
        .unwrap();

    let (sessions, services, _log) = login_services(LoginPolicy::default());
    let services = Arc::new(LoginServices {
        policy: services.policy.clone(),
        sessions: Arc::clone(&services.sessions),
        accounts: Some(Arc::new(database.accounts.clone())),
        ext_auth: None,
        lookup: Arc::clone(&services.lookup),
        log: Arc::clone(&services.log),
    });
    (sessions, services)
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_greeting_advertises_password_login() {
    let dir = TempDir::new().unwrap();
    let (sessions, login) = with_account(&dir, "alice", "correct horse").await;
    let mut client = TestClient::connect(&sessions, &login);

    match client.recv().await {
        Some(ServerMessage::Greeting { version, flags }) => {
            assert_eq!(version, easel_common::SERVER_PROTOCOL_VERSION);
            assert!(flags.iter().any(|f| f == easel_common::FEATURE_IDENT));
            assert!(!flags.iter().any(|f| f == easel_common::FEATURE_TLS));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_join_before_ident_is_rejected() {
    let (sessions, login, _log) = login_services(LoginPolicy::default());
    let mut client = TestClient::connect(&sessions, &login);
    client.recv().await;

    client
        .send(ClientMessage::Join {
            id: "somewhere".to_string(),
            invite: None,
            password: None,
        })
        .await;
    assert_eq!(client.expect_error().await, "protocolViolation");
    assert!(client.recv().await.is_none());
    client.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_tenth_wrong_password_disconnects() {
    let dir = TempDir::new().unwrap();
    let (sessions, login) = with_account(&dir, "alice", "correct horse").await;
    let mut client = TestClient::connect(&sessions, &login);
    client.recv().await;

    for _ in 1..MAX_PASSWORD_ATTEMPTS {
        client.send(auth("alice", "wrong")).await;
        assert_eq!(client.expect_error().await, "badPassword");
    }

    client.send(auth("alice", "wrong")).await;
    assert_eq!(client.expect_error().await, "tooManyAttempts");
    assert!(client.recv().await.is_none());
}

#[tokio::test]
async fn test_account_login_then_host() {
    let dir = TempDir::new().unwrap();
    let (sessions, login) = with_account(&dir, "alice", "correct horse").await;
    let mut client = TestClient::connect(&sessions, &login);
    client.recv().await;

    client.send(auth("ALICE", "wrong")).await;
    assert_eq!(client.expect_error().await, "badPassword");

    client.send(auth("alice", "correct horse")).await;
    match client.recv().await {
        Some(ServerMessage::Identified {
            username,
            guest,
            flags,
        }) => {
            assert_eq!(username, "alice");
            assert!(!guest);
            assert_eq!(flags, vec!["HOST".to_string()]);
        }
        other => panic!("unexpected {other:?}"),
    }

    client
        .send(ClientMessage::Host {
            id: Some("alices-room".to_string()),
            alias: None,
            protocol: common::protocol(),
            title: Some("Alice's room".to_string()),
            password: None,
        })
        .await;
    loop {
        match client.recv().await {
            Some(ServerMessage::SessionList { .. }) => continue,
            Some(ServerMessage::LoginOk { id, founder, .. }) => {
                assert_eq!(id, "alices-room");
                assert!(founder);
                break;
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(sessions.session_count(), 1);
}

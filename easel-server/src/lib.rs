//! Easel collaborative canvas server library
//!
//! This library exposes the server's internal modules for the `easeld`
//! binary and for integration testing.

pub mod config;
pub mod connection;
pub mod connection_tracker;
pub mod db;
pub mod history;
pub mod login;
pub mod server_log;
pub mod session;
pub mod sessions;
pub mod tls;

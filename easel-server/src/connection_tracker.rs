//! Connection tracking for DoS protection
//!
//! Limits how many connections a single IP address may hold open at once,
//! so one client cannot exhaust the server's sockets or login slots.
//! IPv4-mapped IPv6 addresses count towards their IPv4 address.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::history::normalize_ip;

type Counts = Arc<Mutex<HashMap<IpAddr, usize>>>;

fn lock(counts: &Counts) -> MutexGuard<'_, HashMap<IpAddr, usize>> {
    counts.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tracks active connections per IP address
///
/// A limit of 0 means unlimited connections are allowed.
#[derive(Debug)]
pub struct ConnectionTracker {
    connections: Counts,
    max_connections_per_ip: AtomicUsize,
}

impl ConnectionTracker {
    #[must_use]
    pub fn new(max_connections_per_ip: usize) -> Self {
        Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            max_connections_per_ip: AtomicUsize::new(max_connections_per_ip),
        }
    }

    /// Update the limit
    ///
    /// This affects new connections only; existing connections are not disconnected.
    pub fn set_max_connections_per_ip(&self, limit: usize) {
        self.max_connections_per_ip.store(limit, Ordering::Relaxed);
    }

    /// Try to acquire a connection slot for the given IP
    ///
    /// Returns `None` if the IP has reached its connection limit. The slot
    /// is released when the returned guard is dropped.
    pub fn try_acquire(&self, ip: IpAddr) -> Option<ConnectionGuard> {
        let ip = normalize_ip(ip);
        let max = self.max_connections_per_ip.load(Ordering::Relaxed);
        let mut connections = lock(&self.connections);
        let count = connections.entry(ip).or_insert(0);

        if max > 0 && *count >= max {
            return None;
        }

        *count += 1;
        Some(ConnectionGuard {
            ip,
            connections: self.connections.clone(),
        })
    }

    /// Current number of connections from `ip`
    pub fn connection_count(&self, ip: IpAddr) -> usize {
        lock(&self.connections)
            .get(&normalize_ip(ip))
            .copied()
            .unwrap_or(0)
    }

    /// Total active connections across all IPs
    pub fn total_connections(&self) -> usize {
        lock(&self.connections).values().sum()
    }
}

/// RAII guard that releases a connection slot when dropped
///
/// Slots are released even if the connection handler panics or returns early.
#[derive(Debug)]
pub struct ConnectionGuard {
    ip: IpAddr,
    connections: Counts,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let mut connections = lock(&self.connections);
        if let Some(count) = connections.get_mut(&self.ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                connections.remove(&self.ip);
            }
        }
    }
}

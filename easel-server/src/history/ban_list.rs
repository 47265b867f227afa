//! Per-session ban list
//!
//! A ban matches a user by IP address, external authentication id, or
//! client session id (sid). IPv4-mapped IPv6 addresses (e.g.
//! `::ffff:192.168.1.100`) are normalized to IPv4 before comparison, so a ban
//! works regardless of how the OS presents incoming connections.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

/// Errors from importing a ban list
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BanListError {
    #[error("ban list must be a JSON array")]
    NotAList,
}

/// A single ban
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanEntry {
    pub id: u32,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext_auth_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    pub banned_by: String,
    pub timestamp: DateTime<Utc>,
}

/// Identity of a user being banned or checked against the list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BanTarget {
    pub username: String,
    pub ip: Option<IpAddr>,
    pub ext_auth_id: Option<String>,
    pub sid: Option<String>,
}

impl BanTarget {
    fn normalized(mut self) -> Self {
        self.ip = self.ip.map(normalize_ip);
        self.ext_auth_id = self.ext_auth_id.filter(|s| !s.is_empty());
        self.sid = self.sid.filter(|s| !s.is_empty());
        self
    }
}

/// Result of a bulk import
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BanImport {
    /// Entries present in the imported data
    pub total: usize,
    /// Entries that were new and got added
    pub imported: usize,
}

/// Ordered collection of bans with unique, increasing ids
#[derive(Debug, Default, Clone)]
pub struct BanList {
    entries: Vec<BanEntry>,
    next_id: u32,
}

impl BanList {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
        }
    }

    /// Would a ban on `target` duplicate an existing one?
    pub fn is_duplicate(&self, target: &BanTarget) -> bool {
        let ip = target.ip.map(normalize_ip);
        self.entries
            .iter()
            .any(|e| e.ip == ip && e.ext_auth_id == target.ext_auth_id && e.sid == target.sid)
    }

    /// Build the entry `add` would insert, without inserting it
    ///
    /// Returns `None` when the ban would be a duplicate.
    pub fn prepare(
        &self,
        target: BanTarget,
        banned_by: &str,
        timestamp: DateTime<Utc>,
    ) -> Option<BanEntry> {
        let target = target.normalized();
        if self.is_duplicate(&target) {
            return None;
        }
        Some(BanEntry {
            id: self.next_id.max(1),
            username: target.username,
            ip: target.ip,
            ext_auth_id: target.ext_auth_id,
            sid: target.sid,
            banned_by: banned_by.to_string(),
            timestamp,
        })
    }

    /// Insert a fully formed entry (used when replaying persisted bans)
    pub fn insert(&mut self, entry: BanEntry) {
        self.next_id = self.next_id.max(entry.id.saturating_add(1));
        self.entries.push(entry);
    }

    /// Remove a ban by id, returning the banned username
    pub fn remove(&mut self, id: u32) -> Option<String> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(pos).username)
    }

    /// Find the ban matching any of the given identifiers
    pub fn is_banned(
        &self,
        ip: Option<IpAddr>,
        ext_auth_id: Option<&str>,
        sid: Option<&str>,
    ) -> Option<&BanEntry> {
        let ip = ip.map(normalize_ip);
        let ext_auth_id = ext_auth_id.filter(|s| !s.is_empty());
        let sid = sid.filter(|s| !s.is_empty());

        self.entries.iter().find(|e| {
            (e.ip.is_some() && e.ip == ip)
                || (e.ext_auth_id.is_some() && e.ext_auth_id.as_deref() == ext_auth_id)
                || (e.sid.is_some() && e.sid.as_deref() == sid)
        })
    }

    pub fn entries(&self) -> &[BanEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse ban data for import
    ///
    /// Returns the number of entries seen and the well-formed targets with
    /// their banning actor. Malformed entries are counted but skipped.
    pub fn parse_import(data: &Value) -> Result<(usize, Vec<(BanTarget, String)>), BanListError> {
        let items = data.as_array().ok_or(BanListError::NotAList)?;
        let parsed = items.iter().filter_map(parse_import_entry).collect();
        Ok((items.len(), parsed))
    }

    /// Export bans as JSON for operators and other servers
    pub fn export(&self) -> Value {
        Value::Array(
            self.entries
                .iter()
                .map(|e| {
                    json!({
                        "id": e.id,
                        "username": e.username,
                        "ip": e.ip.map(|ip| ip.to_string()),
                        "extAuthId": e.ext_auth_id,
                        "sid": e.sid,
                        "bannedBy": e.banned_by,
                        "timestamp": e.timestamp.to_rfc3339(),
                    })
                })
                .collect(),
        )
    }
}

fn parse_import_entry(item: &Value) -> Option<(BanTarget, String)> {
    let obj = item.as_object()?;
    let text = |key: &str| obj.get(key).and_then(Value::as_str).map(str::to_string);

    let ip = match obj.get("ip") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.is_empty() => None,
        Some(Value::String(s)) => Some(s.parse::<IpAddr>().ok()?),
        Some(_) => return None,
    };
    let target = BanTarget {
        username: text("username").unwrap_or_default(),
        ip,
        ext_auth_id: text("extAuthId"),
        sid: text("sid"),
    }
    .normalized();

    // A ban that matches nobody is not a ban
    if target.ip.is_none() && target.ext_auth_id.is_none() && target.sid.is_none() {
        return None;
    }
    Some((target, text("bannedBy").unwrap_or_default()))
}

/// Normalize an IP address, converting IPv4-mapped IPv6 to IPv4
pub fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        _ => ip,
    }
}

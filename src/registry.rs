// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Robot identity registry: bidirectional `(ip, port) <-> alias` mapping.
//!
//! All mappings are mutated together under one lock (mirrors the
//! `robot_alias_manager` dict guarded by a single `asyncio.Lock` in the
//! original bridge): minting an alias, recording the primary alias for an
//! IP, and removing a session on disconnect must all be seen atomically by
//! every other session task.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::SystemTime;

use serde::Serialize;
use tokio::sync::mpsc;

/// A line written to a robot's TCP socket by its writer task.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    /// Written verbatim, no trailing newline (plain ASCII commands such as
    /// `MOTOR:<n> Kp:<> Ki:<> Kd:<>`).
    Text(String),
    /// Serialized as one compact JSON object followed by `\n` (NDJSON).
    Json(serde_json::Value),
}

/// The per-session handle stored in the registry. The registry itself never
/// touches the socket: writes are channeled through `sender` into the
/// session's own writer task.
#[derive(Debug, Clone)]
pub struct RobotHandle {
    pub ip: IpAddr,
    pub port: u16,
    pub alias: String,
    pub sender: mpsc::Sender<OutboundFrame>,
    pub connected_at: SystemTime,
    token: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RobotSnapshot {
    pub alias: String,
    pub ip: String,
    pub port: u16,
}

#[derive(Default)]
struct RegistryInner {
    by_addr: HashMap<(IpAddr, u16), RobotHandle>,
    alias_to_addr: HashMap<String, (IpAddr, u16)>,
    ip_primary_alias: HashMap<IpAddr, String>,
    next_alias: u64,
    next_token: u64,
}

pub struct Registry {
    inner: Mutex<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                next_alias: 1,
                ..Default::default()
            }),
        }
    }

    /// Registers (or re-registers) a TCP session for `(ip, port)`, minting a
    /// fresh `robot<N>` alias only if this `(ip, port)` pair has never been
    /// seen. Returns the alias and an opaque `token` the caller must present
    /// to [`Registry::unregister`] so a stale disconnect can never evict a
    /// session that has since reconnected and re-registered under the same
    /// address.
    pub fn register(&self, ip: IpAddr, port: u16, sender: mpsc::Sender<OutboundFrame>) -> (String, u64) {
        let mut inner = self.inner.lock().unwrap();
        let key = (ip, port);

        let alias = match inner.alias_to_addr.iter().find(|(_, a)| **a == key) {
            Some((alias, _)) => alias.clone(),
            None => {
                let alias = format!("robot{}", inner.next_alias);
                inner.next_alias += 1;
                inner.alias_to_addr.insert(alias.clone(), key);
                alias
            }
        };

        inner
            .ip_primary_alias
            .entry(ip)
            .or_insert_with(|| alias.clone());

        let token = inner.next_token;
        inner.next_token += 1;

        inner.by_addr.insert(
            key,
            RobotHandle {
                ip,
                port,
                alias: alias.clone(),
                sender,
                connected_at: SystemTime::now(),
                token,
            },
        );

        (alias, token)
    }

    /// Removes the session for `(ip, port)` iff it is still owned by
    /// `token` (compare-and-delete: protects against a lingering disconnect
    /// task racing a freshly reconnected session for the same address).
    pub fn unregister(&self, ip: IpAddr, port: u16, token: u64) -> Option<RobotHandle> {
        let mut inner = self.inner.lock().unwrap();
        let key = (ip, port);

        match inner.by_addr.get(&key) {
            Some(handle) if handle.token == token => {}
            _ => return None,
        }

        let handle = inner.by_addr.remove(&key)?;
        inner.alias_to_addr.remove(&handle.alias);
        if inner.ip_primary_alias.get(&ip) == Some(&handle.alias) {
            inner.ip_primary_alias.remove(&ip);
        }
        Some(handle)
    }

    pub fn lookup_by_alias(&self, alias: &str) -> Option<RobotHandle> {
        let inner = self.inner.lock().unwrap();
        let addr = inner.alias_to_addr.get(alias)?;
        inner.by_addr.get(addr).cloned()
    }

    /// Looks up the primary session for an IP (the first alias minted for
    /// that address that is still connected).
    pub fn lookup_by_ip(&self, ip: IpAddr) -> Option<RobotHandle> {
        let inner = self.inner.lock().unwrap();
        let alias = inner.ip_primary_alias.get(&ip)?;
        let addr = inner.alias_to_addr.get(alias)?;
        inner.by_addr.get(addr).cloned()
    }

    pub fn snapshot(&self) -> Vec<RobotSnapshot> {
        let inner = self.inner.lock().unwrap();
        inner
            .by_addr
            .values()
            .map(|h| RobotSnapshot {
                alias: h.alias.clone(),
                ip: h.ip.to_string(),
                port: h.port,
            })
            .collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

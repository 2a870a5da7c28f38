// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscription router: fans a robot telemetry frame out to every UI client
//! subscribed to `(robot_alias, data_type)` or `(GLOBAL, data_type)`.
//!
//! The whole nested subscription map lives behind a single `Mutex` (not a
//! `DashMap`) because client add/remove/subscribe/unsubscribe and the
//! broadcast snapshot all need to observe the same consistent state; a
//! snapshot of matching senders is taken under the lock and the actual
//! sends happen after it's released, with any closed channels reaped in a
//! second, equally atomic pass.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

pub type ClientId = SocketAddr;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Robot(String),
    Global,
}

struct ClientEntry {
    sender: mpsc::Sender<Value>,
    subs: HashMap<EntityKey, HashSet<String>>,
}

pub struct SubscriptionRouter {
    clients: Mutex<HashMap<ClientId, ClientEntry>>,
}

impl SubscriptionRouter {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_client(&self, id: ClientId, sender: mpsc::Sender<Value>) {
        self.clients.lock().unwrap().insert(
            id,
            ClientEntry {
                sender,
                subs: HashMap::new(),
            },
        );
    }

    pub fn remove_client(&self, id: &ClientId) {
        self.clients.lock().unwrap().remove(id);
    }

    pub fn subscribe(&self, id: &ClientId, entity: EntityKey, data_type: &str) {
        if let Some(entry) = self.clients.lock().unwrap().get_mut(id) {
            entry
                .subs
                .entry(entity)
                .or_default()
                .insert(data_type.to_string());
        }
    }

    pub fn unsubscribe(&self, id: &ClientId, entity: &EntityKey, data_type: &str) {
        if let Some(entry) = self.clients.lock().unwrap().get_mut(id) {
            if let Some(set) = entry.subs.get_mut(entity) {
                set.remove(data_type);
            }
        }
    }

    /// Sends `payload` to every client subscribed to `(robot_alias,
    /// data_type)` or `(GLOBAL, data_type)` — exactly once per client even
    /// if both patterns match. Clients whose channel has since closed are
    /// dropped from the registry.
    pub async fn broadcast(&self, robot_alias: &str, data_type: &str, payload: Value) {
        let targets: Vec<(ClientId, mpsc::Sender<Value>)> = {
            let clients = self.clients.lock().unwrap();
            clients
                .iter()
                .filter(|(_, entry)| {
                    let matches_robot = entry
                        .subs
                        .get(&EntityKey::Robot(robot_alias.to_string()))
                        .map(|set| set.contains(data_type))
                        .unwrap_or(false);
                    let matches_global = entry
                        .subs
                        .get(&EntityKey::Global)
                        .map(|set| set.contains(data_type))
                        .unwrap_or(false);
                    matches_robot || matches_global
                })
                .map(|(id, entry)| (*id, entry.sender.clone()))
                .collect()
        };

        let mut dead = Vec::new();
        for (id, sender) in targets {
            if sender.send(payload.clone()).await.is_err() {
                dead.push(id);
            }
        }

        if !dead.is_empty() {
            let mut clients = self.clients.lock().unwrap();
            for id in dead {
                debug!("dropping client {id} with a closed outbound channel");
                clients.remove(&id);
            }
        }
    }

    /// Sends `payload` to every connected client, regardless of
    /// subscriptions (used for proactive events such as
    /// `available_robot_update`).
    pub async fn broadcast_all(&self, payload: Value) {
        let targets: Vec<(ClientId, mpsc::Sender<Value>)> = {
            let clients = self.clients.lock().unwrap();
            clients.iter().map(|(id, e)| (*id, e.sender.clone())).collect()
        };

        let mut dead = Vec::new();
        for (id, sender) in targets {
            if sender.send(payload.clone()).await.is_err() {
                dead.push(id);
            }
        }
        if !dead.is_empty() {
            let mut clients = self.clients.lock().unwrap();
            for id in dead {
                clients.remove(&id);
            }
        }
    }
}

impl Default for SubscriptionRouter {
    fn default() -> Self {
        Self::new()
    }
}

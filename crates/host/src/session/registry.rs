//! Client registry.
//!
//! Holds one record per admitted participant, the owner included. The lock
//! is never held across network I/O.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Local};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::connection::Connection;
use crate::error::{HostError, Result};

/// Unique identifier of a registered client.
pub type ClientId = Uuid;

/// One admitted participant.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    /// Registry identifier.
    pub id: ClientId,
    /// Name the client joined under.
    pub name: String,
    /// The client's connection. `None` for the owner, who sits at the host.
    pub connection: Option<Arc<Connection>>,
    /// When the client was admitted.
    pub joined: DateTime<Local>,
    /// Whether this is the session owner.
    pub owner: bool,
}

impl ClientRecord {
    /// Remote address, or `local` for the owner.
    pub fn addr(&self) -> &str {
        self.connection.as_ref().map(|c| c.peer()).unwrap_or("local")
    }
}

/// Read-only view of a client for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSummary {
    /// Display name.
    pub name: String,
    /// Remote address.
    pub addr: String,
    /// Join time.
    pub joined: DateTime<Local>,
}

impl fmt::Display for ClientSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) joined {}",
            self.name,
            self.addr,
            self.joined.format("%H:%M:%S")
        )
    }
}

#[derive(Debug)]
struct RegistryInner {
    clients: HashMap<ClientId, ClientRecord>,
    closed: bool,
}

/// The set of admitted clients, bounded by a maximum that counts the owner.
#[derive(Debug)]
pub struct Registry {
    inner: RwLock<RegistryInner>,
    max: usize,
    owner: ClientId,
}

impl Registry {
    /// Creates a registry holding only the owner's record.
    pub fn new(owner_name: impl Into<String>, max: usize) -> Self {
        let owner = ClientRecord {
            id: Uuid::new_v4(),
            name: owner_name.into(),
            connection: None,
            joined: Local::now(),
            owner: true,
        };
        let owner_id = owner.id;

        let mut clients = HashMap::new();
        clients.insert(owner_id, owner);

        Self {
            inner: RwLock::new(RegistryInner {
                clients,
                closed: false,
            }),
            max,
            owner: owner_id,
        }
    }

    /// Admits a client. Capacity is checked under the same lock as the insert.
    pub async fn insert(&self, name: impl Into<String>, connection: Arc<Connection>) -> Result<ClientId> {
        let mut inner = self.inner.write().await;
        if inner.closed {
            return Err(HostError::Cancelled);
        }
        if inner.clients.len() >= self.max {
            return Err(HostError::Capacity {
                current: inner.clients.len(),
                max: self.max,
            });
        }

        let record = ClientRecord {
            id: Uuid::new_v4(),
            name: name.into(),
            connection: Some(connection),
            joined: Local::now(),
            owner: false,
        };
        let id = record.id;
        inner.clients.insert(id, record);
        Ok(id)
    }

    /// Removes a client. The owner cannot be removed.
    pub async fn remove(&self, id: ClientId) -> Option<ClientRecord> {
        if id == self.owner {
            return None;
        }
        self.inner.write().await.clients.remove(&id)
    }

    /// Number of records, owner included.
    pub async fn len(&self) -> usize {
        self.inner.read().await.clients.len()
    }

    /// Returns whether another client can be admitted right now.
    pub async fn is_full(&self) -> bool {
        self.len().await >= self.max
    }

    /// Every non-owner client, oldest first.
    pub async fn summaries(&self) -> Vec<ClientSummary> {
        let inner = self.inner.read().await;
        let mut list: Vec<ClientSummary> = inner
            .clients
            .values()
            .filter(|r| !r.owner)
            .map(|r| ClientSummary {
                name: r.name.clone(),
                addr: r.addr().to_string(),
                joined: r.joined,
            })
            .collect();
        list.sort_by_key(|s| s.joined);
        list
    }

    /// `"current/max"`, owner included.
    pub async fn count_label(&self) -> String {
        format!("{}/{}", self.len().await, self.max)
    }

    /// Stops admissions without touching existing records.
    pub async fn seal(&self) {
        self.inner.write().await.closed = true;
    }

    /// Stops admissions and removes every non-owner record, returning them.
    pub async fn close(&self) -> Vec<ClientRecord> {
        let mut inner = self.inner.write().await;
        inner.closed = true;

        let owner = self.owner;
        let ids: Vec<ClientId> = inner.clients.keys().copied().filter(|id| *id != owner).collect();
        ids.into_iter()
            .filter_map(|id| inner.clients.remove(&id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split};

    fn conn(peer: &str) -> Arc<Connection> {
        let (a, _b) = duplex(64);
        let (r, w) = split(a);
        Arc::new(Connection::new(r, w, peer))
    }

    #[tokio::test]
    async fn test_owner_counts_toward_max() {
        let registry = Registry::new("operator", 3);
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.count_label().await, "1/3");
        assert!(registry.summaries().await.is_empty());

        registry.insert("alice", conn("10.0.0.2:5000")).await.unwrap();
        registry.insert("bob", conn("10.0.0.3:5000")).await.unwrap();
        assert!(registry.is_full().await);

        let err = registry.insert("carol", conn("10.0.0.4:5000")).await.unwrap_err();
        assert!(matches!(err, HostError::Capacity { current: 3, max: 3 }));
        assert_eq!(registry.len().await, 3);
    }

    #[tokio::test]
    async fn test_insert_assigns_unique_ids() {
        let registry = Registry::new("operator", 10);
        let a = registry.insert("alice", conn("a")).await.unwrap();
        let b = registry.insert("alice", conn("b")).await.unwrap();
        assert_ne!(a, b);

        let names: Vec<String> = registry.summaries().await.into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alice", "alice"]);
    }

    #[tokio::test]
    async fn test_summaries_exclude_owner_and_format() {
        let registry = Registry::new("operator", 5);
        registry.insert("alice", conn("10.0.0.2:5000")).await.unwrap();

        let list = registry.summaries().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "alice");
        assert_eq!(list[0].addr, "10.0.0.2:5000");
        assert!(list[0].to_string().starts_with("alice (10.0.0.2:5000) joined "));
    }

    #[tokio::test]
    async fn test_remove_is_single_shot_and_spares_owner() {
        let registry = Registry::new("operator", 5);
        let c = conn("peer");
        let id = registry.insert("alice", Arc::clone(&c)).await.unwrap();

        let removed = registry.remove(id).await.unwrap();
        assert_eq!(removed.addr(), "peer");
        assert!(registry.remove(id).await.is_none());

        let owner = registry.owner;
        assert!(registry.remove(owner).await.is_none());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_close_drains_and_blocks_admission() {
        let registry = Registry::new("operator", 5);
        registry.insert("alice", conn("a")).await.unwrap();
        registry.insert("bob", conn("b")).await.unwrap();

        let drained = registry.close().await;
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().all(|r| !r.owner));
        assert_eq!(registry.len().await, 1);

        let err = registry.insert("carol", conn("c")).await.unwrap_err();
        assert!(matches!(err, HostError::Cancelled));
    }

    #[tokio::test]
    async fn test_seal_keeps_records() {
        let registry = Registry::new("operator", 5);
        registry.insert("alice", conn("a")).await.unwrap();
        registry.seal().await;

        assert_eq!(registry.len().await, 2);
        assert!(registry.insert("bob", conn("b")).await.is_err());
        assert_eq!(registry.close().await.len(), 1);
    }
}

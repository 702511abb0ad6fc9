//! Listener and session registry
//!
//! The registry is the single owner of "is this listener/session still alive"
//! truth. Entries map externally visible keys (an anonymized proxy URL, or a
//! tunnel `host:port` string) to a running listener plus its set of live
//! sessions. Close operations remove the entry from the map *before* running
//! any close side effects, so a concurrent closer observes "already closed"
//! rather than a half-torn-down entry.

use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Set of live sessions hosted by one listener.
#[derive(Default)]
pub struct ConnectionSet {
    sessions: DashMap<Uuid, CancellationToken>,
}

impl ConnectionSet {
    /// Register a new session; the returned guard deregisters it on drop.
    pub fn register(self: &Arc<Self>) -> ConnectionGuard {
        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        self.sessions.insert(id, token.clone());
        ConnectionGuard {
            id,
            token,
            set: Arc::clone(self),
        }
    }

    /// Forcibly close every tracked session.
    pub fn close_all(&self) {
        for entry in self.sessions.iter() {
            entry.value().cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Handle held by a session task for its lifetime.
///
/// Dropping the guard removes the session from its listener's connection set;
/// sessions never touch the registry entry itself.
pub struct ConnectionGuard {
    id: Uuid,
    token: CancellationToken,
    set: Arc<ConnectionSet>,
}

impl ConnectionGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Resolves when the session has been forcibly closed.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.set.sessions.remove(&self.id);
    }
}

/// Registry entry for one running listener.
pub struct ListenerEntry {
    shutdown: CancellationToken,
    connections: Arc<ConnectionSet>,
}

impl ListenerEntry {
    pub fn new() -> Self {
        ListenerEntry {
            shutdown: CancellationToken::new(),
            connections: Arc::new(ConnectionSet::default()),
        }
    }

    /// Token the accept loop selects on.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn connections(&self) -> Arc<ConnectionSet> {
        Arc::clone(&self.connections)
    }

    /// Stop the listener. When `close_connections` is true, every live session
    /// is forcibly closed first; otherwise in-flight sessions finish naturally.
    pub fn close(self, close_connections: bool) {
        if close_connections {
            self.connections.close_all();
        }
        self.shutdown.cancel();
    }
}

impl Default for ListenerEntry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry mapping external keys to running listeners.
///
/// Owned by a single manager instance rather than process-wide state, so tests
/// can run isolated instances side by side.
#[derive(Default)]
pub struct Registry {
    tunnels: DashMap<String, ListenerEntry>,
    servers: DashMap<String, ListenerEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub(crate) fn insert_tunnel(&self, key: String, entry: ListenerEntry) {
        self.tunnels.insert(key, entry);
    }

    pub(crate) fn remove_tunnel(&self, key: &str) -> Option<ListenerEntry> {
        self.tunnels.remove(key).map(|(_, entry)| entry)
    }

    pub(crate) fn insert_server(&self, key: String, entry: ListenerEntry) {
        self.servers.insert(key, entry);
    }

    pub(crate) fn remove_server(&self, key: &str) -> Option<ListenerEntry> {
        self.servers.remove(key).map(|(_, entry)| entry)
    }

    /// Number of registered tunnel listeners.
    pub fn tunnel_count(&self) -> usize {
        self.tunnels.len()
    }

    /// Number of registered anonymized proxy servers.
    pub fn anonymized_count(&self) -> usize {
        self.servers.len()
    }

    /// Close every registered listener, forcing live sessions shut.
    pub(crate) fn drain(&self) {
        let keys: Vec<String> = self.tunnels.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some(entry) = self.remove_tunnel(&key) {
                entry.close(true);
            }
        }
        let keys: Vec<String> = self.servers.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some(entry) = self.remove_server(&key) {
                entry.close(true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_deregisters_on_drop() {
        let set = Arc::new(ConnectionSet::default());
        let guard = set.register();
        assert_eq!(set.len(), 1);
        drop(guard);
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn test_close_all_cancels_sessions() {
        let set = Arc::new(ConnectionSet::default());
        let guard = set.register();
        set.close_all();
        // resolves immediately once cancelled
        guard.cancelled().await;
    }

    #[tokio::test]
    async fn test_entry_close_signals_listener() {
        let entry = ListenerEntry::new();
        let token = entry.shutdown_token();
        let connections = entry.connections();
        let guard = connections.register();

        entry.close(false);
        assert!(token.is_cancelled());
        // graceful close leaves the session running
        assert_eq!(connections.len(), 1);
        drop(guard);
    }

    #[test]
    fn test_remove_is_single_winner() {
        let registry = Registry::new();
        registry.insert_tunnel("localhost:5555".to_string(), ListenerEntry::new());
        assert!(registry.remove_tunnel("localhost:5555").is_some());
        assert!(registry.remove_tunnel("localhost:5555").is_none());
    }
}

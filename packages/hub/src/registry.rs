use std::collections::BTreeMap;

use chatbox_ws::{ConnId, ConnectionHandle};

/// Registered connections, one per user id.
#[derive(Debug, Default)]
pub struct Registry {
    connections: BTreeMap<String, ConnectionHandle>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handle` under its user id and returns the connection it
    /// replaced, if that user was already connected.
    pub fn insert(&mut self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        self.connections.insert(handle.user_id().to_string(), handle)
    }

    /// Removes `user_id` only if it is still registered to `conn_id`.
    pub fn remove(&mut self, user_id: &str, conn_id: ConnId) -> Option<ConnectionHandle> {
        if self.connections.get(user_id)?.conn_id() != conn_id {
            return None;
        }
        self.connections.remove(user_id)
    }

    #[must_use]
    pub fn get(&self, user_id: &str) -> Option<&ConnectionHandle> {
        self.connections.get(user_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionHandle> {
        self.connections.values()
    }

    pub fn user_ids(&self) -> impl Iterator<Item = &str> {
        self.connections.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Empties the registry, handing back everything that was in it.
    pub fn drain(&mut self) -> Vec<ConnectionHandle> {
        std::mem::take(&mut self.connections).into_values().collect()
    }
}

//! Registry of live connections keyed by connection id.

use crate::connection::ConnectionHandle;
use crate::error::ServerError;
use nmq_snowflake::SnowId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Concurrent map from connection id to its handle.
///
/// Lookups take the read lock; register and unregister take the write lock.
/// No lock is held across an await point.
#[derive(Debug, Default)]
pub struct Registry {
    connections: RwLock<HashMap<SnowId, Arc<ConnectionHandle>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection. Ids are unique per generator, so a clash means the
    /// same handle was registered twice.
    pub fn register(&self, handle: Arc<ConnectionHandle>) -> Result<(), ServerError> {
        let id = handle.id();
        let mut connections = self.connections.write();
        if connections.contains_key(&id) {
            return Err(ServerError::DuplicateConnection(id));
        }
        connections.insert(id, handle);
        tracing::debug!("Registered connection {} ({} live)", id, connections.len());
        Ok(())
    }

    /// Removes and closes a connection. Returns `None` if it was already gone.
    pub fn unregister(&self, id: SnowId) -> Option<Arc<ConnectionHandle>> {
        let removed = self.connections.write().remove(&id);
        if let Some(ref handle) = removed {
            handle.close();
            tracing::debug!("Unregistered connection {}", id);
        }
        removed
    }

    pub fn lookup(&self, id: SnowId) -> Option<Arc<ConnectionHandle>> {
        self.connections.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Returns the ids of all live connections in ascending (creation) order.
    pub fn ids(&self) -> Vec<SnowId> {
        let mut ids: Vec<SnowId> = self.connections.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Removes and closes every connection, returning how many there were.
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = self.connections.write().drain().collect();
        for (_, handle) in &drained {
            handle.close();
        }
        if !drained.is_empty() {
            tracing::info!("Closed {} connection(s)", drained.len());
        }
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: i64) -> Arc<ConnectionHandle> {
        let (server_side, _client_side) = tokio::io::duplex(64);
        let (handle, _reader) = ConnectionHandle::new(SnowId::new(id), None, server_side);
        Arc::new(handle)
    }

    #[test]
    fn test_registry_lifecycle() {
        let registry = Registry::new();
        assert!(registry.is_empty());

        let h = handle(10);
        registry.register(h.clone()).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(SnowId::new(10)).is_some());
        assert!(registry.lookup(SnowId::new(11)).is_none());

        let removed = registry.unregister(SnowId::new(10)).unwrap();
        assert!(removed.is_closed());
        assert!(h.is_closed());
        assert!(registry.is_empty());

        // second unregister is a no-op
        assert!(registry.unregister(SnowId::new(10)).is_none());
        assert!(registry.lookup(SnowId::new(10)).is_none());
    }

    #[test]
    fn test_register_duplicate() {
        let registry = Registry::new();
        let h = handle(5);
        registry.register(h.clone()).unwrap();
        assert!(matches!(
            registry.register(h),
            Err(ServerError::DuplicateConnection(id)) if id == SnowId::new(5)
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_ids_sorted() {
        let registry = Registry::new();
        for id in [30, 10, 20] {
            registry.register(handle(id)).unwrap();
        }
        assert_eq!(
            registry.ids(),
            vec![SnowId::new(10), SnowId::new(20), SnowId::new(30)]
        );
    }

    #[test]
    fn test_close_all() {
        let registry = Registry::new();
        let handles: Vec<_> = (1..=3).map(handle).collect();
        for h in &handles {
            registry.register(h.clone()).unwrap();
        }

        assert_eq!(registry.close_all(), 3);
        assert!(registry.is_empty());
        assert!(handles.iter().all(|h| h.is_closed()));
        assert_eq!(registry.close_all(), 0);
    }

    #[test]
    fn test_concurrent_register_unregister() {
        let registry = Arc::new(Registry::new());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let id = t * 1000 + i;
                        registry.register(handle(id)).unwrap();
                        assert!(registry.lookup(SnowId::new(id)).is_some());
                        if i % 2 == 0 {
                            registry.unregister(SnowId::new(id)).unwrap();
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(registry.len(), 8 * 25);
    }
}

//! Address and uuid resolution to shared connections.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use ptlrpc_core::{djb2, ClassHash, HashError, HashOps, ObdUuid, ProcessId};
use tracing::{debug, error, info};

use super::Connection;
use crate::config::RpcConfig;
use crate::error::ResolveError;

/// Hash operations for the connection table, keyed by process id.
#[derive(Debug, Default)]
pub struct ConnHashOps;

impl HashOps for ConnHashOps {
    type Key = ProcessId;
    type Object = Connection;

    fn hash(&self, key: &ProcessId, mask: u32) -> u32 {
        djb2(&key.key_bytes(), mask)
    }

    fn compare(&self, key: &ProcessId, conn: &Connection) -> bool {
        conn.peer() == *key
    }
}

/// Maps a target uuid to the peer serving it.
pub trait PeerResolver: Send + Sync {
    /// Resolve `uuid`.
    fn resolve(&self, uuid: &ObdUuid) -> Result<ProcessId, ResolveError>;
}

/// Static uuid to peer table.
#[derive(Debug, Default)]
pub struct UuidTable {
    entries: RwLock<HashMap<ObdUuid, ProcessId>>,
}

impl UuidTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `uuid` to `peer`, replacing any previous mapping.
    pub fn add(&self, uuid: ObdUuid, peer: ProcessId) -> Option<ProcessId> {
        self.entries.write().insert(uuid, peer)
    }

    /// Forget `uuid`.
    pub fn remove(&self, uuid: &ObdUuid) -> Option<ProcessId> {
        self.entries.write().remove(uuid)
    }
}

impl PeerResolver for UuidTable {
    fn resolve(&self, uuid: &ObdUuid) -> Result<ProcessId, ResolveError> {
        self.entries
            .read()
            .get(uuid)
            .copied()
            .ok_or_else(|| ResolveError::UnknownUuid(uuid.clone()))
    }
}

/// Live connections, one per peer.
#[derive(Debug)]
pub struct ConnectionRegistry {
    hash: ClassHash<ConnHashOps>,
}

impl ConnectionRegistry {
    /// Create a registry sized by `config`.
    pub fn new(config: &RpcConfig) -> Result<Self, HashError> {
        Ok(Self {
            hash: ClassHash::new("connections", config.registry_hash_size, ConnHashOps)?,
        })
    }

    /// The connection to `peer`, created on first use.
    pub fn get(&self, peer: ProcessId) -> Result<Arc<Connection>, HashError> {
        loop {
            if let Some(conn) = self.hash.get(&peer) {
                return Ok(conn);
            }

            let conn = Arc::new(Connection::new(peer));
            match self.hash.add_unique(&peer, Arc::clone(&conn)) {
                Ok(()) => {
                    debug!(%peer, "connection created");
                    return Ok(conn);
                }
                // Lost the race against another creator; use theirs.
                Err(HashError::AlreadyExists) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Resolve `uuid` and return the connection to its peer.
    ///
    /// Records the uuid on the connection and bumps its epoch.
    pub fn uuid_to_connection(
        &self,
        resolver: &dyn PeerResolver,
        uuid: &ObdUuid,
    ) -> Result<Arc<Connection>, ResolveError> {
        let peer = resolver.resolve(uuid).inspect_err(|_| {
            error!(%uuid, "cannot find peer");
        })?;

        let conn = self.get(peer)?;
        conn.set_remote_uuid(uuid.clone());
        let epoch = conn.bump_epoch();
        debug!(%uuid, %peer, epoch, "uuid resolved to connection");
        Ok(conn)
    }

    /// Point `conn` at the peer now serving `uuid`.
    ///
    /// Fails with [`HashError::AlreadyExists`] if the registry already holds a
    /// connection to that peer; `conn` then keeps its old peer and entry.
    pub fn readdress(
        &self,
        conn: &Arc<Connection>,
        resolver: &dyn PeerResolver,
        uuid: &ObdUuid,
    ) -> Result<(), ResolveError> {
        let peer = resolver.resolve(uuid).inspect_err(|_| {
            error!(%uuid, "cannot find peer");
        })?;

        let old = conn.peer();
        if old == peer {
            return Ok(());
        }

        let linked = self.hash.get(&old).is_some_and(|c| Arc::ptr_eq(&c, conn));
        if linked {
            // Claim the new key first; a refusal leaves the connection untouched.
            self.hash
                .add_unique(&peer, Arc::clone(conn))
                .inspect_err(|e| {
                    error!(%uuid, %old, new = %peer, error = %e, "readdress refused");
                })?;
            conn.set_peer(peer);
            if self.hash.del(&old, conn).is_err() {
                debug!(%old, "old registry entry already gone");
            }
        } else {
            conn.set_peer(peer);
        }
        conn.set_remote_uuid(uuid.clone());
        info!(%uuid, %old, new = %peer, "connection readdressed");
        Ok(())
    }

    /// Release a caller reference.
    ///
    /// Unlinks the connection once nothing but the registry holds it, and
    /// returns whether it did.
    pub fn put(&self, conn: Arc<Connection>) -> bool {
        let peer = conn.peer();
        // The registry's reference plus `conn`.
        let removed = self
            .hash
            .remove_if(&peer, &conn, |c| Arc::strong_count(c) == 2);
        if removed {
            debug!(%peer, "connection released");
        }
        removed
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.hash.len()
    }

    /// Whether the registry holds no connection.
    pub fn is_empty(&self) -> bool {
        self.hash.is_empty()
    }

    /// Drop every connection from the registry.
    pub fn teardown(&self) {
        self.hash.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ptlrpc_core::Nid;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(&RpcConfig::default()).expect("registry")
    }

    fn peer(addr: u32) -> ProcessId {
        ProcessId::server(Nid::new(0, addr))
    }

    #[test]
    fn test_get_returns_same_connection() {
        let registry = registry();
        let a = registry.get(peer(1)).expect("get");
        let b = registry.get(peer(1)).expect("get");
        let c = registry.get(peer(2)).expect("get");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_pid_is_part_of_key() {
        let registry = registry();
        let nid = Nid::new(0, 1);
        let a = registry.get(ProcessId::new(nid, 1)).expect("get");
        let b = registry.get(ProcessId::new(nid, 2)).expect("get");
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_put_unlinks_last_reference() {
        let registry = registry();
        let a = registry.get(peer(1)).expect("get");
        let b = registry.get(peer(1)).expect("get");

        assert!(!registry.put(a));
        assert_eq!(registry.len(), 1);
        assert!(registry.put(b));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_uuid_to_connection() {
        let registry = registry();
        let table = UuidTable::new();
        let uuid = ObdUuid::new("mds1_UUID").expect("uuid");
        table.add(uuid.clone(), peer(7));

        let conn = registry
            .uuid_to_connection(&table, &uuid)
            .expect("resolve");
        assert_eq!(conn.peer(), peer(7));
        assert_eq!(conn.remote_uuid(), Some(uuid.clone()));
        assert_eq!(conn.epoch(), 1);

        let again = registry
            .uuid_to_connection(&table, &uuid)
            .expect("resolve");
        assert!(Arc::ptr_eq(&conn, &again));
        assert_eq!(conn.epoch(), 2);
    }

    #[test]
    fn test_uuid_unknown() {
        let registry = registry();
        let uuid = ObdUuid::new("nobody").expect("uuid");
        assert_eq!(
            registry.uuid_to_connection(&UuidTable::new(), &uuid).err(),
            Some(ResolveError::UnknownUuid(uuid))
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_readdress_rehashes() {
        let registry = registry();
        let table = UuidTable::new();
        let uuid = ObdUuid::new("ost0_UUID").expect("uuid");
        table.add(uuid.clone(), peer(1));
        let conn = registry
            .uuid_to_connection(&table, &uuid)
            .expect("resolve");

        // Failover to a new server.
        table.add(uuid.clone(), peer(2));
        registry
            .readdress(&conn, &table, &uuid)
            .expect("readdress");

        assert_eq!(conn.peer(), peer(2));
        let found = registry.get(peer(2)).expect("get");
        assert!(Arc::ptr_eq(&conn, &found));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_readdress_refused_keeps_old_peer() {
        let registry = registry();
        let table = UuidTable::new();
        let uuid = ObdUuid::new("ost1_UUID").expect("uuid");
        table.add(uuid.clone(), peer(1));
        let conn = registry
            .uuid_to_connection(&table, &uuid)
            .expect("resolve");
        let other = registry.get(peer(2)).expect("get");

        table.add(uuid.clone(), peer(2));
        assert_eq!(
            registry.readdress(&conn, &table, &uuid).err(),
            Some(ResolveError::Registry(HashError::AlreadyExists))
        );

        assert_eq!(conn.peer(), peer(1));
        assert_eq!(registry.len(), 2);
        let found = registry.get(peer(1)).expect("get");
        assert!(Arc::ptr_eq(&conn, &found));
        let found = registry.get(peer(2)).expect("get");
        assert!(Arc::ptr_eq(&other, &found));
    }
}

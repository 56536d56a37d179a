use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ptlrpc_core::{djb2, ClassHash, HashError, HashOps, Nid, ObdUuid};
use tracing::{debug, warn};

use crate::config::RpcConfig;
use crate::connection::Connection;

/// Server-side state for one connected client.
pub struct Export {
    client_uuid: ObdUuid,
    connection: Arc<Connection>,
    failed: AtomicBool,
}

impl Export {
    /// Create an export for `client_uuid` reached over `connection`.
    pub fn new(client_uuid: ObdUuid, connection: Arc<Connection>) -> Self {
        Self {
            client_uuid,
            connection,
            failed: AtomicBool::new(false),
        }
    }

    /// Uuid the client connected with.
    pub fn client_uuid(&self) -> &ObdUuid {
        &self.client_uuid
    }

    /// Network id of the client.
    pub fn nid(&self) -> Nid {
        self.connection.peer().nid
    }

    /// Connection to the client.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Mark the export failed. Failed exports stay linked but no lookup finds
    /// them.
    pub fn fail(&self) {
        if !self.failed.swap(true, Ordering::AcqRel) {
            warn!(client = %self.client_uuid, nid = %self.nid(), "export failed");
        }
    }

    /// Whether [`fail`](Self::fail) was called.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Export {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Export")
            .field("client_uuid", &self.client_uuid)
            .field("nid", &self.nid())
            .field("failed", &self.is_failed())
            .finish()
    }
}

/// Exports keyed by client uuid.
#[derive(Debug, Default)]
pub struct UuidExportOps;

impl HashOps for UuidExportOps {
    type Key = ObdUuid;
    type Object = Export;

    fn hash(&self, key: &ObdUuid, mask: u32) -> u32 {
        djb2(key.as_bytes(), mask)
    }

    fn compare(&self, key: &ObdUuid, export: &Export) -> bool {
        export.client_uuid == *key && !export.is_failed()
    }
}

/// Exports keyed by client nid. Several exports may share a nid.
#[derive(Debug, Default)]
pub struct NidExportOps;

impl HashOps for NidExportOps {
    type Key = Nid;
    type Object = Export;

    fn hash(&self, key: &Nid, mask: u32) -> u32 {
        djb2(&key.key_bytes(), mask)
    }

    fn compare(&self, key: &Nid, export: &Export) -> bool {
        export.nid() == *key && !export.is_failed()
    }
}

/// Live exports, findable by uuid (one each) and by nid (many).
#[derive(Debug)]
pub struct ExportTable {
    by_uuid: ClassHash<UuidExportOps>,
    by_nid: ClassHash<NidExportOps>,
}

impl ExportTable {
    /// Create empty tables sized by `config`.
    pub fn new(config: &RpcConfig) -> Result<Self, HashError> {
        Ok(Self {
            by_uuid: ClassHash::new("export uuids", config.registry_hash_size, UuidExportOps)?,
            by_nid: ClassHash::new("export nids", config.registry_hash_size, NidExportOps)?,
        })
    }

    /// Link `export` in both tables.
    ///
    /// # Errors
    ///
    /// [`HashError::AlreadyExists`] if a live export holds the uuid.
    pub fn insert(&self, export: Arc<Export>) -> Result<(), HashError> {
        let uuid = export.client_uuid.clone();
        let nid = export.nid();

        self.by_uuid.add_unique(&uuid, Arc::clone(&export))?;
        if let Err(e) = self.by_nid.add(&nid, Arc::clone(&export)) {
            let _ = self.by_uuid.del(&uuid, &export);
            return Err(e);
        }
        debug!(client = %uuid, %nid, "export linked");
        Ok(())
    }

    /// Live export for `uuid`.
    pub fn by_uuid(&self, uuid: &ObdUuid) -> Option<Arc<Export>> {
        self.by_uuid.get(uuid)
    }

    /// Visit every live export on `nid`.
    pub fn for_each_on_nid<F>(&self, nid: Nid, visit: F)
    where
        F: FnMut(&Arc<Export>),
    {
        self.by_nid.for_each_matching(&nid, visit);
    }

    /// Unlink `export` from both tables.
    pub fn remove(&self, export: &Arc<Export>) -> Result<(), HashError> {
        let uuid = self.by_uuid.del(&export.client_uuid, export);
        let nid = self.by_nid.del(&export.nid(), export);
        uuid.and(nid)
    }

    /// Number of linked exports, failed ones included.
    pub fn len(&self) -> usize {
        self.by_uuid.len()
    }

    /// Whether no export is linked.
    pub fn is_empty(&self) -> bool {
        self.by_uuid.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ptlrpc_core::ProcessId;

    fn export(uuid: &str, addr: u32) -> Arc<Export> {
        let conn = Arc::new(Connection::new(ProcessId::new(Nid::new(0, addr), 1)));
        Arc::new(Export::new(ObdUuid::new(uuid).expect("uuid"), conn))
    }

    fn table() -> ExportTable {
        ExportTable::new(&RpcConfig::default()).expect("table")
    }

    #[test]
    fn test_uuid_is_unique() {
        let table = table();
        table.insert(export("client-a", 1)).expect("insert");
        assert_eq!(
            table.insert(export("client-a", 2)),
            Err(HashError::AlreadyExists)
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_many_exports_per_nid() {
        let table = table();
        table.insert(export("client-a", 5)).expect("insert");
        table.insert(export("client-b", 5)).expect("insert");
        table.insert(export("client-c", 6)).expect("insert");

        let mut seen = Vec::new();
        table.for_each_on_nid(Nid::new(0, 5), |e| seen.push(e.client_uuid().to_string()));
        seen.sort();
        assert_eq!(seen, vec!["client-a", "client-b"]);
    }

    #[test]
    fn test_failed_export_is_hidden() {
        let table = table();
        let old = export("client-a", 1);
        table.insert(Arc::clone(&old)).expect("insert");
        old.fail();

        let uuid = ObdUuid::new("client-a").expect("uuid");
        assert!(table.by_uuid(&uuid).is_none());

        let mut count = 0;
        table.for_each_on_nid(Nid::new(0, 1), |_| count += 1);
        assert_eq!(count, 0);

        // A reconnecting client is not blocked by its failed predecessor.
        let new = export("client-a", 1);
        table.insert(Arc::clone(&new)).expect("insert");
        let found = table.by_uuid(&uuid).expect("live export");
        assert!(Arc::ptr_eq(&found, &new));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_remove_unlinks_both_tables() {
        let table = table();
        let e = export("client-a", 3);
        table.insert(Arc::clone(&e)).expect("insert");

        table.remove(&e).expect("remove");
        assert!(table.is_empty());
        let mut count = 0;
        table.for_each_on_nid(Nid::new(0, 3), |_| count += 1);
        assert_eq!(count, 0);
        assert_eq!(table.remove(&e), Err(HashError::NotFound));
        assert_eq!(Arc::strong_count(&e), 1);
    }
}

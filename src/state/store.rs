//! Typed state store over the table engine
//!
//! Every mutation runs in one write transaction, is persisted to RocksDB (when
//! a durable backend is attached) and only then becomes visible to readers.

use super::memdb::{restore_snapshot, DbSnapshot, MemDb, TableIter, WriteTxn};
use super::persist::{Change, PersistStore};
use super::watch::WatchSet;
use crate::common::{Error, Result};
use crate::structs::{ClaimMode, Node, Volume};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const TABLE_VOLUMES: &str = "volumes";
pub const TABLE_NODES: &str = "nodes";

pub struct StateStore {
    db: MemDb,
    persist: Option<PersistStore>,
    log_index: AtomicU64,
}

impl StateStore {
    /// A purely in-memory store
    pub fn new() -> Self {
        Self {
            db: MemDb::new(),
            persist: None,
            log_index: AtomicU64::new(0),
        }
    }

    /// Open a RocksDB-backed store, restoring whatever it already holds
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let persist = PersistStore::open(path.as_ref())?;
        let restored = persist.load()?;
        info!(
            path = %path.as_ref().display(),
            volumes = restored.volumes.len(),
            nodes = restored.nodes.len(),
            log_index = restored.log_index,
            "Restored state"
        );
        let log_index = AtomicU64::new(restored.log_index);
        let snap = restore_snapshot(restored.volumes, restored.nodes, restored.indexes);
        Ok(Self {
            db: MemDb::from_snapshot(snap),
            persist: Some(persist),
            log_index,
        })
    }

    /// Read-only view at the current point in time
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            snap: self.db.snapshot(),
        }
    }

    pub fn index(&self, table: &str) -> u64 {
        self.db.snapshot().index(table)
    }

    pub fn latest_index(&self) -> u64 {
        self.db.snapshot().latest_index()
    }

    /// Last log entry applied to this store, including entries that
    /// failed or touched no table
    pub fn log_index(&self) -> u64 {
        self.log_index.load(Ordering::SeqCst).max(self.latest_index())
    }

    /// Record that the log entry at `index` has been applied
    pub fn set_log_index(&self, index: u64) -> Result<()> {
        let latest = self.log_index.fetch_max(index, Ordering::SeqCst).max(index);
        match &self.persist {
            Some(persist) => persist.apply(&[Change::LogIndex(latest)]),
            None => Ok(()),
        }
    }

    pub fn flush(&self) -> Result<()> {
        match &self.persist {
            Some(p) => p.flush(),
            None => Ok(()),
        }
    }

    fn commit(&self, txn: WriteTxn<'_>, changes: &[Change]) -> Result<()> {
        if let Some(persist) = &self.persist {
            persist.apply(changes)?;
        }
        txn.commit();
        Ok(())
    }

    /// Register a batch of volumes at `index`.
    ///
    /// An ID that already exists with the same value is left untouched; one
    /// that exists with a different value fails the whole batch.
    pub fn volume_register(&self, index: u64, volumes: Vec<Volume>) -> Result<()> {
        let mut txn = self.db.txn();
        let mut changes = Vec::new();

        for mut volume in volumes {
            if let Some(existing) = txn.view().volumes.get(None, &volume.id) {
                if existing.value_eq(&volume) {
                    continue;
                }
                return Err(Error::Conflict(format!(
                    "volume {} already exists with different contents",
                    volume.id
                )));
            }
            volume.created_index = index;
            volume.modified_index = index;
            let volume = Arc::new(volume);
            txn.insert_volume(Arc::clone(&volume));
            changes.push(Change::PutVolume(volume));
        }

        if changes.is_empty() {
            debug!(index, "Volume register was a no-op");
            return Ok(());
        }
        txn.set_index(TABLE_VOLUMES, index);
        changes.push(Change::Index(TABLE_VOLUMES, index));
        self.commit(txn, &changes)
    }

    /// Remove a batch of volumes; unknown IDs are skipped
    pub fn volume_deregister(&self, index: u64, ids: &[String]) -> Result<()> {
        let mut txn = self.db.txn();
        let mut changes = Vec::new();

        for id in ids {
            if let Some(old) = txn.delete_volume(id) {
                changes.push(Change::DeleteVolume(old));
            }
        }

        if changes.is_empty() {
            return Ok(());
        }
        txn.set_index(TABLE_VOLUMES, index);
        changes.push(Change::Index(TABLE_VOLUMES, index));
        self.commit(txn, &changes)
    }

    /// Take or release one claim on each volume. All or nothing.
    pub fn volume_claim(
        &self,
        index: u64,
        ids: &[String],
        mode: ClaimMode,
        release: bool,
    ) -> Result<()> {
        let mut txn = self.db.txn();
        let mut changes = Vec::new();

        for id in ids {
            let current = txn
                .view()
                .volumes
                .get(None, id)
                .ok_or_else(|| Error::NotFound(format!("volume {id}")))?;

            let mut next = (*current).clone();
            if release {
                if next.claim == 0 {
                    continue;
                }
                next.claim -= 1;
            } else {
                let free = match mode {
                    ClaimMode::ReadOnly => next.can_mount_read_only(),
                    ClaimMode::ReadWrite => next.can_mount_writable(),
                };
                if !free {
                    return Err(Error::ClaimUnavailable(format!(
                        "volume {id} cannot take a {mode} claim ({}/{} claimed)",
                        next.claim, next.max_claim
                    )));
                }
                next.claim += 1;
            }
            next.modified_index = index;
            let next = Arc::new(next);
            txn.insert_volume(Arc::clone(&next));
            changes.push(Change::PutVolume(next));
        }

        if changes.is_empty() {
            return Ok(());
        }
        txn.set_index(TABLE_VOLUMES, index);
        changes.push(Change::Index(TABLE_VOLUMES, index));
        self.commit(txn, &changes)
    }

    /// Insert or update a node. Its secret ID may not change once set.
    pub fn upsert_node(&self, index: u64, mut node: Node) -> Result<()> {
        let mut txn = self.db.txn();

        if let Some(other) = txn.view().nodes.by_secondary(None, &node.secret_id).next() {
            if other.id != node.id {
                return Err(Error::Conflict(format!(
                    "secret ID already belongs to node {}",
                    other.id
                )));
            }
        }

        match txn.view().nodes.get(None, &node.id) {
            Some(existing) => {
                if existing.secret_id != node.secret_id {
                    warn!(node_id = %node.id, "Node re-registered with a different secret");
                    return Err(Error::PermissionDenied);
                }
                node.create_index = existing.create_index;
            }
            None => node.create_index = index,
        }
        node.modify_index = index;

        let node = Arc::new(node);
        txn.insert_node(Arc::clone(&node));
        txn.set_index(TABLE_NODES, index);
        self.commit(
            txn,
            &[Change::PutNode(node), Change::Index(TABLE_NODES, index)],
        )
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// A consistent, immutable read view of the store
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    snap: Arc<DbSnapshot>,
}

impl StateSnapshot {
    pub fn index(&self, table: &str) -> u64 {
        self.snap.index(table)
    }

    pub fn volume_by_id(&self, ws: Option<&mut WatchSet>, id: &str) -> Option<Arc<Volume>> {
        self.snap.volumes.get(ws, id)
    }

    /// All volumes, ordered by ID
    pub fn volumes(&self, ws: Option<&mut WatchSet>) -> TableIter<Volume> {
        self.snap.volumes.iter(ws)
    }

    pub fn volumes_by_driver(&self, ws: Option<&mut WatchSet>, driver: &str) -> TableIter<Volume> {
        self.snap.volumes.by_secondary(ws, driver)
    }

    pub fn volumes_by_driver_prefix(
        &self,
        ws: Option<&mut WatchSet>,
        prefix: &str,
    ) -> TableIter<Volume> {
        self.snap.volumes.by_secondary_prefix(ws, prefix)
    }

    pub fn node_by_id(&self, ws: Option<&mut WatchSet>, id: &str) -> Option<Arc<Node>> {
        self.snap.nodes.get(ws, id)
    }

    pub fn node_by_secret_id(&self, ws: Option<&mut WatchSet>, secret: &str) -> Option<Arc<Node>> {
        self.snap.nodes.by_secondary(ws, secret).next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;
    use tokio_test::{assert_pending, assert_ready, task};

    fn volume(id: &str, driver: &str) -> Volume {
        Volume {
            id: id.into(),
            driver: driver.into(),
            namespace: "default".into(),
            max_claim: 2,
            mode_read_many: true,
            mode_write_one: true,
            topology: BTreeMap::from([("zone".to_string(), "us-east-1a".to_string())]),
            ..Default::default()
        }
    }

    fn ids(iter: TableIter<Volume>) -> Vec<String> {
        iter.map(|v| v.id.clone()).collect()
    }

    #[test]
    fn test_register_assigns_indices() {
        let store = StateStore::new();
        store.volume_register(10, vec![volume("a", "ebs")]).unwrap();

        let v = store.snapshot().volume_by_id(None, "a").unwrap();
        assert_eq!(v.created_index, 10);
        assert_eq!(v.modified_index, 10);
        assert_eq!(store.index(TABLE_VOLUMES), 10);
    }

    #[test]
    fn test_register_identical_is_noop() {
        let store = StateStore::new();
        store.volume_register(10, vec![volume("a", "ebs")]).unwrap();
        store.volume_register(11, vec![volume("a", "ebs")]).unwrap();

        let v = store.snapshot().volume_by_id(None, "a").unwrap();
        assert_eq!(v.modified_index, 10);
        assert_eq!(store.index(TABLE_VOLUMES), 10);
    }

    #[test]
    fn test_register_conflict_is_atomic() {
        let store = StateStore::new();
        store.volume_register(10, vec![volume("a", "ebs")]).unwrap();

        let mut changed = volume("a", "ebs");
        changed.max_claim = 5;
        let err = store
            .volume_register(11, vec![volume("b", "ebs"), changed])
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let snap = store.snapshot();
        assert!(snap.volume_by_id(None, "b").is_none());
        assert_eq!(snap.volume_by_id(None, "a").unwrap().max_claim, 2);
        assert_eq!(store.index(TABLE_VOLUMES), 10);
    }

    #[test]
    fn test_deregister_skips_unknown() {
        let store = StateStore::new();
        store
            .volume_register(5, vec![volume("a", "ebs"), volume("b", "ebs")])
            .unwrap();

        store
            .volume_deregister(6, &["a".to_string(), "missing".to_string()])
            .unwrap();
        assert_eq!(ids(store.snapshot().volumes(None)), vec!["b"]);
        assert_eq!(store.index(TABLE_VOLUMES), 6);

        store.volume_deregister(7, &["missing".to_string()]).unwrap();
        assert_eq!(store.index(TABLE_VOLUMES), 6);
    }

    #[test]
    fn test_driver_queries() {
        let store = StateStore::new();
        store
            .volume_register(
                1,
                vec![
                    volume("c", "ebs-gp3"),
                    volume("a", "ebs"),
                    volume("b", "nfs"),
                ],
            )
            .unwrap();

        let snap = store.snapshot();
        assert_eq!(ids(snap.volumes_by_driver(None, "ebs")), vec!["a"]);
        assert_eq!(ids(snap.volumes_by_driver_prefix(None, "ebs")), vec!["a", "c"]);
        assert!(ids(snap.volumes_by_driver(None, "ceph")).is_empty());
    }

    #[test]
    fn test_claim_and_release() {
        let store = StateStore::new();
        store.volume_register(1, vec![volume("a", "ebs")]).unwrap();
        let a = vec!["a".to_string()];

        store.volume_claim(2, &a, ClaimMode::ReadWrite, false).unwrap();
        let err = store
            .volume_claim(3, &a, ClaimMode::ReadWrite, false)
            .unwrap_err();
        assert!(matches!(err, Error::ClaimUnavailable(_)));

        store.volume_claim(3, &a, ClaimMode::ReadOnly, false).unwrap();
        assert!(matches!(
            store.volume_claim(4, &a, ClaimMode::ReadOnly, false),
            Err(Error::ClaimUnavailable(_))
        ));

        store.volume_claim(4, &a, ClaimMode::ReadOnly, true).unwrap();
        store.volume_claim(5, &a, ClaimMode::ReadOnly, true).unwrap();
        store.volume_claim(6, &a, ClaimMode::ReadOnly, true).unwrap();
        let v = store.snapshot().volume_by_id(None, "a").unwrap();
        assert_eq!(v.claim, 0);
        assert_eq!(v.modified_index, 5);

        assert!(matches!(
            store.volume_claim(7, &["nope".to_string()], ClaimMode::ReadOnly, false),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_node_secret_is_immutable() {
        let store = StateStore::new();
        let node = Node {
            id: "n1".into(),
            secret_id: "s1".into(),
            name: "worker".into(),
            ..Default::default()
        };
        store.upsert_node(3, node.clone()).unwrap();
        store.upsert_node(4, node.clone()).unwrap();

        let snap = store.snapshot();
        let stored = snap.node_by_secret_id(None, "s1").unwrap();
        assert_eq!(stored.id, "n1");
        assert_eq!(stored.create_index, 3);
        assert_eq!(stored.modify_index, 4);

        let mut other = node.clone();
        other.secret_id = "s2".into();
        assert!(matches!(
            store.upsert_node(5, other),
            Err(Error::PermissionDenied)
        ));

        let thief = Node {
            id: "n2".into(),
            secret_id: "s1".into(),
            ..Default::default()
        };
        assert!(matches!(store.upsert_node(6, thief), Err(Error::Conflict(_))));
    }

    #[test]
    fn test_register_wakes_watcher() {
        let store = StateStore::new();
        let mut ws = WatchSet::new();
        assert_eq!(store.snapshot().volumes(Some(&mut ws)).count(), 0);

        let mut fut = task::spawn(ws.wait());
        assert_pending!(fut.poll());
        store.volume_register(1, vec![volume("a", "ebs")]).unwrap();
        assert_ready!(fut.poll());
    }

    #[test]
    fn test_reopen_restores_rows_and_indexes() {
        let dir = tempdir().unwrap();
        {
            let store = StateStore::open(dir.path()).unwrap();
            store
                .volume_register(4, vec![volume("a", "ebs"), volume("b", "nfs")])
                .unwrap();
            store.volume_deregister(5, &["b".to_string()]).unwrap();
            store
                .upsert_node(
                    6,
                    Node {
                        id: "n1".into(),
                        secret_id: "s1".into(),
                        ..Default::default()
                    },
                )
                .unwrap();
            store.flush().unwrap();
        }

        let store = StateStore::open(dir.path()).unwrap();
        let snap = store.snapshot();
        assert_eq!(ids(snap.volumes(None)), vec!["a"]);
        assert_eq!(ids(snap.volumes_by_driver(None, "ebs")), vec!["a"]);
        assert!(snap.node_by_secret_id(None, "s1").is_some());
        assert_eq!(store.index(TABLE_VOLUMES), 5);
        assert_eq!(store.latest_index(), 6);
        assert_eq!(store.log_index(), 6);
    }

    #[test]
    fn test_log_index_survives_entries_without_table_writes() {
        let dir = tempdir().unwrap();
        {
            let store = StateStore::open(dir.path()).unwrap();
            store.volume_register(1, vec![volume("a", "ebs")]).unwrap();
            store.set_log_index(1).unwrap();
            store.set_log_index(3).unwrap();
            // Out-of-order records never move it back
            store.set_log_index(2).unwrap();
            assert_eq!(store.log_index(), 3);
            store.flush().unwrap();
        }

        let store = StateStore::open(dir.path()).unwrap();
        assert_eq!(store.latest_index(), 1);
        assert_eq!(store.log_index(), 3);
    }
}

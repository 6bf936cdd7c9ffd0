//! Transactional in-memory table engine
//!
//! Readers take an immutable [`DbSnapshot`]; a single writer at a time works
//! on a private copy and swaps it in on commit, then fires the watch channels
//! of everything it touched. Dropping a [`WriteTxn`] without committing
//! discards its changes and fires nothing.

use super::watch::{WatchCh, WatchSet, WATCH_LIMIT};
use crate::structs::{Node, Volume};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

/// A value that can be stored in a [`Table`]
pub trait Record: Clone + Send + Sync + 'static {
    fn primary_key(&self) -> &str;

    /// Key in the table's secondary index, if it has one
    fn secondary_key(&self) -> Option<&str> {
        None
    }
}

impl Record for Volume {
    fn primary_key(&self) -> &str {
        &self.id
    }

    fn secondary_key(&self) -> Option<&str> {
        Some(&self.driver)
    }
}

impl Record for Node {
    fn primary_key(&self) -> &str {
        &self.id
    }

    fn secondary_key(&self) -> Option<&str> {
        Some(&self.secret_id)
    }
}

#[derive(Debug, Clone)]
struct Row<T> {
    value: Arc<T>,
    watch: WatchCh,
}

/// One table: rows by primary key plus a `(secondary, primary)` index
#[derive(Debug, Clone)]
pub struct Table<T> {
    rows: BTreeMap<String, Row<T>>,
    secondary: BTreeSet<(String, String)>,
    buckets: BTreeMap<String, WatchCh>,
    table_watch: WatchCh,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            secondary: BTreeSet::new(),
            buckets: BTreeMap::new(),
            table_watch: WatchCh::new(),
        }
    }
}

/// Rows yielded in primary-key order
#[derive(Debug)]
pub struct TableIter<T> {
    inner: std::vec::IntoIter<Arc<T>>,
}

impl<T> Iterator for TableIter<T> {
    type Item = Arc<T>;

    fn next(&mut self) -> Option<Arc<T>> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<T: Record> Table<T> {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Lookup by primary key. A miss watches the whole table so an insert wakes the reader.
    pub fn get(&self, ws: Option<&mut WatchSet>, key: &str) -> Option<Arc<T>> {
        let row = self.rows.get(key);
        if let Some(ws) = ws {
            match row {
                Some(row) => ws.add(&row.watch),
                None => ws.add(&self.table_watch),
            }
        }
        row.map(|r| Arc::clone(&r.value))
    }

    /// Every row, ordered by primary key
    pub fn iter(&self, ws: Option<&mut WatchSet>) -> TableIter<T> {
        if let Some(ws) = ws {
            ws.add(&self.table_watch);
        }
        let rows: Vec<_> = self.rows.values().map(|r| Arc::clone(&r.value)).collect();
        TableIter {
            inner: rows.into_iter(),
        }
    }

    /// Rows whose secondary key equals `key`, ordered by primary key
    pub fn by_secondary(&self, ws: Option<&mut WatchSet>, key: &str) -> TableIter<T> {
        let rows = self.secondary_range(key, |sec| sec == key);
        if let Some(ws) = ws {
            match self.buckets.get(key) {
                Some(bucket) => {
                    for row in &rows {
                        if let Some(r) = self.rows.get(row.primary_key()) {
                            ws.add_with_limit(WATCH_LIMIT, &r.watch, bucket);
                        }
                    }
                    ws.add(bucket);
                }
                None => ws.add(&self.table_watch),
            }
        }
        TableIter {
            inner: rows.into_iter(),
        }
    }

    /// Rows whose secondary key starts with `prefix`
    pub fn by_secondary_prefix(&self, ws: Option<&mut WatchSet>, prefix: &str) -> TableIter<T> {
        if let Some(ws) = ws {
            ws.add(&self.table_watch);
        }
        let mut rows = self.secondary_range(prefix, |sec| sec.starts_with(prefix));
        rows.sort_by(|a, b| a.primary_key().cmp(b.primary_key()));
        TableIter {
            inner: rows.into_iter(),
        }
    }

    fn secondary_range(&self, start: &str, keep: impl Fn(&str) -> bool) -> Vec<Arc<T>> {
        let lower = (start.to_string(), String::new());
        self.secondary
            .range((Bound::Included(lower), Bound::Unbounded))
            .take_while(|(sec, _)| keep(sec))
            .filter_map(|(_, pk)| self.rows.get(pk))
            .map(|r| Arc::clone(&r.value))
            .collect()
    }

    /// Insert or replace a row, queueing the channels to fire on commit
    fn insert(&mut self, value: Arc<T>, fired: &mut Vec<WatchCh>) {
        let key = value.primary_key().to_string();
        if let Some(old) = self.rows.remove(&key) {
            self.unindex(&old.value, fired);
            fired.push(old.watch);
        }
        if let Some(sec) = value.secondary_key() {
            self.secondary.insert((sec.to_string(), key.clone()));
            self.touch_bucket(sec, fired);
        }
        self.rows.insert(
            key,
            Row {
                value,
                watch: WatchCh::new(),
            },
        );
        self.touch_table(fired);
    }

    /// Remove a row, returning it; `None` if it was absent
    fn delete(&mut self, key: &str, fired: &mut Vec<WatchCh>) -> Option<Arc<T>> {
        let old = self.rows.remove(key)?;
        self.unindex(&old.value, fired);
        fired.push(old.watch);
        self.touch_table(fired);
        Some(old.value)
    }

    fn unindex(&mut self, value: &T, fired: &mut Vec<WatchCh>) {
        if let Some(sec) = value.secondary_key() {
            self.secondary
                .remove(&(sec.to_string(), value.primary_key().to_string()));
            self.touch_bucket(sec, fired);
        }
    }

    fn touch_bucket(&mut self, sec: &str, fired: &mut Vec<WatchCh>) {
        if let Some(old) = self.buckets.insert(sec.to_string(), WatchCh::new()) {
            fired.push(old);
        }
    }

    fn touch_table(&mut self, fired: &mut Vec<WatchCh>) {
        let old = std::mem::take(&mut self.table_watch);
        fired.push(old);
    }
}

/// An immutable view of every table
#[derive(Debug, Clone, Default)]
pub struct DbSnapshot {
    pub volumes: Table<Volume>,
    pub nodes: Table<Node>,
    indexes: BTreeMap<String, u64>,
}

impl DbSnapshot {
    /// Last index at which `table` was written, 0 if never
    pub fn index(&self, table: &str) -> u64 {
        self.indexes.get(table).copied().unwrap_or(0)
    }

    /// Highest index across all tables
    pub fn latest_index(&self) -> u64 {
        self.indexes.values().copied().max().unwrap_or(0)
    }
}

/// The table engine
#[derive(Debug, Default)]
pub struct MemDb {
    current: RwLock<Arc<DbSnapshot>>,
    writer: Mutex<()>,
}

impl MemDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an engine from restored rows
    pub fn from_snapshot(snapshot: DbSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(()),
        }
    }

    /// A read transaction
    pub fn snapshot(&self) -> Arc<DbSnapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Start the (single) write transaction, blocking while another is open
    pub fn txn(&self) -> WriteTxn<'_> {
        let guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let snap = (*self.snapshot()).clone();
        WriteTxn {
            db: self,
            _guard: guard,
            snap,
            fired: Vec::new(),
        }
    }
}

/// A write transaction over a private copy of the tables
pub struct WriteTxn<'a> {
    db: &'a MemDb,
    _guard: MutexGuard<'a, ()>,
    snap: DbSnapshot,
    fired: Vec<WatchCh>,
}

impl WriteTxn<'_> {
    /// The transaction's own view, including its uncommitted writes
    pub fn view(&self) -> &DbSnapshot {
        &self.snap
    }

    pub fn insert_volume(&mut self, volume: Arc<Volume>) {
        self.snap.volumes.insert(volume, &mut self.fired);
    }

    pub fn delete_volume(&mut self, id: &str) -> Option<Arc<Volume>> {
        self.snap.volumes.delete(id, &mut self.fired)
    }

    pub fn insert_node(&mut self, node: Arc<Node>) {
        self.snap.nodes.insert(node, &mut self.fired);
    }

    pub fn set_index(&mut self, table: &str, index: u64) {
        self.snap.indexes.insert(table.to_string(), index);
    }

    /// Publish the new snapshot, then wake every watcher of a touched row or bucket
    pub fn commit(self) {
        let WriteTxn {
            db, snap, fired, ..
        } = self;
        *db.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(snap);
        for ch in fired {
            ch.fire();
        }
    }
}

/// Assemble a snapshot from rows loaded off disk
pub(crate) fn restore_snapshot(
    volumes: Vec<Volume>,
    nodes: Vec<Node>,
    indexes: Vec<(String, u64)>,
) -> DbSnapshot {
    let mut snap = DbSnapshot::default();
    let mut discarded = Vec::new();
    for v in volumes {
        snap.volumes.insert(Arc::new(v), &mut discarded);
    }
    for n in nodes {
        snap.nodes.insert(Arc::new(n), &mut discarded);
    }
    snap.indexes = indexes.into_iter().collect();
    snap
}

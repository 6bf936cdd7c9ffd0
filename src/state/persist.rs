//! Durable copy of the state tables in RocksDB
//!
//! Layout:
//! - `volumes`: volume ID → volume record
//! - `volumes_by_driver`: `driver \0 id` → empty
//! - `nodes`: node ID → node record
//! - `index`: table name → big-endian u64, plus `_log` for the last log entry applied
//!
//! Records are framed as `crc32 (4 bytes, BE) || bincode`.

use crate::common::{Error, Result};
use crate::structs::{Node, Volume};
use rocksdb::{ColumnFamily, IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

const CF_VOLUMES: &str = "volumes";
const CF_VOLUMES_BY_DRIVER: &str = "volumes_by_driver";
const CF_NODES: &str = "nodes";
const CF_INDEX: &str = "index";

/// Key in the `index` family holding the last applied log index
const LOG_INDEX_KEY: &str = "_log";

/// One row-level effect of a committed transaction
#[derive(Debug, Clone)]
pub enum Change {
    PutVolume(Arc<Volume>),
    DeleteVolume(Arc<Volume>),
    PutNode(Arc<Node>),
    Index(&'static str, u64),
    /// Last log entry applied, whether or not it changed a table
    LogIndex(u64),
}

/// Rows read back at start-up
#[derive(Debug, Default)]
pub struct Restored {
    pub volumes: Vec<Volume>,
    pub nodes: Vec<Node>,
    pub indexes: Vec<(String, u64)>,
    pub log_index: u64,
}

pub struct PersistStore {
    db: DB,
}

impl PersistStore {
    /// Open or create the store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(
            &opts,
            path,
            vec![CF_VOLUMES, CF_VOLUMES_BY_DRIVER, CF_NODES, CF_INDEX],
        )?;

        Ok(Self { db })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Store(format!("missing column family {name}")))
    }

    /// Write all changes of one transaction atomically
    pub fn apply(&self, changes: &[Change]) -> Result<()> {
        let mut batch = WriteBatch::default();
        for change in changes {
            match change {
                Change::PutVolume(v) => {
                    batch.put_cf(self.cf(CF_VOLUMES)?, v.id.as_bytes(), encode(v.as_ref())?);
                    batch.put_cf(self.cf(CF_VOLUMES_BY_DRIVER)?, driver_key(v), b"");
                }
                Change::DeleteVolume(v) => {
                    batch.delete_cf(self.cf(CF_VOLUMES)?, v.id.as_bytes());
                    batch.delete_cf(self.cf(CF_VOLUMES_BY_DRIVER)?, driver_key(v));
                }
                Change::PutNode(n) => {
                    batch.put_cf(self.cf(CF_NODES)?, n.id.as_bytes(), encode(n.as_ref())?);
                }
                Change::Index(table, index) => {
                    batch.put_cf(self.cf(CF_INDEX)?, table.as_bytes(), index.to_be_bytes());
                }
                Change::LogIndex(index) => {
                    batch.put_cf(self.cf(CF_INDEX)?, LOG_INDEX_KEY, index.to_be_bytes());
                }
            }
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// Load every row
    pub fn load(&self) -> Result<Restored> {
        let mut restored = Restored::default();

        for item in self.db.iterator_cf(self.cf(CF_VOLUMES)?, IteratorMode::Start) {
            let (_, value) = item?;
            restored.volumes.push(decode(&value)?);
        }
        for item in self.db.iterator_cf(self.cf(CF_NODES)?, IteratorMode::Start) {
            let (_, value) = item?;
            restored.nodes.push(decode(&value)?);
        }
        for item in self.db.iterator_cf(self.cf(CF_INDEX)?, IteratorMode::Start) {
            let (key, value) = item?;
            let table = String::from_utf8(key.to_vec())
                .map_err(|_| Error::Corrupted("index table name is not UTF-8".into()))?;
            let bytes: [u8; 8] = value
                .as_ref()
                .try_into()
                .map_err(|_| Error::Corrupted(format!("index for {table} is not 8 bytes")))?;
            let index = u64::from_be_bytes(bytes);
            if table == LOG_INDEX_KEY {
                restored.log_index = index;
            } else {
                restored.indexes.push((table, index));
            }
        }

        Ok(restored)
    }

    /// Volume IDs using `driver`, read from the driver index
    pub fn volume_ids_by_driver(&self, driver: &str) -> Result<Vec<String>> {
        let mut prefix = driver.as_bytes().to_vec();
        prefix.push(0);
        let mut ids = Vec::new();
        let mode = IteratorMode::From(&prefix, rocksdb::Direction::Forward);
        for item in self.db.iterator_cf(self.cf(CF_VOLUMES_BY_DRIVER)?, mode) {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let id = String::from_utf8(key[prefix.len()..].to_vec())
                .map_err(|_| Error::Corrupted("volume ID is not UTF-8".into()))?;
            ids.push(id);
        }
        Ok(ids)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn driver_key(v: &Volume) -> Vec<u8> {
    let mut key = Vec::with_capacity(v.driver.len() + 1 + v.id.len());
    key.extend_from_slice(v.driver.as_bytes());
    key.push(0);
    key.extend_from_slice(v.id.as_bytes());
    key
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let body = bincode::serialize(value)?;
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&crc32fast::hash(&body).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

fn decode<T: DeserializeOwned>(raw: &[u8]) -> Result<T> {
    if raw.len() < 4 {
        return Err(Error::Corrupted("record shorter than checksum".into()));
    }
    let (crc, body) = raw.split_at(4);
    let expected = u32::from_be_bytes([crc[0], crc[1], crc[2], crc[3]]);
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(Error::Corrupted(format!(
            "checksum mismatch: expected {expected:08x}, got {actual:08x}"
        )));
    }
    Ok(bincode::deserialize(body)?)
}

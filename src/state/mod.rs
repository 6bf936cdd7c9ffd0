//! Volume state: table engine, watches, persistence and the typed store

pub mod memdb;
pub mod persist;
pub mod store;
pub mod watch;

pub use memdb::{MemDb, Record, TableIter};
pub use persist::{Change, PersistStore};
pub use store::{StateSnapshot, StateStore, TABLE_NODES, TABLE_VOLUMES};
pub use watch::{WatchCh, WatchSet, WATCH_LIMIT};

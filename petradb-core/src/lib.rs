// petradb-core/src/lib.rs
// Index scanning core: scan bounds, query plans and position-stable cursors

pub mod btree;
pub mod cursor;
pub mod error;
pub mod index;
pub mod logging;
pub mod query_planner;
pub mod storage;

// Public exports
pub use btree::{BtreeArena, BucketId, KeyNode};
pub use cursor::{BasicCursor, BtreeCursor, CancelToken, Cursor, DupSet};
pub use error::{PetraError, Result};
pub use index::{IndexKey, Key, KeyPattern, OrderedFloat};
pub use logging::{get_log_level, init_from_env, set_log_level, LogLevel};
pub use query_planner::{FieldBound, FieldBoundSet, QueryPlan};
pub use storage::{DiskLoc, RecordStore, MAX_DISK_LOC, MIN_DISK_LOC};

// src/storage.rs
// Disk locations and the natural-order record store

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::ops::Bound;

/// Opaque, totally ordered identifier for a stored record.
///
/// The ordering is lexicographic on (extent, offset). `MIN_DISK_LOC` and
/// `MAX_DISK_LOC` are the unbounded search anchors used when descending an
/// index without a location tie-break; real records never use extent 0 or
/// i32::MAX.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct DiskLoc {
    a: i32,
    ofs: i32,
}

pub const MIN_DISK_LOC: DiskLoc = DiskLoc { a: 0, ofs: 1 };
pub const MAX_DISK_LOC: DiskLoc = DiskLoc {
    a: i32::MAX,
    ofs: i32::MAX,
};

impl DiskLoc {
    pub const fn new(a: i32, ofs: i32) -> Self {
        DiskLoc { a, ofs }
    }

    pub const fn null() -> Self {
        DiskLoc { a: -1, ofs: 0 }
    }

    pub fn is_null(&self) -> bool {
        self.a == -1
    }
}

impl Default for DiskLoc {
    fn default() -> Self {
        DiskLoc::null()
    }
}

/// In-memory record store: an ordered map from DiskLoc to document.
///
/// Natural order is DiskLoc order; appended records always receive a
/// location greater than every existing one, which is what makes tailable
/// cursors over a growing store meaningful.
#[derive(Debug, Default)]
pub struct RecordStore {
    records: BTreeMap<DiskLoc, Value>,
    next_ofs: i32,
}

impl RecordStore {
    pub fn new() -> Self {
        RecordStore {
            records: BTreeMap::new(),
            next_ofs: 16,
        }
    }

    /// Append a document, allocating the next location in natural order.
    pub fn append(&mut self, doc: Value) -> DiskLoc {
        let loc = DiskLoc::new(1, self.next_ofs);
        self.next_ofs += 16;
        self.records.insert(loc, doc);
        loc
    }

    pub fn get(&self, loc: DiskLoc) -> Option<&Value> {
        if loc.is_null() {
            return None;
        }
        self.records.get(&loc)
    }

    pub fn remove(&mut self, loc: DiskLoc) -> Option<Value> {
        self.records.remove(&loc)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// First location in natural order, or null if empty.
    pub fn first_loc(&self) -> DiskLoc {
        self.records
            .keys()
            .next()
            .copied()
            .unwrap_or_else(DiskLoc::null)
    }

    /// Last location in natural order, or null if empty.
    pub fn last_loc(&self) -> DiskLoc {
        self.records
            .keys()
            .next_back()
            .copied()
            .unwrap_or_else(DiskLoc::null)
    }

    /// First location strictly after `prev`, or null at end of data.
    pub fn next_loc(&self, prev: DiskLoc) -> DiskLoc {
        self.records
            .range((Bound::Excluded(prev), Bound::Unbounded))
            .next()
            .map(|(loc, _)| *loc)
            .unwrap_or_else(DiskLoc::null)
    }

    /// Last location strictly before `next`, or null at start of data.
    pub fn prev_loc(&self, next: DiskLoc) -> DiskLoc {
        self.records
            .range((Bound::Unbounded, Bound::Excluded(next)))
            .next_back()
            .map(|(loc, _)| *loc)
            .unwrap_or_else(DiskLoc::null)
    }
}

// src/cursor.rs
// Cursor family: one capability interface over index-bounded scans, natural
// order table scans (forward, reverse) and tailable log-following scans.
// Callers program against the Cursor trait only and never downcast.

use crate::btree::{BtreeArena, BucketId};
use crate::error::{PetraError, Result};
use crate::index::{ordering_sign, Key, KeyPattern};
use crate::log_debug;
use crate::storage::{DiskLoc, RecordStore, MAX_DISK_LOC, MIN_DISK_LOC};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Per-operation cooperative cancellation token. Cloned into every cursor an
/// operation drives; checked at the start of each `advance`.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PetraError::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Duplicate-location filter for multikey traversal: an index with multiple
/// entries per record must not hand the same record back twice.
#[derive(Debug, Default)]
pub struct DupSet {
    seen: HashSet<DiskLoc>,
}

impl DupSet {
    /// True if `loc` was already seen; records it otherwise.
    pub fn getsetdup(&mut self, loc: DiskLoc) -> bool {
        !self.seen.insert(loc)
    }
}

/// The capability interface all scan types expose.
///
/// `note_location`/`check_location` bracket externally visible yield points
/// (e.g. between batches returned to a client): note snapshots the position,
/// check repairs it if other writers mutated the structure in between.
pub trait Cursor {
    fn ok(&self) -> bool;

    fn eof(&self) -> bool {
        !self.ok()
    }

    /// The document at the current position.
    fn current(&self) -> Option<Value>;

    fn curr_loc(&self) -> DiskLoc;

    /// The structured key at the current position (index cursors only).
    fn current_key(&self) -> Option<Key> {
        None
    }

    /// Step to the next entry. Ok(true) while a valid entry remains; fails
    /// with `Interrupted` if the operation's cancellation token is set.
    fn advance(&mut self) -> Result<bool>;

    /// Snapshot the current position before a yield point.
    fn note_location(&mut self) {}

    /// Re-validate (and if needed repair) the position after a yield point.
    fn check_location(&mut self) {}

    /// Request tailing: at end of a growing structure, `advance` re-probes
    /// for appended entries instead of reporting permanent exhaustion.
    /// Implementations may ignore the request.
    fn set_tailable(&mut self) {}

    fn tailable(&self) -> bool {
        false
    }

    /// Notification that `bucket` is about to be freed; a cursor caching a
    /// position inside it must invalidate that position.
    fn about_to_delete_bucket(&mut self, _bucket: BucketId) {}

    fn index_key_pattern(&self) -> Option<Arc<KeyPattern>> {
        None
    }

    /// Duplicate suppression across multikey index entries.
    fn getsetdup(&mut self, loc: DiskLoc) -> bool;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanDirection {
    Forward,
    Reverse,
}

/// Natural-order scan over the record store. `BasicCursor::reverse` gives the
/// `$natural: -1` variant; tailing turns end-of-data into a temporary state.
pub struct BasicCursor {
    store: Arc<RwLock<RecordStore>>,
    curr: DiskLoc,
    last: DiskLoc,
    direction: ScanDirection,
    tailable: bool,
    token: CancelToken,
    dups: DupSet,
}

impl BasicCursor {
    pub fn new(store: Arc<RwLock<RecordStore>>, token: CancelToken) -> Self {
        let curr = store.read().first_loc();
        Self::with_start(store, curr, ScanDirection::Forward, token)
    }

    pub fn reverse(store: Arc<RwLock<RecordStore>>, token: CancelToken) -> Self {
        let curr = store.read().last_loc();
        Self::with_start(store, curr, ScanDirection::Reverse, token)
    }

    fn with_start(
        store: Arc<RwLock<RecordStore>>,
        curr: DiskLoc,
        direction: ScanDirection,
        token: CancelToken,
    ) -> Self {
        BasicCursor {
            store,
            curr,
            last: DiskLoc::null(),
            direction,
            tailable: false,
            token,
            dups: DupSet::default(),
        }
    }

    fn next_loc(&self, prev: DiskLoc) -> DiskLoc {
        let store = self.store.read();
        match self.direction {
            ScanDirection::Forward => store.next_loc(prev),
            ScanDirection::Reverse => store.prev_loc(prev),
        }
    }
}

impl Cursor for BasicCursor {
    fn ok(&self) -> bool {
        !self.curr.is_null()
    }

    fn current(&self) -> Option<Value> {
        self.store.read().get(self.curr).cloned()
    }

    fn curr_loc(&self) -> DiskLoc {
        self.curr
    }

    fn advance(&mut self) -> Result<bool> {
        self.token.check()?;
        if self.eof() {
            if self.tailable && !self.last.is_null() {
                self.curr = self.next_loc(self.last);
            } else {
                return Ok(false);
            }
        } else {
            self.last = self.curr;
            self.curr = self.next_loc(self.curr);
        }
        Ok(self.ok())
    }

    fn set_tailable(&mut self) {
        // nothing to resume from on a never-positioned cursor
        if !self.curr.is_null() || !self.last.is_null() {
            self.tailable = true;
        }
    }

    fn tailable(&self) -> bool {
        self.tailable
    }

    fn getsetdup(&mut self, loc: DiskLoc) -> bool {
        self.dups.getsetdup(loc)
    }

    fn name(&self) -> &'static str {
        match self.direction {
            ScanDirection::Forward => "BasicCursor",
            ScanDirection::Reverse => "ReverseCursor",
        }
    }
}

/// Position-stable index cursor: walks the bucket tree between a fixed
/// start/end bound pair in one direction, skipping tombstones, and re-anchors
/// itself after concurrent structural mutation.
///
/// A cursor does not support re-bounding; a new bound requires a new cursor.
pub struct BtreeCursor {
    arena: Arc<RwLock<BtreeArena>>,
    records: Arc<RwLock<RecordStore>>,
    pattern: Arc<KeyPattern>,
    start_key: Key,
    end_key: Key,
    direction: i32,
    position: Option<(BucketId, usize)>,
    /// false after a bucket-deletion notice: the cached slot must not be
    /// trusted and the next check_location re-anchors from the root
    slot_valid: bool,
    noted: Option<(Key, DiskLoc)>,
    token: CancelToken,
    dups: DupSet,
}

impl BtreeCursor {
    /// Descend from the root towards `start_key`; when no exact match exists
    /// the cursor lands on the nearest neighbor in scan direction, then skips
    /// any tombstones and checks it has not already passed `end_key`.
    pub fn new(
        arena: Arc<RwLock<BtreeArena>>,
        records: Arc<RwLock<RecordStore>>,
        start_key: Key,
        end_key: Key,
        direction: i32,
        token: CancelToken,
    ) -> Self {
        let direction = if direction < 0 { -1 } else { 1 };
        let pattern = arena.read().key_pattern().clone();
        let anchor = if direction > 0 {
            MIN_DISK_LOC
        } else {
            MAX_DISK_LOC
        };
        let (position, _) = arena.read().locate(&start_key, anchor, direction);
        let mut cursor = BtreeCursor {
            arena,
            records,
            pattern,
            start_key,
            end_key,
            direction,
            position,
            slot_valid: true,
            noted: None,
            token,
            dups: DupSet::default(),
        };
        cursor.skip_unused();
        cursor.check_end();
        cursor
    }

    pub fn start_key(&self) -> &Key {
        &self.start_key
    }

    pub fn end_key(&self) -> &Key {
        &self.end_key
    }

    pub fn direction(&self) -> i32 {
        self.direction
    }

    /// Skip tombstoned entries in scan direction. A long run is worth a
    /// diagnostic, not a failure.
    fn skip_unused(&mut self) {
        let mut skipped = 0u32;
        loop {
            let Some((bucket, slot)) = self.position else {
                break;
            };
            let arena = self.arena.read();
            match arena.read_entry(bucket, slot) {
                Some(entry) if entry.used => break,
                _ => {
                    self.position = arena.advance(bucket, slot, self.direction);
                    skipped += 1;
                }
            }
        }
        if skipped > 10 {
            log_debug!("btree unused skipped: {}", skipped);
        }
    }

    /// Exhaust the cursor once the current key lies past `end_key` under the
    /// direction's sign convention.
    fn check_end(&mut self) {
        let Some((bucket, slot)) = self.position else {
            return;
        };
        let arena = self.arena.read();
        match arena.read_entry(bucket, slot) {
            Some(entry) => {
                let cmp = ordering_sign(self.pattern.compare(&self.end_key, &entry.key));
                if cmp != 0 && cmp != self.direction {
                    self.position = None;
                }
            }
            None => self.position = None,
        }
    }

    fn step(&mut self) {
        if let Some((bucket, slot)) = self.position {
            self.position = self.arena.read().advance(bucket, slot, self.direction);
        }
    }
}

impl Cursor for BtreeCursor {
    fn ok(&self) -> bool {
        self.position.is_some()
    }

    fn current(&self) -> Option<Value> {
        self.records.read().get(self.curr_loc()).cloned()
    }

    fn curr_loc(&self) -> DiskLoc {
        let Some((bucket, slot)) = self.position else {
            return DiskLoc::null();
        };
        self.arena
            .read()
            .read_entry(bucket, slot)
            .map(|entry| entry.record_loc)
            .unwrap_or_else(DiskLoc::null)
    }

    fn current_key(&self) -> Option<Key> {
        let (bucket, slot) = self.position?;
        self.arena
            .read()
            .read_entry(bucket, slot)
            .map(|entry| entry.key.clone())
    }

    fn advance(&mut self) -> Result<bool> {
        self.token.check()?;
        if self.position.is_none() {
            return Ok(false);
        }
        self.step();
        self.skip_unused();
        self.check_end();
        Ok(self.ok())
    }

    fn note_location(&mut self) {
        let Some((bucket, slot)) = self.position else {
            return;
        };
        if let Some(entry) = self.arena.read().read_entry(bucket, slot) {
            self.noted = Some((entry.key.clone(), entry.record_loc));
        }
    }

    /// Since the last note_location our entry may have moved: slots shift on
    /// insert, buckets are freed by compaction. If the snapshot still matches
    /// the cached slot the position is valid (skipping forward if the entry
    /// was tombstoned in place). Otherwise re-search the index from the root
    /// using the snapshotted key, with the snapshotted record location as the
    /// tie-break between equal keys - that anchor is what disambiguates which
    /// logical position to resume at when the original entry was deleted.
    fn check_location(&mut self) {
        if self.position.is_none() {
            return;
        }
        let Some((noted_key, noted_loc)) = self.noted.clone() else {
            return;
        };
        if let (true, Some((bucket, slot))) = (self.slot_valid, self.position) {
            let in_place = {
                let arena = self.arena.read();
                arena
                    .read_entry(bucket, slot)
                    .filter(|entry| entry.key == noted_key && entry.record_loc == noted_loc)
                    .map(|entry| entry.used)
            };
            match in_place {
                Some(true) => return,
                Some(false) => {
                    // deleted but still present as a tombstone: move on
                    self.skip_unused();
                    self.check_end();
                    return;
                }
                None => {}
            }
        }
        let (position, found) = self.arena.read().locate(&noted_key, noted_loc, self.direction);
        self.position = position;
        self.slot_valid = true;
        log_debug!("index key moved, re-anchoring cursor (found: {})", found);
        self.skip_unused();
        self.check_end();
    }

    fn about_to_delete_bucket(&mut self, bucket: BucketId) {
        if let Some((current, _)) = self.position {
            if current == bucket {
                self.slot_valid = false;
            }
        }
    }

    fn index_key_pattern(&self) -> Option<Arc<KeyPattern>> {
        Some(self.pattern.clone())
    }

    fn getsetdup(&mut self, loc: DiskLoc) -> bool {
        self.dups.getsetdup(loc)
    }

    fn name(&self) -> &'static str {
        "BtreeCursor"
    }
}

// src/btree.rs
// Bucket arena: the index structure cursors traverse.
//
// Buckets live in an arena and are addressed by stable BucketId handles;
// cursors hold handles only, never bucket memory. Keys are stored at every
// level (internal buckets carry real entries, not just routing keys), and a
// deleted entry stays in place as an unused tombstone until compaction.

use crate::index::{Key, KeyPattern};
use crate::storage::DiskLoc;
use std::cmp::Ordering;
use std::sync::Arc;

const DEFAULT_FANOUT: usize = 8;

/// Stable handle to a bucket in the arena. Handles are never reused: a
/// compacted-away bucket's id stays dead, so a stale cursor position can be
/// detected rather than silently aliased.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketId(usize);

/// One slot inside a bucket: a key tuple, the location of the record it
/// indexes, the used flag (false marks a tombstone) and the link to the
/// child subtree sorting before this slot.
#[derive(Debug, Clone)]
pub struct KeyNode {
    pub key: Key,
    pub record_loc: DiskLoc,
    pub used: bool,
    left_child: Option<BucketId>,
}

#[derive(Debug)]
struct Bucket {
    slots: Vec<KeyNode>,
    right_child: Option<BucketId>,
    parent: Option<BucketId>,
}

/// In-memory index bucket tree with the traversal contract cursors consume:
/// `locate`, `advance` and `read_entry`. Mutation entry points (`insert`,
/// `mark_unused`, `compact`) model what concurrent writers do to the shared
/// structure between a cursor's steps.
#[derive(Debug)]
pub struct BtreeArena {
    buckets: Vec<Option<Bucket>>,
    root: Option<BucketId>,
    pattern: Arc<KeyPattern>,
    fanout: usize,
}

impl BtreeArena {
    pub fn new(pattern: Arc<KeyPattern>) -> Self {
        Self::with_fanout(pattern, DEFAULT_FANOUT)
    }

    /// A small fanout forces multi-level trees on few entries; tests use this
    /// to exercise cross-bucket traversal.
    pub fn with_fanout(pattern: Arc<KeyPattern>, fanout: usize) -> Self {
        BtreeArena {
            buckets: Vec::new(),
            root: None,
            pattern,
            fanout: fanout.max(2),
        }
    }

    pub fn key_pattern(&self) -> &Arc<KeyPattern> {
        &self.pattern
    }

    /// Number of live (non-tombstoned) entries.
    pub fn n_keys(&self) -> usize {
        self.entries().iter().filter(|(_, _, used)| *used).count()
    }

    // ---- traversal contract ----

    /// Descend from the root searching for `key` in `direction`, using
    /// `anchor` as the record-location tie-break between equal keys. Lands on
    /// the nearest valid neighbor consistent with the direction when no exact
    /// match exists: the first entry at-or-after the target for a forward
    /// search, the last entry at-or-before it for a reverse search.
    ///
    /// Returns the position (None when every entry lies on the wrong side)
    /// and whether an entry with an exactly matching key was found there.
    pub fn locate(
        &self,
        key: &Key,
        anchor: DiskLoc,
        direction: i32,
    ) -> (Option<(BucketId, usize)>, bool) {
        let Some(root) = self.root else {
            return (None, false);
        };
        let pos = if direction < 0 {
            self.locate_le(root, key, anchor)
        } else {
            self.locate_ge(root, key, anchor)
        };
        let found = pos
            .and_then(|(b, s)| self.read_entry(b, s))
            .map(|kn| self.pattern.compare(&kn.key, key) == Ordering::Equal)
            .unwrap_or(false);
        (pos, found)
    }

    /// One in-order step from (bucket, slot) in `direction`. Descends into
    /// the adjacent subtree when there is one, otherwise moves within the
    /// bucket, otherwise walks parent links until a sibling position exists.
    pub fn advance(
        &self,
        bucket: BucketId,
        slot: usize,
        direction: i32,
    ) -> Option<(BucketId, usize)> {
        let b = self.bucket(bucket)?;
        if slot >= b.slots.len() {
            return None;
        }
        if direction >= 0 {
            if let Some(child) = self.child_at(bucket, slot + 1) {
                return self.edge(child, 1);
            }
            if slot + 1 < b.slots.len() {
                return Some((bucket, slot + 1));
            }
            // past the last slot: climb until we were a left subtree
            let mut child = bucket;
            loop {
                let parent = self.bucket(child)?.parent?;
                let i = self.child_position(parent, child)?;
                if i < self.bucket(parent)?.slots.len() {
                    return Some((parent, i));
                }
                child = parent;
            }
        } else {
            if let Some(child) = self.child_at(bucket, slot) {
                return self.edge(child, -1);
            }
            if slot > 0 {
                return Some((bucket, slot - 1));
            }
            let mut child = bucket;
            loop {
                let parent = self.bucket(child)?.parent?;
                let i = self.child_position(parent, child)?;
                if i > 0 {
                    return Some((parent, i - 1));
                }
                child = parent;
            }
        }
    }

    /// Read the entry at (bucket, slot). None if the bucket has been freed or
    /// the slot index is out of range - both possible after external mutation.
    pub fn read_entry(&self, bucket: BucketId, slot: usize) -> Option<&KeyNode> {
        self.bucket(bucket)?.slots.get(slot)
    }

    // ---- mutation (what concurrent writers do) ----

    /// Insert an entry, shifting slots within the target leaf bucket.
    pub fn insert(&mut self, key: Key, loc: DiskLoc) {
        let Some(root) = self.root else {
            let id = self.alloc(Bucket {
                slots: vec![KeyNode {
                    key,
                    record_loc: loc,
                    used: true,
                    left_child: None,
                }],
                right_child: None,
                parent: None,
            });
            self.root = Some(id);
            return;
        };
        let mut current = root;
        loop {
            let Some(b) = self.bucket(current) else {
                return;
            };
            let pos = b.slots.partition_point(|s| {
                self.cmp_entry(&s.key, s.record_loc, &key, loc) == Ordering::Less
            });
            match self.child_at(current, pos) {
                Some(child) => current = child,
                None => {
                    if let Some(b) = self.bucket_mut(current) {
                        b.slots.insert(
                            pos,
                            KeyNode {
                                key,
                                record_loc: loc,
                                used: true,
                                left_child: None,
                            },
                        );
                    }
                    return;
                }
            }
        }
    }

    /// Tombstone the entry with this exact (key, location) pair. The slot
    /// stays in place, marked unused, until the next compaction.
    pub fn mark_unused(&mut self, key: &Key, loc: DiskLoc) -> bool {
        let (pos, _) = self.locate(key, loc, 1);
        if let Some((bucket, slot)) = pos {
            if let Some(kn) = self.read_entry(bucket, slot) {
                if kn.key == *key && kn.record_loc == loc {
                    if let Some(b) = self.bucket_mut(bucket) {
                        b.slots[slot].used = false;
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Bulk-load the tree from entries pre-sorted under the key pattern
    /// (location-tie-broken). Replaces any existing structure.
    pub fn build_from_sorted(&mut self, entries: Vec<(Key, DiskLoc)>) {
        self.rebuild(entries);
    }

    /// Drop all tombstones and rebuild the tree. Every pre-existing bucket is
    /// freed; the freed handles are returned so live cursors can be notified
    /// via `about_to_delete_bucket` before they touch the arena again.
    pub fn compact(&mut self) -> Vec<BucketId> {
        let live: Vec<(Key, DiskLoc)> = self
            .entries()
            .into_iter()
            .filter(|(_, _, used)| *used)
            .map(|(key, loc, _)| (key, loc))
            .collect();
        self.rebuild(live)
    }

    // ---- internals ----

    fn rebuild(&mut self, entries: Vec<(Key, DiskLoc)>) -> Vec<BucketId> {
        let freed: Vec<BucketId> = self
            .buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_some())
            .map(|(i, _)| BucketId(i))
            .collect();
        self.root = self.build_range(&entries, None);
        for id in &freed {
            self.buckets[id.0] = None;
        }
        freed
    }

    fn build_range(&mut self, entries: &[(Key, DiskLoc)], parent: Option<BucketId>) -> Option<BucketId> {
        if entries.is_empty() {
            return None;
        }
        let id = self.alloc(Bucket {
            slots: Vec::new(),
            right_child: None,
            parent,
        });
        if entries.len() <= self.fanout {
            let slots = entries
                .iter()
                .map(|(key, loc)| KeyNode {
                    key: key.clone(),
                    record_loc: *loc,
                    used: true,
                    left_child: None,
                })
                .collect();
            if let Some(b) = self.bucket_mut(id) {
                b.slots = slots;
            }
            return Some(id);
        }
        // pick `fanout` evenly spaced separators; the ranges between them
        // become child subtrees
        let n = entries.len();
        let parts = self.fanout + 1;
        let seps: Vec<usize> = (1..=self.fanout).map(|i| i * n / parts).collect();
        let mut slots = Vec::with_capacity(self.fanout);
        let mut start = 0;
        for &sep in &seps {
            let left = self.build_range(&entries[start..sep], Some(id));
            let (key, loc) = &entries[sep];
            slots.push(KeyNode {
                key: key.clone(),
                record_loc: *loc,
                used: true,
                left_child: left,
            });
            start = sep + 1;
        }
        let right = self.build_range(&entries[start..], Some(id));
        if let Some(b) = self.bucket_mut(id) {
            b.slots = slots;
            b.right_child = right;
        }
        Some(id)
    }

    fn alloc(&mut self, bucket: Bucket) -> BucketId {
        let id = BucketId(self.buckets.len());
        self.buckets.push(Some(bucket));
        id
    }

    fn bucket(&self, id: BucketId) -> Option<&Bucket> {
        self.buckets.get(id.0)?.as_ref()
    }

    fn bucket_mut(&mut self, id: BucketId) -> Option<&mut Bucket> {
        self.buckets.get_mut(id.0)?.as_mut()
    }

    fn cmp_entry(&self, k: &Key, l: DiskLoc, key: &Key, anchor: DiskLoc) -> Ordering {
        self.pattern.compare(k, key).then(l.cmp(&anchor))
    }

    /// Child pointer at slot boundary `i`: the left child of slot i, or the
    /// bucket's right child past the last slot.
    fn child_at(&self, id: BucketId, i: usize) -> Option<BucketId> {
        let b = self.bucket(id)?;
        if i < b.slots.len() {
            b.slots[i].left_child
        } else {
            b.right_child
        }
    }

    fn child_position(&self, parent: BucketId, child: BucketId) -> Option<usize> {
        let p = self.bucket(parent)?;
        for (i, slot) in p.slots.iter().enumerate() {
            if slot.left_child == Some(child) {
                return Some(i);
            }
        }
        if p.right_child == Some(child) {
            return Some(p.slots.len());
        }
        None
    }

    /// Deepest first (direction > 0) or last (direction < 0) position within
    /// the subtree rooted at `id`.
    fn edge(&self, id: BucketId, direction: i32) -> Option<(BucketId, usize)> {
        let mut current = id;
        loop {
            let b = self.bucket(current)?;
            let boundary = if direction >= 0 { 0 } else { b.slots.len() };
            match self.child_at(current, boundary) {
                Some(child) => current = child,
                None => {
                    if b.slots.is_empty() {
                        return None;
                    }
                    let slot = if direction >= 0 { 0 } else { b.slots.len() - 1 };
                    return Some((current, slot));
                }
            }
        }
    }

    fn locate_ge(&self, id: BucketId, key: &Key, anchor: DiskLoc) -> Option<(BucketId, usize)> {
        let b = self.bucket(id)?;
        let pos = b.slots.partition_point(|s| {
            self.cmp_entry(&s.key, s.record_loc, key, anchor) == Ordering::Less
        });
        if let Some(child) = self.child_at(id, pos) {
            if let Some(hit) = self.locate_ge(child, key, anchor) {
                return Some(hit);
            }
        }
        if pos < b.slots.len() {
            Some((id, pos))
        } else {
            None
        }
    }

    fn locate_le(&self, id: BucketId, key: &Key, anchor: DiskLoc) -> Option<(BucketId, usize)> {
        let b = self.bucket(id)?;
        let pos = b.slots.partition_point(|s| {
            self.cmp_entry(&s.key, s.record_loc, key, anchor) != Ordering::Greater
        });
        if let Some(child) = self.child_at(id, pos) {
            if let Some(hit) = self.locate_le(child, key, anchor) {
                return Some(hit);
            }
        }
        if pos > 0 {
            Some((id, pos - 1))
        } else {
            None
        }
    }

    /// All entries in key order, tombstones included.
    fn entries(&self) -> Vec<(Key, DiskLoc, bool)> {
        let mut out = Vec::new();
        let Some(root) = self.root else {
            return out;
        };
        let mut pos = self.edge(root, 1);
        while let Some((bucket, slot)) = pos {
            if let Some(kn) = self.read_entry(bucket, slot) {
                out.push((kn.key.clone(), kn.record_loc, kn.used));
            }
            pos = self.advance(bucket, slot, 1);
        }
        out
    }
}

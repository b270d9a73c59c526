// Index cursor behavior under concurrent-style mutation, plus the natural
// order cursor variants.

use parking_lot::RwLock;
use petradb_core::{
    BasicCursor, BtreeArena, BtreeCursor, CancelToken, Cursor, DiskLoc, FieldBoundSet, IndexKey,
    KeyPattern, PetraError, QueryPlan, RecordStore,
};
use serde_json::{json, Value};
use std::sync::Arc;

fn int_key(i: i64) -> Vec<IndexKey> {
    vec![IndexKey::Int(i)]
}

/// Arena over pattern {a: 1} with a small fanout (multi-level tree) indexing
/// documents {"a": 0..n} in a record store.
fn setup(n: i64) -> (Arc<RwLock<BtreeArena>>, Arc<RwLock<RecordStore>>, Vec<DiskLoc>) {
    let pattern = KeyPattern::shared(vec![("a".into(), 1)]).unwrap();
    let mut records = RecordStore::new();
    let locs: Vec<DiskLoc> = (0..n).map(|i| records.append(json!({"a": i}))).collect();
    let mut arena = BtreeArena::with_fanout(pattern, 3);
    arena.build_from_sorted((0..n).map(|i| (int_key(i), locs[i as usize])).collect());
    (Arc::new(RwLock::new(arena)), Arc::new(RwLock::new(records)), locs)
}

fn plan(predicate: Value, order: &[(&str, i32)]) -> QueryPlan {
    let bounds = FieldBoundSet::new(&predicate).unwrap();
    let order: Vec<(String, i32)> = order.iter().map(|(f, d)| (f.to_string(), *d)).collect();
    QueryPlan::new(&bounds, &order, vec![("a".to_string(), 1)]).unwrap()
}

fn collect(cursor: &mut BtreeCursor) -> Vec<i64> {
    let mut out = Vec::new();
    while cursor.ok() {
        if let Some(key) = cursor.current_key() {
            if let IndexKey::Int(i) = key[0] {
                out.push(i);
            }
        }
        cursor.advance().unwrap();
    }
    out
}

fn advance_to(cursor: &mut BtreeCursor, target: i64) {
    while cursor.current_key() != Some(int_key(target)) {
        assert!(cursor.advance().unwrap(), "ran off the end before {}", target);
    }
}

#[test]
fn full_scan_visits_index_order() {
    let (arena, records, _) = setup(20);
    let mut cursor = plan(json!({}), &[]).new_cursor(arena, records, CancelToken::new());
    assert_eq!(cursor.name(), "BtreeCursor");
    assert!(cursor.index_key_pattern().is_some());
    assert_eq!(collect(&mut cursor), (0..20).collect::<Vec<_>>());
}

#[test]
fn range_scan_respects_both_bounds() {
    let (arena, records, _) = setup(20);
    let mut cursor =
        plan(json!({"a": {"$gte": 2, "$lte": 5}}), &[]).new_cursor(arena, records, CancelToken::new());
    assert_eq!(collect(&mut cursor), vec![2, 3, 4, 5]);
    // exhaustion is permanent for this cursor
    assert!(!cursor.advance().unwrap());
    assert!(!cursor.advance().unwrap());
    assert!(cursor.curr_loc().is_null());
}

#[test]
fn reverse_scan_with_negated_order() {
    let (arena, records, _) = setup(10);
    let p = plan(json!({}), &[("a", -1)]);
    assert_eq!(p.direction(), -1);
    assert!(!p.scan_and_order_required());
    let mut cursor = p.new_cursor(arena, records, CancelToken::new());
    assert_eq!(collect(&mut cursor), (0..10).rev().collect::<Vec<_>>());
}

#[test]
fn current_resolves_the_record() {
    let (arena, records, _) = setup(5);
    let mut cursor = plan(json!({"a": 3}), &[]).new_cursor(arena, records, CancelToken::new());
    assert_eq!(cursor.current(), Some(json!({"a": 3})));
    assert!(!cursor.advance().unwrap());
}

#[test]
fn tombstoned_start_key_is_never_returned() {
    let (arena, records, locs) = setup(10);
    arena.write().mark_unused(&int_key(2), locs[2]);
    let cursor = plan(json!({"a": {"$gte": 2}}), &[]).new_cursor(
        arena,
        records,
        CancelToken::new(),
    );
    assert_eq!(cursor.current_key(), Some(int_key(3)));
}

#[test]
fn tombstone_runs_are_skipped_mid_scan() {
    let (arena, records, locs) = setup(10);
    for i in 3..7 {
        arena.write().mark_unused(&int_key(i), locs[i as usize]);
    }
    let mut cursor = plan(json!({}), &[]).new_cursor(arena, records, CancelToken::new());
    assert_eq!(collect(&mut cursor), vec![0, 1, 2, 7, 8, 9]);
}

#[test]
fn fully_tombstoned_range_starts_exhausted() {
    let (arena, records, locs) = setup(10);
    for i in 4..=6 {
        arena.write().mark_unused(&int_key(i), locs[i as usize]);
    }
    let cursor = plan(json!({"a": {"$gte": 4, "$lte": 6}}), &[]).new_cursor(
        arena,
        records,
        CancelToken::new(),
    );
    // skipping lands past the end bound immediately
    assert!(cursor.eof());
}

#[test]
fn check_location_survives_slot_shifts() {
    let (arena, records, _) = setup(10);
    let mut cursor =
        plan(json!({}), &[]).new_cursor(arena.clone(), records, CancelToken::new());
    advance_to(&mut cursor, 3);
    cursor.note_location();

    // writers insert equal keys at lower locations, shifting the noted
    // entry within its bucket
    {
        let mut a = arena.write();
        for i in 0..3 {
            a.insert(int_key(3), DiskLoc::new(1, 1 + i));
        }
    }
    cursor.check_location();
    assert_eq!(cursor.current_key(), Some(int_key(3)));
    assert!(cursor.advance().unwrap());
    assert_eq!(cursor.current_key(), Some(int_key(4)));
}

#[test]
fn check_location_skips_entry_tombstoned_in_place() {
    let (arena, records, locs) = setup(10);
    let mut cursor =
        plan(json!({}), &[]).new_cursor(arena.clone(), records, CancelToken::new());
    advance_to(&mut cursor, 3);
    cursor.note_location();

    arena.write().mark_unused(&int_key(3), locs[3]);
    cursor.check_location();
    assert_eq!(cursor.current_key(), Some(int_key(4)));
}

#[test]
fn check_location_reanchors_after_compaction() {
    let (arena, records, locs) = setup(10);
    let mut cursor =
        plan(json!({}), &[]).new_cursor(arena.clone(), records, CancelToken::new());
    advance_to(&mut cursor, 3);
    cursor.note_location();

    // the noted entry is deleted and the whole tree is rebuilt
    let freed = {
        let mut a = arena.write();
        a.mark_unused(&int_key(3), locs[3]);
        a.compact()
    };
    for bucket in freed {
        cursor.about_to_delete_bucket(bucket);
    }
    cursor.check_location();
    // never a stale entry: either exhausted or the next key in scan order
    assert_eq!(cursor.current_key(), Some(int_key(4)));
    assert_eq!(
        collect(&mut cursor),
        vec![4, 5, 6, 7, 8, 9]
    );
}

#[test]
fn reanchor_past_end_bound_exhausts() {
    let (arena, records, locs) = setup(10);
    let mut cursor = plan(json!({"a": {"$gte": 2, "$lte": 3}}), &[]).new_cursor(
        arena.clone(),
        records,
        CancelToken::new(),
    );
    advance_to(&mut cursor, 3);
    cursor.note_location();

    let freed = {
        let mut a = arena.write();
        a.mark_unused(&int_key(3), locs[3]);
        a.compact()
    };
    for bucket in freed {
        cursor.about_to_delete_bucket(bucket);
    }
    cursor.check_location();
    // the entry after the noted key is 4, which lies past the end bound
    assert!(cursor.eof());
    assert!(!cursor.advance().unwrap());
}

#[test]
fn reverse_cursor_reanchors_too() {
    let (arena, records, locs) = setup(10);
    let mut cursor =
        plan(json!({}), &[("a", -1)]).new_cursor(arena.clone(), records, CancelToken::new());
    advance_to(&mut cursor, 6);
    cursor.note_location();

    let freed = {
        let mut a = arena.write();
        a.mark_unused(&int_key(6), locs[6]);
        a.compact()
    };
    for bucket in freed {
        cursor.about_to_delete_bucket(bucket);
    }
    cursor.check_location();
    // scan order is descending: the entry following 6 is 5
    assert_eq!(cursor.current_key(), Some(int_key(5)));
}

#[test]
fn equal_keys_disambiguated_by_record_location() {
    let pattern = KeyPattern::shared(vec![("a".into(), 1)]).unwrap();
    let mut records = RecordStore::new();
    let locs: Vec<DiskLoc> = (0..4).map(|i| records.append(json!({"a": 7, "n": i}))).collect();
    let mut arena = BtreeArena::with_fanout(pattern, 3);
    arena.build_from_sorted(locs.iter().map(|l| (int_key(7), *l)).collect());
    let arena = Arc::new(RwLock::new(arena));
    let records = Arc::new(RwLock::new(records));

    let mut cursor =
        plan(json!({"a": 7}), &[]).new_cursor(arena.clone(), records, CancelToken::new());
    cursor.advance().unwrap();
    assert_eq!(cursor.curr_loc(), locs[1]);
    cursor.note_location();

    // delete the noted entry; the location tie-break picks the right
    // resume point among the remaining equal keys
    let freed = {
        let mut a = arena.write();
        a.mark_unused(&int_key(7), locs[1]);
        a.compact()
    };
    for bucket in freed {
        cursor.about_to_delete_bucket(bucket);
    }
    cursor.check_location();
    assert_eq!(cursor.curr_loc(), locs[2]);
}

#[test]
fn advance_observes_cancellation() {
    let (arena, records, _) = setup(10);
    let token = CancelToken::new();
    let mut cursor = plan(json!({}), &[]).new_cursor(arena, records, token.clone());
    assert!(cursor.advance().unwrap());
    token.cancel();
    assert!(matches!(cursor.advance(), Err(PetraError::Interrupted)));
}

#[test]
fn getsetdup_suppresses_repeats() {
    let (arena, records, locs) = setup(3);
    let mut cursor = plan(json!({}), &[]).new_cursor(arena, records, CancelToken::new());
    assert!(!cursor.getsetdup(locs[0]));
    assert!(cursor.getsetdup(locs[0]));
    assert!(!cursor.getsetdup(locs[1]));
}

// ---- natural order cursors ----

fn record_store(n: i64) -> Arc<RwLock<RecordStore>> {
    let mut store = RecordStore::new();
    for i in 0..n {
        store.append(json!({"n": i}));
    }
    Arc::new(RwLock::new(store))
}

fn collect_basic(cursor: &mut BasicCursor) -> Vec<i64> {
    let mut out = Vec::new();
    while cursor.ok() {
        if let Some(doc) = cursor.current() {
            out.push(doc["n"].as_i64().unwrap());
        }
        cursor.advance().unwrap();
    }
    out
}

#[test]
fn basic_cursor_scans_natural_order() {
    let store = record_store(5);
    let mut cursor = BasicCursor::new(store, CancelToken::new());
    assert_eq!(cursor.name(), "BasicCursor");
    assert!(cursor.current_key().is_none());
    assert!(cursor.index_key_pattern().is_none());
    assert_eq!(collect_basic(&mut cursor), vec![0, 1, 2, 3, 4]);
}

#[test]
fn reverse_cursor_scans_backwards() {
    let store = record_store(5);
    let mut cursor = BasicCursor::reverse(store, CancelToken::new());
    assert_eq!(cursor.name(), "ReverseCursor");
    assert_eq!(collect_basic(&mut cursor), vec![4, 3, 2, 1, 0]);
}

#[test]
fn tailable_cursor_resumes_after_append() {
    let store = record_store(3);
    let mut cursor = BasicCursor::new(store.clone(), CancelToken::new());
    cursor.set_tailable();
    assert!(cursor.tailable());
    assert_eq!(collect_basic(&mut cursor), vec![0, 1, 2]);

    // end of data is temporary for a tailable cursor
    assert!(!cursor.advance().unwrap());
    store.write().append(json!({"n": 3}));
    assert!(cursor.advance().unwrap());
    assert_eq!(cursor.current(), Some(json!({"n": 3})));
}

#[test]
fn tailable_request_ignored_before_any_position() {
    let store = Arc::new(RwLock::new(RecordStore::new()));
    let mut cursor = BasicCursor::new(store.clone(), CancelToken::new());
    cursor.set_tailable();
    assert!(!cursor.tailable());
    assert!(!cursor.advance().unwrap());
}

#[test]
fn basic_cursor_observes_cancellation() {
    let store = record_store(3);
    let token = CancelToken::new();
    let mut cursor = BasicCursor::new(store, token.clone());
    token.cancel();
    assert!(matches!(cursor.advance(), Err(PetraError::Interrupted)));
}

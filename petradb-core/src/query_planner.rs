// src/query_planner.rs
// Per-field scan bounds derived from a predicate, and query plans scoring a
// candidate index against a predicate + sort order.

use crate::btree::BtreeArena;
use crate::cursor::{BtreeCursor, CancelToken};
use crate::error::{PetraError, Result};
use crate::index::{IndexKey, Key, KeyPattern};
use crate::storage::RecordStore;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Interval constraint on one field over the ordered key domain.
///
/// The default bound is unrestricted: `[MinKey, MaxKey]`, both inclusive.
/// Constraints are combined by intersection, so successive lower bounds keep
/// the maximum and successive upper bounds keep the minimum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldBound {
    lower: IndexKey,
    lower_inclusive: bool,
    upper: IndexKey,
    upper_inclusive: bool,
}

impl Default for FieldBound {
    fn default() -> Self {
        FieldBound {
            lower: IndexKey::MinKey,
            lower_inclusive: true,
            upper: IndexKey::MaxKey,
            upper_inclusive: true,
        }
    }
}

impl FieldBound {
    pub fn lower(&self) -> &IndexKey {
        &self.lower
    }

    pub fn upper(&self) -> &IndexKey {
        &self.upper
    }

    pub fn lower_inclusive(&self) -> bool {
        self.lower_inclusive
    }

    pub fn upper_inclusive(&self) -> bool {
        self.upper_inclusive
    }

    /// A point bound pins the field to a single value (equality constraint).
    pub fn is_point(&self) -> bool {
        self.lower == self.upper && self.lower_inclusive && self.upper_inclusive
    }

    pub fn is_unrestricted(&self) -> bool {
        self.lower == IndexKey::MinKey
            && self.upper == IndexKey::MaxKey
            && self.lower_inclusive
            && self.upper_inclusive
    }

    /// Intersect with a new lower endpoint; the tighter bound wins. On equal
    /// values exclusivity wins, being the tighter of the two.
    pub fn intersect_lower(&mut self, value: IndexKey, inclusive: bool) {
        match value.cmp(&self.lower) {
            std::cmp::Ordering::Greater => {
                self.lower = value;
                self.lower_inclusive = inclusive;
            }
            std::cmp::Ordering::Equal => {
                self.lower_inclusive = self.lower_inclusive && inclusive;
            }
            std::cmp::Ordering::Less => {}
        }
    }

    /// Intersect with a new upper endpoint; the tighter bound wins.
    pub fn intersect_upper(&mut self, value: IndexKey, inclusive: bool) {
        match value.cmp(&self.upper) {
            std::cmp::Ordering::Less => {
                self.upper = value;
                self.upper_inclusive = inclusive;
            }
            std::cmp::Ordering::Equal => {
                self.upper_inclusive = self.upper_inclusive && inclusive;
            }
            std::cmp::Ordering::Greater => {}
        }
    }

    fn intersect_point(&mut self, value: IndexKey) {
        self.intersect_lower(value.clone(), true);
        self.intersect_upper(value, true);
    }

    /// The interval is empty when lower exceeds upper, or they coincide with
    /// either endpoint exclusive.
    fn is_empty(&self) -> bool {
        match self.lower.cmp(&self.upper) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Equal => !(self.lower_inclusive && self.upper_inclusive),
            std::cmp::Ordering::Less => false,
        }
    }
}

/// Per-field intervals derived from a conjunctive query predicate.
/// Built once, immutable afterward. Fields absent from the predicate are
/// unrestricted; only genuinely constrained fields are stored.
#[derive(Debug, Clone, Default)]
pub struct FieldBoundSet {
    bounds: HashMap<String, FieldBound>,
}

impl FieldBoundSet {
    /// Derive bounds from a predicate. Fails when the intersection of the
    /// constraints on any one field is empty (e.g. `a = 1` with `a >= 2`).
    ///
    /// Multi-value (`$in`) constraints become the conservative interval
    /// `[min(values), max(values)]` - a superset, not an exact membership
    /// test; callers still apply the original predicate to each candidate.
    pub fn new(predicate: &Value) -> Result<Self> {
        let mut bounds = HashMap::new();
        apply_predicate(&mut bounds, predicate)?;
        bounds.retain(|_, b: &mut FieldBound| !b.is_unrestricted());
        Ok(FieldBoundSet { bounds })
    }

    /// The bound for `field`; unrestricted when the predicate never
    /// constrained it.
    pub fn bound(&self, field: &str) -> FieldBound {
        self.bounds.get(field).cloned().unwrap_or_default()
    }

    pub fn has_bound(&self, field: &str) -> bool {
        self.bounds.contains_key(field)
    }

    pub fn n_bounds(&self) -> usize {
        self.bounds.len()
    }

    pub fn fields(&self) -> impl Iterator<Item = &String> {
        self.bounds.keys()
    }

    /// True when every constrained field is pinned to a single value.
    pub fn all_points(&self) -> bool {
        self.bounds.values().all(|b| b.is_point())
    }
}

fn apply_predicate(bounds: &mut HashMap<String, FieldBound>, predicate: &Value) -> Result<()> {
    let Some(obj) = predicate.as_object() else {
        return Ok(());
    };
    for (field, spec) in obj {
        if field == "$and" {
            // conjunction: clauses intersect into the same bound set
            if let Some(clauses) = spec.as_array() {
                for clause in clauses {
                    apply_predicate(bounds, clause)?;
                }
            }
            continue;
        }
        if field.starts_with('$') {
            // $or / $nor and friends contribute no per-field interval
            continue;
        }
        let bound = bounds.entry(field.clone()).or_default();
        apply_field_spec(bound, field, spec)?;
        if bound.is_empty() {
            return Err(PetraError::UnsatisfiableBound(field.clone()));
        }
    }
    Ok(())
}

fn apply_field_spec(bound: &mut FieldBound, field: &str, spec: &Value) -> Result<()> {
    if let Some(ops) = spec.as_object() {
        if ops.keys().any(|k| k.starts_with('$')) {
            for (op, v) in ops {
                match op.as_str() {
                    "$eq" => {
                        if is_scalar(v) {
                            bound.intersect_point(IndexKey::from(v));
                        }
                    }
                    "$gt" => bound.intersect_lower(IndexKey::from(v), false),
                    "$gte" => bound.intersect_lower(IndexKey::from(v), true),
                    "$lt" => bound.intersect_upper(IndexKey::from(v), false),
                    "$lte" => bound.intersect_upper(IndexKey::from(v), true),
                    "$in" => apply_in(bound, field, v)?,
                    "$regex" => {
                        let options = ops.get("$options").and_then(Value::as_str).unwrap_or("");
                        apply_regex(bound, v, options);
                    }
                    // $ne, $nin, $exists, $options and unknown operators
                    // contribute no interval
                    _ => {}
                }
            }
            return Ok(());
        }
        // plain subdocument equality: no conservative interval available
        return Ok(());
    }
    if is_scalar(spec) {
        bound.intersect_point(IndexKey::from(spec));
    }
    Ok(())
}

fn is_scalar(v: &Value) -> bool {
    !(v.is_array() || v.is_object())
}

fn apply_in(bound: &mut FieldBound, field: &str, v: &Value) -> Result<()> {
    let Some(values) = v.as_array() else {
        return Ok(());
    };
    if values.is_empty() {
        // $in over an empty set matches nothing
        return Err(PetraError::UnsatisfiableBound(field.to_string()));
    }
    let keys: Vec<IndexKey> = values.iter().map(IndexKey::from).collect();
    let min = keys.iter().min().cloned().unwrap_or(IndexKey::MinKey);
    let max = keys.iter().max().cloned().unwrap_or(IndexKey::MaxKey);
    bound.intersect_lower(min, true);
    bound.intersect_upper(max, true);
    Ok(())
}

/// "starts with prefix" approximated as the half-open interval
/// `[prefix, prefix-with-last-char-incremented)`. Only patterns anchored at
/// the start yield a prefix; case-insensitive matching defeats it.
fn apply_regex(bound: &mut FieldBound, pattern: &Value, options: &str) {
    let Some(pattern) = pattern.as_str() else {
        return;
    };
    if options.contains('i') {
        return;
    }
    let Some(prefix) = anchored_prefix(pattern) else {
        return;
    };
    let upper = increment_last_char(&prefix);
    bound.intersect_lower(IndexKey::String(prefix), true);
    bound.intersect_upper(IndexKey::String(upper), false);
}

/// Longest literal prefix of a regex anchored with `^`. None for unanchored
/// patterns or an anchor followed immediately by a metacharacter.
fn anchored_prefix(pattern: &str) -> Option<String> {
    let rest = pattern.strip_prefix('^')?;
    let mut prefix = String::new();
    let mut chars = rest.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                // escaped punctuation is a literal; escaped alphanumerics are
                // character classes like \d and end the prefix
                Some(e) if !e.is_ascii_alphanumeric() => prefix.push(e),
                _ => break,
            },
            '.' | '^' | '$' | '*' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '|' => break,
            _ => prefix.push(c),
        }
    }
    if prefix.is_empty() {
        None
    } else {
        Some(prefix)
    }
}

fn increment_last_char(prefix: &str) -> String {
    let mut s: String = prefix.to_string();
    if let Some(last) = s.pop() {
        let next = char::from_u32(last as u32 + 1).unwrap_or('\u{e000}');
        s.push(next);
    }
    s
}

/// Derived verdicts for scanning one candidate index with one predicate and
/// sort order. Stateless once built; all accessors are pure reads.
#[derive(Debug)]
pub struct QueryPlan {
    pattern: Arc<KeyPattern>,
    direction: i32,
    scan_and_order_required: bool,
    key_match: bool,
    exact_key_match: bool,
    optimal: bool,
    start_key: Key,
    end_key: Key,
}

impl QueryPlan {
    /// Score `key_fields` (a candidate index's key pattern) against the
    /// bounds and requested sort order. Fails on an empty key pattern.
    pub fn new(
        bounds: &FieldBoundSet,
        order: &[(String, i32)],
        key_fields: Vec<(String, i32)>,
    ) -> Result<Self> {
        let pattern = KeyPattern::shared(key_fields)?;
        let order: Vec<(String, i32)> = order
            .iter()
            .map(|(f, d)| (f.clone(), if *d < 0 { -1 } else { 1 }))
            .collect();

        // Point-bound fields are transparent for ordering: every record in
        // range shares their value. The effective sequence is the pattern
        // with those fields removed.
        let effective: Vec<&(String, i32)> = pattern
            .fields()
            .iter()
            .filter(|(field, _)| !bounds.bound(field).is_point())
            .collect();

        // The sort is free iff the order is a prefix of the effective
        // sequence with identical signs (forward scan) or uniformly negated
        // signs (reverse scan).
        let mut direction = 1;
        let mut scan_and_order_required = false;
        if !order.is_empty() {
            match order_ratio(&order, effective.iter().copied()) {
                Some(ratio) => direction = ratio,
                None => scan_and_order_required = true,
            }
        }

        // keyMatch: every bounded field appears in the pattern, and the order
        // is sign-compatible with the pattern wherever its fields occur.
        let bounds_covered = bounds.fields().all(|field| pattern.contains(field));
        let order_compatible = {
            let mut ratio = 0;
            let mut ok = true;
            for (field, dir) in &order {
                match pattern.direction_of(field) {
                    None => {
                        ok = false;
                        break;
                    }
                    Some(pd) => {
                        let r = dir * pd;
                        if ratio == 0 {
                            ratio = r;
                        } else if r != ratio {
                            ok = false;
                            break;
                        }
                    }
                }
            }
            ok
        };
        let key_match = bounds_covered && order_compatible;
        let exact_key_match = key_match && bounds.all_points();

        // optimal: no unconstrained pattern field may precede a constrained
        // one - constrained fields belong at the front of a good index.
        let mut optimal = true;
        let mut seen_unbounded = false;
        for (field, _) in pattern.fields() {
            if bounds.has_bound(field) {
                if seen_unbounded {
                    optimal = false;
                    break;
                }
            } else {
                seen_unbounded = true;
            }
        }

        // Scan bounds: under the chosen direction, each field contributes the
        // endpoint the scan meets first.
        let mut start_key = Vec::with_capacity(pattern.len());
        let mut end_key = Vec::with_capacity(pattern.len());
        for (field, sign) in pattern.fields() {
            let bound = bounds.bound(field);
            if direction * sign > 0 {
                start_key.push(bound.lower().clone());
                end_key.push(bound.upper().clone());
            } else {
                start_key.push(bound.upper().clone());
                end_key.push(bound.lower().clone());
            }
        }

        Ok(QueryPlan {
            pattern,
            direction,
            scan_and_order_required,
            key_match,
            exact_key_match,
            optimal,
            start_key,
            end_key,
        })
    }

    /// Whether a separate sort pass is required after the scan.
    pub fn scan_and_order_required(&self) -> bool {
        self.scan_and_order_required
    }

    /// +1 forward, -1 reverse scan of the index.
    pub fn direction(&self) -> i32 {
        self.direction
    }

    /// Every bounded and ordered field is served by this index's key pattern.
    pub fn key_match(&self) -> bool {
        self.key_match
    }

    /// Index keys alone suffice to answer the query without fetching records.
    pub fn exact_key_match(&self) -> bool {
        self.exact_key_match
    }

    /// No unconstrained pattern field blocks a constrained one downstream.
    pub fn optimal(&self) -> bool {
        self.optimal
    }

    pub fn start_key(&self) -> &Key {
        &self.start_key
    }

    pub fn end_key(&self) -> &Key {
        &self.end_key
    }

    pub fn key_pattern(&self) -> &Arc<KeyPattern> {
        &self.pattern
    }

    /// Construct the index cursor this plan describes.
    pub fn new_cursor(
        &self,
        arena: Arc<RwLock<BtreeArena>>,
        records: Arc<RwLock<RecordStore>>,
        token: CancelToken,
    ) -> BtreeCursor {
        BtreeCursor::new(
            arena,
            records,
            self.start_key.clone(),
            self.end_key.clone(),
            self.direction,
            token,
        )
    }
}

/// Prefix-match `order` against a field sequence: every order field must line
/// up by name, and the per-field sign products must be uniform. Returns the
/// uniform ratio (+1 identical, -1 uniformly negated), or None on mismatch.
fn order_ratio<'a>(
    order: &[(String, i32)],
    mut effective: impl Iterator<Item = &'a (String, i32)>,
) -> Option<i32> {
    let mut ratio = 0;
    for (field, dir) in order {
        let (eff_field, eff_dir) = effective.next()?;
        if field != eff_field {
            return None;
        }
        let r = dir * eff_dir;
        if ratio == 0 {
            ratio = r;
        } else if r != ratio {
            return None;
        }
    }
    Some(if ratio == 0 { 1 } else { ratio })
}

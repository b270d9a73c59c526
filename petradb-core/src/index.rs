// src/index.rs
// Ordered index key domain and key patterns

use crate::error::{PetraError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;

/// Index key - the ordered value domain index entries are compared in.
///
/// `MinKey` and `MaxKey` are the unbounded search sentinels: every other key
/// sorts strictly between them. They never appear inside stored entries, only
/// in scan bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IndexKey {
    MinKey,
    Null,
    Bool(bool),
    Int(i64),
    Float(OrderedFloat),
    String(String),
    MaxKey,
}

/// OrderedFloat wrapper for f64 to enable Ord (NaN sorts greatest)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrderedFloat(pub f64);

impl PartialEq for OrderedFloat {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for OrderedFloat {}

impl PartialOrd for OrderedFloat {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedFloat {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0.is_nan(), other.0.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => self.0.partial_cmp(&other.0).unwrap_or(Ordering::Equal),
        }
    }
}

// Equality must agree with cmp: Int(3) and Float(3.0) compare Equal in the
// shared numeric band, so they are equal keys.
impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        use IndexKey::*;
        match (self, other) {
            (MinKey, MinKey) => Ordering::Equal,
            (MinKey, _) => Ordering::Less,
            (_, MinKey) => Ordering::Greater,

            (MaxKey, MaxKey) => Ordering::Equal,
            (MaxKey, _) => Ordering::Greater,
            (_, MaxKey) => Ordering::Less,

            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,

            (Bool(a), Bool(b)) => a.cmp(b),
            (Bool(_), _) => Ordering::Less,
            (_, Bool(_)) => Ordering::Greater,

            // Ints and floats share one numeric band
            (Int(a), Int(b)) => a.cmp(b),
            (Int(a), Float(b)) => OrderedFloat(*a as f64).cmp(b),
            (Float(a), Int(b)) => a.cmp(&OrderedFloat(*b as f64)),
            (Float(a), Float(b)) => a.cmp(b),
            (Int(_), _) => Ordering::Less,
            (_, Int(_)) => Ordering::Greater,
            (Float(_), _) => Ordering::Less,
            (_, Float(_)) => Ordering::Greater,

            (String(a), String(b)) => a.cmp(b),
        }
    }
}

/// Convert serde_json::Value to IndexKey
impl From<&Value> for IndexKey {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => IndexKey::Null,
            Value::Bool(b) => IndexKey::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    IndexKey::Int(i)
                } else if let Some(f) = n.as_f64() {
                    IndexKey::Float(OrderedFloat(f))
                } else {
                    IndexKey::Null
                }
            }
            Value::String(s) => IndexKey::String(s.clone()),
            _ => IndexKey::Null, // arrays and objects index as Null
        }
    }
}

/// A structured key tuple: one component per key pattern field.
pub type Key = Vec<IndexKey>;

/// Key pattern: the ordered (field, direction) list defining an index's sort
/// order. Directions are +1 (ascending) or -1 (descending), each field
/// carrying its own sign. Immutable once constructed; shared by `Arc` between
/// plans and cursors built against the same index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPattern {
    fields: Vec<(String, i32)>,
}

impl KeyPattern {
    /// Build a key pattern, normalizing directions to +/-1.
    /// Fails on an empty field list - there is no index to describe.
    pub fn new(fields: Vec<(String, i32)>) -> Result<Self> {
        if fields.is_empty() {
            return Err(PetraError::EmptyKeyPattern);
        }
        let fields = fields
            .into_iter()
            .map(|(name, dir)| (name, if dir < 0 { -1 } else { 1 }))
            .collect();
        Ok(KeyPattern { fields })
    }

    pub fn shared(fields: Vec<(String, i32)>) -> Result<Arc<Self>> {
        Ok(Arc::new(Self::new(fields)?))
    }

    pub fn fields(&self) -> &[(String, i32)] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Direction of `field` within this pattern, if present.
    pub fn direction_of(&self, field: &str) -> Option<i32> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, dir)| *dir)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.direction_of(field).is_some()
    }

    /// Asymmetric ordered comparison of two key tuples under this pattern:
    /// each component's comparison is flipped by its field's sign. Components
    /// beyond the pattern length compare ascending; a shorter tuple sorts
    /// before a longer one with an equal prefix.
    pub fn compare(&self, a: &[IndexKey], b: &[IndexKey]) -> Ordering {
        for (i, (ka, kb)) in a.iter().zip(b.iter()).enumerate() {
            let cmp = ka.cmp(kb);
            if cmp != Ordering::Equal {
                let dir = self.fields.get(i).map(|(_, d)| *d).unwrap_or(1);
                return if dir < 0 { cmp.reverse() } else { cmp };
            }
        }
        a.len().cmp(&b.len())
    }

    /// Extract this pattern's key tuple from a document. Missing fields index
    /// as Null, matching how absent values are stored.
    pub fn extract_key(&self, doc: &Value) -> Key {
        self.fields
            .iter()
            .map(|(field, _)| {
                nested_value(doc, field)
                    .map(IndexKey::from)
                    .unwrap_or(IndexKey::Null)
            })
            .collect()
    }
}

/// Sign of an Ordering as -1/0/+1, for combining with a scan direction.
pub(crate) fn ordering_sign(o: Ordering) -> i32 {
    match o {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }
}

/// Look up a possibly-nested field with dot notation (e.g. "address.city").
fn nested_value<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

//! Entry model shared by the store, index, listeners and near caches

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{
    cmp::Ordering,
    collections::BTreeMap,
    fmt::{self, Display},
    hash::{Hash, Hasher},
    sync::Arc,
    time::Instant,
};

/// Trait for types that can be cached
pub trait Cacheable: Serialize + DeserializeOwned + Send + Sync + 'static {}
impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Trait for cache key types
///
/// Keys travel inside invalidation messages, so they must serialize.
pub trait CacheKey:
    Display + Hash + Eq + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
}
impl<T> CacheKey for T where
    T: Display + Hash + Eq + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Identity of a cluster member
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Storage tier an entry currently lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Hot,
    Cold,
}

/// An indexable attribute value.
///
/// Integers and floats compare numerically with each other so that
/// `price > 100` matches a stored `149.99`. Mixed comparisons are exact,
/// with no rounding through `f64`, and `-0.0` equals `0.0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl AttrValue {
    fn rank(&self) -> u8 {
        match self {
            AttrValue::Bool(_) => 0,
            AttrValue::Int(_) | AttrValue::Float(_) => 1,
            AttrValue::Str(_) => 2,
        }
    }
}

/// 2^63, the first float above every `i64`
const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;

/// Whole floats that convert to an `i64` without loss
fn exact_int(f: f64) -> Option<i64> {
    (f.fract() == 0.0 && (-I64_BOUND..I64_BOUND).contains(&f)).then_some(f as i64)
}

fn cmp_floats(a: f64, b: f64) -> Ordering {
    if a.is_nan() || b.is_nan() {
        a.total_cmp(&b)
    } else {
        a.partial_cmp(&b).unwrap_or(Ordering::Equal)
    }
}

/// Positive NaN sorts above and negative NaN below every integer, the
/// same places `f64::total_cmp` gives them among floats.
fn cmp_int_float(i: i64, f: f64) -> Ordering {
    if f.is_nan() {
        return if f.is_sign_negative() {
            Ordering::Greater
        } else {
            Ordering::Less
        };
    }
    if f >= I64_BOUND {
        return Ordering::Less;
    }
    if f < -I64_BOUND {
        return Ordering::Greater;
    }
    let whole = f.trunc();
    match i.cmp(&(whole as i64)) {
        Ordering::Equal => cmp_floats(0.0, f - whole),
        unequal => unequal,
    }
}

impl Ord for AttrValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (AttrValue::Bool(a), AttrValue::Bool(b)) => a.cmp(b),
            (AttrValue::Int(a), AttrValue::Int(b)) => a.cmp(b),
            (AttrValue::Float(a), AttrValue::Float(b)) => cmp_floats(*a, *b),
            (AttrValue::Int(a), AttrValue::Float(b)) => cmp_int_float(*a, *b),
            (AttrValue::Float(a), AttrValue::Int(b)) => cmp_int_float(*b, *a).reverse(),
            (AttrValue::Str(a), AttrValue::Str(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for AttrValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for AttrValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for AttrValue {}

impl Hash for AttrValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            AttrValue::Bool(b) => b.hash(state),
            AttrValue::Int(i) => i.hash(state),
            // Whole floats hash like the equal integer.
            AttrValue::Float(f) => match exact_int(*f) {
                Some(i) => i.hash(state),
                None => f.to_bits().hash(state),
            },
            AttrValue::Str(s) => s.hash(state),
        }
    }
}

impl Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(b) => write!(f, "{b}"),
            AttrValue::Int(i) => write!(f, "{i}"),
            AttrValue::Float(x) => write!(f, "{x}"),
            AttrValue::Str(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<i32> for AttrValue {
    fn from(v: i32) -> Self {
        AttrValue::Int(v.into())
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_owned())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Str(v)
    }
}

/// Attribute name to value mapping attached to every entry
pub type Attributes = BTreeMap<String, AttrValue>;

/// Build an [`Attributes`] map from name/value pairs.
pub fn attributes<I, N, V>(pairs: I) -> Attributes
where
    I: IntoIterator<Item = (N, V)>,
    N: Into<String>,
    V: Into<AttrValue>,
{
    pairs
        .into_iter()
        .map(|(name, value)| (name.into(), value.into()))
        .collect()
}

/// A cache entry as held by its owning node
#[derive(Debug)]
pub struct Entry<K, V> {
    pub key: K,
    pub value: Arc<V>,
    /// Monotonic per-key version; bumped by every mutation
    pub version: u64,
    pub last_access: Instant,
    pub tier: Tier,
    pub attributes: Attributes,
}

impl<K: Clone, V> Clone for Entry<K, V> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            value: Arc::clone(&self.value),
            version: self.version,
            last_access: self.last_access,
            tier: self.tier,
            attributes: self.attributes.clone(),
        }
    }
}

/// A value together with the authoritative version it was read at
#[derive(Debug)]
pub struct Versioned<V> {
    pub value: Arc<V>,
    pub version: u64,
}

impl<V> Clone for Versioned<V> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            version: self.version,
        }
    }
}

impl<K, V> From<Entry<K, V>> for Versioned<V> {
    fn from(entry: Entry<K, V>) -> Self {
        Self {
            value: entry.value,
            version: entry.version,
        }
    }
}

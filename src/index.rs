//! Secondary attribute indexes
//!
//! Each store partition owns one [`AttributeIndex`] and mutates it under the
//! same lock as its entries, so an index never lags the data it covers.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    hash::Hash,
    ops::Bound,
};

use crate::{AttrValue, Attributes, CompareOp};

/// Ordered value -> keys buckets for every indexed attribute
#[derive(Debug)]
pub(crate) struct AttributeIndex<K> {
    buckets: HashMap<String, BTreeMap<AttrValue, HashSet<K>>>,
}

impl<K> Default for AttributeIndex<K> {
    fn default() -> Self {
        Self {
            buckets: HashMap::new(),
        }
    }
}

impl<K: Hash + Eq + Clone> AttributeIndex<K> {
    pub(crate) fn has(&self, attr: &str) -> bool {
        self.buckets.contains_key(attr)
    }

    /// Start indexing `attr`, seeding it from existing entries.
    /// Returns false if the attribute was already indexed.
    pub(crate) fn create<'a, I>(&mut self, attr: &str, entries: I) -> bool
    where
        I: IntoIterator<Item = (&'a K, &'a Attributes)>,
        K: 'a,
    {
        if self.has(attr) {
            return false;
        }
        let mut tree: BTreeMap<AttrValue, HashSet<K>> = BTreeMap::new();
        for (key, attrs) in entries {
            if let Some(value) = attrs.get(attr) {
                tree.entry(value.clone()).or_default().insert(key.clone());
            }
        }
        self.buckets.insert(attr.to_owned(), tree);
        true
    }

    pub(crate) fn insert(&mut self, key: &K, attrs: &Attributes) {
        for (attr, tree) in self.buckets.iter_mut() {
            if let Some(value) = attrs.get(attr) {
                tree.entry(value.clone()).or_default().insert(key.clone());
            }
        }
    }

    pub(crate) fn remove(&mut self, key: &K, attrs: &Attributes) {
        for (attr, tree) in self.buckets.iter_mut() {
            let Some(value) = attrs.get(attr) else {
                continue;
            };
            if let Some(keys) = tree.get_mut(value) {
                keys.remove(key);
                if keys.is_empty() {
                    tree.remove(value);
                }
            }
        }
    }

    /// Keys whose `attr` satisfies `op value`, or `None` if `attr` is not indexed.
    pub(crate) fn lookup(&self, attr: &str, op: CompareOp, value: &AttrValue) -> Option<HashSet<K>> {
        let tree = self.buckets.get(attr)?;
        let keys = match op {
            CompareOp::Eq => tree.get(value).cloned().unwrap_or_default(),
            CompareOp::Ne => union(tree.iter().filter(|(v, _)| *v != value)),
            CompareOp::Lt => union(tree.range((Bound::Unbounded, Bound::Excluded(value)))),
            CompareOp::Le => union(tree.range((Bound::Unbounded, Bound::Included(value)))),
            CompareOp::Gt => union(tree.range((Bound::Excluded(value), Bound::Unbounded))),
            CompareOp::Ge => union(tree.range((Bound::Included(value), Bound::Unbounded))),
        };
        Some(keys)
    }

    pub(crate) fn indexed(&self) -> impl Iterator<Item = &str> {
        self.buckets.keys().map(String::as_str)
    }
}

fn union<'a, K>(buckets: impl Iterator<Item = (&'a AttrValue, &'a HashSet<K>)>) -> HashSet<K>
where
    K: Hash + Eq + Clone + 'a,
{
    buckets.flat_map(|(_, keys)| keys.iter().cloned()).collect()
}

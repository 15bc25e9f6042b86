//! Deltas: the filtered difference between two snapshots.

use std::collections::HashMap;
use std::hash::Hash;

use crate::value::Value;

/// Old and new value of one property.
#[derive(Debug, Clone, PartialEq)]
pub struct Change<O> {
    pub old: Value<O>,
    pub new: Value<O>,
}

impl<O> Change<O> {
    pub fn new(old: Value<O>, new: Value<O>) -> Self {
        Self { old, new }
    }

    /// A change whose previous value is unknown, as produced on the
    /// receiving side where only the new value travels.
    pub fn to(new: Value<O>) -> Self {
        Self {
            old: Value::Null,
            new,
        }
    }
}

/// Changed properties per object.
///
/// Each (object, property) pair appears at most once. Iteration order is
/// unspecified.
#[derive(Debug, Clone, PartialEq)]
pub struct Delta<O: Eq + Hash, P: Eq + Hash> {
    changes: HashMap<O, HashMap<P, Change<O>>>,
}

impl<O: Eq + Hash, P: Eq + Hash> Default for Delta<O, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: Eq + Hash, P: Eq + Hash> Delta<O, P> {
    /// Create an empty delta.
    pub fn new() -> Self {
        Self {
            changes: HashMap::new(),
        }
    }

    /// Record a change, replacing any earlier change for the same pair.
    pub fn insert(&mut self, object: O, property: P, change: Change<O>) -> Option<Change<O>> {
        self.changes
            .entry(object)
            .or_default()
            .insert(property, change)
    }

    /// Look up the change for one pair.
    pub fn get(&self, object: &O, property: &P) -> Option<&Change<O>> {
        self.changes.get(object)?.get(property)
    }

    /// Remove the change for one pair, dropping the object if it has no
    /// changes left.
    pub fn remove(&mut self, object: &O, property: &P) -> Option<Change<O>> {
        let props = self.changes.get_mut(object)?;
        let removed = props.remove(property);
        if props.is_empty() {
            self.changes.remove(object);
        }
        removed
    }

    /// Keep only the changes for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&O, &P, &Change<O>) -> bool) {
        self.changes.retain(|object, props| {
            props.retain(|property, change| keep(object, property, change));
            !props.is_empty()
        });
    }

    /// True when no property changed.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Number of changed (object, property) pairs.
    pub fn len(&self) -> usize {
        self.changes.values().map(HashMap::len).sum()
    }

    /// Number of objects with at least one change.
    pub fn object_count(&self) -> usize {
        self.changes.len()
    }

    /// Iterate over all `(object, property, change)` entries.
    pub fn iter(&self) -> impl Iterator<Item = (&O, &P, &Change<O>)> {
        self.changes.iter().flat_map(|(object, props)| {
            props
                .iter()
                .map(move |(property, change)| (object, property, change))
        })
    }

    /// Iterate over the changes grouped per object.
    pub fn objects(&self) -> impl Iterator<Item = (&O, &HashMap<P, Change<O>>)> {
        self.changes.iter()
    }
}

impl<O: Eq + Hash + Clone, P: Eq + Hash> IntoIterator for Delta<O, P> {
    type Item = (O, P, Change<O>);
    type IntoIter = std::vec::IntoIter<(O, P, Change<O>)>;

    fn into_iter(self) -> Self::IntoIter {
        let mut entries = Vec::with_capacity(self.len());
        for (object, props) in self.changes {
            for (property, change) in props {
                entries.push((object.clone(), property, change));
            }
        }
        entries.into_iter()
    }
}

impl<O: Eq + Hash, P: Eq + Hash> FromIterator<(O, P, Change<O>)> for Delta<O, P> {
    fn from_iter<I: IntoIterator<Item = (O, P, Change<O>)>>(iter: I) -> Self {
        let mut delta = Delta::new();
        for (object, property, change) in iter {
            delta.insert(object, property, change);
        }
        delta
    }
}

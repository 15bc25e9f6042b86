//! Model trait: the interface the sync layer needs from a transactional
//! object model.
//!
//! The sync layer never looks inside a model. It diffs two snapshots,
//! writes property values and listens for commits. Everything else
//! (transactions, observers, consistency rules) belongs to the model.

use std::fmt;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use deltalink_core::{Delta, Value};

use crate::error::Result;

/// A stored predicate over object or property identities.
pub struct Filter<T: ?Sized> {
    predicate: Arc<dyn Fn(&T) -> bool + Send + Sync>,
}

impl<T: ?Sized> Filter<T> {
    pub fn new(predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Arc::new(predicate),
        }
    }

    /// A filter admitting everything.
    pub fn all() -> Self {
        Self::new(|_| true)
    }

    pub fn test(&self, value: &T) -> bool {
        (self.predicate)(value)
    }
}

impl<T: ?Sized> Clone for Filter<T> {
    fn clone(&self) -> Self {
        Self {
            predicate: Arc::clone(&self.predicate),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Filter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter").finish_non_exhaustive()
    }
}

/// Selects the objects whose changes are replicated.
pub type ObjectFilter<O> = Filter<O>;

/// Selects the properties whose changes are replicated.
pub type PropertyFilter<P> = Filter<P>;

/// One commit notification.
#[derive(Debug, Clone)]
pub struct Commit<S> {
    /// State before the commit.
    pub pre: S,
    /// State after the commit.
    pub post: S,
    /// No further commit was queued when this one was delivered.
    pub last: bool,
}

/// Callback invoked for every commit, on the model's commit thread.
pub type CommitHandler<S> = Box<dyn Fn(&Commit<S>) -> Result<()> + Send + Sync>;

/// The Model trait.
///
/// Implementations deliver commits one at a time, in commit order, on a
/// single commit thread. A handler that blocks holds back later commits.
pub trait Model: Send + Sync + 'static {
    /// Object identity.
    type Object: Clone + Eq + Hash + Debug + Send + Sync + 'static;
    /// Property identity.
    type Property: Clone + Eq + Hash + Debug + Send + Sync + 'static;
    /// Immutable state at a commit boundary.
    type Snapshot: Clone + Send + Sync + 'static;

    // ─────────────────────────────────────────────────────────────────────────
    // Snapshots
    // ─────────────────────────────────────────────────────────────────────────

    /// Changed properties between two snapshots, restricted to entries
    /// admitted by both filters.
    fn diff(
        &self,
        pre: &Self::Snapshot,
        post: &Self::Snapshot,
        objects: &ObjectFilter<Self::Object>,
        properties: &PropertyFilter<Self::Property>,
    ) -> Delta<Self::Object, Self::Property>;

    // ─────────────────────────────────────────────────────────────────────────
    // Mutation
    // ─────────────────────────────────────────────────────────────────────────

    /// Overwrite one property value.
    fn set(
        &self,
        object: &Self::Object,
        property: &Self::Property,
        value: Value<Self::Object>,
    ) -> Result<()>;

    /// Write the new value of every entry in `delta` and return the
    /// entries that changed the model.
    ///
    /// Every returned entry is later reported by a commit. The commit must
    /// not be delivered on the calling thread.
    ///
    /// The default issues one [`Model::set`] per entry, stops at the first
    /// error and reports every entry as changed. Models with transactions
    /// should apply the whole delta as one commit.
    fn apply(
        &self,
        delta: Delta<Self::Object, Self::Property>,
    ) -> Result<Delta<Self::Object, Self::Property>> {
        let mut changed = Delta::new();
        for (object, property, change) in delta {
            self.set(&object, &property, change.new.clone())?;
            changed.insert(object, property, change);
        }
        Ok(changed)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Commit notification
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a handler called for every subsequent commit.
    fn on_commit(&self, handler: CommitHandler<Self::Snapshot>);

    // ─────────────────────────────────────────────────────────────────────────
    // Status
    // ─────────────────────────────────────────────────────────────────────────

    /// The model no longer processes commits.
    fn is_stopped(&self) -> bool;

    /// A commit is being delivered to the handlers right now.
    fn is_handling(&self) -> bool;

    /// Commits waiting for delivery.
    fn pending_commits(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter() {
        let even = Filter::new(|n: &u32| n % 2 == 0);
        let copy = even.clone();
        assert!(even.test(&4));
        assert!(!copy.test(&3));
        assert!(Filter::<str>::all().test("anything"));
    }
}

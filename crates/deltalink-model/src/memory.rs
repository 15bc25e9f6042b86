//! In-memory implementation of the Model trait.
//!
//! A small transactional store of objects and property values. Each
//! transaction produces a new immutable snapshot; commits are delivered
//! to the registered handlers on the model's own commit thread, in
//! commit order.
//!
//! Objects exist implicitly once they hold a value. Writing
//! [`Value::Null`] removes a property.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error};

use deltalink_core::{Change, CoreError, Delta, IdentitySerializer, Value};

use crate::error::{ModelError, Result};
use crate::traits::{Commit, CommitHandler, Model, ObjectFilter, PropertyFilter};

/// Identity of an object in a [`MemoryModel`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(String);

/// Identity of a property in a [`MemoryModel`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PropertyId(String);

macro_rules! string_id {
    ($name:ident) => {
        impl $name {
            pub fn new(name: impl Into<String>) -> Self {
                Self(name.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(name: &str) -> Self {
                Self::new(name)
            }
        }
    };
}

string_id!(ObjectId);
string_id!(PropertyId);

type Properties = BTreeMap<PropertyId, Value<ObjectId>>;

/// Immutable state of a [`MemoryModel`] at one commit boundary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemorySnapshot {
    objects: Arc<BTreeMap<ObjectId, Properties>>,
}

impl MemorySnapshot {
    /// Value of one property, if set.
    pub fn get(&self, object: &ObjectId, property: &PropertyId) -> Option<&Value<ObjectId>> {
        self.objects.get(object)?.get(property)
    }

    /// All properties of one object.
    pub fn object(&self, object: &ObjectId) -> Option<&BTreeMap<PropertyId, Value<ObjectId>>> {
        self.objects.get(object)
    }

    pub fn objects(&self) -> impl Iterator<Item = &ObjectId> {
        self.objects.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Writes collected by one [`MemoryModel::transact`] call.
pub struct Transaction<'a> {
    objects: &'a mut BTreeMap<ObjectId, Properties>,
    properties: Option<&'a BTreeSet<PropertyId>>,
}

impl Transaction<'_> {
    /// Overwrite one property; [`Value::Null`] removes it.
    pub fn set(
        &mut self,
        object: &ObjectId,
        property: &PropertyId,
        value: Value<ObjectId>,
    ) -> Result<()> {
        if let Some(known) = self.properties {
            if !known.contains(property) {
                return Err(ModelError::UnknownProperty(property.to_string()));
            }
        }

        if value.is_null() {
            if let Some(props) = self.objects.get_mut(object) {
                props.remove(property);
                if props.is_empty() {
                    self.objects.remove(object);
                }
            }
        } else {
            self.objects
                .entry(object.clone())
                .or_default()
                .insert(property.clone(), value);
        }
        Ok(())
    }

    /// Current value inside this transaction.
    pub fn get(&self, object: &ObjectId, property: &PropertyId) -> Option<&Value<ObjectId>> {
        self.objects.get(object)?.get(property)
    }
}

type SharedHandler = Arc<dyn Fn(&Commit<MemorySnapshot>) -> Result<()> + Send + Sync>;

/// State shared with the commit thread.
struct Shared {
    handlers: RwLock<Vec<SharedHandler>>,
    handling: AtomicBool,
    pending: AtomicUsize,
    stopped: AtomicBool,
}

enum Message {
    Commit(MemorySnapshot, MemorySnapshot),
    Stop,
}

/// In-memory model.
///
/// Thread-safe; share it behind an `Arc`. Dropping the last handle ends
/// the commit thread after it delivers the commits already queued.
pub struct MemoryModel {
    name: String,
    state: Mutex<MemorySnapshot>,
    properties: Option<Arc<BTreeSet<PropertyId>>>,
    shared: Arc<Shared>,
    commits: Sender<Message>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryModel {
    /// Create a model accepting any property.
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name.into(), None)
    }

    /// Create a model that rejects properties outside `properties`.
    pub fn with_properties<I, P>(name: impl Into<String>, properties: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PropertyId>,
    {
        let known = properties.into_iter().map(Into::into).collect();
        Self::build(name.into(), Some(Arc::new(known)))
    }

    fn build(name: String, properties: Option<Arc<BTreeSet<PropertyId>>>) -> Self {
        let shared = Arc::new(Shared {
            handlers: RwLock::new(Vec::new()),
            handling: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        });
        let (tx, rx) = channel::unbounded();

        let thread_shared = Arc::clone(&shared);
        let thread_name = format!("model-{name}");
        let thread = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || run_commits(&thread_name, &thread_shared, &rx))
            .map_err(|e| error!(model = %name, "failed to spawn commit thread: {e}"))
            .ok();

        if thread.is_none() {
            shared.stopped.store(true, Ordering::SeqCst);
        }

        Self {
            name,
            state: Mutex::new(MemorySnapshot::default()),
            properties,
            shared,
            commits: tx,
            thread: Mutex::new(thread),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` as one transaction.
    ///
    /// When `f` succeeds and changed anything, a new snapshot is committed
    /// and queued for the handlers. When `f` fails nothing is committed.
    pub fn transact<T>(&self, f: impl FnOnce(&mut Transaction<'_>) -> Result<T>) -> Result<T> {
        if self.is_stopped() {
            return Err(ModelError::Stopped);
        }

        let mut state = self.state.lock();
        let pre = state.clone();
        let mut objects = (*pre.objects).clone();
        let mut tx = Transaction {
            objects: &mut objects,
            properties: self.properties.as_deref(),
        };
        let out = f(&mut tx)?;

        if objects != *pre.objects {
            let post = MemorySnapshot {
                objects: Arc::new(objects),
            };
            *state = post.clone();
            self.shared.pending.fetch_add(1, Ordering::SeqCst);
            if self.commits.send(Message::Commit(pre, post)).is_err() {
                self.shared.pending.fetch_sub(1, Ordering::SeqCst);
            }
        }
        Ok(out)
    }

    /// Latest committed state.
    pub fn snapshot(&self) -> MemorySnapshot {
        self.state.lock().clone()
    }

    /// Latest committed value of one property.
    pub fn get(&self, object: &ObjectId, property: &PropertyId) -> Option<Value<ObjectId>> {
        self.state.lock().get(object, property).cloned()
    }

    /// Latest committed properties of one object.
    pub fn object(&self, object: &ObjectId) -> Result<BTreeMap<PropertyId, Value<ObjectId>>> {
        self.state
            .lock()
            .object(object)
            .cloned()
            .ok_or_else(|| ModelError::UnknownObject(object.to_string()))
    }

    /// Identity serializer for this model's ids.
    pub fn serializer(&self) -> MemorySerializer {
        MemorySerializer {
            properties: self.properties.clone(),
        }
    }

    /// Stop accepting transactions; commits already queued are dropped.
    pub fn stop(&self) {
        if !self.shared.stopped.swap(true, Ordering::SeqCst) {
            debug!(model = %self.name, "stopping");
            let _ = self.commits.send(Message::Stop);
        }
    }

    /// Wait for the commit thread to exit. Call [`MemoryModel::stop`] first.
    pub fn join(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(model = %self.name, "commit thread panicked");
            }
        }
    }
}

fn run_commits(name: &str, shared: &Shared, rx: &Receiver<Message>) {
    debug!(model = name, "commit thread started");
    for message in rx {
        let (pre, post) = match message {
            Message::Commit(pre, post) => (pre, post),
            Message::Stop => break,
        };
        if shared.stopped.load(Ordering::SeqCst) {
            break;
        }

        let commit = Commit {
            pre,
            post,
            last: rx.is_empty(),
        };
        shared.handling.store(true, Ordering::SeqCst);
        shared.pending.fetch_sub(1, Ordering::SeqCst);

        let handlers = shared.handlers.read().clone();
        for handler in &handlers {
            if let Err(e) = handler(&commit) {
                error!(model = name, error = %e, "commit handler failed");
            }
        }

        shared.handling.store(false, Ordering::SeqCst);
    }
    debug!(model = name, "commit thread stopped");
}

impl Model for MemoryModel {
    type Object = ObjectId;
    type Property = PropertyId;
    type Snapshot = MemorySnapshot;

    fn diff(
        &self,
        pre: &MemorySnapshot,
        post: &MemorySnapshot,
        objects: &ObjectFilter<ObjectId>,
        properties: &PropertyFilter<PropertyId>,
    ) -> Delta<ObjectId, PropertyId> {
        let mut delta = Delta::new();
        if Arc::ptr_eq(&pre.objects, &post.objects) {
            return delta;
        }

        let ids: BTreeSet<&ObjectId> = pre.objects.keys().chain(post.objects.keys()).collect();
        let empty = Properties::new();
        for object in ids.into_iter().filter(|o| objects.test(o)) {
            let before = pre.objects.get(object).unwrap_or(&empty);
            let after = post.objects.get(object).unwrap_or(&empty);
            if before == after {
                continue;
            }

            let props: BTreeSet<&PropertyId> = before.keys().chain(after.keys()).collect();
            for property in props.into_iter().filter(|p| properties.test(p)) {
                let old = before.get(property).cloned().unwrap_or(Value::Null);
                let new = after.get(property).cloned().unwrap_or(Value::Null);
                if old != new {
                    delta.insert(object.clone(), property.clone(), Change::new(old, new));
                }
            }
        }
        delta
    }

    fn set(&self, object: &ObjectId, property: &PropertyId, value: Value<ObjectId>) -> Result<()> {
        self.transact(|tx| tx.set(object, property, value))
    }

    fn apply(&self, delta: Delta<ObjectId, PropertyId>) -> Result<Delta<ObjectId, PropertyId>> {
        self.transact(|tx| {
            let mut changed = Delta::new();
            for (object, property, change) in delta {
                let old = tx.get(&object, &property).cloned().unwrap_or(Value::Null);
                if old == change.new {
                    continue;
                }
                tx.set(&object, &property, change.new.clone())?;
                changed.insert(object, property, Change::new(old, change.new));
            }
            Ok(changed)
        })
    }

    fn on_commit(&self, handler: CommitHandler<MemorySnapshot>) {
        self.shared.handlers.write().push(Arc::from(handler));
    }

    fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    fn is_handling(&self) -> bool {
        self.shared.handling.load(Ordering::SeqCst)
    }

    fn pending_commits(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for MemoryModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryModel")
            .field("name", &self.name)
            .field("stopped", &self.is_stopped())
            .field("pending", &self.pending_commits())
            .finish_non_exhaustive()
    }
}

/// Serializes [`MemoryModel`] ids to their names.
#[derive(Debug, Clone, Default)]
pub struct MemorySerializer {
    properties: Option<Arc<BTreeSet<PropertyId>>>,
}

impl IdentitySerializer for MemorySerializer {
    type Object = ObjectId;
    type Property = PropertyId;

    fn serialize_object(&self, object: &ObjectId) -> String {
        object.0.clone()
    }

    fn serialize_property(&self, property: &PropertyId) -> String {
        property.0.clone()
    }

    fn deserialize_object(&self, s: &str) -> deltalink_core::Result<ObjectId> {
        if s.is_empty() {
            return Err(CoreError::NotDeserializable("empty object id".into()));
        }
        Ok(ObjectId::new(s))
    }

    fn deserialize_property(&self, s: &str) -> deltalink_core::Result<PropertyId> {
        let property = PropertyId::new(s);
        match &self.properties {
            Some(known) if !known.contains(&property) => Err(CoreError::NotDeserializable(
                format!("unknown property {s:?}"),
            )),
            _ if s.is_empty() => Err(CoreError::NotDeserializable("empty property id".into())),
            _ => Ok(property),
        }
    }
}

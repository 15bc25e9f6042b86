//! Delta adaptor: binds one model to one replication link.
//!
//! Outgoing: every model commit is diffed under the adaptor's filters and,
//! when anything changed, encoded and pushed onto a bounded outgoing queue.
//! A full queue blocks the commit thread until the transport drains it.
//!
//! Incoming: serialized deltas are queued as tasks on one worker thread,
//! so they are decoded and applied strictly in arrival order, one at a
//! time.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};

use deltalink_core::{Delta, DeltaCodec, Value};
use deltalink_model::{Commit, Model, ModelError, ObjectFilter, PropertyFilter};

use crate::daemon::{Daemon, DaemonState, Interrupt, Outcome, Submitter};
use crate::endpoint::DeltaEndpoint;
use crate::error::{Result, SyncError};

/// Default capacity of the outgoing queue and the worker task queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// Adaptor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptorConfig {
    /// Serialized deltas buffered before commits block.
    pub outgoing_capacity: usize,
    /// Incoming deltas buffered before `submit_incoming` blocks.
    pub task_capacity: usize,
    /// Publish commits from the worker thread instead of the model's
    /// commit thread.
    pub publish_on_worker: bool,
    /// Drop outgoing entries that merely repeat a value received from the
    /// peer.
    pub suppress_echo: bool,
}

impl Default for AdaptorConfig {
    fn default() -> Self {
        Self {
            outgoing_capacity: DEFAULT_QUEUE_CAPACITY,
            task_capacity: DEFAULT_QUEUE_CAPACITY,
            publish_on_worker: false,
            suppress_echo: true,
        }
    }
}

impl AdaptorConfig {
    pub fn with_outgoing_capacity(mut self, capacity: usize) -> Self {
        self.outgoing_capacity = capacity;
        self
    }

    pub fn with_task_capacity(mut self, capacity: usize) -> Self {
        self.task_capacity = capacity;
        self
    }

    pub fn with_publish_on_worker(mut self, enabled: bool) -> Self {
        self.publish_on_worker = enabled;
        self
    }

    pub fn with_suppress_echo(mut self, enabled: bool) -> Self {
        self.suppress_echo = enabled;
        self
    }
}

/// Unit of work for the adaptor's worker.
#[derive(Debug)]
pub enum Task<S> {
    /// Diff two snapshots and queue the result.
    Publish { pre: S, post: S, last: bool },
    /// Decode a delta from the peer and apply it.
    Apply(String),
}

enum Published {
    Skipped,
    Queued,
    Woken,
}

/// Peer values per key, in apply order, awaiting the commit that reports them.
type EchoMemory<O, P> = HashMap<O, HashMap<P, Vec<Value<O>>>>;

struct Inner<M: Model> {
    name: String,
    model: Arc<M>,
    objects: ObjectFilter<M::Object>,
    properties: PropertyFilter<M::Property>,
    codec: DeltaCodec<M::Object, M::Property>,
    suppress_echo: bool,
    outgoing_tx: Sender<String>,
    outgoing_rx: Receiver<String>,
    /// Disconnected once the adaptor stops.
    closed_rx: Receiver<()>,
    closed_tx: Mutex<Option<Sender<()>>>,
    applied: Mutex<EchoMemory<M::Object, M::Property>>,
    publish_error: Mutex<Option<Arc<anyhow::Error>>>,
}

/// Connects a [`Model`] to a replication link.
pub struct DeltaAdaptor<M: Model> {
    inner: Arc<Inner<M>>,
    daemon: Daemon<Task<M::Snapshot>>,
}

impl<M: Model> DeltaAdaptor<M> {
    /// Create an adaptor with the default configuration.
    pub fn new(
        name: impl Into<String>,
        model: Arc<M>,
        objects: ObjectFilter<M::Object>,
        properties: PropertyFilter<M::Property>,
        codec: DeltaCodec<M::Object, M::Property>,
    ) -> Result<Self> {
        Self::with_config(name, model, objects, properties, codec, AdaptorConfig::default())
    }

    /// Create an adaptor, start its worker `adaptor-<name>` and register
    /// its commit handler with `model`.
    pub fn with_config(
        name: impl Into<String>,
        model: Arc<M>,
        objects: ObjectFilter<M::Object>,
        properties: PropertyFilter<M::Property>,
        codec: DeltaCodec<M::Object, M::Property>,
        config: AdaptorConfig,
    ) -> Result<Self> {
        let name = name.into();
        let (outgoing_tx, outgoing_rx) = channel::bounded(config.outgoing_capacity);
        let (closed_tx, closed_rx) = channel::bounded(0);

        let inner = Arc::new(Inner {
            name: name.clone(),
            model: Arc::clone(&model),
            objects,
            properties,
            codec,
            suppress_echo: config.suppress_echo,
            outgoing_tx,
            outgoing_rx,
            closed_rx,
            closed_tx: Mutex::new(Some(closed_tx)),
            applied: Mutex::new(HashMap::new()),
            publish_error: Mutex::new(None),
        });

        let worker = Arc::clone(&inner);
        let daemon = Daemon::spawn(
            format!("adaptor-{name}"),
            config.task_capacity,
            move |task, interrupt: &Interrupt| worker.execute(task, interrupt),
        )?;

        let weak = Arc::downgrade(&inner);
        let submitter = config.publish_on_worker.then(|| daemon.submitter());
        model.on_commit(Box::new(move |commit| on_commit(&weak, submitter.as_ref(), commit)));

        debug!(adaptor = %name, ?config, "adaptor started");
        Ok(Self { inner, daemon })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn model(&self) -> &Arc<M> {
        &self.inner.model
    }

    /// Next outgoing delta, blocking until one is queued.
    ///
    /// After [`DeltaAdaptor::stop`] the deltas already queued are still
    /// returned; then this fails with [`SyncError::OutgoingClosed`].
    pub fn pull_next_outgoing(&self) -> Result<String> {
        let inner = &self.inner;
        if let Ok(text) = inner.outgoing_rx.try_recv() {
            return Ok(text);
        }
        crossbeam::select! {
            recv(inner.outgoing_rx) -> text => text.map_err(|_| SyncError::OutgoingClosed),
            recv(inner.closed_rx) -> _ => Err(SyncError::OutgoingClosed),
        }
    }

    /// Next outgoing delta if one is queued.
    pub fn try_pull_next_outgoing(&self) -> Option<String> {
        self.inner.outgoing_rx.try_recv().ok()
    }

    /// Next outgoing delta, waiting at most `timeout`.
    pub fn pull_next_outgoing_timeout(&self, timeout: Duration) -> Result<Option<String>> {
        let inner = &self.inner;
        if let Ok(text) = inner.outgoing_rx.try_recv() {
            return Ok(Some(text));
        }
        crossbeam::select! {
            recv(inner.outgoing_rx) -> text => text.map(Some).map_err(|_| SyncError::OutgoingClosed),
            recv(inner.closed_rx) -> _ => Err(SyncError::OutgoingClosed),
            default(timeout) => Ok(None),
        }
    }

    /// Next outgoing delta, or `None` once `cancel` yields or disconnects.
    pub fn pull_next_outgoing_or_cancel(&self, cancel: &Receiver<()>) -> Result<Option<String>> {
        let inner = &self.inner;
        if let Ok(text) = inner.outgoing_rx.try_recv() {
            return Ok(Some(text));
        }
        crossbeam::select! {
            recv(inner.outgoing_rx) -> text => text.map(Some).map_err(|_| SyncError::OutgoingClosed),
            recv(inner.closed_rx) -> _ => Err(SyncError::OutgoingClosed),
            recv(cancel) -> _ => Ok(None),
        }
    }

    /// Queue a delta received from the peer for application.
    ///
    /// Returns as soon as the delta is queued; blocks only while the task
    /// queue is full. Failures while applying surface through
    /// [`DeltaAdaptor::last_fatal_error`].
    pub fn submit_incoming(&self, text: impl Into<String>) -> Result<()> {
        self.daemon.submit(Task::Apply(text.into()))
    }

    /// Write every entry of `delta` into the model.
    pub fn apply_all(&self, delta: Delta<M::Object, M::Property>) -> Result<()> {
        self.inner.apply_all(delta)
    }

    /// Cooperative stop; also closes the outgoing queue.
    pub fn stop(&self) {
        self.daemon.stop();
        self.inner.close();
    }

    /// Wake the worker out of a blocked wait.
    pub fn interrupt(&self) {
        self.daemon.interrupt();
    }

    /// Wait for the worker thread to exit.
    pub fn join(&self) {
        self.daemon.join();
    }

    pub fn worker_state(&self) -> DaemonState {
        self.daemon.state()
    }

    /// The failure that stopped the worker or a commit handler, if any.
    pub fn last_fatal_error(&self) -> Option<Arc<anyhow::Error>> {
        self.daemon
            .last_fatal_error()
            .or_else(|| self.inner.publish_error.lock().clone())
    }

    /// Number of serialized deltas waiting to be pulled.
    pub fn outgoing_len(&self) -> usize {
        self.inner.outgoing_rx.len()
    }

    /// Peer values applied but not yet seen in a commit.
    pub fn pending_echoes(&self) -> usize {
        let applied = self.inner.applied.lock();
        applied
            .values()
            .flat_map(|props| props.values())
            .map(|pending| pending.len())
            .sum()
    }

    pub fn is_busy(&self) -> bool {
        self.is_busy_explained(&mut String::new())
    }

    /// Like [`DeltaAdaptor::is_busy`], appending the reasons, separated
    /// by `", "`, to `explanation`.
    pub fn is_busy_explained(&self, explanation: &mut String) -> bool {
        let mut reasons = Vec::new();
        let mut busy = false;
        if self.daemon.is_busy() {
            reasons.push("adaptor worker busy".to_string());
            busy = true;
        }
        if !self.inner.outgoing_rx.is_empty() {
            reasons.push("outgoing queue not empty".to_string());
            busy = true;
        }

        let model = &self.inner.model;
        if model.is_stopped() {
            reasons.push("model is stopped".to_string());
        } else {
            if model.is_handling() {
                reasons.push("model is handling".to_string());
                busy = true;
            }
            let pending = model.pending_commits();
            if pending != 0 {
                reasons.push(format!("model queue not empty ({pending})"));
                busy = true;
            }
        }
        explanation.push_str(&reasons.join(", "));
        busy
    }
}

impl<M: Model> Drop for DeltaAdaptor<M> {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl<M: Model> DeltaEndpoint for DeltaAdaptor<M> {
    fn name(&self) -> &str {
        DeltaAdaptor::name(self)
    }

    fn pull_next_outgoing(&self) -> Result<String> {
        DeltaAdaptor::pull_next_outgoing(self)
    }

    fn pull_next_outgoing_or_cancel(&self, cancel: &Receiver<()>) -> Result<Option<String>> {
        DeltaAdaptor::pull_next_outgoing_or_cancel(self, cancel)
    }

    fn submit_incoming(&self, text: String) -> Result<()> {
        DeltaAdaptor::submit_incoming(self, text)
    }
}

fn on_commit<M: Model>(
    weak: &Weak<Inner<M>>,
    submitter: Option<&Submitter<Task<M::Snapshot>>>,
    commit: &Commit<M::Snapshot>,
) -> deltalink_model::Result<()> {
    let Some(inner) = weak.upgrade() else {
        return Ok(());
    };

    let result = match submitter {
        Some(submitter) => submitter.submit(Task::Publish {
            pre: commit.pre.clone(),
            post: commit.post.clone(),
            last: commit.last,
        }),
        None => inner
            .publish(&commit.pre, &commit.post, &channel::never())
            .map(|_| ()),
    };

    match result {
        Ok(()) => Ok(()),
        Err(SyncError::OutgoingClosed | SyncError::WorkerStopped(_)) if inner.is_closed() => {
            debug!(adaptor = %inner.name, "commit after stop not published");
            Ok(())
        }
        Err(e) => {
            let message = e.to_string();
            error!(adaptor = %inner.name, error = %message, "failed to publish commit");
            inner
                .publish_error
                .lock()
                .get_or_insert_with(|| Arc::new(anyhow::Error::new(e)));
            Err(ModelError::Handler(message))
        }
    }
}

impl<M: Model> Inner<M> {
    fn execute(&self, task: Task<M::Snapshot>, interrupt: &Interrupt) -> Outcome {
        match task {
            Task::Apply(text) => self
                .apply_text(&text)
                .with_context(|| format!("adaptor {} failed to apply incoming delta", self.name))
                .into(),
            Task::Publish { pre, post, last } => {
                trace!(adaptor = %self.name, last, "publishing on worker");
                match self.publish(&pre, &post, interrupt.channel()) {
                    Ok(Published::Woken) => interrupt.outcome(),
                    Ok(_) => Outcome::Ok,
                    Err(SyncError::OutgoingClosed) => Outcome::Ok,
                    Err(e) => Outcome::Fatal(
                        anyhow::Error::new(e)
                            .context(format!("adaptor {} failed to publish commit", self.name)),
                    ),
                }
            }
        }
    }

    fn publish(
        &self,
        pre: &M::Snapshot,
        post: &M::Snapshot,
        wake: &Receiver<()>,
    ) -> Result<Published> {
        let mut delta = self
            .model
            .diff(pre, post, &self.objects, &self.properties);
        if self.suppress_echo {
            self.forget_echoes(&mut delta);
        }
        if delta.is_empty() {
            return Ok(Published::Skipped);
        }

        let text = self.codec.encode(&delta)?;
        if text.contains('\n') {
            return Err(SyncError::EmbeddedNewline);
        }
        trace!(adaptor = %self.name, entries = delta.len(), "queueing outgoing delta");

        crossbeam::select! {
            send(self.outgoing_tx, text) -> sent => sent
                .map(|()| Published::Queued)
                .map_err(|_| SyncError::OutgoingClosed),
            recv(self.closed_rx) -> _ => Err(SyncError::OutgoingClosed),
            recv(wake) -> _ => Ok(Published::Woken),
        }
    }

    fn apply_text(&self, text: &str) -> Result<()> {
        let delta = self.codec.decode(text)?;
        trace!(adaptor = %self.name, entries = delta.len(), "applying incoming delta");
        self.apply_all(delta)
    }

    fn apply_all(&self, delta: Delta<M::Object, M::Property>) -> Result<()> {
        if !self.suppress_echo {
            self.model.apply(delta)?;
            return Ok(());
        }

        // Held across the apply so its commit is never diffed before the
        // values it carries are remembered.
        let mut applied = self.applied.lock();
        let changed = self.model.apply(delta)?;
        for (object, property, change) in changed {
            if self.objects.test(&object) && self.properties.test(&property) {
                applied
                    .entry(object)
                    .or_default()
                    .entry(property)
                    .or_default()
                    .push(change.new);
            }
        }
        Ok(())
    }

    /// Remove entries that repeat a value applied from the peer. Each
    /// remembered value is consumed by the first commit reporting it.
    fn forget_echoes(&self, delta: &mut Delta<M::Object, M::Property>) {
        let mut applied = self.applied.lock();
        if applied.is_empty() {
            return;
        }
        delta.retain(|object, property, change| {
            let Some(props) = applied.get_mut(object) else {
                return true;
            };
            let Some(pending) = props.get_mut(property) else {
                return true;
            };
            let Some(at) = pending.iter().position(|value| *value == change.new) else {
                return true;
            };
            pending.remove(at);
            if pending.is_empty() {
                props.remove(property);
                if props.is_empty() {
                    applied.remove(object);
                }
            }
            false
        });
    }

    fn close(&self) {
        self.closed_tx.lock().take();
    }

    fn is_closed(&self) -> bool {
        self.closed_tx.lock().is_none()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Instant;

    use deltalink_model::{
        CommitHandler, MemoryModel, MemorySnapshot, ObjectId, PropertyFilter, PropertyId,
    };

    use super::*;

    type Adaptor = DeltaAdaptor<MemoryModel>;

    fn o(name: &str) -> ObjectId {
        ObjectId::new(name)
    }

    fn p(name: &str) -> PropertyId {
        PropertyId::new(name)
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn adaptor(name: &str, config: AdaptorConfig) -> (Arc<MemoryModel>, Adaptor) {
        let model = Arc::new(MemoryModel::new(name));
        let codec = DeltaCodec::json(model.serializer());
        let adaptor = DeltaAdaptor::with_config(
            name,
            Arc::clone(&model),
            ObjectFilter::all(),
            PropertyFilter::all(),
            codec,
            config,
        )
        .unwrap();
        (model, adaptor)
    }

    fn shutdown<M: Model>(adaptor: &DeltaAdaptor<M>) {
        adaptor.stop();
        adaptor.interrupt();
        adaptor.join();
    }

    #[test]
    fn test_commit_is_published() {
        let (model, a) = adaptor("a", AdaptorConfig::default());
        model.set(&o("obj"), &p("x"), Value::Int(2)).unwrap();

        let text = a.pull_next_outgoing().unwrap();
        let codec = DeltaCodec::json(model.serializer());
        let delta = codec.decode(&text).unwrap();
        assert_eq!(delta.len(), 1);
        assert_eq!(delta.get(&o("obj"), &p("x")).unwrap().new, Value::Int(2));
        shutdown(&a);
    }

    #[test]
    fn test_pull_returns_none_on_cancel() {
        let (model, a) = adaptor("a", AdaptorConfig::default());
        let a = Arc::new(a);
        let (cancel_tx, cancel_rx) = channel::bounded::<()>(0);
        let waiter = thread::spawn({
            let a = Arc::clone(&a);
            move || a.pull_next_outgoing_or_cancel(&cancel_rx).map_err(|e| e.to_string())
        });
        thread::sleep(Duration::from_millis(20));
        drop(cancel_tx);
        assert_eq!(waiter.join().unwrap(), Ok(None));

        let (_keep, never) = channel::bounded::<()>(0);
        model.set(&o("obj"), &p("x"), Value::Int(4)).unwrap();
        let text = a.pull_next_outgoing_or_cancel(&never).unwrap().unwrap();
        assert!(text.contains("I4"));
        shutdown(&a);
    }

    #[test]
    fn test_filtered_commit_is_not_published() {
        let model = Arc::new(MemoryModel::new("m"));
        let a = DeltaAdaptor::new(
            "a",
            Arc::clone(&model),
            ObjectFilter::all(),
            PropertyFilter::new(|prop: &PropertyId| prop.as_str() != "local"),
            DeltaCodec::json(model.serializer()),
        )
        .unwrap();

        model.set(&o("obj"), &p("local"), Value::Int(1)).unwrap();
        wait_until(|| !a.is_busy());
        assert_eq!(
            a.pull_next_outgoing_timeout(Duration::from_millis(50)).unwrap(),
            None
        );

        model.set(&o("obj"), &p("shared"), Value::Int(1)).unwrap();
        let text = a.pull_next_outgoing().unwrap();
        assert!(text.contains("shared"));
        assert!(!text.contains("local"));
        shutdown(&a);
    }

    #[test]
    fn test_order_preserved_end_to_end() {
        let (model_a, a) = adaptor("a", AdaptorConfig::default());
        let (model_b, b) = adaptor("b", AdaptorConfig::default());

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        model_b.on_commit(Box::new(move |commit| {
            sink.lock().push(commit.post.get(&o("obj"), &p("x")).cloned());
            Ok(())
        }));

        for i in 1..=5 {
            model_a.set(&o("obj"), &p("x"), Value::Int(i)).unwrap();
            b.submit_incoming(a.pull_next_outgoing().unwrap()).unwrap();
        }
        wait_until(|| seen.lock().len() == 5);

        let expected: Vec<_> = (1..=5).map(|i| Some(Value::Int(i))).collect();
        assert_eq!(*seen.lock(), expected);
        assert_eq!(model_b.get(&o("obj"), &p("x")), Some(Value::Int(5)));
        shutdown(&a);
        shutdown(&b);
    }

    #[test]
    fn test_backpressure_blocks_commit_thread() {
        let config = AdaptorConfig::default().with_outgoing_capacity(2);
        let (model, a) = adaptor("a", config);

        for i in 1..=3 {
            model.set(&o("obj"), &p("x"), Value::Int(i)).unwrap();
        }
        wait_until(|| a.outgoing_len() == 2 && model.is_handling());

        let mut explanation = String::new();
        assert!(a.is_busy_explained(&mut explanation));
        assert_eq!(explanation, "outgoing queue not empty, model is handling");

        let first = a.pull_next_outgoing().unwrap();
        assert!(first.contains("I1"));
        wait_until(|| !model.is_handling() && a.outgoing_len() == 2);

        assert!(a.pull_next_outgoing().unwrap().contains("I2"));
        assert!(a.pull_next_outgoing().unwrap().contains("I3"));
        wait_until(|| !a.is_busy());
        shutdown(&a);
    }

    #[test]
    fn test_echo_is_suppressed() {
        let (model, a) = adaptor("a", AdaptorConfig::default());
        let codec = DeltaCodec::json(model.serializer());

        let mut delta = Delta::new();
        delta.insert(o("obj"), p("x"), deltalink_core::Change::to(Value::Int(2)));
        a.submit_incoming(codec.encode(&delta).unwrap()).unwrap();

        wait_until(|| model.get(&o("obj"), &p("x")) == Some(Value::Int(2)));
        wait_until(|| !a.is_busy());
        assert_eq!(a.try_pull_next_outgoing(), None);

        model.set(&o("obj"), &p("x"), Value::Int(3)).unwrap();
        let text = a.pull_next_outgoing().unwrap();
        assert!(text.contains("I3"));

        model.set(&o("obj"), &p("x"), Value::Int(2)).unwrap();
        let text = a.pull_next_outgoing().unwrap();
        assert!(text.contains("I2"));
        shutdown(&a);
    }

    fn incoming(codec: &DeltaCodec<ObjectId, PropertyId>, entries: &[(&str, &str, i32)]) -> String {
        let delta: Delta<ObjectId, PropertyId> = entries
            .iter()
            .map(|(object, property, value)| {
                (o(object), p(property), deltalink_core::Change::to(Value::Int(*value)))
            })
            .collect();
        codec.encode(&delta).unwrap()
    }

    #[test]
    fn test_peer_value_applied_during_local_commit_is_not_echoed() {
        let model = Arc::new(MemoryModel::new("m"));
        let (entered_tx, entered_rx) = channel::bounded(1);
        let (release_tx, release_rx) = channel::bounded::<()>(0);
        let gated = AtomicBool::new(true);
        model.on_commit(Box::new(move |_| {
            if gated.swap(false, Ordering::SeqCst) {
                let _ = entered_tx.send(());
                let _ = release_rx.recv();
            }
            Ok(())
        }));
        let codec = DeltaCodec::json(model.serializer());
        let a = DeltaAdaptor::new(
            "a",
            Arc::clone(&model),
            ObjectFilter::all(),
            PropertyFilter::all(),
            DeltaCodec::json(model.serializer()),
        )
        .unwrap();

        // The local commit is held on the commit thread while the peer's
        // value lands.
        model.set(&o("obj"), &p("x"), Value::Int(1)).unwrap();
        entered_rx.recv().unwrap();
        a.submit_incoming(incoming(&codec, &[("obj", "x", 2)])).unwrap();
        wait_until(|| a.pending_echoes() == 1);
        assert_eq!(model.get(&o("obj"), &p("x")), Some(Value::Int(2)));
        release_tx.send(()).unwrap();

        assert_eq!(a.pull_next_outgoing().unwrap(), r#"{"obj":{"x":"I1"}}"#);
        wait_until(|| !a.is_busy());
        assert_eq!(a.try_pull_next_outgoing(), None);
        assert_eq!(a.pending_echoes(), 0);
        shutdown(&a);
    }

    #[test]
    fn test_repeated_peer_values_are_each_suppressed() {
        let (model, a) = adaptor("a", AdaptorConfig::default());
        let codec = DeltaCodec::json(model.serializer());

        a.submit_incoming(incoming(&codec, &[("obj", "x", 1)])).unwrap();
        a.submit_incoming(incoming(&codec, &[("obj", "x", 2)])).unwrap();
        a.submit_incoming(incoming(&codec, &[("obj", "x", 1)])).unwrap();
        wait_until(|| model.get(&o("obj"), &p("x")) == Some(Value::Int(1)));
        wait_until(|| !a.is_busy());

        assert_eq!(a.try_pull_next_outgoing(), None);
        assert_eq!(a.pending_echoes(), 0);
        shutdown(&a);
    }

    #[test]
    fn test_unreported_peer_values_are_not_remembered() {
        let model = Arc::new(MemoryModel::new("m"));
        let codec = DeltaCodec::json(model.serializer());
        let a = DeltaAdaptor::new(
            "a",
            Arc::clone(&model),
            ObjectFilter::all(),
            PropertyFilter::new(|prop: &PropertyId| prop.as_str() != "local"),
            DeltaCodec::json(model.serializer()),
        )
        .unwrap();

        a.submit_incoming(incoming(&codec, &[("obj", "x", 2), ("obj", "local", 5)]))
            .unwrap();
        a.submit_incoming(incoming(&codec, &[("obj", "x", 2)])).unwrap();
        wait_until(|| model.get(&o("obj"), &p("local")) == Some(Value::Int(5)));
        wait_until(|| !a.is_busy());
        assert_eq!(a.pending_echoes(), 0);

        model.set(&o("obj"), &p("x"), Value::Int(3)).unwrap();
        assert!(a.pull_next_outgoing().unwrap().contains("I3"));
        model.set(&o("obj"), &p("x"), Value::Int(2)).unwrap();
        assert!(a.pull_next_outgoing().unwrap().contains("I2"));
        shutdown(&a);
    }

    #[test]
    fn test_echo_without_suppression() {
        let config = AdaptorConfig::default().with_suppress_echo(false);
        let (model, a) = adaptor("a", config);
        let codec = DeltaCodec::json(model.serializer());

        let mut delta = Delta::new();
        delta.insert(o("obj"), p("x"), deltalink_core::Change::to(Value::Int(2)));
        a.submit_incoming(codec.encode(&delta).unwrap()).unwrap();

        let echoed = a.pull_next_outgoing().unwrap();
        assert!(echoed.contains("I2"));
        shutdown(&a);
    }

    #[test]
    fn test_publish_on_worker() {
        let config = AdaptorConfig::default().with_publish_on_worker(true);
        let (model, a) = adaptor("a", config);
        model.set(&o("obj"), &p("x"), Value::Str("hi".into())).unwrap();
        assert!(a.pull_next_outgoing().unwrap().contains("shi"));
        shutdown(&a);
        assert!(a.last_fatal_error().is_none());
    }

    #[test]
    fn test_malformed_incoming_is_fatal() {
        let (_model, a) = adaptor("a", AdaptorConfig::default());
        a.submit_incoming("{not json").unwrap();
        a.join();

        let err = a.last_fatal_error().unwrap();
        assert!(format!("{err:#}").contains("failed to apply incoming delta"));
        assert_eq!(a.worker_state(), DaemonState::Stopped);
        assert!(!a.is_busy());
        assert!(matches!(
            a.submit_incoming("{}"),
            Err(SyncError::WorkerStopped(_))
        ));
    }

    #[test]
    fn test_embedded_newline_rejected() {
        let model = Arc::new(MemoryModel::new("m"));
        let a = DeltaAdaptor::new(
            "a",
            Arc::clone(&model),
            ObjectFilter::all(),
            PropertyFilter::all(),
            DeltaCodec::framed(model.serializer()),
        )
        .unwrap();

        model
            .set(&o("obj"), &p("x"), Value::Str("two\nlines".into()))
            .unwrap();
        wait_until(|| a.last_fatal_error().is_some());

        let err = a.last_fatal_error().unwrap();
        assert!(err.to_string().contains("newline"));
        assert_eq!(a.try_pull_next_outgoing(), None);
        shutdown(&a);
    }

    #[test]
    fn test_shutdown_is_clean() {
        let (model, a) = adaptor("a", AdaptorConfig::default());
        model.set(&o("obj"), &p("x"), Value::Int(1)).unwrap();
        wait_until(|| a.outgoing_len() == 1);

        shutdown(&a);
        assert!(a.last_fatal_error().is_none());
        assert_eq!(a.worker_state(), DaemonState::Stopped);

        assert!(a.pull_next_outgoing().unwrap().contains("I1"));
        assert!(matches!(
            a.pull_next_outgoing(),
            Err(SyncError::OutgoingClosed)
        ));
        assert!(!a.is_busy());
    }

    #[test]
    fn test_stop_unblocks_commit_thread() {
        let config = AdaptorConfig::default().with_outgoing_capacity(1);
        let (model, a) = adaptor("a", config);
        model.set(&o("obj"), &p("x"), Value::Int(1)).unwrap();
        model.set(&o("obj"), &p("x"), Value::Int(2)).unwrap();
        wait_until(|| model.is_handling());

        shutdown(&a);
        wait_until(|| !model.is_handling() && model.pending_commits() == 0);
        assert!(a.last_fatal_error().is_none());
    }

    #[test]
    fn test_busy_explanation_lists_every_cause() {
        let config = AdaptorConfig::default().with_outgoing_capacity(1);
        let (model, a) = adaptor("a", config);
        for i in 1..=3 {
            model.set(&o("obj"), &p("x"), Value::Int(i)).unwrap();
        }
        wait_until(|| a.outgoing_len() == 1 && model.is_handling() && model.pending_commits() == 1);

        let mut explanation = String::new();
        assert!(a.is_busy_explained(&mut explanation));
        assert_eq!(
            explanation,
            "outgoing queue not empty, model is handling, model queue not empty (1)"
        );
        shutdown(&a);
    }

    #[test]
    fn test_busy_explanation_when_model_stopped() {
        let (model, a) = adaptor("a", AdaptorConfig::default());
        model.stop();
        model.join();

        let mut explanation = String::new();
        assert!(!a.is_busy_explained(&mut explanation));
        assert_eq!(explanation, "model is stopped");
        shutdown(&a);
    }

    /// Wraps a [`MemoryModel`] and records how many applies overlap.
    struct Overlap {
        inner: MemoryModel,
        active: AtomicUsize,
        max_active: AtomicUsize,
        applied: AtomicUsize,
    }

    impl Model for Overlap {
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
            self.inner.diff(pre, post, objects, properties)
        }

        fn set(
            &self,
            object: &ObjectId,
            property: &PropertyId,
            value: Value<ObjectId>,
        ) -> deltalink_model::Result<()> {
            self.inner.set(object, property, value)
        }

        fn apply(
            &self,
            delta: Delta<ObjectId, PropertyId>,
        ) -> deltalink_model::Result<Delta<ObjectId, PropertyId>> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(2));
            let result = self.inner.apply(delta);
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.applied.fetch_add(1, Ordering::SeqCst);
            result
        }

        fn on_commit(&self, handler: CommitHandler<MemorySnapshot>) {
            self.inner.on_commit(handler)
        }

        fn is_stopped(&self) -> bool {
            self.inner.is_stopped()
        }

        fn is_handling(&self) -> bool {
            self.inner.is_handling()
        }

        fn pending_commits(&self) -> usize {
            self.inner.pending_commits()
        }
    }

    #[test]
    fn test_single_flight_application() {
        let model = Arc::new(Overlap {
            inner: MemoryModel::new("m"),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            applied: AtomicUsize::new(0),
        });
        let codec = DeltaCodec::json(model.inner.serializer());
        let a = Arc::new(
            DeltaAdaptor::new(
                "a",
                Arc::clone(&model),
                ObjectFilter::all(),
                PropertyFilter::all(),
                DeltaCodec::json(model.inner.serializer()),
            )
            .unwrap(),
        );

        let producers: Vec<_> = (0..4)
            .map(|t| {
                let a = Arc::clone(&a);
                let text = {
                    let mut delta = Delta::new();
                    delta.insert(
                        o(&format!("obj{t}")),
                        p("x"),
                        deltalink_core::Change::to(Value::Int(t)),
                    );
                    codec.encode(&delta).unwrap()
                };
                thread::spawn(move || {
                    for _ in 0..5 {
                        a.submit_incoming(text.clone()).unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        wait_until(|| model.applied.load(Ordering::SeqCst) == 20);
        assert_eq!(model.max_active.load(Ordering::SeqCst), 1);
        shutdown(&a);
    }
}

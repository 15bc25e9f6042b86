//! Test fixtures and helpers.
//!
//! Common setup code for integration tests. Everything here panics on
//! failure; it is meant to be called from tests.

use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use deltalink::{CodecKind, NodeConfig, SyncNode};
use deltalink_core::{DeltaCodec, Value};
use deltalink_model::{Filter, MemoryModel, ObjectId, PropertyFilter, PropertyId};
use deltalink_sync::{
    AdaptorConfig, DeltaAdaptor, MemoryLink, MemoryLinkConfig, Role, TransportConfig,
};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// How long polling helpers wait before failing the test.
pub const WAIT: Duration = Duration::from_secs(10);

const POLL: Duration = Duration::from_millis(5);

static TRACING: Once = Once::new();

/// Install a test-friendly subscriber once per process.
///
/// The filter comes from `DELTALINK_LOG` and defaults to `deltalink=info`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_env("DELTALINK_LOG")
            .unwrap_or_else(|_| EnvFilter::new("deltalink=info"));
        let _ = tracing_subscriber::registry()
            .with(fmt::layer().with_test_writer())
            .with(filter)
            .try_init();
    });
}

/// Poll `cond` until it holds, panicking after [`WAIT`].
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        thread::sleep(POLL);
    }
}

/// Commit a single property write.
pub fn set(model: &MemoryModel, object: &str, property: &str, value: Value<ObjectId>) {
    model
        .transact(|tx| tx.set(&object.into(), &property.into(), value))
        .unwrap_or_else(|e| panic!("set {object}.{property} failed: {e}"));
}

/// A memory model with an adaptor attached.
pub struct ModelFixture {
    pub model: Arc<MemoryModel>,
    pub adaptor: Arc<DeltaAdaptor<MemoryModel>>,
}

impl ModelFixture {
    /// JSON codec, no filtering, default adaptor configuration.
    pub fn new(name: &str) -> Self {
        Self::with_config(name, Filter::all(), CodecKind::Json, AdaptorConfig::default())
    }

    pub fn with_config(
        name: &str,
        properties: PropertyFilter<PropertyId>,
        codec: CodecKind,
        config: AdaptorConfig,
    ) -> Self {
        init_tracing();
        let model = Arc::new(MemoryModel::new(name));
        let codec = match codec {
            CodecKind::Json => DeltaCodec::json(model.serializer()),
            CodecKind::Framed => DeltaCodec::framed(model.serializer()),
        };
        let adaptor = DeltaAdaptor::with_config(
            name,
            Arc::clone(&model),
            Filter::all(),
            properties,
            codec,
            config,
        )
        .unwrap_or_else(|e| panic!("adaptor {name} failed to start: {e}"));
        Self {
            model,
            adaptor: Arc::new(adaptor),
        }
    }

    pub fn get(&self, object: &str, property: &str) -> Option<Value<ObjectId>> {
        self.model
            .get(&ObjectId::from(object), &PropertyId::from(property))
    }

    /// Busy explanation, empty when idle.
    pub fn explain(&self) -> String {
        let mut explanation = String::new();
        self.adaptor.is_busy_explained(&mut explanation);
        explanation
    }

    /// Stop the adaptor and the model and wait for their threads.
    pub fn shutdown(&self) {
        self.adaptor.stop();
        self.adaptor.interrupt();
        self.adaptor.join();
        self.model.stop();
        self.model.join();
    }
}

/// Wait until none of `fixtures` reports busy on several consecutive polls.
///
/// A delta in transit between two endpoints is briefly invisible to both,
/// so a single idle observation is not enough.
pub fn wait_for_idle(fixtures: &[&ModelFixture]) {
    let deadline = Instant::now() + WAIT;
    let mut quiet = 0;
    while quiet < 4 {
        if fixtures.iter().any(|f| f.adaptor.is_busy()) {
            quiet = 0;
        } else {
            quiet += 1;
        }
        if Instant::now() >= deadline {
            let busy: Vec<String> = fixtures
                .iter()
                .map(|f| format!("{}: {:?}", f.adaptor.name(), f.explain()))
                .collect();
            panic!("timed out waiting for idle: {}", busy.join("; "));
        }
        thread::sleep(POLL);
    }
}

/// Two fixtures connected by a [`MemoryLink`].
pub struct LinkedPair {
    pub a: ModelFixture,
    pub b: ModelFixture,
    link: Option<MemoryLink>,
}

impl LinkedPair {
    /// `a` publishes to `b`.
    pub fn one_way() -> Self {
        Self::connect(ModelFixture::new("a"), ModelFixture::new("b"), false)
    }

    /// Both directions.
    pub fn duplex() -> Self {
        Self::connect(ModelFixture::new("a"), ModelFixture::new("b"), true)
    }

    pub fn connect(a: ModelFixture, b: ModelFixture, duplex: bool) -> Self {
        let config = MemoryLinkConfig::default();
        let link = if duplex {
            MemoryLink::pair(a.adaptor.clone(), b.adaptor.clone(), config)
        } else {
            MemoryLink::one_way(a.adaptor.clone(), b.adaptor.clone(), config)
        }
        .unwrap_or_else(|e| panic!("failed to link fixtures: {e}"));
        Self {
            a,
            b,
            link: Some(link),
        }
    }

    pub fn wait_for_idle(&self) {
        wait_for_idle(&[&self.a, &self.b]);
    }

    /// Wait until `b` holds the same state as `a`.
    pub fn wait_for_convergence(&self) {
        wait_until("models to converge", || {
            self.a.model.snapshot() == self.b.model.snapshot()
        });
    }

    pub fn shutdown(mut self) {
        self.a.adaptor.stop();
        self.b.adaptor.stop();
        if let Some(link) = self.link.take() {
            link.shutdown();
        }
        self.a.shutdown();
        self.b.shutdown();
    }
}

/// Two [`SyncNode`]s over loopback TCP: `a` listens, `b` connects.
pub struct NodePair {
    pub a_model: Arc<MemoryModel>,
    pub b_model: Arc<MemoryModel>,
    pub a: SyncNode<MemoryModel>,
    pub b: SyncNode<MemoryModel>,
}

impl NodePair {
    pub fn start(codec: CodecKind, duplex: bool) -> Self {
        init_tracing();
        let a_model = Arc::new(MemoryModel::new("a"));
        let b_model = Arc::new(MemoryModel::new("b"));

        let server = NodeConfig::new("a", Role::Server)
            .with_codec(codec)
            .with_transport(
                TransportConfig::new(Role::Server)
                    .with_bind_host("127.0.0.1")
                    .with_port(0)
                    .with_startup_delay(Duration::ZERO)
                    .with_duplex(duplex),
            );
        let a = SyncNode::start(
            Arc::clone(&a_model),
            a_model.serializer(),
            Filter::all(),
            Filter::all(),
            server,
        )
        .unwrap_or_else(|e| panic!("server node failed to start: {e}"));
        let port = a
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or_else(|| panic!("server node has no local address"));

        let client = NodeConfig::new("b", Role::Client)
            .with_codec(codec)
            .with_transport(
                TransportConfig::new(Role::Client)
                    .with_host("127.0.0.1")
                    .with_port(port)
                    .with_startup_delay(Duration::ZERO)
                    .with_connect_attempts(20)
                    .with_retry_interval(Duration::from_millis(50))
                    .with_duplex(duplex),
            );
        let b = SyncNode::start(
            Arc::clone(&b_model),
            b_model.serializer(),
            Filter::all(),
            Filter::all(),
            client,
        )
        .unwrap_or_else(|e| panic!("client node failed to start: {e}"));

        Self {
            a_model,
            b_model,
            a,
            b,
        }
    }

    pub fn shutdown(self) {
        if let Err(e) = self.b.shutdown() {
            panic!("client node shutdown failed: {e}");
        }
        if let Err(e) = self.a.shutdown() {
            panic!("server node shutdown failed: {e}");
        }
        for model in [&self.a_model, &self.b_model] {
            model.stop();
            model.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_publishes() {
        let fixture = ModelFixture::new("solo");
        set(&fixture.model, "O", "P", 1i64.into());

        let line = fixture
            .adaptor
            .pull_next_outgoing_timeout(WAIT)
            .unwrap()
            .unwrap();
        let decoded: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(decoded["O"]["P"], "J1");
        assert_eq!(fixture.explain(), "");

        fixture.shutdown();
    }

    #[test]
    fn test_linked_pair_filters() {
        let a = ModelFixture::with_config(
            "a",
            Filter::new(|p: &PropertyId| p.as_str() != "local"),
            CodecKind::Framed,
            AdaptorConfig::default(),
        );
        let b = ModelFixture::with_config(
            "b",
            Filter::all(),
            CodecKind::Framed,
            AdaptorConfig::default(),
        );
        let pair = LinkedPair::connect(a, b, false);

        set(&pair.a.model, "O", "local", "x".into());
        set(&pair.a.model, "O", "shared", "y".into());

        wait_until("shared value", || pair.b.get("O", "shared").is_some());
        pair.wait_for_idle();
        assert_eq!(pair.b.get("O", "local"), None);

        pair.shutdown();
    }
}

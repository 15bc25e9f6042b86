//! # deltalink
//!
//! Two-party replication of changes between transactional object models.
//!
//! ## Overview
//!
//! Each side owns a [`Model`](deltalink_model::Model). Every committed
//! transaction is diffed into a [`Delta`](deltalink_core::Delta), filtered,
//! serialized to a single line of text and shipped over a TCP connection.
//! The other side parses the line and applies it to its own model as one
//! transaction.
//!
//! - **core**: values, deltas, identity serialization and the converter chain
//! - **model**: the model contract and an in-memory implementation
//! - **sync**: the worker daemon, the delta adaptor and the line transport
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use deltalink::{MemoryModel, MemorySerializer, NodeConfig, Role, SyncNode};
//! use deltalink::model::Filter;
//!
//! fn example() -> deltalink::Result<()> {
//!     let model = Arc::new(MemoryModel::new("a"));
//!     let serializer = model.serializer();
//!     let node = SyncNode::start(
//!         Arc::clone(&model),
//!         serializer,
//!         Filter::all(),
//!         Filter::all(),
//!         NodeConfig::new("a", Role::Server),
//!     )?;
//!
//!     model.transact(|tx| tx.set(&"O".into(), &"P".into(), 1i64.into()))?;
//!     node.shutdown()
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `deltalink::core` - values, deltas, codecs
//! - `deltalink::model` - the model contract and `MemoryModel`
//! - `deltalink::sync` - daemon, adaptor, transports

pub mod error;
pub mod node;

pub use deltalink_core as core;
pub use deltalink_model as model;
pub use deltalink_sync as sync;

pub use error::{LinkError, Result};
pub use node::{CodecKind, NodeConfig, SyncNode};

pub use deltalink_core::{Delta, DeltaCodec, IdentitySerializer, Value};
pub use deltalink_model::{MemoryModel, MemorySerializer, Model, ObjectId, PropertyId};
pub use deltalink_sync::{
    AdaptorConfig, DeltaAdaptor, DeltaEndpoint, Role, TcpTransport, TransportConfig,
    TransportHandle,
};

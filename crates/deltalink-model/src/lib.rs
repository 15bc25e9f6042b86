//! # deltalink model
//!
//! The model interface the replication layer works against, and an
//! in-memory reference model.
//!
//! ## Key Types
//!
//! - [`Model`] - Snapshot diff, property set and commit notification
//! - [`Commit`] - A (pre, post) snapshot pair delivered per commit
//! - [`Filter`] - Stored predicate selecting replicated objects or properties
//! - [`MemoryModel`] - Transactional in-memory model with its own commit thread
//!
//! ## Usage
//!
//! ```rust
//! use deltalink_core::Value;
//! use deltalink_model::{MemoryModel, Model, ObjectId, PropertyId};
//!
//! let model = MemoryModel::new("example");
//! let object = ObjectId::new("o");
//! let property = PropertyId::new("p");
//! model.set(&object, &property, Value::Int(1)).unwrap();
//! assert_eq!(model.get(&object, &property), Some(Value::Int(1)));
//! ```

pub mod error;
pub mod memory;
pub mod traits;

pub use error::{ModelError, Result};
pub use memory::{MemoryModel, MemorySerializer, MemorySnapshot, ObjectId, PropertyId, Transaction};
pub use traits::{Commit, CommitHandler, Filter, Model, ObjectFilter, PropertyFilter};

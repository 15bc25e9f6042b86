//! # deltalink testkit
//!
//! Testing utilities for deltalink.
//!
//! ## Overview
//!
//! - **Fixtures**: a model with its adaptor, linked pairs over
//!   [`MemoryLink`](deltalink_sync::MemoryLink) or loopback TCP, and
//!   polling helpers
//! - **Generators**: proptest strategies for ids, values and deltas
//!
//! ## Test Fixtures
//!
//! ```rust
//! use deltalink_testkit::fixtures::{set, LinkedPair};
//!
//! let pair = LinkedPair::one_way();
//! set(&pair.a.model, "O", "P", 1i64.into());
//! pair.wait_for_convergence();
//! pair.shutdown();
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use deltalink_testkit::generators::delta;
//!
//! proptest! {
//!     #[test]
//!     fn json_round_trip(d in delta()) {
//!         // ...
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{init_tracing, set, wait_until, LinkedPair, ModelFixture, NodePair};
pub use generators::{delta, object_id, property_id, value, Script};

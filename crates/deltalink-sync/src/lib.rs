//! # deltalink sync
//!
//! Moves model deltas between two processes.
//!
//! ## Overview
//!
//! A [`DeltaAdaptor`] turns model commits into serialized deltas on a
//! bounded outgoing queue and applies deltas from the peer on its own
//! worker thread, one at a time and in arrival order. A [`TcpTransport`]
//! carries the serialized deltas as lines over a socket.
//!
//! ## Key Properties
//!
//! - **Ordered**: deltas leave in commit order and are applied in arrival order
//! - **Bounded**: a full outgoing queue blocks the model's commit thread
//! - **Polled**: worker failures never propagate; check
//!   [`DeltaAdaptor::is_busy`] and [`DeltaAdaptor::last_fatal_error`]
//!
//! ## Data Flow
//!
//! ```text
//! Node A (server)                                Node B (client)
//!   commit -> diff -> encode -> outgoing ----line----> submit_incoming
//!                                                        -> worker -> decode -> apply
//! ```

pub mod adaptor;
pub mod daemon;
pub mod endpoint;
pub mod error;
pub mod transport;

pub use adaptor::{AdaptorConfig, DeltaAdaptor, Task, DEFAULT_QUEUE_CAPACITY};
pub use daemon::{Daemon, DaemonState, Interrupt, Outcome, Submitter};
pub use endpoint::DeltaEndpoint;
pub use error::{Result, SyncError};
pub use transport::{
    memory::MemoryLink, memory::MemoryLinkConfig, LinkStats, Role, TcpTransport, TransportConfig,
    TransportHandle, DEFAULT_BIND_HOST, DEFAULT_PORT,
};

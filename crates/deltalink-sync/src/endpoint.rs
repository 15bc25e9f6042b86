//! The seam between a transport and whatever produces and consumes
//! serialized deltas.

use std::sync::Arc;

use crossbeam::channel::Receiver;

use crate::error::Result;

/// Source of outgoing and sink of incoming serialized deltas.
///
/// Implementations must be thread-safe: a transport pulls from one
/// thread while submitting from another.
pub trait DeltaEndpoint: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Next outgoing delta, blocking until one is available.
    ///
    /// Fails with [`SyncError::OutgoingClosed`](crate::SyncError::OutgoingClosed)
    /// once the endpoint is stopped and drained.
    fn pull_next_outgoing(&self) -> Result<String>;

    /// Like [`DeltaEndpoint::pull_next_outgoing`], returning `None` as soon
    /// as `cancel` yields or disconnects.
    fn pull_next_outgoing_or_cancel(&self, cancel: &Receiver<()>) -> Result<Option<String>>;

    /// Hand over one delta received from the peer.
    fn submit_incoming(&self, text: String) -> Result<()>;
}

impl<T: DeltaEndpoint + ?Sized> DeltaEndpoint for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn pull_next_outgoing(&self) -> Result<String> {
        (**self).pull_next_outgoing()
    }

    fn pull_next_outgoing_or_cancel(&self, cancel: &Receiver<()>) -> Result<Option<String>> {
        (**self).pull_next_outgoing_or_cancel(cancel)
    }

    fn submit_incoming(&self, text: String) -> Result<()> {
        (**self).submit_incoming(text)
    }
}

//! Shared plumbing between [`super::input::RedundantInputSession`] and
//! [`super::output::RedundantOutputSession`]: the "column operation"
//! interface [`RedundantTransport`](super::RedundantTransport) uses to keep
//! every row's inferior list in lock-step with its own list of inferior
//! transports.

use crate::error::Result;
use crate::transport::{SessionSpecifier, Transport};
use std::sync::Arc;

/// The half of a redundant session's interface that the owning
/// [`RedundantTransport`](super::RedundantTransport) drives directly. Never
/// exposed to library users; it exists so the transport can add/remove a
/// column without caring whether the row is an input or an output session.
#[async_trait::async_trait]
pub(crate) trait RedundantSessionControl: Send + Sync {
    fn specifier(&self) -> SessionSpecifier;
    fn inferior_count(&self) -> usize;

    /// Obtains an inferior session of the appropriate kind from `transport`
    /// and registers it as a new column. On failure, nothing is left
    /// registered.
    async fn add_inferior(&self, transport: &Arc<dyn Transport>) -> Result<()>;

    /// Closes and removes the inferior sitting at column `index`, if any.
    /// Never fails from the caller's point of view; internal errors are
    /// logged.
    async fn close_inferior(&self, index: usize);

    /// Closes every inferior and releases the row's claim on its specifier.
    async fn close(&self);
}

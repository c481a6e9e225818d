//! Loader adapter between the cache and the inference runtime

use crate::descriptor::ModelDescriptor;
use crate::Result;

/// Constructs and destroys the heavyweight sessions managed by the cache.
///
/// Implementations wrap whatever the host runtime provides (an ONNX Runtime
/// session builder, typically). Both operations are synchronous and may be
/// slow; `load` can take seconds and allocate gigabytes. They must be safe to
/// call concurrently for distinct sessions.
///
/// `load` must not call back into the cache that invoked it: it runs with
/// cache locks held, and re-entry deadlocks. Restructure any such callback to
/// run before registration or after the reservation is returned.
pub trait SessionLoader: Send + Sync + 'static {
    /// The session type this loader produces
    type Session: Send + 'static;

    /// Build a new session from the descriptor
    fn load(&self, descriptor: &ModelDescriptor) -> Result<Self::Session>;

    /// Release all resources held by a session. The default lets the
    /// session's own `Drop` reclaim them.
    fn unload(&self, session: Self::Session) {
        drop(session);
    }
}

//! Realtime session coordinator for group voice rooms.
//!
//! Opens and maintains one pub/sub channel per joined group, reconciles
//! presence across reconnects, serializes outgoing presence writes through a
//! debounced single-slot queue, and ref-counts the scarce media resources
//! (audio context, capture stream) so they are never leaked or
//! double-acquired.

pub mod config;
pub mod error;
pub mod presence;
pub mod resource;
pub mod session;
pub mod supervisor;
pub mod visibility;

pub use config::SessionConfig;
pub use error::SessionError;
pub use presence::PresenceCoordinator;
pub use resource::{ResourceError, ResourceLifecycleManager};
pub use session::{GroupSession, JoinOptions, SessionEvent, SessionSnapshot};
pub use supervisor::{ConnectionState, ConnectionSupervisor, ReconnectGate, SupervisorEvent};
pub use visibility::VisibilityGate;

#[cfg(test)]
pub(crate) mod testing;

//! The relay engine.
//!
//! # Submodule Architecture
//!
//! - **[`connection`]**: strong/weak handles to a connection's outbound
//!   queue.
//! - **[`translator`]**: the wrapping internal ID counter and the table of
//!   requests awaiting an upstream reply.
//! - **[`registry`]**: the single upstream, the handshake secret and the
//!   relay's lifecycle mode, all behind one lock.
//! - **[`session`]**: the per-connection protocol state machine.
//! - **[`supervisor`]**: re-delivers the payload after the upstream drops.
//! - **[`context`]**: bundles the above for the sessions.
//!
//! # Data Flow
//!
//! ```text
//! client frame
//!   → RelaySession::handle_message
//!     → AuthGate::authorize
//!     → ConnectionRegistry::admit (allocates internal ID, records pending)
//!     → upstream queue
//! upstream frame
//!   → RelaySession::handle_message
//!     → ConnectionRegistry::take_pending
//!     → originating client queue
//! upstream close
//!   → ConnectionRegistry::upstream_lost → RelayContext::start_reconnect
//!     → ReconnectSupervisor::run
//! ```

pub mod connection;
pub mod context;
pub mod registry;
pub mod session;
pub mod supervisor;
pub mod translator;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::ConnectionHandle;
pub use context::RelayContext;
pub use registry::ConnectionRegistry;
pub use session::RelaySession;
pub use supervisor::{ReconnectOutcome, ReconnectPolicy, ReconnectSupervisor};

//! conductor-core: Shared protocol library for Conductor.
//!
//! Provides the relay's wire messages (handshake, client commands, upstream
//! replies, structured rejections), the error taxonomy, handshake secret
//! generation and the injectable payload template.

pub mod error;
pub mod messages;
pub mod payload;
pub mod secret;

// Re-export commonly used items at crate root.
pub use error::{ConductorError, ConductorResult, Rejection};
pub use messages::{
    CommandMessage, Failure, Inbound, UpstreamCommand, UpstreamReply, HANDSHAKE_PREFIX,
    TERMINATE_FRAME,
};
pub use payload::PayloadTemplate;
pub use secret::generate_secret;

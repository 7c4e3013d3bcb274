//! conductor-client: Rust client library for the Conductor relay.
//!
//! Connects to the relay as a downstream client and multiplexes calls over
//! one WebSocket, correlating each reply through its `messageId`.
//!
//! # Quick Start
//!
//! ```no_run
//! use conductor_client::{ClientConfig, ConductorClient};
//! use serde_json::json;
//!
//! # async fn example() -> conductor_core::ConductorResult<()> {
//! let client = ConductorClient::connect("ws://127.0.0.1:7355", ClientConfig {
//!     secret: Some("my-token".into()),
//!     ..Default::default()
//! }).await?;
//!
//! let reply = client
//!     .call("RemoveShortcut", Some(json!({"appId": 1234})))
//!     .await?;
//! println!("{reply}");
//!
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod client;

pub use client::{ClientConfig, ConductorClient, DEFAULT_MAX_IN_FLIGHT};

// Re-export conductor-core error types for convenience.
pub use conductor_core::{ConductorError, ConductorResult};

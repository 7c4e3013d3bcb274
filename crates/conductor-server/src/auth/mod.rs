//! Client authentication.

pub mod gate;

pub use gate::AuthGate;

// respio-common - Shared types for the respio client engine
//
// This crate defines the error taxonomy, configuration values, and RESP wire
// markers shared by the engine and client crates.

pub mod config;
pub mod error;
pub mod wire;

// Re-export for convenience
pub use config::*;
pub use error::*;
pub use wire::*;

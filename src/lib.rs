//! yeti-client - an async client for the Yeti threat-intelligence platform
//!
//! This library provides the typed REST client, its configuration and error
//! types, and the CI harness used to test and release the client against a
//! live deployment.

pub mod api;
pub mod ci;
pub mod config;
pub mod error;

// Re-export commonly used types
pub use api::YetiApi;
pub use config::{ClientConfig, RetryConfig};
pub use error::{YetiError, YetiResult};

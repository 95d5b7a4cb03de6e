//! Client for the Yeti threat-intelligence platform's v2 REST API

pub mod client;
pub mod models;

pub use client::YetiApi;
pub use models::*;

//! Vigil Core Library
//!
//! Shared functionality for the Vigil engine and tooling:
//! - Error types
//! - Hierarchical configuration resolution
//! - Tracing/logging initialization
//! - Target-list normalization (host/url parser kinds)
//! - Alert message model and producer-side queue deposit

pub mod alerts;
pub mod config;
pub mod error;
pub mod targets;
pub mod tracing_init;

pub use error::{Error, Result};

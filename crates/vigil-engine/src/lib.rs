//! Vigil Engine Library
//!
//! Core functionality for the Vigil job orchestration engine:
//! - Filesystem-backed job store and per-job advisory locks
//! - Input staging into timestamped run directories
//! - Backend dispatch (local container or cluster pod)
//! - Worker pool for target-parallel scans
//! - Process supervision with external cancellation
//! - Credential rotation for rate-limited tools
//! - Alert queue consumer

pub mod alerts;
pub mod dispatch;
pub mod engine;
pub mod jobs;
pub mod module;
pub mod parser;
pub mod pool;
pub mod rotation;
pub mod staging;
pub mod supervisor;

//! CLI-specific functionality for the portal runner
//!
//! Argument parsing and configuration discovery.

pub mod args;
pub mod config;

pub use args::{Args, ExecutionMode, RunConfig};
pub use config::ConfigDiscovery;

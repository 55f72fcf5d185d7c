//! Bootstrap helpers for starting the relay
//!
//! Configuration loading lives here so the binary stays a thin wiring layer.

pub mod config;

pub use config::load_config;

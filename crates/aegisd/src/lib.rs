//! Aegis control-plane daemon library.
//!
//! The binary wires the engines together ([`state::AppState::bootstrap`]),
//! registers the periodic jobs, and serves the control HTTP surface with
//! the safe-mode, security, and latency middleware installed.

#![forbid(unsafe_code)]

pub mod config;
pub mod http;
pub mod jobs;
pub mod state;

pub use config::AegisConfig;
pub use state::AppState;

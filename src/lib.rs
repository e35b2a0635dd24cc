//! Palaver is a terminal client for an MCP-enabled chat backend that keeps
//! working sensibly when the network or the backend does not.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns the reliability machinery: the request manager
//!   (deduplication, timeouts, priority admission), the health monitor, the
//!   recovery service (retries, circuit breakers, cached fallbacks, offline
//!   mode, feature degradation) and the error reporter, plus the chat facade
//!   and the service root that wires them together.
//! - [`api`] defines the backend's JSON payloads.
//! - [`utils`] holds URL, jitter and logging helpers.
//!
//! Runtime entrypoints live in the binary crate (`src/main.rs`) and route
//! through [`crate::cli::main`].

pub mod api;
pub mod cli;
pub mod core;
pub mod utils;

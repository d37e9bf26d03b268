//! Browser debug proxy
//!
//! An inspector-protocol proxy that sits between a debugging front end and a
//! browser, and presents managed code running inside the browser's sandboxed
//! runtime as ordinary debuggable scripts.

pub mod bridge;
pub mod cdp;
pub mod cli;
pub mod commands;
pub mod common;
pub mod location;
pub mod relay;
pub mod server;
pub mod store;

// Re-export commonly used types for tests
pub use common::{Error, Result};

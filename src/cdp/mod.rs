//! Inspector protocol (CDP) messages
//!
//! This module implements the subset of the browser inspector protocol the
//! proxy needs to classify, correlate and rewrite messages.

pub mod codec;
pub mod types;

pub use types::*;

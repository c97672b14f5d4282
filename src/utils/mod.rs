//! Shared utilities: errors, logging, escaping and counters.

pub mod counter;
pub mod error;
pub mod escape;
pub mod logging;

//! Generic process spawning utilities.
//!
//! Async-first child process execution with combined output capture,
//! timeouts and cancellation.

mod spawn;

pub use spawn::{spawn_process, ProcessOptions, ProcessOutput, ProcessResult};

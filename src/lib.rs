//! Supervisor for AI coding agent subprocesses.
//!
//! Each supervised child process speaks the Agent Client Protocol (ACP), a
//! bidirectional JSON-RPC 2.0 dialect carried over the child's stdio. The
//! supervisor multiplexes many logical sessions onto a smaller pool of
//! clients (one client = one child process rooted at a working directory),
//! normalizes and persists every event the agent emits, fans events out to
//! live subscribers, and brokers human-in-the-loop approval requests.
//!
//! Entry point for embedders is [`supervisor::SessionManager`]; the binary
//! in `main.rs` is a thin bootstrap around it.

#![forbid(unsafe_code)]

pub mod acp;
pub mod broker;
pub mod config;
pub mod errors;
pub mod hub;
pub mod models;
pub mod normalizer;
pub mod persistence;
pub mod supervisor;

pub use errors::{AppError, Result};

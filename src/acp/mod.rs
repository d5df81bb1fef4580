//! Agent Client Protocol plumbing.
//!
//! ACP is JSON-RPC 2.0 carried as newline-delimited JSON over a child
//! process's stdio. [`codec`] frames the byte streams, [`wire`] holds the
//! typed payloads for the methods this supervisor speaks, and [`transport`]
//! runs the bidirectional pump: outbound calls correlated by id, inbound
//! frames classified into responses, requests, and notifications.

pub mod codec;
pub mod transport;
pub mod wire;

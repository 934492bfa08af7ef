//! Rust SDK for subscribing to per-user provider event streams.
//!
//! The crate is organized by concern:
//! - `stream`: reconnecting session, transport seam, and the SSE transport.
//! - `retry`: reconnect backoff policy.

/// Reconnect backoff policy used by stream sessions.
pub mod retry;
/// Realtime stream client, protocol types, and session state machine.
pub mod stream;

//! Realtime stream modules.
//!
//! - `client`: HTTP server-sent events transport and client builder.
//! - `proto`: status, channel, and path types shared with the provider.
//! - `session`: reconnecting subscription state machine.
//! - `transport`: seam between the session and any push-connection provider.

/// SSE transport and client builder.
pub mod client;
/// Stream protocol types.
pub mod proto;
/// Reconnecting session and its output feeds.
pub mod session;
/// Transport traits and the generation-tagged event sink.
pub mod transport;

//! Streaming modules.
//!
//! - `frame`: newline-delimited JSON frame parser over a live body.
//! - `proto`: typed events decoded from frames.
//! - `listener`: listener capabilities, registry and lifecycle observers.
//! - `dispatcher`: worker pool that runs listener callbacks off the read loop.
//! - `session`: connection supervisor with classified reconnect backoff.
//! - `client`: public stream handle, factory and filter query builder.

/// Public stream handle and factory.
pub mod client;
/// Shared event dispatcher and its session-counted pool.
pub mod dispatcher;
/// Frame parser for the live response body.
pub mod frame;
/// Listener traits and registry.
pub mod listener;
/// Stream payload types.
pub mod proto;
/// Connection supervisor.
pub mod session;

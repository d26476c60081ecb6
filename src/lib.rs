//! Rust client for a long-lived streaming status API.
//!
//! The crate is organized by concern:
//! - `stream`: public stream handle, supervisor, parser and listener fan-out.
//! - `transport`: HTTP transport that opens streaming requests.
//! - `auth`: authorization providers attached to each connection attempt.
//! - `config`: stream options and their defaults.
//! - `backoff`: reconnect wait policies for network and protocol failures.
//! - `error`: error taxonomy delivered to callers and listeners.

/// Authorization providers.
pub mod auth;
/// Reconnect backoff policies and state.
pub mod backoff;
/// Stream configuration and defaults.
pub mod config;
/// Errors surfaced by stream handles.
pub mod error;
/// Streaming handle, supervisor and listener modules.
pub mod stream;
/// Transport trait and the default HTTP implementation.
pub mod transport;

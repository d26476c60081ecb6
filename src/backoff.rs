//! Reconnect backoff policies.
//!
//! Streaming endpoints ask clients to back off differently depending on how
//! a connection failed: failures below the application layer (DNS, TCP,
//! dropped sockets) back off from a short initial wait, while rejections by
//! the server (HTTP error statuses, malformed frames) back off from a much
//! longer one. Both grow geometrically up to a cap.

use std::fmt;
use std::time::Duration;

/// Policy controlling exponential backoff for one failure class.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BackoffPolicy {
    /// Wait applied after the first failure of an outage.
    pub initial_backoff: Duration,
    /// Upper bound for backoff growth.
    pub max_backoff: Duration,
}

impl BackoffPolicy {
    /// Policy for network-level failures: 250 ms doubling up to 16 s.
    pub const fn network() -> Self {
        Self {
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_millis(16_000),
        }
    }

    /// Policy for protocol-level failures: 10 s doubling up to 240 s.
    pub const fn protocol() -> Self {
        Self {
            initial_backoff: Duration::from_millis(10_000),
            max_backoff: Duration::from_millis(240_000),
        }
    }

    pub(crate) fn validate(&self, name: &str) -> Result<(), String> {
        if self.initial_backoff.is_zero() {
            return Err(format!("{name}.initial_backoff must be > 0"));
        }
        if self.max_backoff < self.initial_backoff {
            return Err(format!(
                "{name}.max_backoff must be >= {name}.initial_backoff"
            ));
        }
        Ok(())
    }
}

/// Failure class that selects which [`BackoffPolicy`] applies.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum BackoffKind {
    /// The connection never reached the application layer.
    Network,
    /// The server answered but rejected the request or sent a bad frame.
    Protocol,
}

impl fmt::Display for BackoffKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => f.write_str("network"),
            Self::Protocol => f.write_str("protocol"),
        }
    }
}

/// Per-session backoff bookkeeping.
///
/// The current wait never decreases within an outage and drops back to zero
/// as soon as [`BackoffState::reset`] is called on a successful connect.
/// Switching failure class starts the new class from its own initial wait.
#[derive(Clone, Debug)]
pub struct BackoffState {
    network: BackoffPolicy,
    protocol: BackoffPolicy,
    kind: Option<BackoffKind>,
    current: Duration,
}

impl BackoffState {
    pub fn new(network: BackoffPolicy, protocol: BackoffPolicy) -> Self {
        Self {
            network,
            protocol,
            kind: None,
            current: Duration::ZERO,
        }
    }

    /// Records one more failure of `kind` and returns the wait to apply.
    pub fn next_delay(&mut self, kind: BackoffKind) -> Duration {
        let policy = self.policy(kind);
        self.current = if self.kind == Some(kind) && !self.current.is_zero() {
            std::cmp::min(self.current.saturating_mul(2), policy.max_backoff)
        } else {
            policy.initial_backoff
        };
        self.kind = Some(kind);
        self.current
    }

    /// Clears the outage after a connection was established.
    pub fn reset(&mut self) {
        self.kind = None;
        self.current = Duration::ZERO;
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn kind(&self) -> Option<BackoffKind> {
        self.kind
    }

    fn policy(&self, kind: BackoffKind) -> BackoffPolicy {
        match kind {
            BackoffKind::Network => self.network,
            BackoffKind::Protocol => self.protocol,
        }
    }
}

impl Default for BackoffState {
    fn default() -> Self {
        Self::new(BackoffPolicy::network(), BackoffPolicy::protocol())
    }
}

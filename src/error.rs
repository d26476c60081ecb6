use reqwest::StatusCode;
use thiserror::Error;

use crate::backoff::BackoffKind;
use crate::stream::frame::FrameError;
use crate::transport::TransportError;

/// Errors surfaced by stream handles and delivered to exception callbacks.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The handle is not usable as configured (e.g. no listener registered).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Credentials are missing or unusable.
    #[error("authorization error: {0}")]
    Authorization(String),

    /// Transport-level failure before or while streaming.
    #[error("network error: {0}")]
    Network(String),

    /// Non-2xx response or malformed frame.
    #[error("protocol error: {message}")]
    Protocol {
        status: Option<StatusCode>,
        message: String,
    },

    /// 403 or 406: the account lacks the role required by the endpoint.
    #[error("stream rejected with status {status}: {message}")]
    PermanentRejection { status: StatusCode, message: String },
}

impl StreamError {
    /// Backoff class for retryable failures; `None` for fatal ones.
    pub fn backoff_kind(&self) -> Option<BackoffKind> {
        match self {
            Self::Network(_) => Some(BackoffKind::Network),
            Self::Protocol { .. } => Some(BackoffKind::Protocol),
            Self::Configuration(_) | Self::Authorization(_) | Self::PermanentRejection { .. } => {
                None
            }
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.backoff_kind().is_none()
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Protocol { status, .. } => *status,
            Self::PermanentRejection { status, .. } => Some(*status),
            _ => None,
        }
    }
}

fn is_permanent_rejection(status: StatusCode) -> bool {
    status == StatusCode::FORBIDDEN || status == StatusCode::NOT_ACCEPTABLE
}

impl From<TransportError> for StreamError {
    fn from(error: TransportError) -> Self {
        match error.status() {
            Some(status) if is_permanent_rejection(status) => Self::PermanentRejection {
                status,
                message: error.to_string(),
            },
            Some(status) if status.as_u16() > 200 => Self::Protocol {
                status: Some(status),
                message: error.to_string(),
            },
            _ => Self::Network(error.to_string()),
        }
    }
}

impl From<FrameError> for StreamError {
    fn from(error: FrameError) -> Self {
        match error {
            FrameError::Transport(inner) => inner.into(),
            FrameError::ReadTimeout(_) => Self::Network(error.to_string()),
            FrameError::InvalidUtf8 { .. }
            | FrameError::Malformed { .. }
            | FrameError::NotAnObject { .. }
            | FrameError::Decode { .. } => Self::Protocol {
                status: None,
                message: error.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reqwest::StatusCode;

    use super::StreamError;
    use crate::backoff::BackoffKind;
    use crate::stream::frame::FrameError;
    use crate::transport::TransportError;

    fn http(status: StatusCode) -> StreamError {
        TransportError::HttpStatus {
            status,
            body: "nope".to_string(),
        }
        .into()
    }

    #[test]
    fn forbidden_and_not_acceptable_are_permanent() {
        for status in [StatusCode::FORBIDDEN, StatusCode::NOT_ACCEPTABLE] {
            let error = http(status);
            assert!(matches!(error, StreamError::PermanentRejection { .. }));
            assert!(error.is_fatal());
            assert_eq!(error.status(), Some(status));
        }
    }

    #[test]
    fn other_http_statuses_use_protocol_backoff() {
        for status in [
            StatusCode::UNAUTHORIZED,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            assert_eq!(http(status).backoff_kind(), Some(BackoffKind::Protocol));
        }
    }

    #[test]
    fn network_failures_use_network_backoff() {
        let error: StreamError = TransportError::Network("connection refused".to_string()).into();
        assert_eq!(error.backoff_kind(), Some(BackoffKind::Network));

        let timeout: StreamError = FrameError::ReadTimeout(Duration::from_secs(40)).into();
        assert_eq!(timeout.backoff_kind(), Some(BackoffKind::Network));
    }

    #[test]
    fn malformed_frames_use_protocol_backoff() {
        let source = serde_json::from_str::<serde_json::Value>("{oops").expect_err("invalid json");
        let error: StreamError = FrameError::Malformed {
            snippet: "{oops".to_string(),
            source,
        }
        .into();
        assert_eq!(error.backoff_kind(), Some(BackoffKind::Protocol));
        assert!(error.to_string().contains("{oops"));
    }

    #[test]
    fn configuration_and_authorization_are_fatal() {
        assert!(StreamError::Configuration("no listener".to_string()).is_fatal());
        assert!(StreamError::Authorization("missing".to_string()).is_fatal());
    }
}

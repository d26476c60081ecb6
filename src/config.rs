use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::error::StreamError;

/// Production base URL for the streaming endpoints.
pub const STREAM_BASE_URL: &str = "https://stream.twitter.com/1.1/";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamDefaults;

impl StreamDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
    pub const STREAMING_READ_TIMEOUT: Duration = Duration::from_secs(40);
    pub const ASYNC_NUM_THREADS: usize = 1;
    pub const STALL_WARNINGS: bool = true;
}

/// Options shared by every stream handle created from one factory.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    pub stream_base_url: String,
    pub connect_timeout: Duration,
    /// Idle timeout for a single read while streaming.
    pub streaming_read_timeout: Duration,
    /// Worker count of the shared event dispatcher.
    pub async_num_threads: usize,
    pub stall_warnings: bool,
    /// Label added to the supervisor tracing span.
    pub stream_thread_name: String,
    pub network_backoff: BackoffPolicy,
    pub protocol_backoff: BackoffPolicy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            stream_base_url: STREAM_BASE_URL.to_string(),
            connect_timeout: StreamDefaults::CONNECT_TIMEOUT,
            streaming_read_timeout: StreamDefaults::STREAMING_READ_TIMEOUT,
            async_num_threads: StreamDefaults::ASYNC_NUM_THREADS,
            stall_warnings: StreamDefaults::STALL_WARNINGS,
            stream_thread_name: String::new(),
            network_backoff: BackoffPolicy::network(),
            protocol_backoff: BackoffPolicy::protocol(),
        }
    }
}

impl StreamConfig {
    /// Sets the base URL that endpoint paths are resolved against.
    ///
    /// A trailing slash is added when missing.
    pub fn with_stream_base_url(mut self, url: impl Into<String>) -> Self {
        let mut url = url.into().trim_end().to_string();
        if !url.ends_with('/') {
            url.push('/');
        }
        self.stream_base_url = url;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_streaming_read_timeout(mut self, timeout: Duration) -> Self {
        self.streaming_read_timeout = timeout;
        self
    }

    pub fn with_async_num_threads(mut self, threads: usize) -> Self {
        self.async_num_threads = threads;
        self
    }

    pub fn with_stall_warnings(mut self, enabled: bool) -> Self {
        self.stall_warnings = enabled;
        self
    }

    pub fn with_stream_thread_name(mut self, name: impl Into<String>) -> Self {
        self.stream_thread_name = name.into();
        self
    }

    pub fn with_network_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.network_backoff = policy;
        self
    }

    pub fn with_protocol_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.protocol_backoff = policy;
        self
    }

    /// Resolves an endpoint path such as `statuses/sample.json`.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.stream_base_url, path.trim_start_matches('/'))
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        if self.async_num_threads == 0 {
            return Err(StreamError::Configuration(
                "async_num_threads must be >= 1".to_string(),
            ));
        }
        if self.streaming_read_timeout.is_zero() {
            return Err(StreamError::Configuration(
                "streaming_read_timeout must be > 0".to_string(),
            ));
        }
        self.network_backoff
            .validate("network_backoff")
            .map_err(StreamError::Configuration)?;
        self.protocol_backoff
            .validate("protocol_backoff")
            .map_err(StreamError::Configuration)?;
        Ok(())
    }
}

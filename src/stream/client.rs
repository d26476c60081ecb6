//! Public stream handle and the factory that creates it.
//!
//! A [`StreamFactory`] holds the configuration, the transport, the
//! credentials and the dispatcher pool shared by every [`TwitterStream`] it
//! creates. Each handle owns its listeners and at most one running session;
//! calling a streaming verb replaces the previous session.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::auth::Authorization;
use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::stream::dispatcher::DispatcherPool;
use crate::stream::listener::{
    ConnectionLifeCycleListener, LifecycleObservers, Listener, ListenerRegistry,
};
use crate::stream::proto::Status;
use crate::stream::session::{ConnectFn, SessionControl, SessionState, StreamMode, StreamSession};
use crate::transport::{HttpMethod, HttpTransport, StreamRequest, Transport};

const SAMPLE_PATH: &str = "statuses/sample.json";
const FILTER_PATH: &str = "statuses/filter.json";
const FIREHOSE_PATH: &str = "statuses/firehose.json";
const LINKS_PATH: &str = "statuses/links.json";
const RETWEET_PATH: &str = "statuses/retweet.json";

/// Minimum value of `filter_level` a status must have to be delivered.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FilterLevel {
    None,
    Low,
    Medium,
}

impl FilterLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Low => "low",
            Self::Medium => "medium",
        }
    }
}

/// Predicates for the filter endpoint.
///
/// At least one of `follow`, `track` or a location box must be set.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FilterQuery {
    follow: Vec<u64>,
    track: Vec<String>,
    locations: Vec<[f64; 4]>,
    language: Vec<String>,
    count: Option<i32>,
    filter_level: Option<FilterLevel>,
}

impl FilterQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// User ids whose statuses should be delivered.
    pub fn follow(mut self, ids: impl IntoIterator<Item = u64>) -> Self {
        self.follow.extend(ids);
        self
    }

    /// Keywords to track.
    pub fn track<I, S>(mut self, terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.track.extend(terms.into_iter().map(Into::into));
        self
    }

    /// Adds a bounding box given as south-west and north-east
    /// `(longitude, latitude)` corners.
    pub fn location(mut self, south_west: (f64, f64), north_east: (f64, f64)) -> Self {
        self.locations
            .push([south_west.0, south_west.1, north_east.0, north_east.1]);
        self
    }

    pub fn language<I, S>(mut self, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.language.extend(languages.into_iter().map(Into::into));
        self
    }

    /// Number of backfilled messages to deliver before live ones.
    pub fn count(mut self, count: i32) -> Self {
        self.count = Some(count);
        self
    }

    pub fn filter_level(mut self, level: FilterLevel) -> Self {
        self.filter_level = Some(level);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.follow.is_empty() && self.track.is_empty() && self.locations.is_empty()
    }

    /// Form parameters in the order the endpoint documents them.
    pub fn params(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some(count) = self.count {
            params.push(("count".to_string(), count.to_string()));
        }
        if !self.follow.is_empty() {
            params.push(("follow".to_string(), join(&self.follow)));
        }
        if !self.track.is_empty() {
            params.push(("track".to_string(), self.track.join(",")));
        }
        if !self.locations.is_empty() {
            let coordinates: Vec<f64> = self.locations.iter().flatten().copied().collect();
            params.push(("locations".to_string(), join(&coordinates)));
        }
        if !self.language.is_empty() {
            params.push(("language".to_string(), self.language.join(",")));
        }
        if let Some(level) = self.filter_level {
            params.push(("filter_level".to_string(), level.as_str().to_string()));
        }
        params
    }
}

fn join<T: ToString>(values: &[T]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Creates stream handles that share one transport and dispatcher pool.
#[derive(Clone)]
pub struct StreamFactory {
    config: Arc<StreamConfig>,
    transport: Arc<dyn Transport>,
    auth: Arc<dyn Authorization>,
    pool: Arc<DispatcherPool>,
}

impl StreamFactory {
    /// Builds a factory backed by [`HttpTransport`].
    pub fn new<A>(config: StreamConfig, auth: A) -> Result<Self, StreamError>
    where
        A: Authorization + 'static,
    {
        config.validate()?;
        let transport = HttpTransport::new(&config)
            .map_err(|err| StreamError::Configuration(format!("http client: {err}")))?;
        Ok(Self::with_transport(config, auth, transport))
    }

    pub fn with_transport<A, T>(config: StreamConfig, auth: A, transport: T) -> Self
    where
        A: Authorization + 'static,
        T: Transport,
    {
        let pool = Arc::new(DispatcherPool::new(
            config.async_num_threads,
            config.stream_thread_name.clone(),
        ));
        Self {
            config: Arc::new(config),
            transport: Arc::new(transport),
            auth: Arc::new(auth),
            pool,
        }
    }

    /// Returns a new handle with its own listeners and no session.
    pub fn instance(&self) -> TwitterStream {
        TwitterStream {
            inner: Arc::new(StreamInner {
                config: Arc::clone(&self.config),
                transport: Arc::clone(&self.transport),
                auth: Arc::clone(&self.auth),
                pool: Arc::clone(&self.pool),
                listeners: Arc::new(ListenerRegistry::new()),
                lifecycle: Arc::new(LifecycleObservers::default()),
                active: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<DispatcherPool> {
        &self.pool
    }
}

impl fmt::Debug for StreamFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamFactory")
            .field("config", &self.config)
            .field("auth", &self.auth)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

/// Releases one pool slot exactly once, whoever gets there first.
struct SessionLease {
    pool: Arc<DispatcherPool>,
    released: AtomicBool,
}

impl SessionLease {
    fn new(pool: Arc<DispatcherPool>) -> Self {
        Self {
            pool,
            released: AtomicBool::new(false),
        }
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.pool.release();
        }
    }
}

struct ActiveSession {
    id: u64,
    mode: StreamMode,
    control: Arc<SessionControl>,
    lease: Arc<SessionLease>,
}

impl ActiveSession {
    fn stop(self) {
        info!(event = "stream_clean_up", session = self.id, mode = %self.mode);
        self.control.close();
        self.lease.release();
    }
}

struct StreamInner {
    config: Arc<StreamConfig>,
    transport: Arc<dyn Transport>,
    auth: Arc<dyn Authorization>,
    pool: Arc<DispatcherPool>,
    listeners: Arc<ListenerRegistry>,
    lifecycle: Arc<LifecycleObservers>,
    active: Mutex<Option<ActiveSession>>,
}

impl StreamInner {
    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn clean_up(&self) {
        let previous = self.lock_active().take();
        if let Some(session) = previous {
            session.stop();
        }
    }
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        self.clean_up();
    }
}

/// Handle to one logical stream.
///
/// Cloning yields another handle to the same stream. Streaming verbs must be
/// called from within a tokio runtime; the session runs as a task on it.
#[derive(Clone)]
pub struct TwitterStream {
    inner: Arc<StreamInner>,
}

impl TwitterStream {
    pub fn add_listener(&self, listener: Listener) -> &Self {
        self.inner.listeners.add(listener);
        self
    }

    /// Removes one registration of `listener`. Unknown listeners are ignored.
    pub fn remove_listener(&self, listener: &Listener) -> &Self {
        if !self.inner.listeners.remove(listener) {
            debug!(event = "listener_not_registered", "remove_listener found nothing to remove");
        }
        self
    }

    /// Whether `listener` is currently registered on this handle.
    pub fn has_listener(&self, listener: &Listener) -> bool {
        self.inner.listeners.contains(listener)
    }

    pub fn replace_listener(&self, old: &Listener, new: Listener) -> &Self {
        self.inner.listeners.replace(old, new);
        self
    }

    pub fn clear_listeners(&self) -> &Self {
        self.inner.listeners.clear();
        self
    }

    /// Registers a closure that receives statuses only.
    pub fn on_status<F>(&self, action: F) -> &Self
    where
        F: Fn(&Status) + Send + Sync + 'static,
    {
        self.add_listener(Listener::on_status(action))
    }

    /// Registers a closure that receives stream failures only.
    pub fn on_exception<F>(&self, action: F) -> &Self
    where
        F: Fn(&StreamError) + Send + Sync + 'static,
    {
        self.add_listener(Listener::on_exception(action))
    }

    pub fn add_connection_life_cycle_listener<L>(&self, listener: L) -> &Self
    where
        L: ConnectionLifeCycleListener + 'static,
    {
        self.inner.lifecycle.add(Arc::new(listener));
        self
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Random sample of all public statuses.
    pub fn sample(&self) -> Result<(), StreamError> {
        self.start(StreamMode::Sample, HttpMethod::Get, SAMPLE_PATH, Vec::new())
    }

    /// Sample restricted to statuses in `language`.
    pub fn sample_language(&self, language: &str) -> Result<(), StreamError> {
        let params = vec![("language".to_string(), language.to_string())];
        self.start(StreamMode::Sample, HttpMethod::Get, SAMPLE_PATH, params)
    }

    pub fn filter(&self, query: &FilterQuery) -> Result<(), StreamError> {
        if query.is_empty() {
            return Err(StreamError::Configuration(
                "filter query needs at least one of follow, track or locations".to_string(),
            ));
        }
        self.start(StreamMode::Filter, HttpMethod::Post, FILTER_PATH, query.params())
    }

    /// Filters by keywords only.
    pub fn filter_track<S: AsRef<str>>(&self, terms: &[S]) -> Result<(), StreamError> {
        let query = FilterQuery::new().track(terms.iter().map(|term| term.as_ref().to_string()));
        self.filter(&query)
    }

    /// All public statuses. Requires elevated access.
    pub fn firehose(&self, count: i32) -> Result<(), StreamError> {
        let params = vec![("count".to_string(), count.to_string())];
        self.start(StreamMode::Firehose, HttpMethod::Post, FIREHOSE_PATH, params)
    }

    /// Public statuses containing links. Requires elevated access.
    pub fn links(&self, count: i32) -> Result<(), StreamError> {
        let params = vec![("count".to_string(), count.to_string())];
        self.start(StreamMode::Links, HttpMethod::Post, LINKS_PATH, params)
    }

    /// All retweets. Requires elevated access.
    pub fn retweet(&self) -> Result<(), StreamError> {
        self.start(StreamMode::Retweet, HttpMethod::Post, RETWEET_PATH, Vec::new())
    }

    /// Stops the current session; the shared dispatcher stays up.
    ///
    /// Idempotent and safe to call from listener callbacks.
    pub fn clean_up(&self) {
        self.inner.clean_up();
    }

    /// Stops the current session and releases the shared dispatcher when no
    /// other handle of the factory still streams.
    pub fn shutdown(&self) {
        self.clean_up();
        if self.inner.pool.shutdown_if_idle() {
            info!(event = "dispatcher_released");
        }
    }

    /// `true` while a session is running and has not been closed.
    pub fn is_active(&self) -> bool {
        self.inner
            .lock_active()
            .as_ref()
            .is_some_and(|session| !session.control.is_closed())
    }

    pub fn mode(&self) -> Option<StreamMode> {
        self.inner.lock_active().as_ref().map(|session| session.mode)
    }

    pub fn state(&self) -> Option<SessionState> {
        self.inner
            .lock_active()
            .as_ref()
            .map(|session| session.control.state())
    }

    fn start(
        &self,
        mode: StreamMode,
        method: HttpMethod,
        path: &str,
        mut params: Vec<(String, String)>,
    ) -> Result<(), StreamError> {
        let inner = &self.inner;
        inner.config.validate()?;
        if inner.listeners.is_empty() {
            return Err(StreamError::Configuration(
                "no listener is registered".to_string(),
            ));
        }
        if !inner.auth.is_enabled() {
            return Err(StreamError::Authorization(
                "authentication credentials are missing".to_string(),
            ));
        }
        let runtime = Handle::try_current().map_err(|_| {
            StreamError::Configuration(
                "streaming verbs must be called within a tokio runtime".to_string(),
            )
        })?;

        params.push((
            "stall_warnings".to_string(),
            inner.config.stall_warnings.to_string(),
        ));
        let request = StreamRequest {
            method,
            url: inner.config.endpoint(path),
            params,
            credentials: None,
            read_timeout: inner.config.streaming_read_timeout,
        };
        let connect = connector(Arc::clone(&inner.transport), Arc::clone(&inner.auth), request);

        let mut active = inner.lock_active();
        if let Some(previous) = active.take() {
            debug!(event = "stream_replaced", session = previous.id);
            previous.stop();
        }

        let dispatcher = inner
            .pool
            .acquire()
            .map_err(|err| StreamError::Configuration(err.to_string()))?;
        let lease = Arc::new(SessionLease::new(Arc::clone(&inner.pool)));
        let session = StreamSession::new(
            mode,
            &inner.config,
            Arc::clone(&inner.listeners),
            Arc::clone(&inner.lifecycle),
            dispatcher,
            connect,
        );
        let id = session.id();
        let control = session.control();
        info!(event = "stream_started", session = id, mode = %mode);

        let finished = Arc::clone(&lease);
        runtime.spawn(async move {
            session.run().await;
            finished.release();
        });

        *active = Some(ActiveSession {
            id,
            mode,
            control,
            lease,
        });
        Ok(())
    }
}

impl fmt::Debug for TwitterStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwitterStream")
            .field("listeners", &self.inner.listeners.len())
            .field("mode", &self.mode())
            .field("active", &self.is_active())
            .finish()
    }
}

fn connector(
    transport: Arc<dyn Transport>,
    auth: Arc<dyn Authorization>,
    request: StreamRequest,
) -> ConnectFn {
    Arc::new(move || {
        let mut attempt = request.clone();
        attempt.credentials = auth.authorization_header();
        transport.open(attempt)
    })
}

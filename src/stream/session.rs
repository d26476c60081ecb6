//! Connection supervisor for one streaming session.
//!
//! A [`StreamSession`] owns a single logical stream: it opens the connection
//! through a connect closure, pumps frames into the shared dispatcher,
//! classifies failures and sleeps through the matching backoff before
//! reconnecting. The state machine is
//! `Idle -> Connecting -> Streaming -> (Backoff <-> Connecting) -> Closed`,
//! and `Closed` is terminal.
//!
//! Closing goes through [`SessionControl`]. Both suspension points (the read
//! and the backoff sleep) race against the close signal, so a close takes
//! effect promptly no matter what the server does.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::backoff::BackoffState;
use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::stream::dispatcher::{Dispatcher, Task};
use crate::stream::frame::{Frame, FrameReader, RawFrame};
use crate::stream::listener::{LifecycleEvent, LifecycleObservers, ListenerCache, ListenerRegistry};
use crate::stream::proto::StreamEvent;
use crate::transport::{LiveBody, TransportError};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Opens one connection attempt. Called again for every reconnect.
pub type ConnectFn =
    Arc<dyn Fn() -> BoxFuture<'static, Result<LiveBody, TransportError>> + Send + Sync>;

/// Which streaming endpoint a session is attached to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum StreamMode {
    Sample,
    Filter,
    Firehose,
    Links,
    Retweet,
}

impl fmt::Display for StreamMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sample => "status-sample",
            Self::Filter => "status-filter",
            Self::Firehose => "status-firehose",
            Self::Links => "status-links",
            Self::Retweet => "status-retweet",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Idle,
    Connecting,
    Streaming,
    Backoff,
    Closed,
}

/// Shared state and close signal of one session.
#[derive(Debug)]
pub struct SessionControl {
    state: watch::Sender<SessionState>,
}

impl SessionControl {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self { state }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Marks the session closed. Returns `false` if it already was.
    ///
    /// Safe to call from any thread, including listener callbacks.
    pub fn close(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Closed {
                return false;
            }
            *state = SessionState::Closed;
            true
        })
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == SessionState::Closed).await;
    }

    /// Moves to `next` unless closed; returns whether it moved.
    fn transition(&self, next: SessionState) -> bool {
        let mut moved = false;
        self.state.send_if_modified(|state| {
            if *state == SessionState::Closed {
                return false;
            }
            moved = true;
            let changed = *state != next;
            *state = next;
            changed
        });
        moved
    }
}

impl Default for SessionControl {
    fn default() -> Self {
        Self::new()
    }
}

enum PumpExit {
    ClosedByCaller,
    Failed(StreamError),
}

/// One supervised streaming session.
pub struct StreamSession {
    id: u64,
    mode: StreamMode,
    name: String,
    read_timeout: Duration,
    backoff: BackoffState,
    control: Arc<SessionControl>,
    listeners: Arc<ListenerRegistry>,
    cache: ListenerCache,
    lifecycle: Arc<LifecycleObservers>,
    dispatcher: Arc<Dispatcher>,
    connect: ConnectFn,
}

impl StreamSession {
    pub fn new(
        mode: StreamMode,
        config: &StreamConfig,
        listeners: Arc<ListenerRegistry>,
        lifecycle: Arc<LifecycleObservers>,
        dispatcher: Arc<Dispatcher>,
        connect: ConnectFn,
    ) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let cache = listeners.cache();
        Self {
            id,
            mode,
            name: format!("stream consumer / {} [{id}]", config.stream_thread_name),
            read_timeout: config.streaming_read_timeout,
            backoff: BackoffState::new(config.network_backoff, config.protocol_backoff),
            control: Arc::new(SessionControl::new()),
            listeners,
            cache,
            lifecycle,
            dispatcher,
            connect,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    pub fn control(&self) -> Arc<SessionControl> {
        Arc::clone(&self.control)
    }

    /// Runs the session until it is closed or rejected.
    pub async fn run(mut self) {
        let span = info_span!(
            "stream_consumer",
            name = %self.name,
            session = self.id,
            mode = %self.mode
        );
        self.supervise().instrument(span).await
    }

    async fn supervise(&mut self) {
        let control = Arc::clone(&self.control);

        while !control.is_closed() {
            control.transition(SessionState::Connecting);
            info!(event = "stream_connecting", "establishing connection");

            let opened = tokio::select! {
                biased;
                _ = control.closed() => break,
                opened = (self.connect)() => opened,
            };

            let failure = match opened {
                Ok(live) => {
                    if !control.transition(SessionState::Streaming) {
                        break;
                    }
                    self.backoff.reset();
                    info!(event = "stream_connected", status = %live.status, "connection established");
                    self.lifecycle.emit(LifecycleEvent::Connected);

                    let mut reader = FrameReader::new(live.body, self.read_timeout);
                    let exit = self.pump(&mut reader).await;
                    reader.close();
                    self.lifecycle.emit(LifecycleEvent::Disconnected);

                    match exit {
                        PumpExit::ClosedByCaller => break,
                        PumpExit::Failed(error) => error,
                    }
                }
                Err(error) => StreamError::from(error),
            };

            if control.is_closed() {
                break;
            }

            let Some(kind) = failure.backoff_kind() else {
                warn!(event = "stream_rejected", error = %failure, "not retrying");
                self.notify_exception(&failure);
                control.close();
                break;
            };

            let delay = self.backoff.next_delay(kind);
            control.transition(SessionState::Backoff);
            info!(
                event = "stream_backoff",
                kind = %kind,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "waiting before reconnect"
            );
            self.notify_exception(&failure);

            tokio::select! {
                biased;
                _ = control.closed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        control.close();
        info!(event = "stream_cleaned_up", "session closed");
        self.lifecycle.emit(LifecycleEvent::CleanedUp);
    }

    async fn pump(&mut self, reader: &mut FrameReader) -> PumpExit {
        let control = Arc::clone(&self.control);
        debug!(event = "stream_receiving");

        loop {
            let next = tokio::select! {
                biased;
                _ = control.closed() => return PumpExit::ClosedByCaller,
                next = reader.next_frame() => next,
            };

            match next {
                Ok(Some(Frame::KeepAlive)) => trace!(event = "stream_keep_alive"),
                Ok(Some(Frame::Message(raw))) => match StreamEvent::decode(&raw) {
                    Ok(decoded) => self.dispatch(raw, decoded),
                    Err(error) => return PumpExit::Failed(error.into()),
                },
                Ok(None) => {
                    return PumpExit::Failed(StreamError::Network(
                        "stream closed by remote".to_string(),
                    ))
                }
                Err(error) => return PumpExit::Failed(error.into()),
            }
        }
    }

    fn dispatch(&mut self, raw: RawFrame, decoded: StreamEvent) {
        let snapshot = self.listeners.refresh(&mut self.cache);
        trace!(event = "stream_frame", kind = decoded.kind());

        let control = Arc::clone(&self.control);
        let text = raw.text;
        let task: Task = Box::new(move || {
            snapshot.deliver(&text, &decoded, || control.is_closed());
        });
        if let Err(error) = self.dispatcher.submit(self.id, task) {
            warn!(event = "dispatch_rejected", error = %error);
        }
    }

    fn notify_exception(&mut self, error: &StreamError) {
        let snapshot = self.listeners.refresh(&mut self.cache);
        snapshot.notify_exception(error);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use bytes::Bytes;
    use futures_util::{stream, FutureExt, StreamExt};
    use reqwest::StatusCode;

    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::stream::listener::{
        ConnectionLifeCycleListener, Listener, RawStreamListener, StatusListener,
    };
    use crate::stream::proto::Status;

    enum Attempt {
        Body { lines: Vec<&'static str>, hold_open: bool },
        Status(StatusCode),
        Network,
    }

    fn scripted(script: Vec<Attempt>) -> (ConnectFn, Arc<AtomicUsize>) {
        let attempts = Arc::new(AtomicUsize::new(0));
        let script = Arc::new(Mutex::new(VecDeque::from(script)));
        let counter = Arc::clone(&attempts);
        let connect: ConnectFn = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let next = script.lock().expect("lock").pop_front();
            async move {
                match next {
                    Some(Attempt::Body { lines, hold_open }) => {
                        let chunks: Vec<Result<Bytes, TransportError>> = lines
                            .into_iter()
                            .map(|line| Ok(Bytes::from(format!("{line}\n"))))
                            .collect();
                        let body = if hold_open {
                            stream::iter(chunks).chain(stream::pending()).boxed()
                        } else {
                            stream::iter(chunks).boxed()
                        };
                        Ok(LiveBody::new(StatusCode::OK, body))
                    }
                    Some(Attempt::Status(status)) => Err(TransportError::HttpStatus {
                        status,
                        body: String::new(),
                    }),
                    Some(Attempt::Network) | None => {
                        Err(TransportError::Network("connection refused".to_string()))
                    }
                }
            }
            .boxed()
        });
        (connect, attempts)
    }

    #[derive(Default)]
    struct Journal {
        entries: Mutex<Vec<String>>,
    }

    impl Journal {
        fn push(&self, entry: String) {
            self.entries.lock().expect("lock").push(entry);
        }

        fn entries(&self) -> Vec<String> {
            self.entries.lock().expect("lock").clone()
        }

        fn count(&self, prefix: &str) -> usize {
            self.entries()
                .iter()
                .filter(|entry| entry.starts_with(prefix))
                .count()
        }
    }

    struct Recorder(Arc<Journal>);

    impl StatusListener for Recorder {
        fn on_status(&self, status: &Status) {
            self.0.push(format!("status:{}", status.id));
        }

        fn on_exception(&self, error: &StreamError) {
            self.0.push(format!("exception:{error}"));
        }
    }

    impl RawStreamListener for Recorder {
        fn on_message(&self, raw: &str) {
            self.0.push(format!("raw:{raw}"));
        }
    }

    impl ConnectionLifeCycleListener for Recorder {
        fn on_connect(&self) {
            self.0.push("connect".to_string());
        }

        fn on_disconnect(&self) {
            self.0.push("disconnect".to_string());
        }

        fn on_clean_up(&self) {
            self.0.push("cleanup".to_string());
        }
    }

    fn fast_config() -> StreamConfig {
        StreamConfig::default()
            .with_network_backoff(BackoffPolicy {
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(40),
            })
            .with_protocol_backoff(BackoffPolicy {
                initial_backoff: Duration::from_millis(20),
                max_backoff: Duration::from_millis(80),
            })
    }

    fn session(
        config: &StreamConfig,
        connect: ConnectFn,
        journal: &Arc<Journal>,
    ) -> StreamSession {
        let listeners = Arc::new(ListenerRegistry::new());
        listeners.add(Listener::dual(Recorder(Arc::clone(journal))));
        let lifecycle = Arc::new(LifecycleObservers::default());
        lifecycle.add(Arc::new(Recorder(Arc::clone(journal))));
        let dispatcher = Arc::new(Dispatcher::new(1, "session-test").expect("dispatcher"));
        StreamSession::new(
            StreamMode::Sample,
            config,
            listeners,
            lifecycle,
            dispatcher,
            connect,
        )
    }

    async fn wait_until(what: &str, condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn frames_reach_raw_and_structured_listeners_in_order() {
        let journal = Arc::new(Journal::default());
        let (connect, _) = scripted(vec![Attempt::Body {
            lines: vec![
                r#"{"id":1,"text":"a"}"#,
                "",
                r#"{"id":2,"text":"b"}"#,
                r#"{"id":3,"text":"c"}"#,
            ],
            hold_open: true,
        }]);
        let session = session(&fast_config(), connect, &journal);
        let control = session.control();
        let task = tokio::spawn(session.run());

        wait_until("three statuses", || journal.count("status:") == 3).await;
        let delivered: Vec<String> = journal
            .entries()
            .into_iter()
            .filter(|entry| entry.starts_with("status:") || entry.starts_with("raw:"))
            .collect();
        assert_eq!(
            delivered,
            vec![
                r#"raw:{"id":1,"text":"a"}"#,
                "status:1",
                r#"raw:{"id":2,"text":"b"}"#,
                "status:2",
                r#"raw:{"id":3,"text":"c"}"#,
                "status:3",
            ]
        );

        assert!(control.close());
        task.await.expect("session task");
        let lifecycle: Vec<String> = journal
            .entries()
            .into_iter()
            .filter(|entry| ["connect", "disconnect", "cleanup"].contains(&entry.as_str()))
            .collect();
        assert_eq!(lifecycle, vec!["connect", "disconnect", "cleanup"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn forbidden_closes_without_retry() {
        let journal = Arc::new(Journal::default());
        let (connect, attempts) = scripted(vec![Attempt::Status(StatusCode::FORBIDDEN)]);
        let session = session(&fast_config(), connect, &journal);
        let control = session.control();

        tokio::time::timeout(Duration::from_secs(2), session.run())
            .await
            .expect("session ends on its own");

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(journal.count("exception:"), 1);
        assert_eq!(journal.count("cleanup"), 1);
        assert_eq!(journal.count("connect"), 0);
        assert_eq!(control.state(), SessionState::Closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn every_retryable_failure_is_reported_then_backoff_resets() {
        let journal = Arc::new(Journal::default());
        let (connect, attempts) = scripted(vec![
            Attempt::Network,
            Attempt::Network,
            Attempt::Status(StatusCode::SERVICE_UNAVAILABLE),
            Attempt::Body {
                lines: vec![r#"{"id":9,"text":"back"}"#],
                hold_open: true,
            },
        ]);
        let session = session(&fast_config(), connect, &journal);
        let control = session.control();
        let task = tokio::spawn(session.run());

        wait_until("status after recovery", || journal.count("status:9") == 1).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(journal.count("exception:"), 3);
        assert_eq!(journal.count("connect"), 1);
        assert_eq!(control.state(), SessionState::Streaming);

        control.close();
        task.await.expect("session task");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_frame_reconnects() {
        let journal = Arc::new(Journal::default());
        let (connect, attempts) = scripted(vec![
            Attempt::Body {
                lines: vec![r#"{"id":1,"text":"ok"}"#, "{not json"],
                hold_open: true,
            },
            Attempt::Body {
                lines: vec![r#"{"id":2,"text":"again"}"#],
                hold_open: true,
            },
        ]);
        let session = session(&fast_config(), connect, &journal);
        let control = session.control();
        let task = tokio::spawn(session.run());

        wait_until("second connection", || journal.count("status:2") == 1).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(journal.count("exception:protocol error"), 1);
        assert_eq!(journal.count("disconnect"), 1);

        control.close();
        task.await.expect("session task");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_interrupts_backoff_sleep() {
        let journal = Arc::new(Journal::default());
        let config = fast_config().with_protocol_backoff(BackoffPolicy::protocol());
        let (connect, _) = scripted(vec![Attempt::Status(StatusCode::INTERNAL_SERVER_ERROR)]);
        let session = session(&config, connect, &journal);
        let control = session.control();
        let task = tokio::spawn(session.run());

        wait_until("backoff", || control.state() == SessionState::Backoff).await;
        let started = Instant::now();
        control.close();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("close within bound")
            .expect("session task");
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(journal.count("cleanup"), 1);
    }

    #[test]
    fn close_is_idempotent() {
        let control = SessionControl::new();
        assert!(control.close());
        assert!(!control.close());
        assert!(!control.transition(SessionState::Connecting));
        assert_eq!(control.state(), SessionState::Closed);
    }

    #[test]
    fn modes_have_stable_names() {
        assert_eq!(StreamMode::Sample.to_string(), "status-sample");
        assert_eq!(StreamMode::Filter.to_string(), "status-filter");
    }
}

//! Listener capabilities and the registry that fans frames out to them.
//!
//! A [`Listener`] declares at registration time which capabilities it
//! provides: structured events ([`StatusListener`]), raw frame text
//! ([`RawStreamListener`]), or both. The supervisor never inspects listener
//! types; it reads a [`ListenerSnapshot`] that is rebuilt only after the
//! registry changed.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::warn;

use crate::error::StreamError;
use crate::stream::proto::{Status, StallWarning, StatusDeletionNotice, StreamEvent};

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Receives decoded events and stream failures.
pub trait StatusListener: Send + Sync {
    fn on_status(&self, _status: &Status) {}

    fn on_deletion_notice(&self, _notice: &StatusDeletionNotice) {}

    fn on_track_limitation_notice(&self, _undelivered: u64) {}

    fn on_scrub_geo(&self, _user_id: u64, _up_to_status_id: u64) {}

    fn on_stall_warning(&self, _warning: &StallWarning) {}

    /// Called for every connection failure, retryable or not.
    fn on_exception(&self, _error: &StreamError) {}
}

/// Receives the text of every frame, recognized or not.
pub trait RawStreamListener: Send + Sync {
    fn on_message(&self, raw: &str);
}

/// Observes connection transitions independently of event content.
pub trait ConnectionLifeCycleListener: Send + Sync {
    fn on_connect(&self) {}

    fn on_disconnect(&self) {}

    fn on_clean_up(&self) {}
}

/// Stable identity of a registered listener.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ListenerId(u64);

/// A listener registration carrying its declared capabilities.
///
/// Cloning keeps the identity, so a clone can later be passed to
/// `remove_listener` or `replace_listener`.
#[derive(Clone)]
pub struct Listener {
    id: ListenerId,
    status: Option<Arc<dyn StatusListener>>,
    raw: Option<Arc<dyn RawStreamListener>>,
}

impl Listener {
    pub fn status<L>(listener: L) -> Self
    where
        L: StatusListener + 'static,
    {
        Self::from_parts(Some(Arc::new(listener)), None)
    }

    pub fn raw<L>(listener: L) -> Self
    where
        L: RawStreamListener + 'static,
    {
        Self::from_parts(None, Some(Arc::new(listener)))
    }

    /// Registers one object under both capabilities.
    pub fn dual<L>(listener: L) -> Self
    where
        L: StatusListener + RawStreamListener + 'static,
    {
        let shared = Arc::new(listener);
        let status: Arc<dyn StatusListener> = shared.clone();
        let raw: Arc<dyn RawStreamListener> = shared;
        Self::from_parts(Some(status), Some(raw))
    }

    pub fn from_parts(
        status: Option<Arc<dyn StatusListener>>,
        raw: Option<Arc<dyn RawStreamListener>>,
    ) -> Self {
        Self {
            id: ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed)),
            status,
            raw,
        }
    }

    /// Listener that only handles statuses.
    pub fn on_status<F>(action: F) -> Self
    where
        F: Fn(&Status) + Send + Sync + 'static,
    {
        Self::status(StatusFn(action))
    }

    /// Listener that only handles failures.
    pub fn on_exception<F>(action: F) -> Self
    where
        F: Fn(&StreamError) + Send + Sync + 'static,
    {
        Self::status(ExceptionFn(action))
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn is_status(&self) -> bool {
        self.status.is_some()
    }

    pub fn is_raw(&self) -> bool {
        self.raw.is_some()
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("status", &self.status.is_some())
            .field("raw", &self.raw.is_some())
            .finish()
    }
}

struct StatusFn<F>(F);

impl<F> StatusListener for StatusFn<F>
where
    F: Fn(&Status) + Send + Sync,
{
    fn on_status(&self, status: &Status) {
        (self.0)(status)
    }
}

struct ExceptionFn<F>(F);

impl<F> StatusListener for ExceptionFn<F>
where
    F: Fn(&StreamError) + Send + Sync,
{
    fn on_exception(&self, error: &StreamError) {
        (self.0)(error)
    }
}

/// Listeners split by capability, in registration order.
#[derive(Clone, Default)]
pub struct ListenerSnapshot {
    pub(crate) status: Vec<Arc<dyn StatusListener>>,
    pub(crate) raw: Vec<Arc<dyn RawStreamListener>>,
}

impl ListenerSnapshot {
    fn from_listeners(listeners: &[Listener]) -> Self {
        Self {
            status: listeners.iter().filter_map(|l| l.status.clone()).collect(),
            raw: listeners.iter().filter_map(|l| l.raw.clone()).collect(),
        }
    }

    pub fn status_count(&self) -> usize {
        self.status.len()
    }

    pub fn raw_count(&self) -> usize {
        self.raw.len()
    }

    /// Raw listeners first, then structured listeners, each call isolated.
    pub(crate) fn deliver(&self, raw_text: &str, event: &StreamEvent, is_closed: impl Fn() -> bool) {
        for listener in &self.raw {
            if is_closed() {
                return;
            }
            guard_callback("on_message", || listener.on_message(raw_text));
        }
        if matches!(event, StreamEvent::Unknown) {
            return;
        }
        for listener in &self.status {
            if is_closed() {
                return;
            }
            guard_callback(event.kind(), || deliver_event(listener.as_ref(), event));
        }
    }

    pub(crate) fn notify_exception(&self, error: &StreamError) {
        for listener in &self.status {
            guard_callback("on_exception", || listener.on_exception(error));
        }
    }
}

fn deliver_event(listener: &dyn StatusListener, event: &StreamEvent) {
    match event {
        StreamEvent::Status(status) => listener.on_status(status),
        StreamEvent::Deletion(notice) => listener.on_deletion_notice(notice),
        StreamEvent::TrackLimitation { undelivered } => {
            listener.on_track_limitation_notice(*undelivered)
        }
        StreamEvent::ScrubGeo(notice) => {
            listener.on_scrub_geo(notice.user_id, notice.up_to_status_id)
        }
        StreamEvent::StallWarning(warning) => listener.on_stall_warning(warning),
        StreamEvent::Unknown => {}
    }
}

/// Cached snapshot held by a running supervisor.
pub(crate) struct ListenerCache {
    version: u64,
    snapshot: Arc<ListenerSnapshot>,
}

/// Thread-safe, ordered listener collection owned by one stream handle.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Vec<Listener>>,
    version: AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Listener) {
        self.mutate(|listeners| listeners.push(listener));
    }

    /// Removes the first registration with the same identity.
    pub fn remove(&self, listener: &Listener) -> bool {
        let mut removed = false;
        self.mutate(|listeners| removed = remove_first(listeners, listener.id));
        removed
    }

    pub fn replace(&self, old: &Listener, new: Listener) {
        self.mutate(|listeners| {
            remove_first(listeners, old.id);
            listeners.push(new);
        });
    }

    pub fn clear(&self) {
        self.mutate(Vec::clear);
    }

    pub fn contains(&self, listener: &Listener) -> bool {
        self.read(|listeners| listeners.iter().any(|entry| entry.id == listener.id))
    }

    pub fn len(&self) -> usize {
        self.read(|listeners| listeners.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bumped on every mutation.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> ListenerSnapshot {
        self.read(|listeners| ListenerSnapshot::from_listeners(listeners))
    }

    pub(crate) fn cache(&self) -> ListenerCache {
        self.read(|listeners| ListenerCache {
            version: self.version(),
            snapshot: Arc::new(ListenerSnapshot::from_listeners(listeners)),
        })
    }

    /// Returns the cached snapshot, rebuilding it if the registry changed.
    pub(crate) fn refresh(&self, cache: &mut ListenerCache) -> Arc<ListenerSnapshot> {
        if cache.version != self.version() {
            *cache = self.cache();
        }
        Arc::clone(&cache.snapshot)
    }

    fn mutate(&self, change: impl FnOnce(&mut Vec<Listener>)) {
        let mut guard = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        change(&mut guard);
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    fn read<T>(&self, f: impl FnOnce(&[Listener]) -> T) -> T {
        let guard = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }
}

fn remove_first(listeners: &mut Vec<Listener>, id: ListenerId) -> bool {
    match listeners.iter().position(|listener| listener.id == id) {
        Some(index) => {
            listeners.remove(index);
            true
        }
        None => false,
    }
}

/// Connection transitions broadcast to lifecycle observers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LifecycleEvent {
    Connected,
    Disconnected,
    CleanedUp,
}

#[derive(Default)]
pub struct LifecycleObservers {
    observers: RwLock<Vec<Arc<dyn ConnectionLifeCycleListener>>>,
}

impl LifecycleObservers {
    pub fn add(&self, observer: Arc<dyn ConnectionLifeCycleListener>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `event` to every observer in registration order.
    pub(crate) fn emit(&self, event: LifecycleEvent) {
        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            match event {
                LifecycleEvent::Connected => guard_callback("on_connect", || observer.on_connect()),
                LifecycleEvent::Disconnected => {
                    guard_callback("on_disconnect", || observer.on_disconnect())
                }
                LifecycleEvent::CleanedUp => {
                    guard_callback("on_clean_up", || observer.on_clean_up())
                }
            }
        }
    }
}

/// Runs a user callback, logging instead of propagating a panic.
pub(crate) fn guard_callback(callback: &str, f: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        warn!(
            event = "listener_panicked",
            callback,
            message = %panic_message(payload.as_ref())
        );
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::stream::proto::Status;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl StatusListener for Recorder {
        fn on_status(&self, status: &Status) {
            self.seen
                .lock()
                .expect("lock")
                .push(format!("status:{}", status.id));
        }
    }

    impl RawStreamListener for Recorder {
        fn on_message(&self, raw: &str) {
            self.seen.lock().expect("lock").push(format!("raw:{raw}"));
        }
    }

    struct Shared(Arc<Recorder>);

    impl StatusListener for Shared {
        fn on_status(&self, status: &Status) {
            self.0.on_status(status)
        }
    }

    impl RawStreamListener for Shared {
        fn on_message(&self, raw: &str) {
            self.0.on_message(raw)
        }
    }

    fn status(id: u64) -> StreamEvent {
        StreamEvent::Status(Status {
            id,
            text: "t".to_string(),
            full_text: None,
            created_at: None,
            lang: None,
            user: None,
            in_reply_to_status_id: None,
            retweeted_status: None,
        })
    }

    #[test]
    fn snapshot_partitions_by_capability() {
        let registry = ListenerRegistry::new();
        registry.add(Listener::status(Recorder::default()));
        registry.add(Listener::raw(Recorder::default()));
        registry.add(Listener::dual(Recorder::default()));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.status_count(), 2);
        assert_eq!(snapshot.raw_count(), 2);
    }

    #[test]
    fn dual_listener_receives_raw_then_structured() {
        let recorder = Arc::new(Recorder::default());
        let registry = ListenerRegistry::new();
        registry.add(Listener::dual(Shared(Arc::clone(&recorder))));

        registry
            .snapshot()
            .deliver(r#"{"id":1,"text":"t"}"#, &status(1), || false);

        let seen = recorder.seen.lock().expect("lock").clone();
        assert_eq!(seen, vec![r#"raw:{"id":1,"text":"t"}"#.to_string(), "status:1".to_string()]);
    }

    #[test]
    fn unknown_events_reach_only_raw_listeners() {
        let recorder = Arc::new(Recorder::default());
        let registry = ListenerRegistry::new();
        registry.add(Listener::dual(Shared(Arc::clone(&recorder))));

        registry
            .snapshot()
            .deliver(r#"{"friends":[]}"#, &StreamEvent::Unknown, || false);

        assert_eq!(recorder.seen.lock().expect("lock").len(), 1);
    }

    #[test]
    fn remove_and_replace_use_identity() {
        let registry = ListenerRegistry::new();
        let first = Listener::on_status(|_| {});
        let second = Listener::on_status(|_| {});
        registry.add(first.clone());
        registry.add(first.clone());
        registry.add(second.clone());

        assert!(registry.remove(&first));
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(&first));
        assert!(registry.remove(&first));
        assert!(!registry.contains(&first));
        registry.add(first.clone());

        let replacement = Listener::raw(Recorder::default());
        registry.replace(&second, replacement.clone());
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.status_count(), 1);
        assert_eq!(snapshot.raw_count(), 1);

        registry.clear();
        assert!(registry.is_empty());
        assert!(!registry.remove(&replacement));
    }

    #[test]
    fn refresh_rebuilds_only_after_mutation() {
        let registry = ListenerRegistry::new();
        registry.add(Listener::on_status(|_| {}));
        let mut cache = registry.cache();

        let before = registry.refresh(&mut cache);
        let unchanged = registry.refresh(&mut cache);
        assert!(Arc::ptr_eq(&before, &unchanged));

        registry.add(Listener::raw(Recorder::default()));
        let after = registry.refresh(&mut cache);
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.raw_count(), 1);
        assert_eq!(before.raw_count(), 0);
    }

    #[test]
    fn panicking_listener_does_not_stop_fan_out() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = ListenerRegistry::new();
        registry.add(Listener::on_status(|_| panic!("listener bug")));
        registry.add(Listener::on_status({
            let calls = Arc::clone(&calls);
            move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        }));

        registry.snapshot().deliver("{}", &status(1), || false);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn closed_session_delivers_nothing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = ListenerRegistry::new();
        registry.add(Listener::on_status({
            let calls = Arc::clone(&calls);
            move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        }));

        registry.snapshot().deliver("{}", &status(1), || true);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn lifecycle_observers_are_isolated_from_panics() {
        struct Counting(Arc<AtomicUsize>);
        impl ConnectionLifeCycleListener for Counting {
            fn on_connect(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        struct Exploding;
        impl ConnectionLifeCycleListener for Exploding {
            fn on_connect(&self) {
                panic!("observer bug");
            }
        }

        let connects = Arc::new(AtomicUsize::new(0));
        let observers = LifecycleObservers::default();
        observers.add(Arc::new(Exploding));
        observers.add(Arc::new(Counting(Arc::clone(&connects))));
        observers.emit(LifecycleEvent::Connected);
        observers.emit(LifecycleEvent::Disconnected);

        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }
}

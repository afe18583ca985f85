//! Notification listener and dispatcher.
//!
//! One reader task drains the notify endpoint; frames are normalised into
//! events on a bounded coalescing queue, then routed. Each property
//! registration owns a worker loop fed by its own small coalescing queue, so
//! a given callback sees events for a property in arrival order while a slow
//! or stuck callback can never hold up the pipeline. Every callback
//! invocation runs under the configured deadline, and every spawned task is
//! tracked so `close` can drain them with a bound.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::{AbortOnDropHandle, TaskTracker};
use tracing::{debug, warn};

use crate::codec::{self, Frame};
use crate::config::EngineConfig;
use crate::error::TransportError;
use crate::keepalive::LivenessSignal;
use crate::socket::SocketManager;
use crate::types::{ConnectionEvent, Counters, EndpointRole, PropertyEvent, RawNotification};

/// Bound on the dispatcher's central event queue.
const EVENT_QUEUE_CAPACITY: usize = 256;

/// Bound on each registration's delivery queue.
const SUB_QUEUE_CAPACITY: usize = 32;

/// How long `close` waits for tracked callback tasks to drain.
const DRAIN_DEADLINE: Duration = Duration::from_secs(2);

/// Poll granularity of the notify reader.
const READER_POLL: Duration = Duration::from_millis(250);

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A property callback: plain function or future-returning.
#[derive(Clone)]
pub(crate) enum Callback {
    Sync(Arc<dyn Fn(PropertyEvent) + Send + Sync>),
    Async(Arc<dyn Fn(PropertyEvent) -> BoxFuture + Send + Sync>),
}

pub(crate) type ConnectionCallback = Arc<dyn Fn(ConnectionEvent) + Send + Sync>;
pub(crate) type RawCallback = Arc<dyn Fn(RawNotification) + Send + Sync>;

#[derive(Debug, Clone)]
enum QueuedEvent {
    Property(PropertyEvent),
    Menu(RawNotification),
    Bar(RawNotification),
}

/// Bounded queue that coalesces same-property events when full and drops the
/// oldest entry otherwise.
struct CoalescingQueue {
    inner: StdMutex<std::collections::VecDeque<QueuedEvent>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    counters: Arc<Counters>,
}

impl CoalescingQueue {
    fn new(capacity: usize, counters: Arc<Counters>) -> Self {
        Self {
            inner: StdMutex::new(std::collections::VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
            counters,
        }
    }

    fn push(&self, event: QueuedEvent) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut queue = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if queue.len() >= self.capacity {
            if let QueuedEvent::Property(incoming) = &event {
                // Last-writer-wins onto the most recent entry for this property
                let slot = queue.iter().rposition(|queued| {
                    matches!(queued, QueuedEvent::Property(p) if p.name == incoming.name)
                });
                if let Some(pos) = slot {
                    queue[pos] = event;
                    self.record_drop();
                    drop(queue);
                    self.notify.notify_one();
                    return;
                }
            }
            queue.pop_front();
            self.record_drop();
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }

    fn record_drop(&self) {
        let total = self
            .counters
            .notifications_dropped
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        if total.is_power_of_two() {
            warn!(total, "notification queue full, coalescing or dropping events");
        }
    }

    async fn pop(&self) -> Option<QueuedEvent> {
        loop {
            {
                let mut queue = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

struct PropertySub {
    id: u64,
    /// `None` subscribes to every property.
    pattern: Option<String>,
    queue: Arc<CoalescingQueue>,
    worker: JoinHandle<()>,
}

/// What a [`Registration`] handle points back to.
enum RegKind {
    Property,
    Connection,
    Menu,
    Bar,
}

/// Opaque handle for a registered callback. Dropping the handle keeps the
/// callback alive; call [`Registration::unregister`] to remove it.
pub struct Registration {
    id: u64,
    kind: RegKind,
    shared: Weak<DispatchShared>,
}

impl Registration {
    /// Remove the callback. Idempotent.
    pub fn unregister(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        match self.kind {
            RegKind::Property => {
                let mut subs = shared
                    .property_subs
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if let Some(pos) = subs.iter().position(|s| s.id == self.id) {
                    let sub = subs.remove(pos);
                    sub.queue.close();
                }
            }
            RegKind::Connection => {
                shared
                    .connection_subs
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|(id, _)| *id != self.id);
            }
            RegKind::Menu => {
                shared
                    .menu_subs
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|(id, _)| *id != self.id);
            }
            RegKind::Bar => {
                shared
                    .bar_subs
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|(id, _)| *id != self.id);
            }
        }
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration").field("id", &self.id).finish()
    }
}

struct DispatchShared {
    config: Arc<EngineConfig>,
    counters: Arc<Counters>,
    main_queue: CoalescingQueue,
    property_subs: StdMutex<Vec<PropertySub>>,
    connection_subs: StdMutex<Vec<(u64, ConnectionCallback)>>,
    menu_subs: StdMutex<Vec<(u64, RawCallback)>>,
    bar_subs: StdMutex<Vec<(u64, RawCallback)>>,
    /// Most recent lifecycle event, replayed to late registrations.
    last_connection: StdMutex<Option<ConnectionEvent>>,
    tracker: TaskTracker,
    worker_cancel: CancellationToken,
    next_id: AtomicU64,
    last_seq: StdMutex<Option<u32>>,
    legacy_warned: AtomicBool,
}

impl DispatchShared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn track_sequence(&self, seq: u32) {
        let mut last = self.last_seq.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(prev) = *last {
            let expected = prev.wrapping_add(1);
            let gap = seq.wrapping_sub(expected);
            // Values in the upper half look like reordering, not loss
            if gap != 0 && gap < u32::MAX / 2 {
                self.counters.sequence_gaps.fetch_add(1, Ordering::Relaxed);
                warn!(prev, seq, "notification sequence gap");
            }
        }
        *last = Some(seq);
    }

    fn route(&self, event: QueuedEvent) {
        match event {
            QueuedEvent::Property(property) => {
                let subs = self
                    .property_subs
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                for sub in subs.iter() {
                    let matches = match &sub.pattern {
                        None => true,
                        Some(name) => *name == property.name,
                    };
                    if matches {
                        sub.queue.push(QueuedEvent::Property(property.clone()));
                    }
                }
            }
            QueuedEvent::Menu(raw) => {
                let subs: Vec<RawCallback> = self
                    .menu_subs
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                    .map(|(_, cb)| Arc::clone(cb))
                    .collect();
                for cb in subs {
                    let raw = raw.clone();
                    self.spawn_blocking_invoke(move || cb(raw));
                }
            }
            QueuedEvent::Bar(raw) => {
                let subs: Vec<RawCallback> = self
                    .bar_subs
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                    .map(|(_, cb)| Arc::clone(cb))
                    .collect();
                for cb in subs {
                    let raw = raw.clone();
                    self.spawn_blocking_invoke(move || cb(raw));
                }
            }
        }
    }

    fn spawn_blocking_invoke<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = self.config.callback_timeout();
        let counters = Arc::clone(&self.counters);
        self.tracker.spawn(async move {
            invoke_blocking(f, deadline, &counters).await;
        });
    }
}

/// Run a synchronous callback on the blocking pool under the deadline.
async fn invoke_blocking<F>(f: F, deadline: Duration, counters: &Counters)
where
    F: FnOnce() + Send + 'static,
{
    let handle = tokio::task::spawn_blocking(f);
    match tokio::time::timeout(deadline, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(join)) if join.is_panic() => {
            counters.callback_panics.fetch_add(1, Ordering::Relaxed);
            warn!("callback panicked");
        }
        Ok(Err(_)) => {}
        Err(_) => {
            counters.callback_timeouts.fetch_add(1, Ordering::Relaxed);
            warn!(deadline_ms = deadline.as_millis() as u64, "callback exceeded deadline");
        }
    }
}

/// Invoke one property callback under the deadline. Async callbacks are
/// aborted on expiry; blocking ones are detached and logged.
async fn invoke_property(callback: &Callback, event: PropertyEvent, deadline: Duration, counters: &Counters) {
    match callback {
        Callback::Sync(f) => {
            let f = Arc::clone(f);
            invoke_blocking(move || f(event), deadline, counters).await;
        }
        Callback::Async(f) => {
            let handle = AbortOnDropHandle::new(tokio::spawn(f(event)));
            match tokio::time::timeout(deadline, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(join)) if join.is_panic() => {
                    counters.callback_panics.fetch_add(1, Ordering::Relaxed);
                    warn!("callback panicked");
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    counters.callback_timeouts.fetch_add(1, Ordering::Relaxed);
                    warn!(deadline_ms = deadline.as_millis() as u64, "callback cancelled at deadline");
                }
            }
        }
    }
}

async fn property_worker(
    queue: Arc<CoalescingQueue>,
    callback: Callback,
    deadline: Duration,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = queue.pop() => match event {
                Some(QueuedEvent::Property(property)) => property,
                Some(_) => continue,
                None => break,
            }
        };
        invoke_property(&callback, event, deadline, &counters).await;
    }
}

pub(crate) struct NotificationDispatcher {
    shared: Arc<DispatchShared>,
    pipeline: StdMutex<Option<Vec<JoinHandle<()>>>>,
}

impl NotificationDispatcher {
    pub fn new(config: Arc<EngineConfig>, counters: Arc<Counters>) -> Self {
        Self {
            shared: Arc::new(DispatchShared {
                main_queue: CoalescingQueue::new(EVENT_QUEUE_CAPACITY, Arc::clone(&counters)),
                config,
                counters,
                property_subs: StdMutex::new(Vec::new()),
                connection_subs: StdMutex::new(Vec::new()),
                menu_subs: StdMutex::new(Vec::new()),
                bar_subs: StdMutex::new(Vec::new()),
                last_connection: StdMutex::new(None),
                tracker: TaskTracker::new(),
                worker_cancel: CancellationToken::new(),
                next_id: AtomicU64::new(1),
                last_seq: StdMutex::new(None),
                legacy_warned: AtomicBool::new(false),
            }),
            pipeline: StdMutex::new(None),
        }
    }

    /// Spawn the notify reader and routing loop. Idempotent per engine run.
    pub fn start(
        &self,
        sockets: Arc<SocketManager>,
        liveness: mpsc::Sender<LivenessSignal>,
        cancel: CancellationToken,
    ) {
        let mut slot = self.pipeline.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }
        let reader = self.shared.tracker.spawn(reader_loop(
            sockets,
            Arc::clone(&self.shared),
            liveness,
            cancel.clone(),
        ));
        let router = self
            .shared
            .tracker
            .spawn(dispatch_loop(Arc::clone(&self.shared), cancel));
        *slot = Some(vec![reader, router]);
    }

    pub fn on_property(&self, pattern: Option<String>, callback: Callback) -> Registration {
        let id = self.shared.next_id();
        let queue = Arc::new(CoalescingQueue::new(
            SUB_QUEUE_CAPACITY,
            Arc::clone(&self.shared.counters),
        ));
        let worker = self.shared.tracker.spawn(property_worker(
            Arc::clone(&queue),
            callback,
            self.shared.config.callback_timeout(),
            Arc::clone(&self.shared.counters),
            self.shared.worker_cancel.clone(),
        ));
        self.shared
            .property_subs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PropertySub {
                id,
                pattern,
                queue,
                worker,
            });
        Registration {
            id,
            kind: RegKind::Property,
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn on_connection(&self, callback: ConnectionCallback) -> Registration {
        let id = self.shared.next_id();
        self.shared
            .connection_subs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::clone(&callback)));

        // A late registration is told the current connection context right
        // away instead of waiting for the next transition.
        let replay = self
            .shared
            .last_connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(event) = replay {
            self.shared.spawn_blocking_invoke(move || callback(event));
        }

        Registration {
            id,
            kind: RegKind::Connection,
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn on_menu(&self, callback: RawCallback) -> Registration {
        let id = self.shared.next_id();
        self.shared
            .menu_subs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, callback));
        Registration {
            id,
            kind: RegKind::Menu,
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn on_bar(&self, callback: RawCallback) -> Registration {
        let id = self.shared.next_id();
        self.shared
            .bar_subs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, callback));
        Registration {
            id,
            kind: RegKind::Bar,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Fan a lifecycle event out to connection callbacks.
    pub fn emit_connection(&self, event: ConnectionEvent) {
        *self
            .shared
            .last_connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(event.clone());
        let subs: Vec<ConnectionCallback> = self
            .shared
            .connection_subs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for cb in subs {
            let event = event.clone();
            self.shared.spawn_blocking_invoke(move || cb(event));
        }
    }

    /// Cancel workers, drain tracked tasks with a deadline, abort stragglers.
    pub async fn shutdown(&self) {
        self.shared.worker_cancel.cancel();
        self.shared.main_queue.close();

        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        {
            let mut subs = self
                .shared
                .property_subs
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for sub in subs.drain(..) {
                sub.queue.close();
                handles.push(sub.worker);
            }
        }
        self.shared
            .connection_subs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.shared
            .menu_subs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.shared
            .bar_subs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        if let Some(pipeline) = self
            .pipeline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handles.extend(pipeline);
        }

        self.shared.tracker.close();
        if tokio::time::timeout(DRAIN_DEADLINE, self.shared.tracker.wait())
            .await
            .is_err()
        {
            warn!("dispatcher drain deadline hit, aborting remaining tasks");
            for handle in &handles {
                handle.abort();
            }
        }
    }
}

fn handle_frame(shared: &Arc<DispatchShared>, frame: Frame, liveness: &mpsc::Sender<LivenessSignal>) {
    match frame {
        Frame::KeepAlive => send_liveness(liveness, LivenessSignal::KeepAlive),
        Frame::Goodbye => send_liveness(liveness, LivenessSignal::Goodbye),
        Frame::Notify {
            sequence,
            properties,
            legacy,
        } => {
            if legacy {
                shared.counters.legacy_frames.fetch_add(1, Ordering::Relaxed);
                if !shared.legacy_warned.swap(true, Ordering::Relaxed) {
                    warn!("device is sending legacy v2.0 notification frames");
                }
            }
            shared.track_sequence(sequence);
            for property in properties {
                if property.name.eq_ignore_ascii_case("keepalive") {
                    send_liveness(liveness, LivenessSignal::KeepAlive);
                } else if property.name.eq_ignore_ascii_case("goodbye") {
                    send_liveness(liveness, LivenessSignal::Goodbye);
                } else {
                    shared.main_queue.push(QueuedEvent::Property(PropertyEvent {
                        name: property.name,
                        value: property.value,
                        visible: property.visible,
                        seq: sequence,
                    }));
                }
            }
        }
        Frame::MenuNotify(raw) => shared.main_queue.push(QueuedEvent::Menu(raw)),
        Frame::BarNotify(raw) => shared.main_queue.push(QueuedEvent::Bar(raw)),
        other => {
            debug!(frame = ?other, "ignoring frame on notify endpoint");
        }
    }
}

fn send_liveness(liveness: &mpsc::Sender<LivenessSignal>, signal: LivenessSignal) {
    // Keepalives are frequent; a momentarily full channel is harmless
    let _ = liveness.try_send(signal);
}

async fn reader_loop(
    sockets: Arc<SocketManager>,
    shared: Arc<DispatchShared>,
    liveness: mpsc::Sender<LivenessSignal>,
    cancel: CancellationToken,
) {
    loop {
        let datagram = tokio::select! {
            _ = cancel.cancelled() => break,
            result = sockets.recv(EndpointRole::Notify, READER_POLL) => match result {
                Ok(datagram) => datagram,
                Err(TransportError::RecvTimeout { .. }) => continue,
                Err(TransportError::NotRunning) => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
                Err(_) => continue,
            }
        };
        match codec::parse_frame(&datagram.data, shared.config.max_xml_bytes) {
            Ok(frame) => handle_frame(&shared, frame, &liveness),
            Err(e) => {
                warn!(error = %e, source = %datagram.source, "discarding bad notify datagram");
            }
        }
    }
    debug!("notify reader stopped");
}

async fn dispatch_loop(shared: Arc<DispatchShared>, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = shared.main_queue.pop() => match event {
                Some(event) => event,
                None => break,
            }
        };
        shared.route(event);
    }
    debug!("dispatch loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use std::sync::atomic::AtomicUsize;

    fn dispatcher() -> NotificationDispatcher {
        let host: IpAddr = "127.0.0.1".parse().unwrap();
        let config = Arc::new(EngineConfig::new(host).with_ack_timeout(200));
        NotificationDispatcher::new(config, Arc::new(Counters::default()))
    }

    fn property(name: &str, value: &str, seq: u32) -> PropertyEvent {
        PropertyEvent {
            name: name.to_string(),
            value: value.to_string(),
            visible: true,
            seq,
        }
    }

    #[tokio::test]
    async fn test_exact_and_wildcard_routing() {
        let dispatcher = dispatcher();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (wild_tx, mut wild_rx) = mpsc::unbounded_channel();

        let _exact = dispatcher.on_property(
            Some("volume".to_string()),
            Callback::Sync(Arc::new(move |e| {
                let _ = tx.send(e);
            })),
        );
        let _wild = dispatcher.on_property(
            None,
            Callback::Sync(Arc::new(move |e| {
                let _ = wild_tx.send(e);
            })),
        );

        dispatcher
            .shared
            .route(QueuedEvent::Property(property("volume", "-40.0", 1)));
        dispatcher
            .shared
            .route(QueuedEvent::Property(property("power", "on", 2)));

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.name, "volume");
        assert!(rx.try_recv().is_err(), "exact sub must not see other properties");

        let first = tokio::time::timeout(Duration::from_secs(1), wild_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), wild_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.name, "volume");
        assert_eq!(second.name, "power");

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_same_property_events_arrive_in_order() {
        let dispatcher = dispatcher();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _reg = dispatcher.on_property(
            Some("volume".to_string()),
            Callback::Sync(Arc::new(move |e| {
                let _ = tx.send(e.value);
            })),
        );

        for i in 0..5 {
            dispatcher
                .shared
                .route(QueuedEvent::Property(property("volume", &i.to_string(), i)));
        }

        for i in 0..5 {
            let value = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(value, i.to_string());
        }
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_unregister_stops_delivery() {
        let dispatcher = dispatcher();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reg = dispatcher.on_property(
            Some("volume".to_string()),
            Callback::Sync(Arc::new(move |e| {
                let _ = tx.send(e);
            })),
        );
        reg.unregister();

        dispatcher
            .shared
            .route(QueuedEvent::Property(property("volume", "-1.0", 1)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_slow_callback_hits_deadline_counter() {
        let host: IpAddr = "127.0.0.1".parse().unwrap();
        let config = Arc::new(EngineConfig {
            callback_timeout_ms: 50,
            ..EngineConfig::new(host)
        });
        let counters = Arc::new(Counters::default());
        let dispatcher = NotificationDispatcher::new(config, Arc::clone(&counters));

        let _reg = dispatcher.on_property(
            Some("volume".to_string()),
            Callback::Async(Arc::new(|_: PropertyEvent| -> BoxFuture {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                })
            })),
        );
        dispatcher
            .shared
            .route(QueuedEvent::Property(property("volume", "-1.0", 1)));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(counters.callback_timeouts.load(Ordering::Relaxed), 1);

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_callback_is_isolated() {
        let dispatcher = dispatcher();
        let counters = Arc::clone(&dispatcher.shared.counters);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _bad = dispatcher.on_property(
            Some("volume".to_string()),
            Callback::Sync(Arc::new(|_| panic!("boom"))),
        );
        let _good = dispatcher.on_property(
            Some("volume".to_string()),
            Callback::Sync(Arc::new(move |e| {
                let _ = tx.send(e);
            })),
        );

        dispatcher
            .shared
            .route(QueuedEvent::Property(property("volume", "-1.0", 1)));

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.value, "-1.0");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counters.callback_panics.load(Ordering::Relaxed), 1);

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_coalescing_keeps_latest_value_when_full() {
        let counters = Arc::new(Counters::default());
        let queue = CoalescingQueue::new(4, Arc::clone(&counters));

        for i in 0..10 {
            queue.push(QueuedEvent::Property(property("volume", &i.to_string(), i)));
        }

        // Capacity 4: later pushes coalesce onto the single queued volume entry
        let mut values = Vec::new();
        while let Some(QueuedEvent::Property(p)) =
            tokio::time::timeout(Duration::from_millis(50), queue.pop())
                .await
                .ok()
                .flatten()
        {
            values.push(p.value);
        }
        assert_eq!(values.len(), 4);
        assert_eq!(values.last().unwrap(), "9");
        assert_eq!(counters.notifications_dropped.load(Ordering::Relaxed), 6);
    }

    #[tokio::test]
    async fn test_non_coalescing_events_drop_oldest() {
        let counters = Arc::new(Counters::default());
        let queue = CoalescingQueue::new(2, Arc::clone(&counters));
        for i in 0..4 {
            queue.push(QueuedEvent::Menu(RawNotification {
                sequence: i,
                xml: format!("<emotivaMenuNotify sequence=\"{i}\"/>"),
            }));
        }
        let first = queue.pop().await.unwrap();
        match first {
            QueuedEvent::Menu(raw) => assert_eq!(raw.sequence, 2),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(counters.notifications_dropped.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_keepalive_frames_feed_liveness_channel() {
        let dispatcher = dispatcher();
        let (tx, mut rx) = mpsc::channel(8);

        handle_frame(&dispatcher.shared, Frame::KeepAlive, &tx);
        assert_eq!(rx.recv().await.unwrap(), LivenessSignal::KeepAlive);

        // A keepalive carried as a property inside emotivaNotify counts too
        let frame = codec::parse_frame(
            b"<emotivaNotify sequence=\"2\"><property name=\"keepAlive\" value=\"7500\"/></emotivaNotify>",
            65_536,
        )
        .unwrap();
        handle_frame(&dispatcher.shared, frame, &tx);
        assert_eq!(rx.recv().await.unwrap(), LivenessSignal::KeepAlive);

        handle_frame(&dispatcher.shared, Frame::Goodbye, &tx);
        assert_eq!(rx.recv().await.unwrap(), LivenessSignal::Goodbye);

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_sequence_gap_detection() {
        let dispatcher = dispatcher();
        let counters = Arc::clone(&dispatcher.shared.counters);

        dispatcher.shared.track_sequence(1);
        dispatcher.shared.track_sequence(2);
        assert_eq!(counters.sequence_gaps.load(Ordering::Relaxed), 0);

        dispatcher.shared.track_sequence(5);
        assert_eq!(counters.sequence_gaps.load(Ordering::Relaxed), 1);

        // Wraparound without loss is not a gap
        dispatcher.shared.track_sequence(u32::MAX);
        let gaps = counters.sequence_gaps.load(Ordering::Relaxed);
        dispatcher.shared.track_sequence(0);
        assert_eq!(counters.sequence_gaps.load(Ordering::Relaxed), gaps);

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_connection_registration_replays_last_event() {
        let dispatcher = dispatcher();
        dispatcher.emit_connection(ConnectionEvent::Closed);

        // Registered after the event: the current context is replayed
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _reg = dispatcher.on_connection(Arc::new(move |event| {
            let _ = tx.send(event);
        }));

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, ConnectionEvent::Closed);

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_connection_registration_before_any_event_stays_quiet() {
        let dispatcher = dispatcher();
        let (tx, mut rx) = mpsc::unbounded_channel::<ConnectionEvent>();
        let _reg = dispatcher.on_connection(Arc::new(move |event| {
            let _ = tx.send(event);
        }));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_tracked_tasks() {
        let dispatcher = dispatcher();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_cb = Arc::clone(&calls);
        let _reg = dispatcher.on_property(
            Some("volume".to_string()),
            Callback::Sync(Arc::new(move |_| {
                calls_cb.fetch_add(1, Ordering::SeqCst);
            })),
        );
        dispatcher
            .shared
            .route(QueuedEvent::Property(property("volume", "-1.0", 1)));

        tokio::time::sleep(Duration::from_millis(100)).await;
        dispatcher.shutdown().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(dispatcher.shared.property_subs.lock().unwrap().is_empty());
    }
}

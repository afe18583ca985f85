//! Protocol engine: reliable command/ack exchange and subscription round-trips.
//!
//! All control-channel traffic funnels through one correlator task that pairs
//! response frames with outstanding requests. Pairing is FIFO among
//! overlapping requests: a response is charged to the oldest request that
//! expects at least one of the returned names, and leftover names spill to
//! the next oldest. Responses that match nothing are buffered briefly, then
//! dropped with a warning.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::codec::{self, Frame, StatusProperty};
use crate::config::EngineConfig;
use crate::error::{ProtocolError, TransportError};
use crate::socket::SocketManager;
use crate::types::{
    is_valid_command_name, AckResult, AckStatus, Command, Counters, EndpointRole, ProtocolVersion,
    SubscribeOutcome, SubscriptionSet,
};

/// How long an unmatched response is kept before being dropped.
const ORPHAN_TTL: Duration = Duration::from_millis(200);

/// Poll granularity of the correlator; bounds orphan-purge latency.
const CORRELATOR_POLL: Duration = Duration::from_millis(250);

/// Which response root an outstanding request is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseKind {
    Ack,
    Subscription,
    Unsubscribe,
    Update,
}

type ResponseResult = Result<Vec<StatusProperty>, ProtocolError>;

struct PendingEntry {
    id: u64,
    kind: ResponseKind,
    expected: HashSet<String>,
    received: Vec<StatusProperty>,
    tx: Option<oneshot::Sender<ResponseResult>>,
}

struct OrphanFrame {
    at: Instant,
    kind: ResponseKind,
    entries: Vec<StatusProperty>,
}

#[derive(Default)]
struct PendingQueue {
    entries: VecDeque<PendingEntry>,
    orphans: Vec<OrphanFrame>,
}

/// Removes its pending entry when the awaiting request is dropped, so a
/// cancelled caller never leaves a response slot behind.
struct PendingGuard {
    id: u64,
    queue: Arc<StdMutex<PendingQueue>>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        queue.entries.retain(|entry| entry.id != self.id);
    }
}

pub(crate) struct ProtocolEngine {
    sockets: Arc<SocketManager>,
    config: Arc<EngineConfig>,
    semaphore: Arc<Semaphore>,
    pending: Arc<StdMutex<PendingQueue>>,
    /// Serialises subscribe/unsubscribe/update exchanges so the device never
    /// sees overlapping subscription traffic from this engine.
    roundtrip_lock: Mutex<()>,
    subscriptions: Arc<StdMutex<SubscriptionSet>>,
    counters: Arc<Counters>,
    online: AtomicBool,
    version: StdMutex<ProtocolVersion>,
    next_id: AtomicU64,
    correlator: StdMutex<Option<JoinHandle<()>>>,
}

impl ProtocolEngine {
    pub fn new(
        sockets: Arc<SocketManager>,
        config: Arc<EngineConfig>,
        subscriptions: Arc<StdMutex<SubscriptionSet>>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_commands)),
            sockets,
            config,
            pending: Arc::new(StdMutex::new(PendingQueue::default())),
            roundtrip_lock: Mutex::new(()),
            subscriptions,
            counters,
            online: AtomicBool::new(false),
            version: StdMutex::new(ProtocolVersion::V3_1),
            next_id: AtomicU64::new(1),
            correlator: StdMutex::new(None),
        }
    }

    /// Spawn the control-channel correlator. Idempotent per engine run.
    pub fn start(&self, cancel: CancellationToken) {
        let mut slot = self.correlator.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }
        *slot = Some(tokio::spawn(correlator_loop(
            Arc::clone(&self.sockets),
            Arc::clone(&self.pending),
            Arc::clone(&self.counters),
            self.config.max_xml_bytes,
            cancel,
        )));
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    pub fn set_version(&self, version: ProtocolVersion) {
        *self.version.lock().unwrap_or_else(PoisonError::into_inner) = version;
    }

    fn version(&self) -> ProtocolVersion {
        *self.version.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_online(&self) -> Result<(), ProtocolError> {
        if self.online.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ProtocolError::NotConnected)
        }
    }

    /// Snapshot of the acked subscription set.
    pub fn subscription_set(&self) -> SubscriptionSet {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drain the subscription set for reconnect replay.
    pub fn take_subscription_set(&self) -> SubscriptionSet {
        std::mem::take(
            &mut *self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Send a single command, awaiting the ack when one was requested.
    pub async fn send_command(&self, command: &Command) -> Result<AckResult, ProtocolError> {
        if !is_valid_command_name(&command.name) {
            return Err(ProtocolError::InvalidCommandName(command.name.clone()));
        }
        let frame = codec::control_frame(std::slice::from_ref(command));

        if !command.ack_required {
            let _permit = self.acquire_permit().await?;
            self.ensure_online()?;
            self.sockets
                .send(EndpointRole::Control, frame.as_bytes(), None)
                .await?;
            return Ok(AckResult {
                name: command.name.clone(),
                status: AckStatus::Ack,
            });
        }

        let expected: HashSet<String> = [command.name.clone()].into();
        let entries = self.roundtrip(ResponseKind::Ack, frame, expected).await?;
        let entry = entries.into_iter().next().ok_or_else(|| {
            ProtocolError::UnexpectedResponse(format!("empty ack frame for `{}`", command.name))
        })?;
        Ok(AckResult {
            name: command.name.clone(),
            status: entry.status.unwrap_or(AckStatus::Nak),
        })
    }

    /// Send a batch in one control frame and pair the grouped ack by name.
    pub async fn send_commands(&self, commands: &[Command]) -> Result<Vec<AckResult>, ProtocolError> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        for command in commands {
            if !is_valid_command_name(&command.name) {
                return Err(ProtocolError::InvalidCommandName(command.name.clone()));
            }
        }
        let frame = codec::control_frame(commands);
        let expected: HashSet<String> = commands
            .iter()
            .filter(|c| c.ack_required)
            .map(|c| c.name.clone())
            .collect();

        if expected.is_empty() {
            let _permit = self.acquire_permit().await?;
            self.ensure_online()?;
            self.sockets
                .send(EndpointRole::Control, frame.as_bytes(), None)
                .await?;
            return Ok(commands
                .iter()
                .map(|c| AckResult {
                    name: c.name.clone(),
                    status: AckStatus::Ack,
                })
                .collect());
        }

        let entries = self.roundtrip(ResponseKind::Ack, frame, expected).await?;
        let statuses: HashMap<&str, AckStatus> = entries
            .iter()
            .map(|e| (e.name.as_str(), e.status.unwrap_or(AckStatus::Nak)))
            .collect();
        Ok(commands
            .iter()
            .map(|c| AckResult {
                name: c.name.clone(),
                status: if c.ack_required {
                    statuses.get(c.name.as_str()).copied().unwrap_or(AckStatus::Nak)
                } else {
                    AckStatus::Ack
                },
            })
            .collect())
    }

    /// Subscribe to the given property names. Names already in the acked set
    /// are not re-sent; the set is extended only for names the device acks.
    pub async fn subscribe<I, S>(
        &self,
        names: I,
    ) -> Result<HashMap<String, SubscribeOutcome>, ProtocolError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let requested = self.collect_names(names)?;
        let _serial = self.roundtrip_lock.lock().await;

        let mut outcomes = HashMap::new();
        let fresh: Vec<String> = {
            let set = self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            requested
                .into_iter()
                .filter(|name| {
                    if set.contains(name) {
                        outcomes.insert(name.clone(), noop_ack());
                        false
                    } else {
                        true
                    }
                })
                .collect()
        };
        if fresh.is_empty() {
            return Ok(outcomes);
        }

        let frame = codec::subscription_frame(&fresh, self.version());
        let expected: HashSet<String> = fresh.iter().cloned().collect();
        let entries = self
            .roundtrip(ResponseKind::Subscription, frame, expected)
            .await?;

        {
            let mut set = self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for entry in &entries {
                if entry.status == Some(AckStatus::Ack) {
                    set.insert(entry.name.clone());
                }
            }
        }
        for entry in entries {
            let StatusProperty {
                name,
                value,
                visible,
                status,
            } = entry;
            outcomes.insert(
                name,
                SubscribeOutcome {
                    status: status.unwrap_or(AckStatus::Nak),
                    initial_value: value,
                    visible,
                },
            );
        }
        Ok(outcomes)
    }

    /// Unsubscribe from the given names; acked names leave the set.
    pub async fn unsubscribe<I, S>(
        &self,
        names: I,
    ) -> Result<HashMap<String, SubscribeOutcome>, ProtocolError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let requested = self.collect_names(names)?;
        let _serial = self.roundtrip_lock.lock().await;

        let mut outcomes = HashMap::new();
        let subscribed: Vec<String> = {
            let set = self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            requested
                .into_iter()
                .filter(|name| {
                    if set.contains(name) {
                        true
                    } else {
                        outcomes.insert(name.clone(), noop_ack());
                        false
                    }
                })
                .collect()
        };
        if subscribed.is_empty() {
            return Ok(outcomes);
        }

        let frame = codec::unsubscribe_frame(&subscribed, self.version());
        let expected: HashSet<String> = subscribed.iter().cloned().collect();
        let entries = self
            .roundtrip(ResponseKind::Unsubscribe, frame, expected)
            .await?;

        {
            let mut set = self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for entry in &entries {
                if entry.status == Some(AckStatus::Ack) {
                    set.remove(&entry.name);
                }
            }
        }
        for entry in entries {
            let StatusProperty {
                name,
                value,
                visible,
                status,
            } = entry;
            outcomes.insert(
                name,
                SubscribeOutcome {
                    status: status.unwrap_or(AckStatus::Nak),
                    initial_value: value,
                    visible,
                },
            );
        }
        Ok(outcomes)
    }

    /// Request current values for the given names. Naks are omitted.
    pub async fn request_update<I, S>(
        &self,
        names: I,
    ) -> Result<HashMap<String, String>, ProtocolError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let requested = self.collect_names(names)?;
        if requested.is_empty() {
            return Ok(HashMap::new());
        }
        let _serial = self.roundtrip_lock.lock().await;

        let frame = codec::update_frame(&requested, self.version());
        let expected: HashSet<String> = requested.iter().cloned().collect();
        let entries = self.roundtrip(ResponseKind::Update, frame, expected).await?;

        Ok(entries
            .into_iter()
            .filter(|entry| entry.status != Some(AckStatus::Nak))
            .filter_map(|entry| entry.value.map(|value| (entry.name, value)))
            .collect())
    }

    /// Fail every outstanding request with `NotConnected`. Used when the
    /// engine degrades so callers fail fast instead of timing out.
    pub fn fail_pending(&self) {
        let mut queue = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        for entry in queue.entries.iter_mut() {
            if let Some(tx) = entry.tx.take() {
                let _ = tx.send(Err(ProtocolError::NotConnected));
            }
        }
        queue.entries.clear();
        queue.orphans.clear();
    }

    /// Terminal shutdown: stop the correlator, fail callers, refuse new work.
    pub fn shutdown(&self) {
        if let Some(handle) = self
            .correlator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        self.set_online(false);
        self.fail_pending();
        self.semaphore.close();
    }

    fn collect_names<I, S>(&self, names: I) -> Result<Vec<String>, ProtocolError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for name in names {
            let name = name.into();
            if !is_valid_command_name(&name) {
                return Err(ProtocolError::InvalidCommandName(name));
            }
            if seen.insert(name.clone()) {
                out.push(name);
            }
        }
        Ok(out)
    }

    async fn acquire_permit(&self) -> Result<tokio::sync::OwnedSemaphorePermit, ProtocolError> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| ProtocolError::NotConnected)
    }

    async fn roundtrip(
        &self,
        kind: ResponseKind,
        frame: String,
        expected: HashSet<String>,
    ) -> Result<Vec<StatusProperty>, ProtocolError> {
        let _permit = self.acquire_permit().await?;
        self.ensure_online()?;

        let first_name = expected.iter().next().cloned().unwrap_or_default();
        let (guard, mut rx) = register(&self.pending, &self.next_id, kind, expected);
        let _guard = guard;

        let backoff = Backoff::new(self.config.retry_base(), self.config.retry_max());
        let attempts = self.config.max_retries + 1;
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(backoff.delay(attempt - 1)).await;
                debug!(name = %first_name, attempt = attempt + 1, "retransmitting control frame");
            }
            self.sockets
                .send(EndpointRole::Control, frame.as_bytes(), None)
                .await?;

            match tokio::time::timeout(self.config.ack_timeout(), &mut rx).await {
                Ok(Ok(result)) => return result,
                // The engine dropped the sender: shutdown raced this request.
                Ok(Err(_)) => return Err(ProtocolError::NotConnected),
                Err(_) => continue,
            }
        }

        Err(ProtocolError::AckTimeout { name: first_name })
    }
}

/// Outcome for names that need no wire exchange: already subscribed on
/// subscribe, already absent on unsubscribe.
fn noop_ack() -> SubscribeOutcome {
    SubscribeOutcome {
        status: AckStatus::Ack,
        initial_value: None,
        visible: None,
    }
}

/// Register an outstanding request, consuming any fresh orphaned responses
/// that already carry some of its names.
fn register(
    queue: &Arc<StdMutex<PendingQueue>>,
    next_id: &AtomicU64,
    kind: ResponseKind,
    expected: HashSet<String>,
) -> (PendingGuard, oneshot::Receiver<ResponseResult>) {
    let id = next_id.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = oneshot::channel();
    let mut entry = PendingEntry {
        id,
        kind,
        expected,
        received: Vec::new(),
        tx: Some(tx),
    };

    let mut q = queue.lock().unwrap_or_else(PoisonError::into_inner);
    for orphan in q.orphans.iter_mut() {
        if orphan.kind != kind || orphan.at.elapsed() >= ORPHAN_TTL {
            continue;
        }
        orphan.entries.retain(|status_entry| {
            if entry.expected.remove(&status_entry.name) {
                entry.received.push(status_entry.clone());
                false
            } else {
                true
            }
        });
    }
    q.orphans.retain(|o| !o.entries.is_empty());

    if entry.expected.is_empty() {
        if let Some(tx) = entry.tx.take() {
            let _ = tx.send(Ok(std::mem::take(&mut entry.received)));
        }
    } else {
        q.entries.push_back(entry);
    }

    (
        PendingGuard {
            id,
            queue: Arc::clone(queue),
        },
        rx,
    )
}

/// Charge a response frame to outstanding requests, FIFO.
fn match_response(
    queue: &Arc<StdMutex<PendingQueue>>,
    kind: ResponseKind,
    mut entries: Vec<StatusProperty>,
) {
    let mut q = queue.lock().unwrap_or_else(PoisonError::into_inner);
    for pending in q.entries.iter_mut() {
        if pending.kind != kind || pending.tx.is_none() {
            continue;
        }
        let mut rest = Vec::with_capacity(entries.len());
        for entry in entries.drain(..) {
            if pending.expected.remove(&entry.name) {
                pending.received.push(entry);
            } else {
                rest.push(entry);
            }
        }
        entries = rest;
        if pending.expected.is_empty() {
            if let Some(tx) = pending.tx.take() {
                let _ = tx.send(Ok(std::mem::take(&mut pending.received)));
            }
        }
        if entries.is_empty() {
            break;
        }
    }
    // Completed entries are removed by their guards; drop satisfied slots now
    // so FIFO scans stay short.
    q.entries.retain(|e| e.tx.is_some());

    if !entries.is_empty() {
        q.orphans.push(OrphanFrame {
            at: Instant::now(),
            kind,
            entries,
        });
    }
}

fn purge_orphans(queue: &Arc<StdMutex<PendingQueue>>, counters: &Counters) {
    let mut q = queue.lock().unwrap_or_else(PoisonError::into_inner);
    let before = q.orphans.len();
    q.orphans.retain(|o| o.at.elapsed() < ORPHAN_TTL);
    let dropped = before - q.orphans.len();
    if dropped > 0 {
        counters
            .orphan_responses
            .fetch_add(dropped as u64, Ordering::Relaxed);
        warn!(dropped, "dropped control responses matching no outstanding request");
    }
}

async fn correlator_loop(
    sockets: Arc<SocketManager>,
    pending: Arc<StdMutex<PendingQueue>>,
    counters: Arc<Counters>,
    max_xml_bytes: usize,
    cancel: CancellationToken,
) {
    loop {
        purge_orphans(&pending, &counters);
        let datagram = tokio::select! {
            _ = cancel.cancelled() => break,
            result = sockets.recv(EndpointRole::Control, CORRELATOR_POLL) => match result {
                Ok(datagram) => datagram,
                Err(TransportError::RecvTimeout { .. }) => continue,
                Err(TransportError::NotRunning) => {
                    // Sockets are mid-rebind during reconnect; try again.
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
                Err(_) => continue,
            }
        };

        match codec::parse_frame(&datagram.data, max_xml_bytes) {
            Ok(Frame::Ack(entries)) => match_response(&pending, ResponseKind::Ack, entries),
            Ok(Frame::Subscription(entries)) => {
                match_response(&pending, ResponseKind::Subscription, entries)
            }
            Ok(Frame::Unsubscribe(entries)) => {
                match_response(&pending, ResponseKind::Unsubscribe, entries)
            }
            Ok(Frame::Update(entries)) => match_response(&pending, ResponseKind::Update, entries),
            Ok(other) => {
                debug!(source = %datagram.source, frame = ?other, "ignoring frame on control endpoint");
            }
            Err(ProtocolError::UnknownRoot(root)) => {
                counters.unknown_roots.fetch_add(1, Ordering::Relaxed);
                debug!(%root, "skipping unknown root on control endpoint");
            }
            Err(e) => {
                warn!(error = %e, "discarding bad control datagram");
            }
        }
    }
    debug!("control correlator stopped");
}

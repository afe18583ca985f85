//! Socket manager: lifecycle and multiplexing of the four UDP endpoints.
//!
//! Each bound endpoint gets exactly one reader task that drains the socket
//! into a bounded queue; `recv` consumes from that queue. `start` and `stop`
//! are serialised and idempotent, so concurrent lifecycle calls can never
//! double-bind a role.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::TransportError;
use crate::types::{Counters, DeviceDescriptor, EndpointRole};

/// Per-role inbound queue capacity. Overflow drops the oldest datagram.
const RECV_QUEUE_CAPACITY: usize = 64;

/// Largest datagram the readers will accept.
const MAX_DATAGRAM: usize = 65_536;

/// One datagram as received from the wire.
#[derive(Debug, Clone)]
pub(crate) struct Datagram {
    pub data: Vec<u8>,
    pub source: SocketAddr,
}

/// Bounded drop-oldest queue feeding `recv` from a reader task.
struct RecvQueue {
    inner: StdMutex<VecDeque<Datagram>>,
    notify: Notify,
    closed: AtomicBool,
    counters: Arc<Counters>,
    role: EndpointRole,
}

impl RecvQueue {
    fn new(role: EndpointRole, counters: Arc<Counters>) -> Self {
        Self {
            inner: StdMutex::new(VecDeque::with_capacity(RECV_QUEUE_CAPACITY)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            counters,
            role,
        }
    }

    fn push(&self, datagram: Datagram) {
        let mut queue = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if queue.len() >= RECV_QUEUE_CAPACITY {
            queue.pop_front();
            let total = self
                .counters
                .recv_queue_overflows
                .fetch_add(1, Ordering::Relaxed)
                + 1;
            warn!(role = %self.role, total, "receive queue full, dropped oldest datagram");
        }
        queue.push_back(datagram);
        drop(queue);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Option<Datagram> {
        loop {
            {
                let mut queue = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(datagram) = queue.pop_front() {
                    return Some(datagram);
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

/// One bound endpoint: the socket, its default destination, and the owned
/// reader task.
struct Endpoint {
    socket: Arc<UdpSocket>,
    dest: Option<SocketAddr>,
    queue: Arc<RecvQueue>,
    reader: JoinHandle<()>,
    cancel: CancellationToken,
}

impl Endpoint {
    async fn bind(
        role: EndpointRole,
        local_port: u16,
        broadcast: bool,
        dest: Option<SocketAddr>,
        counters: Arc<Counters>,
    ) -> Result<Endpoint, TransportError> {
        let socket = UdpSocket::bind(("0.0.0.0", local_port))
            .await
            .map_err(|source| TransportError::PortBindFailed {
                role,
                port: local_port,
                source,
            })?;
        if broadcast {
            socket
                .set_broadcast(true)
                .map_err(|source| TransportError::PortBindFailed {
                    role,
                    port: local_port,
                    source,
                })?;
        }

        let socket = Arc::new(socket);
        let queue = Arc::new(RecvQueue::new(role, counters));
        let cancel = CancellationToken::new();
        let reader = tokio::spawn(reader_loop(
            role,
            Arc::clone(&socket),
            Arc::clone(&queue),
            cancel.clone(),
        ));

        debug!(%role, local = ?socket.local_addr().ok(), "endpoint bound");
        Ok(Endpoint {
            socket,
            dest,
            queue,
            reader,
            cancel,
        })
    }

    fn shutdown(&self) {
        self.cancel.cancel();
        self.queue.close();
        self.reader.abort();
    }
}

async fn reader_loop(
    role: EndpointRole,
    socket: Arc<UdpSocket>,
    queue: Arc<RecvQueue>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok((len, source)) => {
                    queue.push(Datagram {
                        data: buf[..len].to_vec(),
                        source,
                    });
                }
                Err(e) => {
                    warn!(%role, error = %e, "endpoint read failed");
                    // Transient errors (e.g. ICMP port unreachable surfacing
                    // as ECONNREFUSED) must not kill the reader.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
    debug!(%role, "endpoint reader stopped");
}

/// Owns and multiplexes the engine's UDP endpoints.
pub(crate) struct SocketManager {
    lifecycle: Mutex<()>,
    endpoints: RwLock<HashMap<EndpointRole, Arc<Endpoint>>>,
    counters: Arc<Counters>,
}

impl SocketManager {
    pub fn new(counters: Arc<Counters>) -> Self {
        Self {
            lifecycle: Mutex::new(()),
            endpoints: RwLock::new(HashMap::new()),
            counters,
        }
    }

    /// Bind endpoints. Without a descriptor only the discovery pair is bound;
    /// with one, the control and notify endpoints are bound as well. Roles
    /// that are already bound are left untouched, so a second `start` is a
    /// no-op.
    pub async fn start(
        &self,
        config: &EngineConfig,
        descriptor: Option<&DeviceDescriptor>,
    ) -> Result<(), TransportError> {
        let _guard = self.lifecycle.lock().await;

        let mut wanted: Vec<(EndpointRole, u16, bool, Option<SocketAddr>)> = vec![
            (
                EndpointRole::DiscoverRequest,
                0,
                true,
                Some(SocketAddr::new(
                    config.broadcast_addr,
                    config.discover_request_port,
                )),
            ),
            (
                EndpointRole::DiscoverResponse,
                config.discover_response_port,
                false,
                None,
            ),
        ];
        if let Some(descriptor) = descriptor {
            wanted.push((
                EndpointRole::Control,
                0,
                false,
                Some(SocketAddr::new(config.host, descriptor.control_port)),
            ));
            wanted.push((
                EndpointRole::Notify,
                0,
                false,
                Some(SocketAddr::new(config.host, descriptor.notify_port)),
            ));
        }

        for (role, port, broadcast, dest) in wanted {
            let already_bound = {
                let endpoints = self.endpoints.read().unwrap_or_else(PoisonError::into_inner);
                endpoints.contains_key(&role)
            };
            if already_bound {
                continue;
            }
            let endpoint =
                Endpoint::bind(role, port, broadcast, dest, Arc::clone(&self.counters)).await?;
            self.endpoints
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(role, Arc::new(endpoint));
        }
        Ok(())
    }

    /// Write one datagram. Never buffers.
    pub async fn send(
        &self,
        role: EndpointRole,
        bytes: &[u8],
        dest_override: Option<SocketAddr>,
    ) -> Result<(), TransportError> {
        let endpoint = self.endpoint(role)?;
        let dest = dest_override
            .or(endpoint.dest)
            .ok_or(TransportError::NotRunning)?;
        endpoint
            .socket
            .send_to(bytes, dest)
            .await
            .map_err(|source| TransportError::SendFailed { role, source })?;
        Ok(())
    }

    /// Next datagram from the role's queue, or `RecvTimeout`.
    pub async fn recv(
        &self,
        role: EndpointRole,
        timeout: Duration,
    ) -> Result<Datagram, TransportError> {
        let endpoint = self.endpoint(role)?;
        match tokio::time::timeout(timeout, endpoint.queue.pop()).await {
            Ok(Some(datagram)) => Ok(datagram),
            Ok(None) => Err(TransportError::NotRunning),
            Err(_) => Err(TransportError::RecvTimeout { role }),
        }
    }

    /// Local address of a bound role, if running.
    pub fn local_addr(&self, role: EndpointRole) -> Option<SocketAddr> {
        let endpoints = self.endpoints.read().unwrap_or_else(PoisonError::into_inner);
        endpoints.get(&role).and_then(|e| e.socket.local_addr().ok())
    }

    /// Close all endpoints and cancel pending reads. Idempotent.
    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;
        let endpoints: Vec<Arc<Endpoint>> = {
            let mut map = self.endpoints.write().unwrap_or_else(PoisonError::into_inner);
            map.drain().map(|(_, e)| e).collect()
        };
        for endpoint in endpoints {
            endpoint.shutdown();
        }
    }

    pub fn is_running(&self) -> bool {
        !self
            .endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    fn endpoint(&self, role: EndpointRole) -> Result<Arc<Endpoint>, TransportError> {
        let endpoints = self.endpoints.read().unwrap_or_else(PoisonError::into_inner);
        endpoints
            .get(&role)
            .cloned()
            .ok_or(TransportError::NotRunning)
    }
}

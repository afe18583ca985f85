//! Controller facade binding discovery, sockets, protocol, dispatch, and
//! liveness into one lifecycle.
//!
//! The controller owns every other component as a tree and drives shutdown
//! top-down. `connect` is serialised so concurrent callers share a single
//! discovery exchange; `close` is idempotent and leaves no task, socket, or
//! timer behind. On keepalive loss or goodbye the engine degrades, fails
//! pending commands fast, and (by default) reconnects with backoff,
//! replaying the authoritative subscription set.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::EngineConfig;
use crate::discovery;
use crate::dispatch::{Callback, NotificationDispatcher, Registration};
use crate::error::{ConnectError, ProtocolError};
use crate::keepalive::{KeepaliveMonitor, LivenessSignal};
use crate::protocol::ProtocolEngine;
use crate::socket::SocketManager;
use crate::types::{
    AckResult, AckStatus, Command, ConnectionEvent, ConnectionState, Counters, DeviceDescriptor,
    EndpointRole, EngineStats, LossReason, PropertyEvent, RawNotification, SubscribeOutcome,
    SubscriptionSet,
};

/// How long `close` waits for the supervisor task to wind down.
const SUPERVISOR_DRAIN: Duration = Duration::from_secs(2);

/// Capacity of the liveness signal channel; keepalives beyond it are dropped
/// harmlessly because any one of them re-arms the watchdog.
const LIVENESS_CHANNEL: usize = 16;

struct RunHandles {
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
    liveness_tx: mpsc::Sender<LivenessSignal>,
}

struct ControllerInner {
    config: Arc<EngineConfig>,
    counters: Arc<Counters>,
    sockets: Arc<SocketManager>,
    protocol: Arc<ProtocolEngine>,
    dispatcher: NotificationDispatcher,
    monitor: KeepaliveMonitor,
    subscriptions: Arc<StdMutex<SubscriptionSet>>,
    state: StdMutex<ConnectionState>,
    descriptor: StdMutex<Option<DeviceDescriptor>>,
    connect_lock: Mutex<()>,
    run: StdMutex<Option<RunHandles>>,
}

/// Async controller for one Emotiva XMC-series processor.
pub struct EmotivaController {
    inner: Arc<ControllerInner>,
}

impl EmotivaController {
    /// Build a controller for the configured device. Fails only on invalid
    /// configuration; no network activity happens until [`connect`].
    ///
    /// [`connect`]: EmotivaController::connect
    pub fn new(config: EngineConfig) -> Result<Self, ConnectError> {
        config.validate()?;
        let config = Arc::new(config);
        let counters = Arc::new(Counters::default());
        let sockets = Arc::new(SocketManager::new(Arc::clone(&counters)));
        let subscriptions = Arc::new(StdMutex::new(SubscriptionSet::new()));
        let protocol = Arc::new(ProtocolEngine::new(
            Arc::clone(&sockets),
            Arc::clone(&config),
            Arc::clone(&subscriptions),
            Arc::clone(&counters),
        ));
        let dispatcher = NotificationDispatcher::new(Arc::clone(&config), Arc::clone(&counters));

        Ok(Self {
            inner: Arc::new(ControllerInner {
                config,
                counters,
                sockets,
                protocol,
                dispatcher,
                monitor: KeepaliveMonitor::new(),
                subscriptions,
                state: StdMutex::new(ConnectionState::Disconnected),
                descriptor: StdMutex::new(None),
                connect_lock: Mutex::new(()),
                run: StdMutex::new(None),
            }),
        })
    }

    /// Discover the device and bring the engine up.
    ///
    /// Concurrent callers are serialised and observe the same outcome; a
    /// second `connect` while already connected is a no-op that returns the
    /// existing descriptor.
    pub async fn connect(&self) -> Result<DeviceDescriptor, ConnectError> {
        let _serial = self.inner.connect_lock.lock().await;

        match self.inner.state() {
            ConnectionState::Connected => {
                // AlreadyConnected is non-fatal by contract
                if let Some(descriptor) = self.inner.descriptor() {
                    return Ok(descriptor);
                }
            }
            ConnectionState::Closing | ConnectionState::Closed => {
                return Err(ConnectError::ClosingInProgress);
            }
            _ => {}
        }

        self.inner.set_state(ConnectionState::Connecting);
        match ControllerInner::establish(&self.inner).await {
            Ok(descriptor) => {
                self.inner.set_state(ConnectionState::Connected);
                self.inner.dispatcher.emit_connection(ConnectionEvent::Established {
                    descriptor: descriptor.clone(),
                });
                self.inner.replay_default_subscriptions().await;
                Ok(descriptor)
            }
            Err(e) => {
                self.inner.teardown_run().await;
                self.inner.sockets.stop().await;
                self.inner.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Shut the engine down. Idempotent; concurrent closes merge.
    pub async fn close(&self) -> Result<(), ConnectError> {
        let _serial = self.inner.connect_lock.lock().await;
        if self.inner.state() == ConnectionState::Closed {
            return Ok(());
        }
        self.inner.set_state(ConnectionState::Closing);
        self.inner.dispatcher.emit_connection(ConnectionEvent::Closed);

        self.inner.teardown_run().await;
        self.inner.monitor.stop();
        self.inner.protocol.shutdown();
        self.inner.dispatcher.shutdown().await;
        self.inner.sockets.stop().await;

        self.inner.set_state(ConnectionState::Closed);
        info!("engine closed");
        Ok(())
    }

    /// Send one command. With `ack_required`, the returned status is the
    /// device's ack or nak; without it, a successful send reports `Ack`.
    pub async fn send_command(
        &self,
        name: &str,
        value: &str,
        ack_required: bool,
    ) -> Result<AckResult, ProtocolError> {
        self.ensure_connected()?;
        let command = Command {
            name: name.to_string(),
            value: value.to_string(),
            ack_required,
        };
        self.inner.protocol.send_command(&command).await
    }

    /// Send a batch of commands in one control frame.
    pub async fn send_commands(&self, commands: &[Command]) -> Result<Vec<AckResult>, ProtocolError> {
        self.ensure_connected()?;
        self.inner.protocol.send_commands(commands).await
    }

    /// Subscribe to property notifications. Names already acked are skipped
    /// on the wire.
    pub async fn subscribe<I, S>(
        &self,
        names: I,
    ) -> Result<HashMap<String, SubscribeOutcome>, ProtocolError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ensure_connected()?;
        self.inner.protocol.subscribe(names).await
    }

    /// Unsubscribe from property notifications.
    pub async fn unsubscribe<I, S>(
        &self,
        names: I,
    ) -> Result<HashMap<String, SubscribeOutcome>, ProtocolError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ensure_connected()?;
        self.inner.protocol.unsubscribe(names).await
    }

    /// Request current values for the given properties. Naks are omitted
    /// from the result.
    pub async fn request_update<I, S>(
        &self,
        names: I,
    ) -> Result<HashMap<String, String>, ProtocolError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ensure_connected()?;
        self.inner.protocol.request_update(names).await
    }

    /// Register a callback for one property, or for every property with
    /// `"*"`. The callback runs off the engine loop and is cancelled at the
    /// configured deadline.
    pub fn on_property<F>(&self, name: &str, callback: F) -> Registration
    where
        F: Fn(PropertyEvent) + Send + Sync + 'static,
    {
        self.inner
            .dispatcher
            .on_property(pattern(name), Callback::Sync(Arc::new(callback)))
    }

    /// Async variant of [`on_property`].
    ///
    /// [`on_property`]: EmotivaController::on_property
    pub fn on_property_async<F, Fut>(&self, name: &str, callback: F) -> Registration
    where
        F: Fn(PropertyEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.dispatcher.on_property(
            pattern(name),
            Callback::Async(Arc::new(move |event| {
                let fut: std::pin::Pin<Box<dyn Future<Output = ()> + Send>> =
                    Box::pin(callback(event));
                fut
            })),
        )
    }

    /// Register a callback for lifecycle events. The current connection is
    /// reported through `Established`/`Lost`/`Restored`/`Closed` events.
    pub fn on_connection<F>(&self, callback: F) -> Registration
    where
        F: Fn(ConnectionEvent) + Send + Sync + 'static,
    {
        self.inner.dispatcher.on_connection(Arc::new(callback))
    }

    /// Register a callback for raw menu display frames.
    pub fn on_menu<F>(&self, callback: F) -> Registration
    where
        F: Fn(RawNotification) + Send + Sync + 'static,
    {
        self.inner.dispatcher.on_menu(Arc::new(callback))
    }

    /// Register a callback for raw front-panel bar frames.
    pub fn on_bar<F>(&self, callback: F) -> Registration
    where
        F: Fn(RawNotification) + Send + Sync + 'static,
    {
        self.inner.dispatcher.on_bar(Arc::new(callback))
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Descriptor of the connected device, if discovery has completed.
    pub fn descriptor(&self) -> Option<DeviceDescriptor> {
        self.inner.descriptor()
    }

    /// Snapshot of the acked subscription set.
    pub fn subscriptions(&self) -> HashSet<String> {
        self.inner.protocol.subscription_set()
    }

    /// Running counters for dropped notifications, gaps, and callback faults.
    pub fn stats(&self) -> EngineStats {
        self.inner.counters.snapshot()
    }

    /// Local address the device should deliver notifications to, once
    /// connected. Useful for diagnostics and device simulators.
    pub fn notify_addr(&self) -> Option<SocketAddr> {
        self.inner.sockets.local_addr(EndpointRole::Notify)
    }

    /// Local address control responses return to, once connected.
    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.inner.sockets.local_addr(EndpointRole::Control)
    }

    // Typed convenience helpers; each is a thin mapping onto `send_command`
    // that turns a device nak into an error.

    pub async fn set_power(&self, on: bool) -> Result<(), ProtocolError> {
        self.command_acked("power", if on { "true" } else { "false" }).await
    }

    pub async fn power_on(&self) -> Result<(), ProtocolError> {
        self.set_power(true).await
    }

    pub async fn power_off(&self) -> Result<(), ProtocolError> {
        self.set_power(false).await
    }

    /// Set the main-zone volume in dB.
    pub async fn set_volume(&self, db: f32) -> Result<(), ProtocolError> {
        self.command_acked("volume", &format!("{db:.1}")).await
    }

    pub async fn volume_up(&self) -> Result<(), ProtocolError> {
        self.command_acked("volumeUp", "0").await
    }

    pub async fn volume_down(&self) -> Result<(), ProtocolError> {
        self.command_acked("volumeDown", "0").await
    }

    pub async fn set_mute(&self, muted: bool) -> Result<(), ProtocolError> {
        self.command_acked("mute", if muted { "true" } else { "false" }).await
    }

    pub async fn set_input(&self, source: &str) -> Result<(), ProtocolError> {
        self.command_acked("input", source).await
    }

    pub async fn set_mode(&self, mode: &str) -> Result<(), ProtocolError> {
        self.command_acked("mode", mode).await
    }

    pub async fn set_zone2_power(&self, on: bool) -> Result<(), ProtocolError> {
        self.command_acked("zone2_power", if on { "true" } else { "false" }).await
    }

    pub async fn set_zone2_volume(&self, db: f32) -> Result<(), ProtocolError> {
        self.command_acked("zone2_volume", &format!("{db:.1}")).await
    }

    pub async fn set_zone2_input(&self, source: &str) -> Result<(), ProtocolError> {
        self.command_acked("zone2_input", source).await
    }

    async fn command_acked(&self, name: &str, value: &str) -> Result<(), ProtocolError> {
        let result = self.send_command(name, value, true).await?;
        match result.status {
            AckStatus::Ack => Ok(()),
            AckStatus::Nak => Err(ProtocolError::Nak { name: result.name }),
        }
    }

    fn ensure_connected(&self) -> Result<(), ProtocolError> {
        if self.inner.state() == ConnectionState::Connected {
            Ok(())
        } else {
            Err(ProtocolError::NotConnected)
        }
    }
}

fn pattern(name: &str) -> Option<String> {
    if name == "*" {
        None
    } else {
        Some(name.to_string())
    }
}

impl ControllerInner {
    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != next {
            let previous = *state;
            debug!(from = %previous, to = %next, "connection state change");
            *state = next;
        }
    }

    fn descriptor(&self) -> Option<DeviceDescriptor> {
        self.descriptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn keepalive_window(&self, descriptor: &DeviceDescriptor) -> Duration {
        Duration::from_millis(u64::from(descriptor.keepalive_interval_ms)) + self.config.keepalive_grace()
    }

    /// Discovery, device sockets, readers, watchdog, supervisor.
    async fn establish(inner: &Arc<ControllerInner>) -> Result<DeviceDescriptor, ConnectError> {
        inner.sockets.start(&inner.config, None).await?;
        let descriptor = discovery::discover(&inner.sockets, &inner.config).await?;
        inner.sockets.start(&inner.config, Some(&descriptor)).await?;

        let negotiated = inner.config.protocol_pref.min(descriptor.protocol_version);
        inner.protocol.set_version(negotiated);

        let cancel = CancellationToken::new();
        let (liveness_tx, liveness_rx) = mpsc::channel(LIVENESS_CHANNEL);

        inner.protocol.start(cancel.child_token());
        inner.dispatcher.start(
            Arc::clone(&inner.sockets),
            liveness_tx.clone(),
            cancel.child_token(),
        );
        inner.monitor.start(
            inner.keepalive_window(&descriptor),
            liveness_tx.clone(),
            cancel.child_token(),
        );
        inner.protocol.set_online(true);

        let supervisor = tokio::spawn(supervisor_loop(
            Arc::clone(inner),
            liveness_rx,
            cancel.child_token(),
        ));
        *inner.run.lock().unwrap_or_else(PoisonError::into_inner) = Some(RunHandles {
            cancel,
            supervisor,
            liveness_tx,
        });
        *inner
            .descriptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(descriptor.clone());

        Ok(descriptor)
    }

    /// Best-effort replay of the configured default subscriptions.
    async fn replay_default_subscriptions(&self) {
        if self.config.default_subscriptions.is_empty() {
            return;
        }
        let names: Vec<String> = self.config.default_subscriptions.iter().cloned().collect();
        if let Err(e) = self.protocol.subscribe(names).await {
            warn!(error = %e, "default subscriptions could not be established");
        }
    }

    async fn teardown_run(&self) {
        let run = self.run.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(run) = run {
            run.cancel.cancel();
            let mut supervisor = run.supervisor;
            if tokio::time::timeout(SUPERVISOR_DRAIN, &mut supervisor)
                .await
                .is_err()
            {
                warn!("supervisor did not stop within the drain deadline");
                supervisor.abort();
            }
        }
    }

    async fn handle_loss(&self, reason: LossReason, cancel: &CancellationToken) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        warn!(?reason, "connection to device lost");
        self.set_state(ConnectionState::Degraded);
        self.monitor.stop();
        self.protocol.set_online(false);
        self.protocol.fail_pending();
        self.dispatcher
            .emit_connection(ConnectionEvent::Lost { reason });

        if self.config.reconnect {
            self.reconnect_loop(cancel).await;
        }
    }

    async fn reconnect_loop(&self, cancel: &CancellationToken) {
        let backoff = Backoff::new(self.config.retry_base(), self.config.reconnect_backoff_max());
        let mut attempt: u32 = 0;
        loop {
            let delay = backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.try_reconnect(cancel).await {
                Ok(descriptor) => {
                    self.set_state(ConnectionState::Connected);
                    self.dispatcher
                        .emit_connection(ConnectionEvent::Restored { descriptor });
                    info!(attempt, "reconnected to device");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, attempt, "reconnect attempt failed");
                }
            }
        }
    }

    async fn try_reconnect(
        &self,
        cancel: &CancellationToken,
    ) -> Result<DeviceDescriptor, ConnectError> {
        self.sockets.stop().await;
        self.sockets.start(&self.config, None).await?;
        let descriptor = discovery::discover(&self.sockets, &self.config).await?;
        self.sockets.start(&self.config, Some(&descriptor)).await?;

        self.protocol
            .set_version(self.config.protocol_pref.min(descriptor.protocol_version));
        *self
            .descriptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(descriptor.clone());

        let liveness = self
            .run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|r| r.liveness_tx.clone());
        if let Some(liveness) = liveness {
            self.monitor.start(
                self.keepalive_window(&descriptor),
                liveness,
                cancel.child_token(),
            );
        }
        self.protocol.set_online(true);

        // Replay the authoritative subscription set, then refresh values.
        let names = self.protocol.take_subscription_set();
        if !names.is_empty() {
            let replay: Vec<String> = names.iter().cloned().collect();
            if let Err(e) = self.protocol.subscribe(replay.clone()).await {
                // Keep the set intact so the next attempt replays it again
                *self
                    .subscriptions
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = names;
                return Err(e.into());
            }
            if let Err(e) = self.protocol.request_update(replay).await {
                debug!(error = %e, "post-reconnect value refresh failed");
            }
        }

        Ok(descriptor)
    }
}

async fn supervisor_loop(
    inner: Arc<ControllerInner>,
    mut signals: mpsc::Receiver<LivenessSignal>,
    cancel: CancellationToken,
) {
    loop {
        let signal = tokio::select! {
            _ = cancel.cancelled() => break,
            signal = signals.recv() => match signal {
                Some(signal) => signal,
                None => break,
            }
        };
        match signal {
            LivenessSignal::KeepAlive => inner.monitor.touch(),
            LivenessSignal::Goodbye => inner.handle_loss(LossReason::Goodbye, &cancel).await,
            LivenessSignal::KeepaliveLost => {
                inner.handle_loss(LossReason::KeepaliveTimeout, &cancel).await
            }
        }
    }
    debug!("supervisor stopped");
}

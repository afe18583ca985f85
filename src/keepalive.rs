//! Keepalive surveillance.
//!
//! The device advertises a keepalive interval at discovery time and is
//! expected to emit a keepalive on the notify endpoint at that cadence. The
//! monitor arms a deadline of interval plus grace; any keepalive traffic
//! pushes the deadline out. Expiry reports a connection loss and the monitor
//! parks until the next (re)connect re-arms it.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Liveness traffic observed by the dispatcher, plus the monitor's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LivenessSignal {
    KeepAlive,
    Goodbye,
    KeepaliveLost,
}

pub(crate) struct KeepaliveMonitor {
    last_seen: Arc<StdMutex<Instant>>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl KeepaliveMonitor {
    pub fn new() -> Self {
        Self {
            last_seen: Arc::new(StdMutex::new(Instant::now())),
            task: StdMutex::new(None),
        }
    }

    /// Arm (or re-arm) the watchdog. A previous watchdog task is replaced.
    pub fn start(
        &self,
        window: Duration,
        signals: mpsc::Sender<LivenessSignal>,
        cancel: CancellationToken,
    ) {
        self.touch();
        let last_seen = Arc::clone(&self.last_seen);
        let handle = tokio::spawn(watchdog(last_seen, window, signals, cancel));
        let mut slot = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    /// Record keepalive traffic, pushing the deadline out.
    pub fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn stop(&self) {
        if let Some(handle) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

async fn watchdog(
    last_seen: Arc<StdMutex<Instant>>,
    window: Duration,
    signals: mpsc::Sender<LivenessSignal>,
    cancel: CancellationToken,
) {
    loop {
        let due = *last_seen.lock().unwrap_or_else(PoisonError::into_inner) + window;
        let now = Instant::now();
        if due <= now {
            warn!(window_ms = window.as_millis() as u64, "keepalive window expired");
            let _ = signals.send(LivenessSignal::KeepaliveLost).await;
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(due) => {}
        }
    }
    debug!("keepalive watchdog stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LossReason;

    #[tokio::test]
    async fn test_expiry_reports_loss() {
        let monitor = KeepaliveMonitor::new();
        let (tx, mut rx) = mpsc::channel(4);
        monitor.start(Duration::from_millis(80), tx, CancellationToken::new());

        let signal = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("watchdog must fire")
            .unwrap();
        assert_eq!(signal, LivenessSignal::KeepaliveLost);
    }

    #[tokio::test]
    async fn test_touch_defers_expiry() {
        let monitor = KeepaliveMonitor::new();
        let (tx, mut rx) = mpsc::channel(4);
        monitor.start(Duration::from_millis(120), tx, CancellationToken::new());

        // Keep touching for well past the bare window
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            monitor.touch();
        }
        assert!(rx.try_recv().is_err(), "watchdog fired despite keepalives");

        // Stop touching: now it must fire
        let signal = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("watchdog must fire after keepalives stop")
            .unwrap();
        assert_eq!(signal, LivenessSignal::KeepaliveLost);
    }

    #[tokio::test]
    async fn test_stop_disarms_watchdog() {
        let monitor = KeepaliveMonitor::new();
        let (tx, mut rx) = mpsc::channel(4);
        monitor.start(Duration::from_millis(60), tx, CancellationToken::new());
        monitor.stop();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_loss_reason_mapping() {
        // The controller maps signals onto loss reasons; keep them in sync
        assert_ne!(LossReason::KeepaliveTimeout, LossReason::Goodbye);
    }
}

//! Heartbeat: periodic pings to the peer and a watchdog for the peer's pings.

use crate::channel::Outbox;
use crate::config::HeartbeatConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, warn};
use undine_core::Outbound;

/// Marks that a ping arrived from the peer.
#[derive(Clone)]
pub struct PingSignal {
    tx: mpsc::Sender<()>,
}

impl PingSignal {
    pub fn mark(&self) {
        // A pending mark already covers this one.
        let _ = self.tx.try_send(());
    }
}

/// Handles the dispatcher keeps for the heartbeat tasks.
pub struct Heartbeat {
    pub signal: PingSignal,
    /// Fires once if the watchdog is configured to end the daemon.
    pub expired: mpsc::Receiver<()>,
    stale: Arc<AtomicU64>,
}

impl Heartbeat {
    /// Number of watchdog windows that elapsed without a ping.
    pub fn stale_windows(&self) -> u64 {
        self.stale.load(Ordering::Relaxed)
    }
}

/// Start the emitter and the watchdog. Both stop on `shutdown`.
pub fn spawn(config: HeartbeatConfig, outbox: Outbox, shutdown: &broadcast::Sender<()>) -> Heartbeat {
    let (ping_tx, ping_rx) = mpsc::channel(1);
    let (expired_tx, expired_rx) = mpsc::channel(1);
    let stale = Arc::new(AtomicU64::new(0));

    tokio::spawn(emit(config.clone(), outbox, shutdown.subscribe()));
    tokio::spawn(watch(
        config,
        ping_rx,
        expired_tx,
        stale.clone(),
        shutdown.subscribe(),
    ));

    Heartbeat {
        signal: PingSignal { tx: ping_tx },
        expired: expired_rx,
        stale,
    }
}

async fn emit(config: HeartbeatConfig, outbox: Outbox, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                outbox.send(Outbound::Ping).await;
            }
        }
    }
    debug!("heartbeat emitter stopped");
}

async fn watch(
    config: HeartbeatConfig,
    mut pings: mpsc::Receiver<()>,
    expired: mpsc::Sender<()>,
    stale: Arc<AtomicU64>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            ping = pings.recv() => {
                if ping.is_none() {
                    break;
                }
            }
            _ = sleep(config.timeout) => {
                stale.fetch_add(1, Ordering::Relaxed);
                warn!(timeout_secs = config.timeout.as_secs(), "no ping timeout");
                if config.exit_on_timeout {
                    let _ = expired.try_send(());
                    break;
                }
            }
        }
    }
    debug!("heartbeat watchdog stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(exit_on_timeout: bool) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(10),
            exit_on_timeout,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn emits_pings_on_interval() {
        let (outbox, mut events) = Outbox::pair(16);
        let (shutdown, _) = broadcast::channel(1);
        let _hb = spawn(config(false), outbox, &shutdown);

        // First ping goes out immediately.
        assert_eq!(events.recv().await, Some(Outbound::Ping));
        let start = tokio::time::Instant::now();
        assert_eq!(events.recv().await, Some(Outbound::Ping));
        assert_eq!(start.elapsed(), Duration::from_secs(5));

        shutdown.send(()).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn pings_keep_the_watchdog_quiet() {
        let (outbox, _events) = Outbox::pair(16);
        let (shutdown, _) = broadcast::channel(1);
        let hb = spawn(config(false), outbox, &shutdown);

        for _ in 0..5 {
            sleep(Duration::from_secs(6)).await;
            hb.signal.mark();
        }
        assert_eq!(hb.stale_windows(), 0);
        shutdown.send(()).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silence_is_logged_but_not_fatal() {
        let (outbox, _events) = Outbox::pair(64);
        let (shutdown, _) = broadcast::channel(1);
        let mut hb = spawn(config(false), outbox, &shutdown);

        sleep(Duration::from_secs(35)).await;
        assert_eq!(hb.stale_windows(), 3);
        assert!(hb.expired.try_recv().is_err());

        // The watchdog keeps running after a stale window.
        hb.signal.mark();
        sleep(Duration::from_secs(5)).await;
        assert_eq!(hb.stale_windows(), 3);
        shutdown.send(()).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silence_expires_when_configured() {
        let (outbox, _events) = Outbox::pair(64);
        let (shutdown, _) = broadcast::channel(1);
        let mut hb = spawn(config(true), outbox, &shutdown);

        assert_eq!(hb.expired.recv().await, Some(()));
        assert_eq!(hb.stale_windows(), 1);
        shutdown.send(()).unwrap();
    }
}

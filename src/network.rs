//! Online/offline tracking.
//!
//! The monitor holds the current connectivity flag in a `watch` channel so
//! the sync loop can react to offline → online transitions. A background
//! check flips it from the health endpoint; the sync engine flips it to
//! offline early when a delivery fails at the transport level.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::RequestSender;
use crate::notify::{Notification, Notifier};

pub struct NetworkMonitor {
    tx: watch::Sender<bool>,
    notifier: Notifier,
}

impl NetworkMonitor {
    pub fn new(initially_online: bool, notifier: Notifier) -> Self {
        let (tx, _) = watch::channel(initially_online);
        Self { tx, notifier }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Returns `true` when the flag actually changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            if online {
                info!("Network online");
            } else {
                info!("Network offline; queued requests stay pending");
            }
            self.notifier
                .emit(Notification::NetworkStatus { is_online: online });
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Poll the backend health endpoint every `interval` until cancelled.
pub fn start_health_check<S: RequestSender>(
    sender: Arc<S>,
    monitor: Arc<NetworkMonitor>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Health check started (interval: {}s)", interval.as_secs());
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let online = sender.check_health().await;
                    monitor.set_online(online);
                }
            }
        }
        info!("Health check stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::queue::QueuedRequest;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlakyHealth {
        healthy: AtomicBool,
    }

    impl RequestSender for FlakyHealth {
        async fn send(&self, _request: &QueuedRequest) -> Result<Value> {
            Ok(Value::Null)
        }

        async fn check_health(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_set_online_reports_transitions_only() {
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe();
        let monitor = NetworkMonitor::new(false, notifier);

        assert!(!monitor.set_online(false));
        assert!(monitor.set_online(true));
        assert!(!monitor.set_online(true));
        assert!(monitor.is_online());

        assert_eq!(
            rx.try_recv().unwrap(),
            Notification::NetworkStatus { is_online: true }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_health_check_flips_monitor() {
        let sender = Arc::new(FlakyHealth {
            healthy: AtomicBool::new(true),
        });
        let monitor = Arc::new(NetworkMonitor::new(false, Notifier::new()));
        let mut watch_rx = monitor.subscribe();
        let token = CancellationToken::new();

        let handle = start_health_check(
            sender.clone(),
            monitor.clone(),
            Duration::from_millis(10),
            token.clone(),
        );

        tokio::time::timeout(Duration::from_secs(2), watch_rx.wait_for(|online| *online))
            .await
            .expect("check marks online")
            .expect("watch open");

        sender.healthy.store(false, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(2), watch_rx.wait_for(|online| !*online))
            .await
            .expect("check marks offline")
            .expect("watch open");

        token.cancel();
        handle.await.unwrap();
    }
}

//! User-facing notifications and status events.
//!
//! Every service publishes onto one broadcast channel; UI shells, the agent
//! binary, or tests subscribe and render them however they like (toasts,
//! log lines, assertions).

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::queue::{QueueStats, RequestType};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    /// A mutating action was stored for later delivery.
    RequestQueued {
        id: String,
        request_type: RequestType,
    },
    SyncCompleted {
        delivered: usize,
    },
    /// The whole pass failed; individual delivery failures stay on their rows.
    SyncFailed {
        error: String,
    },
    /// A request gave up and needs operator attention.
    RequestDeadLettered {
        id: String,
        request_type: RequestType,
        error: String,
    },
    RealtimeConnected,
    RegisterLocked {
        register_id: String,
        name: String,
    },
    /// Kitchen display must re-fetch its order list.
    KitchenRefresh {
        event: String,
    },
    NetworkStatus {
        is_online: bool,
    },
    SyncStatus(SyncStatus),
}

/// Snapshot of the sync engine, published after every loop tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub is_online: bool,
    pub sync_in_flight: bool,
    pub last_sync: Option<String>,
    pub stats: QueueStats,
}

#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Fire-and-forget; having no subscribers is normal.
    pub fn emit(&self, notification: Notification) {
        trace!(?notification, "notify");
        let _ = self.tx.send(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers_is_ok() {
        let notifier = Notifier::new();
        notifier.emit(Notification::RealtimeConnected);
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe();
        notifier.emit(Notification::SyncCompleted { delivered: 2 });
        notifier.emit(Notification::RealtimeConnected);

        assert_eq!(
            rx.recv().await.unwrap(),
            Notification::SyncCompleted { delivered: 2 }
        );
        assert_eq!(rx.recv().await.unwrap(), Notification::RealtimeConnected);
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_value(Notification::RegisterLocked {
            register_id: "r1".into(),
            name: "Front".into(),
        })
        .unwrap();
        assert_eq!(json["kind"], "register_locked");
        assert_eq!(json["register_id"], "r1");
    }
}

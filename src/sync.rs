//! Background sync engine.
//!
//! Replays the offline queue against the backend. A pass is triggered by the
//! periodic timer, by an offline → online transition of the network monitor,
//! or manually through [`SyncEngine::force_sync`]. Passes never overlap: a
//! trigger that arrives while one is running is collapsed into a no-op.
//! Within a pass requests go out one at a time in enqueue order, each
//! awaited before the next, so the server observes them in that order.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::RequestSender;
use crate::db::{self, DbState};
use crate::error::{Error, Result};
use crate::network::NetworkMonitor;
use crate::notify::{Notification, Notifier, SyncStatus};
use crate::queue::{FailureOutcome, OfflineQueue};

const SETTINGS_CATEGORY: &str = "sync";
const SETTING_LAST_SYNC: &str = "last_sync";

/// Why a `sync()` call did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyRunning,
    Offline,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub delivered: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
    /// Rows another pass claimed first.
    pub claimed_elsewhere: usize,
    /// The pass stopped early because the backend became unreachable.
    pub interrupted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Skipped(SkipReason),
    Completed(PassReport),
}

/// Clears the in-flight flag however the pass ends.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncEngine<S: RequestSender> {
    db: Arc<DbState>,
    queue: Arc<OfflineQueue>,
    sender: Arc<S>,
    network: Arc<NetworkMonitor>,
    notifier: Notifier,
    claim_lease: Duration,
    in_flight: AtomicBool,
    last_sync: Mutex<Option<String>>,
}

impl<S: RequestSender> SyncEngine<S> {
    pub fn new(
        db: Arc<DbState>,
        queue: Arc<OfflineQueue>,
        sender: Arc<S>,
        network: Arc<NetworkMonitor>,
        notifier: Notifier,
        claim_lease: Duration,
    ) -> Self {
        let last_sync = db::get_setting(&db, SETTINGS_CATEGORY, SETTING_LAST_SYNC)
            .unwrap_or_else(|e| {
                warn!("Failed to read last sync time: {e}");
                None
            });
        Self {
            db,
            queue,
            sender,
            network,
            notifier,
            claim_lease,
            in_flight: AtomicBool::new(false),
            last_sync: Mutex::new(last_sync),
        }
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Run one replay pass unless offline or a pass is already running.
    pub async fn sync(&self) -> Result<SyncOutcome> {
        if !self.network.is_online() {
            debug!("Sync skipped: offline");
            return Ok(SyncOutcome::Skipped(SkipReason::Offline));
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Sync skipped: pass already in flight");
            return Ok(SyncOutcome::Skipped(SkipReason::AlreadyRunning));
        }
        let _guard = InFlightGuard(&self.in_flight);

        match self.run_pass().await {
            Ok(report) => {
                self.record_last_sync();
                if report.delivered > 0 {
                    info!(
                        delivered = report.delivered,
                        rescheduled = report.rescheduled,
                        dead_lettered = report.dead_lettered,
                        "Sync pass complete"
                    );
                    self.notifier.emit(Notification::SyncCompleted {
                        delivered: report.delivered,
                    });
                }
                Ok(SyncOutcome::Completed(report))
            }
            Err(e) => {
                warn!("Sync pass failed: {e}");
                self.notifier.emit(Notification::SyncFailed {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Operator-triggered pass. Unlike the loop, reports why nothing ran.
    pub async fn force_sync(&self) -> Result<usize> {
        match self.sync().await? {
            SyncOutcome::Completed(report) => {
                info!("Force sync complete: {} requests delivered", report.delivered);
                Ok(report.delivered)
            }
            SyncOutcome::Skipped(SkipReason::Offline) => {
                Err(Error::Transport("Cannot sync while offline".into()))
            }
            SyncOutcome::Skipped(SkipReason::AlreadyRunning) => Ok(0),
        }
    }

    async fn run_pass(&self) -> Result<PassReport> {
        self.queue.recover_stale_claims(self.claim_lease)?;

        // Snapshot of due rows; anything enqueued meanwhile waits for the
        // next pass. A rescheduled row ends the pass.
        let due = self.queue.due_pending()?;
        let mut report = PassReport::default();
        if due.is_empty() {
            return Ok(report);
        }
        debug!(count = due.len(), "Replaying queued requests");

        for request in due {
            if !self.queue.claim(&request.id)? {
                report.claimed_elsewhere += 1;
                continue;
            }

            match self.sender.send(&request).await {
                Ok(_) => {
                    self.queue.complete(&request.id)?;
                    report.delivered += 1;
                }
                Err(err) => {
                    let unreachable = matches!(err, Error::Transport(_));
                    match self.queue.record_failure(&request, &err)? {
                        // Still pending, so later rows must wait behind it.
                        FailureOutcome::Rescheduled { .. } => {
                            report.rescheduled += 1;
                            if unreachable {
                                self.network.set_online(false);
                                report.interrupted = true;
                            }
                            break;
                        }
                        FailureOutcome::DeadLettered => report.dead_lettered += 1,
                    }
                }
            }
        }

        Ok(report)
    }

    fn record_last_sync(&self) {
        let now = Utc::now().to_rfc3339();
        if let Err(e) = db::set_setting(&self.db, SETTINGS_CATEGORY, SETTING_LAST_SYNC, &now) {
            warn!("Failed to persist last sync time: {e}");
        }
        if let Ok(mut guard) = self.last_sync.lock() {
            *guard = Some(now);
        }
    }

    pub fn status(&self) -> Result<SyncStatus> {
        Ok(SyncStatus {
            is_online: self.network.is_online(),
            sync_in_flight: self.is_in_flight(),
            last_sync: self.last_sync.lock().ok().and_then(|g| g.clone()),
            stats: self.queue.stats()?,
        })
    }

    pub fn publish_status(&self) {
        match self.status() {
            Ok(status) => self.notifier.emit(Notification::SyncStatus(status)),
            Err(e) => warn!("Failed to collect sync status: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Background sync loop
// ---------------------------------------------------------------------------

/// Spawn the sync loop: one pass at start, then every `interval`, plus one
/// on each offline → online transition. Stops when `token` is cancelled.
pub fn start_sync_loop<S: RequestSender>(
    engine: Arc<SyncEngine<S>>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Sync loop started (interval: {}s)", interval.as_secs());

        let mut online_rx = engine.network.subscribe();
        let mut was_online = *online_rx.borrow_and_update();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
                changed = online_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = *online_rx.borrow_and_update();
                    let restored = online && !was_online;
                    was_online = online;
                    if !restored {
                        engine.publish_status();
                        continue;
                    }
                    info!("Network restored; resuming queued sync");
                }
            }

            match engine.sync().await {
                Ok(SyncOutcome::Completed(report)) if report.interrupted => {
                    info!("Sync pass interrupted: backend unreachable");
                }
                Ok(_) => {}
                Err(e) => warn!("Sync cycle failed: {e}"),
            }
            engine.publish_status();
        }

        info!("Sync loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{HttpMethod, QueuedRequest, RequestType, RetryPolicy};
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::{Notify, Semaphore};

    /// Records every delivery; optionally scripted failures and a gate that
    /// holds sends until the test releases them.
    #[derive(Default)]
    struct RecordingSender {
        calls: Mutex<Vec<(String, String)>>,
        script: Mutex<VecDeque<Result<Value>>>,
        gate: Option<Arc<Semaphore>>,
        entered: Notify,
        attempts: AtomicUsize,
    }

    impl RecordingSender {
        fn gated(gate: Arc<Semaphore>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::default()
            }
        }

        fn script(&self, results: Vec<Result<Value>>) {
            self.script.lock().unwrap().extend(results);
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl RequestSender for RecordingSender {
        async fn send(&self, request: &QueuedRequest) -> Result<Value> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            if let Some(gate) = &self.gate {
                gate.acquire().await.expect("gate open").forget();
            }
            let scripted = self.script.lock().unwrap().pop_front();
            let result = scripted.unwrap_or(Ok(json!({ "ok": true })));
            if result.is_ok() {
                self.calls
                    .lock()
                    .unwrap()
                    .push((request.id.clone(), request.idempotency_key.clone()));
            }
            result
        }

        async fn check_health(&self) -> bool {
            true
        }
    }

    struct Harness {
        engine: Arc<SyncEngine<RecordingSender>>,
        sender: Arc<RecordingSender>,
        notifier: Notifier,
    }

    fn harness_with(sender: RecordingSender, online: bool) -> Harness {
        let db = Arc::new(db::open_in_memory_for_test());
        let notifier = Notifier::new();
        let queue = Arc::new(OfflineQueue::new(
            db.clone(),
            notifier.clone(),
            RetryPolicy::default(),
        ));
        let network = Arc::new(NetworkMonitor::new(online, notifier.clone()));
        let sender = Arc::new(sender);
        let engine = Arc::new(SyncEngine::new(
            db,
            queue,
            sender.clone(),
            network,
            notifier.clone(),
            Duration::from_secs(120),
        ));
        Harness {
            engine,
            sender,
            notifier,
        }
    }

    fn enqueue(h: &Harness, request_type: RequestType, n: i64) -> QueuedRequest {
        h.engine
            .queue()
            .enqueue(request_type, "/api/sales", json!({ "n": n }), HttpMethod::Post)
            .expect("enqueue")
    }

    #[tokio::test]
    async fn test_full_sync_delivers_all_in_order_with_their_keys() {
        let h = harness_with(RecordingSender::default(), true);
        let queued: Vec<QueuedRequest> = (0..7)
            .map(|n| enqueue(&h, RequestType::SaleCreate, n))
            .collect();

        let outcome = h.engine.sync().await.unwrap();
        let SyncOutcome::Completed(report) = outcome else {
            panic!("expected a pass, got {outcome:?}");
        };
        assert_eq!(report.delivered, 7);

        let expected: Vec<(String, String)> = queued
            .iter()
            .map(|q| (q.id.clone(), q.idempotency_key.clone()))
            .collect();
        assert_eq!(h.sender.calls(), expected);

        let stats = h.engine.queue().stats().unwrap();
        assert_eq!(stats.pending + stats.sent + stats.failed, 0);
        assert!(h.engine.status().unwrap().last_sync.is_some());
    }

    #[tokio::test]
    async fn test_sync_is_noop_when_offline() {
        let h = harness_with(RecordingSender::default(), false);
        enqueue(&h, RequestType::SaleCreate, 1);

        assert_eq!(
            h.engine.sync().await.unwrap(),
            SyncOutcome::Skipped(SkipReason::Offline)
        );
        assert!(h.sender.calls().is_empty());
        assert!(h.engine.force_sync().await.is_err());
    }

    #[tokio::test]
    async fn test_overlapping_sync_collapses_into_one_pass() {
        let gate = Arc::new(Semaphore::new(0));
        let h = harness_with(RecordingSender::gated(gate.clone()), true);
        enqueue(&h, RequestType::SaleCreate, 1);
        enqueue(&h, RequestType::TableOrderSubmit, 2);

        let engine = h.engine.clone();
        let first = tokio::spawn(async move { engine.sync().await });

        // Wait until the first pass is blocked inside its first send.
        h.sender.entered.notified().await;
        assert!(h.engine.is_in_flight());
        assert_eq!(
            h.engine.sync().await.unwrap(),
            SyncOutcome::Skipped(SkipReason::AlreadyRunning)
        );

        gate.add_permits(2);
        let outcome = first.await.unwrap().unwrap();
        assert!(matches!(
            outcome,
            SyncOutcome::Completed(PassReport { delivered: 2, .. })
        ));
        assert_eq!(h.sender.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(h.sender.calls().len(), 2);
        assert!(!h.engine.is_in_flight());
    }

    #[tokio::test]
    async fn test_server_error_keeps_key_and_holds_later_rows_back() {
        let h = harness_with(RecordingSender::default(), true);
        let a = enqueue(&h, RequestType::SaleCreate, 1);
        let b = enqueue(&h, RequestType::SaleCreate, 2);
        h.sender.script(vec![Err(Error::Http {
            status: 503,
            message: "POS backend server error".into(),
            retry_after_secs: None,
        })]);

        let SyncOutcome::Completed(report) = h.engine.sync().await.unwrap() else {
            panic!("expected a pass");
        };
        assert_eq!(report.rescheduled, 1);
        assert_eq!(report.delivered, 0);
        assert!(!report.interrupted);
        assert!(h.engine.network().is_online());

        let stored = h.engine.queue().get(&a.id).unwrap().unwrap();
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.idempotency_key, a.idempotency_key);
        assert!(stored.next_retry_at.is_some());

        // a is still in backoff; b waits behind it.
        let SyncOutcome::Completed(report) = h.engine.sync().await.unwrap() else {
            panic!("expected a pass");
        };
        assert_eq!(report.delivered, 0);
        assert!(h.sender.calls().is_empty());
        assert_eq!(h.engine.queue().get(&b.id).unwrap().unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn test_transport_failure_interrupts_pass_and_marks_offline() {
        let h = harness_with(RecordingSender::default(), true);
        let a = enqueue(&h, RequestType::SaleCreate, 1);
        let b = enqueue(&h, RequestType::SaleCreate, 2);
        h.sender
            .script(vec![Err(Error::Transport("Cannot reach POS backend".into()))]);

        let SyncOutcome::Completed(report) = h.engine.sync().await.unwrap() else {
            panic!("expected a pass");
        };
        assert!(report.interrupted);
        assert_eq!(report.delivered, 0);
        assert!(!h.engine.network().is_online());

        // b was never attempted; a keeps its full budget too.
        let b_row = h.engine.queue().get(&b.id).unwrap().unwrap();
        assert_eq!(b_row.retry_count, 0);
        assert_eq!(h.engine.queue().get(&a.id).unwrap().unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn test_transport_failure_then_reconnect_delivers_in_submission_order() {
        let h = harness_with(RecordingSender::default(), true);
        let a = enqueue(&h, RequestType::TableOrderPay, 1);
        let b = enqueue(&h, RequestType::TableOrderSubmit, 2);
        h.sender.script(vec![Err(Error::Transport("down".into()))]);

        h.engine.sync().await.unwrap();
        assert!(!h.engine.network().is_online());

        // Connectivity returns well before any backoff would have elapsed.
        h.engine.network().set_online(true);
        let SyncOutcome::Completed(report) = h.engine.sync().await.unwrap() else {
            panic!("expected a pass");
        };
        assert_eq!(report.delivered, 2);
        assert_eq!(
            h.sender.calls(),
            vec![
                (a.id.clone(), a.idempotency_key.clone()),
                (b.id.clone(), b.idempotency_key.clone()),
            ]
        );
    }

    #[tokio::test]
    async fn test_rejected_request_is_dead_lettered_and_pass_continues() {
        let h = harness_with(RecordingSender::default(), true);
        let mut rx = h.notifier.subscribe();
        let a = enqueue(&h, RequestType::TableOrderPay, 1);
        enqueue(&h, RequestType::SaleCreate, 2);
        h.sender.script(vec![Err(Error::Http {
            status: 400,
            message: "Table already paid".into(),
            retry_after_secs: None,
        })]);

        let SyncOutcome::Completed(report) = h.engine.sync().await.unwrap() else {
            panic!("expected a pass");
        };
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.delivered, 1);

        let dead = h.engine.queue().dead_letters().unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, a.id);

        let mut saw_dead_letter = false;
        while let Ok(n) = rx.try_recv() {
            if matches!(n, Notification::RequestDeadLettered { .. }) {
                saw_dead_letter = true;
            }
        }
        assert!(saw_dead_letter);
    }

    #[tokio::test]
    async fn test_offline_enqueue_then_online_transition_syncs_automatically() {
        let h = harness_with(RecordingSender::default(), false);
        let mut rx = h.notifier.subscribe();
        let sale = enqueue(&h, RequestType::SaleCreate, 42);

        let token = CancellationToken::new();
        let handle = start_sync_loop(h.engine.clone(), Duration::from_secs(3600), token.clone());

        // Let the loop run its startup tick while offline.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.sender.calls().is_empty());

        h.engine.network().set_online(true);

        let delivered = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Ok(Notification::SyncCompleted { delivered }) => break delivered,
                    Ok(_) => continue,
                    Err(e) => panic!("notifier closed: {e}"),
                }
            }
        })
        .await
        .expect("sync completes after going online");
        assert_eq!(delivered, 1);
        assert!(h.engine.queue().get(&sale.id).unwrap().is_none());

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_rows_claimed_elsewhere_are_not_resent() {
        let h = harness_with(RecordingSender::default(), true);
        let a = enqueue(&h, RequestType::SaleCreate, 1);
        // Another process sharing the database claimed it moments ago.
        assert!(h.engine.queue().claim(&a.id).unwrap());

        let SyncOutcome::Completed(report) = h.engine.sync().await.unwrap() else {
            panic!("expected a pass");
        };
        assert_eq!(report.delivered, 0);
        assert!(h.sender.calls().is_empty());
        assert_eq!(h.engine.queue().stats().unwrap().sent, 1);
    }

    #[tokio::test]
    async fn test_force_sync_reports_count_and_status_is_published() {
        let h = harness_with(RecordingSender::default(), true);
        let mut rx = h.notifier.subscribe();
        enqueue(&h, RequestType::TableOrderPay, 1);
        enqueue(&h, RequestType::TableOrderPay, 2);

        assert_eq!(h.engine.force_sync().await.unwrap(), 2);
        h.engine.publish_status();

        let mut status = None;
        while let Ok(n) = rx.try_recv() {
            if let Notification::SyncStatus(s) = n {
                status = Some(s);
            }
        }
        let status = status.expect("status published");
        assert!(status.is_online);
        assert!(!status.sync_in_flight);
        assert!(status.last_sync.is_some());
        assert_eq!(status.stats.pending, 0);
    }
}

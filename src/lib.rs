//! Offline-first sync for POS terminals.
//!
//! Mutating calls are stored in a durable SQLite queue and replayed in
//! order with their idempotency keys once the backend is reachable. A
//! websocket client keeps a live view of every register and the most
//! recent sales. [`Services`] wires the pieces together; embedders that
//! need a different transport can build the parts individually.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod network;
pub mod notify;
pub mod queue;
pub mod realtime;
pub mod storage;
pub mod sync;

pub use api::{ApiClient, RequestSender};
pub use config::ClientConfig;
pub use db::DbState;
pub use error::{Error, Result};
pub use network::NetworkMonitor;
pub use notify::{Notification, Notifier, SyncStatus};
pub use queue::{
    HttpMethod, OfflineQueue, QueueStats, QueueStatus, QueuedRequest, RequestType, RetryPolicy,
};
pub use realtime::{ConnectionState, RealtimeClient, RealtimeSettings};
pub use storage::{CredentialStore, KeyringStore, MemoryStore, KEY_API_TOKEN};
pub use sync::{SyncEngine, SyncOutcome};

/// Every long-lived service, constructed once and shared by reference.
pub struct Services {
    pub config: ClientConfig,
    pub db: Arc<DbState>,
    pub notifier: Notifier,
    pub queue: Arc<OfflineQueue>,
    pub api: Arc<ApiClient>,
    pub network: Arc<NetworkMonitor>,
    pub sync: Arc<SyncEngine<ApiClient>>,
    pub realtime: Arc<RealtimeClient>,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Services {
    /// Open the database and build the services. Nothing runs until
    /// [`Services::start`].
    pub fn init(config: ClientConfig, credentials: Arc<dyn CredentialStore>) -> Result<Self> {
        config.validate()?;
        let db = Arc::new(db::init(&config.db_path())?);
        let notifier = Notifier::new();
        let queue = Arc::new(OfflineQueue::new(
            db.clone(),
            notifier.clone(),
            config.retry.clone(),
        ));
        let api = Arc::new(ApiClient::new(&config.api_base_url, credentials)?);
        // Offline until the first health check says otherwise.
        let network = Arc::new(NetworkMonitor::new(false, notifier.clone()));
        let sync = Arc::new(SyncEngine::new(
            db.clone(),
            queue.clone(),
            api.clone(),
            network.clone(),
            notifier.clone(),
            config.claim_lease(),
        ));
        let realtime = Arc::new(RealtimeClient::new(
            RealtimeSettings::from_config(&config),
            notifier.clone(),
            Some(api.clone()),
        ));

        Ok(Self {
            config,
            db,
            notifier,
            queue,
            api,
            network,
            sync,
            realtime,
            token: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    /// Spawn the health check, the sync loop and the realtime connection.
    pub fn start(&mut self) {
        if !self.tasks.is_empty() {
            return;
        }
        self.tasks.push(network::start_health_check(
            self.api.clone(),
            self.network.clone(),
            self.config.health_interval(),
            self.token.clone(),
        ));
        self.tasks.push(sync::start_sync_loop(
            self.sync.clone(),
            self.config.sync_interval(),
            self.token.clone(),
        ));
        self.realtime.start();
    }

    pub async fn shutdown(self) {
        self.token.cancel();
        self.realtime.shutdown().await;
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {e}");
            }
        }
        info!("Services stopped");
    }
}

/// Agent entry point: load config, start logging and services, run until
/// Ctrl-C.
pub async fn run() -> anyhow::Result<()> {
    let (config, token) = ClientConfig::load()?;
    let _guard = logging::init(&config.log_dir)?;
    info!("Starting pos-sync-agent v{}", env!("CARGO_PKG_VERSION"));

    let credentials: Arc<dyn CredentialStore> = Arc::new(KeyringStore);
    if let Some(token) = token {
        credentials.set(KEY_API_TOKEN, token.as_str())?;
        info!("Stored API token from connection string");
    }
    if credentials.get(KEY_API_TOKEN).is_none() {
        warn!("No API token configured; requests will be sent unauthenticated");
    }

    let mut services = Services::init(config, credentials)?;
    let mut notifications = services.notifier.subscribe();
    services.start();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            received = notifications.recv() => match received {
                Ok(notification) => log_notification(&notification),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Dropped {n} notifications");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    info!("Shutting down");
    services.shutdown().await;
    Ok(())
}

fn log_notification(notification: &Notification) {
    match notification {
        Notification::SyncStatus(_) => {}
        Notification::RequestDeadLettered { id, request_type, error } => {
            warn!(%id, %request_type, "Request needs attention: {error}");
        }
        Notification::RegisterLocked { register_id, name } => {
            warn!(%register_id, "Register {name} locked by admin");
        }
        other => match serde_json::to_string(other) {
            Ok(json) => info!(event = %json, "notification"),
            Err(e) => warn!("Unserializable notification: {e}"),
        },
    }
}

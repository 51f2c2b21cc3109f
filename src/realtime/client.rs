//! WebSocket connection to the push server.
//!
//! One background task owns the socket. It joins the configured room after
//! every handshake, folds incoming events into [`LiveState`] and reconnects
//! with a fixed delay until the attempt budget runs out.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::model::{RegisterState, SalePreview};
use super::protocol::{self, ServerEvent};
use super::state::{LiveState, RegisterEffect};
use crate::api::ApiClient;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::notify::{Notification, Notifier};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct RealtimeSettings {
    pub url: String,
    pub room: String,
    /// Consecutive failed handshakes tolerated before giving up.
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub feed_capacity: usize,
    pub snapshot_path: Option<String>,
}

impl RealtimeSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            url: config.websocket_url(),
            room: config.room.clone(),
            reconnect_attempts: config.reconnect_attempts,
            reconnect_delay: config.reconnect_delay(),
            feed_capacity: config.feed_capacity,
            snapshot_path: config.register_snapshot_path.clone(),
        }
    }
}

pub struct RealtimeClient {
    settings: RealtimeSettings,
    live: RwLock<LiveState>,
    notifier: Notifier,
    api: Option<Arc<ApiClient>>,
    announced: AtomicBool,
    state_tx: watch::Sender<ConnectionState>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl RealtimeClient {
    /// `api` is only needed when a register snapshot path is configured.
    pub fn new(settings: RealtimeSettings, notifier: Notifier, api: Option<Arc<ApiClient>>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        Self {
            live: RwLock::new(LiveState::new(settings.feed_capacity)),
            settings,
            notifier,
            api,
            announced: AtomicBool::new(false),
            state_tx,
            task: Mutex::new(None),
        }
    }

    /// Spawn the connection task. No-op while one is already running.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, handle)) = task.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }
        let token = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(self).run(token.clone()));
        *task = Some((token, handle));
    }

    /// Drop the current connection and start over with a fresh attempt budget.
    pub async fn reconnect(self: &Arc<Self>) {
        info!("Realtime reconnect requested");
        self.stop_task().await;
        self.start();
    }

    /// Close the socket and stop reconnecting.
    pub async fn shutdown(&self) {
        self.stop_task().await;
        self.set_state(ConnectionState::Disconnected);
        info!("Realtime client shut down");
    }

    async fn stop_task(&self) {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((token, handle)) = task {
            token.cancel();
            if let Err(e) = handle.await {
                warn!("Realtime task ended abnormally: {e}");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn registers(&self) -> Vec<RegisterState> {
        self.read_live().registers()
    }

    pub fn register(&self, id: &str) -> Option<RegisterState> {
        self.read_live().register(id).cloned()
    }

    /// Recent sales, newest first.
    pub fn feed(&self) -> Vec<SalePreview> {
        self.read_live().feed()
    }

    fn read_live(&self) -> RwLockReadGuard<'_, LiveState> {
        self.live.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_live(&self) -> RwLockWriteGuard<'_, LiveState> {
        self.live.write().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    /// Fold one text frame into the live state.
    pub fn handle_text(&self, text: &str) {
        let event = match protocol::decode(text) {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!("Ignoring realtime frame: {text}");
                return;
            }
            Err(e) => {
                debug!("Dropping malformed realtime frame: {e}");
                return;
            }
        };

        match event {
            ServerEvent::RegisterUpdated(update) => {
                let id = update.id.clone();
                let effect = self.write_live().apply_register_update(update);
                match effect {
                    RegisterEffect::Applied {
                        locked: true,
                        register_id,
                        name,
                    } => {
                        info!(%register_id, "Register locked by admin");
                        self.notifier
                            .emit(Notification::RegisterLocked { register_id, name });
                    }
                    RegisterEffect::Applied { .. } => {}
                    RegisterEffect::Stale => debug!(register_id = %id, "Stale register update dropped"),
                }
            }
            ServerEvent::SaleCompleted(sale) => {
                let sale_id = sale.id.clone();
                let bumped = self.write_live().apply_sale_completed(sale);
                debug!(%sale_id, bumped, "Sale added to feed");
            }
            ServerEvent::KitchenRefresh(event) => {
                self.notifier.emit(Notification::KitchenRefresh { event });
            }
        }
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut failures: u32 = 0;
        loop {
            self.set_state(ConnectionState::Connecting);
            let connected = tokio::select! {
                _ = token.cancelled() => break,
                r = tokio_tungstenite::connect_async(self.settings.url.as_str()) => r,
            };

            match connected {
                Ok((socket, _)) => {
                    failures = 0;
                    match self.session(socket, &token).await {
                        Ok(()) => debug!("Realtime connection closed"),
                        Err(e) => warn!("Realtime connection lost: {e}"),
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        "Realtime connect failed ({failures}/{}): {e}",
                        self.settings.reconnect_attempts
                    );
                }
            }

            self.set_state(ConnectionState::Disconnected);
            if token.is_cancelled() {
                break;
            }
            if failures > self.settings.reconnect_attempts {
                error!("Realtime reconnect attempts exhausted; staying disconnected");
                break;
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.settings.reconnect_delay) => {}
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }

    async fn session(&self, socket: Socket, token: &CancellationToken) -> Result<()> {
        let (mut write, mut read) = socket.split();
        write
            .send(Message::Text(protocol::join_message(&self.settings.room)?.into()))
            .await?;

        self.set_state(ConnectionState::Connected);
        info!(url = %self.settings.url, room = %self.settings.room, "Realtime connected");
        if !self.announced.swap(true, Ordering::SeqCst) {
            self.notifier.emit(Notification::RealtimeConnected);
        }

        self.refresh_snapshot().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()),
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "Server closed realtime connection");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                },
            }
        }
    }

    async fn refresh_snapshot(&self) {
        let (Some(api), Some(path)) = (self.api.as_ref(), self.settings.snapshot_path.as_deref())
        else {
            return;
        };
        let registers = match api.get_json(path).await.and_then(parse_snapshot) {
            Ok(registers) => registers,
            Err(e) => {
                warn!("Register snapshot fetch failed: {e}");
                return;
            }
        };
        let replaced = self.write_live().apply_snapshot(registers);
        info!(replaced, "Register snapshot applied");
    }
}

/// Accepts a bare array or an object wrapping it in `registers` or `data`.
fn parse_snapshot(body: Value) -> Result<Vec<RegisterState>> {
    let list = match body {
        Value::Array(_) => body,
        Value::Object(mut map) => map
            .remove("registers")
            .or_else(|| map.remove("data"))
            .ok_or_else(|| Error::Transport("Register snapshot has no register list".into()))?,
        _ => return Err(Error::Transport("Unexpected register snapshot shape".into())),
    };
    Ok(serde_json::from_value(list)?)
}

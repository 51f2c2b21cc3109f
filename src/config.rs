//! Client configuration.
//!
//! Layers, later overriding earlier: built-in defaults, an optional JSON file
//! named by `POS_SYNC_CONFIG`, individual `POS_*` environment variables, and
//! finally a terminal connection string (`POS_CONNECTION_STRING`) which may
//! also carry the bearer token.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::queue::RetryPolicy;

pub const ENV_CONFIG_FILE: &str = "POS_SYNC_CONFIG";
pub const ENV_API_BASE_URL: &str = "POS_API_BASE_URL";
pub const ENV_WS_URL: &str = "POS_WS_URL";
pub const ENV_ROOM: &str = "POS_SYNC_ROOM";
pub const ENV_DATA_DIR: &str = "POS_DATA_DIR";
pub const ENV_LOG_DIR: &str = "POS_LOG_DIR";
pub const ENV_SYNC_INTERVAL_SECS: &str = "POS_SYNC_INTERVAL_SECS";
pub const ENV_CONNECTION_STRING: &str = "POS_CONNECTION_STRING";

const DEFAULT_API_BASE_URL: &str = "http://localhost:3000";
const DEFAULT_ROOM: &str = "live-monitor";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub api_base_url: String,
    /// Derived from `api_base_url` when absent.
    pub ws_url: Option<String>,
    /// Broadcast group joined after every successful handshake.
    pub room: String,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub sync_interval_secs: u64,
    pub health_interval_secs: u64,
    pub retry: RetryPolicy,
    pub claim_lease_secs: u64,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub feed_capacity: usize,
    /// `GET` path returning the authoritative register list, fetched after
    /// each realtime (re)connect.
    pub register_snapshot_path: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            ws_url: None,
            room: DEFAULT_ROOM.to_string(),
            log_dir: data_dir.join("logs"),
            data_dir,
            sync_interval_secs: 60,
            health_interval_secs: 15,
            retry: RetryPolicy::default(),
            claim_lease_secs: 120,
            reconnect_attempts: 5,
            reconnect_delay_ms: 1_000,
            feed_capacity: 50,
            register_snapshot_path: None,
        }
    }
}

impl ClientConfig {
    /// Load defaults, then the optional config file, then env overrides.
    ///
    /// Returns the bearer token when a connection string supplied one.
    pub fn load() -> Result<(Self, Option<Zeroizing<String>>)> {
        let mut config = match std::env::var(ENV_CONFIG_FILE) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(path.trim()))?,
            _ => Self::default(),
        };

        config.apply_env()?;

        let token = match std::env::var(ENV_CONNECTION_STRING) {
            Ok(raw) if !raw.trim().is_empty() => config.apply_connection_string(&raw)?,
            _ => None,
        };

        config.api_base_url = normalize_base_url(&config.api_base_url);
        config.validate()?;
        info!(
            api = %config.api_base_url,
            ws = %config.websocket_url(),
            room = %config.room,
            "Client configuration loaded"
        );
        Ok((config, token))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("parse {}: {e}", path.display())))
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_non_empty(ENV_API_BASE_URL) {
            self.api_base_url = v;
        }
        if let Some(v) = env_non_empty(ENV_WS_URL) {
            self.ws_url = Some(v);
        }
        if let Some(v) = env_non_empty(ENV_ROOM) {
            self.room = v;
        }
        if let Some(v) = env_non_empty(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = env_non_empty(ENV_LOG_DIR) {
            self.log_dir = PathBuf::from(v);
        }
        if let Some(v) = env_non_empty(ENV_SYNC_INTERVAL_SECS) {
            self.sync_interval_secs = v.parse().map_err(|_| {
                Error::Config(format!("{ENV_SYNC_INTERVAL_SECS} must be an integer, got {v:?}"))
            })?;
        }
        Ok(())
    }

    /// Apply a terminal connection string (raw JSON or base64url JSON with
    /// `url`, optional `ws` and optional `key`). Returns the embedded key.
    pub fn apply_connection_string(&mut self, raw: &str) -> Result<Option<Zeroizing<String>>> {
        let payload = decode_connection_string_payload(raw)
            .ok_or_else(|| Error::Config("connection string is not valid JSON/base64".into()))?;

        if let Some(url) = payload
            .get("url")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            self.api_base_url = normalize_base_url(url);
        }
        if let Some(ws) = payload
            .get("ws")
            .or_else(|| payload.get("wsUrl"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            self.ws_url = Some(ws.to_string());
        }

        Ok(payload
            .get("key")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| Zeroizing::new(s.to_string())))
    }

    /// Reject values the background loops cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.room.trim().is_empty() {
            return Err(Error::Config("room must not be empty".into()));
        }
        if self.sync_interval_secs == 0 {
            return Err(Error::Config("sync_interval_secs must be > 0".into()));
        }
        if self.feed_capacity == 0 {
            return Err(Error::Config("feed_capacity must be > 0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be > 0".into()));
        }
        Ok(())
    }

    /// Websocket endpoint, falling back to the API base with a ws scheme.
    pub fn websocket_url(&self) -> String {
        match self.ws_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => url.trim_end_matches('/').to_string(),
            _ => derive_ws_url(&normalize_base_url(&self.api_base_url)),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("pos-sync.db")
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn default_data_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join("com.thesmall.pos-sync")
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the API base URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/api` segment
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

fn derive_ws_url(base: &str) -> String {
    if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    }
}

fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    match BASE64_STANDARD.decode(padded) {
        Ok(decoded) => serde_json::from_slice::<Value>(&decoded).ok(),
        Err(e) => {
            warn!(error = %e, "connection string is not valid base64");
            None
        }
    }
}

//! Bearer token storage.
//!
//! Production terminals keep the token in the OS credential store (DPAPI on
//! Windows, Keychain on macOS, kernel keyutils / Secret Service on Linux).
//! Tests and headless runs use the in-memory store.

use keyring::Entry;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::warn;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

const SERVICE_NAME: &str = "pos-offline-sync";

/// Credential key for the API bearer token.
pub const KEY_API_TOKEN: &str = "api_token";

pub trait CredentialStore: Send + Sync {
    /// Returns `None` when the entry does not exist.
    fn get(&self, key: &str) -> Option<Zeroizing<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Silently succeeds if the entry does not exist.
    fn delete(&self, key: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// OS keyring
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct KeyringStore;

impl CredentialStore for KeyringStore {
    fn get(&self, key: &str) -> Option<Zeroizing<String>> {
        let entry = match Entry::new(SERVICE_NAME, key) {
            Ok(e) => e,
            Err(e) => {
                warn!(key, error = %e, "keyring: failed to create entry");
                return None;
            }
        };
        match entry.get_password() {
            Ok(pw) => Some(Zeroizing::new(pw)),
            Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                warn!(key, error = %e, "keyring: failed to read credential");
                None
            }
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let entry =
            Entry::new(SERVICE_NAME, key).map_err(|e| Error::Credential(e.to_string()))?;
        entry
            .set_password(value)
            .map_err(|e| Error::Credential(e.to_string()))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let entry =
            Entry::new(SERVICE_NAME, key).map_err(|e| Error::Credential(e.to_string()))?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(Error::Credential(e.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Zeroizing<String>>>,
}

impl MemoryStore {
    pub fn with_token(token: &str) -> Self {
        let store = Self::default();
        if let Ok(mut entries) = store.entries.lock() {
            entries.insert(KEY_API_TOKEN.to_string(), Zeroizing::new(token.to_string()));
        }
        store
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Zeroizing<String>> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| Error::Credential(e.to_string()))?;
        entries.insert(key.to_string(), Zeroizing::new(value.to_string()));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| Error::Credential(e.to_string()))?;
        entries.remove(key);
        Ok(())
    }
}

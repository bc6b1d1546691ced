//! Backend credentials in the OS credential store (Keychain, DPAPI via
//! `keyring`, or the kernel keyring on Linux). Environment variables take
//! precedence; see [`crate::config::Config::from_env`].

use keyring::Entry;
use thiserror::Error;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::config::{decode_connection_string, normalize_remote_url};

const SERVICE_NAME: &str = "restaurant-pos-sync";

pub const KEY_REMOTE_URL: &str = "remote_url";
pub const KEY_API_KEY: &str = "api_key";
pub const KEY_REALTIME_URL: &str = "realtime_url";

const ALL_KEYS: &[&str] = &[KEY_REMOTE_URL, KEY_API_KEY, KEY_REALTIME_URL];

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential store: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("connection string is neither JSON nor base64 JSON with url and key")]
    InvalidConnectionString,
}

/// Read one credential. `None` when absent or the platform store is
/// unavailable.
pub fn get_credential(key: &str) -> Option<Zeroizing<String>> {
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

fn set_credential(key: &str, value: &str) -> Result<(), CredentialError> {
    Entry::new(SERVICE_NAME, key)?.set_password(value)?;
    Ok(())
}

fn delete_credential(key: &str) -> Result<(), CredentialError> {
    match Entry::new(SERVICE_NAME, key)?.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Store the endpoint and key carried by a connection string. Returns the
/// normalized endpoint URL.
pub fn save_connection_string(raw: &str) -> Result<String, CredentialError> {
    let (url, key) = decode_connection_string(raw).ok_or(CredentialError::InvalidConnectionString)?;
    let url = normalize_remote_url(&url);
    set_credential(KEY_REMOTE_URL, &url)?;
    set_credential(KEY_API_KEY, &key)?;
    info!(remote = %url, "Saved backend credentials");
    Ok(url)
}

/// Configured when both the endpoint and the key are stored.
pub fn is_configured() -> bool {
    get_credential(KEY_REMOTE_URL).is_some() && get_credential(KEY_API_KEY).is_some()
}

/// Forget every stored credential (terminal reset).
pub fn clear_credentials() -> Result<(), CredentialError> {
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    info!("Cleared stored backend credentials");
    Ok(())
}

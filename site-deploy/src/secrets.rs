//! Credential resolution against the system secret store.
//!
//! A site's configured password may be a placeholder of the form
//! `"<service> <account>"`; the real secret then lives in the OS keyring
//! under that service and account.

use crate::utils::{DeployError, Result};
use keyring::Entry;

/// Read access to a secret store.
pub trait SecretStore {
    /// `Ok(None)` when nothing is stored for the pair.
    fn get_secret(&self, service: &str, account: &str) -> Result<Option<String>>;
}

/// The platform keyring (Secret Service, Keychain, Credential Manager).
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyringStore;

impl SecretStore for KeyringStore {
    fn get_secret(&self, service: &str, account: &str) -> Result<Option<String>> {
        let entry = Entry::new(service, account).map_err(|e| DeployError::Secret(e.to_string()))?;
        match entry.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(DeployError::Secret(e.to_string())),
        }
    }
}

/// Per-site keyring account: the site uuid when there is one, else a slug of its name.
pub fn account_for(site_name: &str, uuid: Option<&str>) -> String {
    match uuid {
        Some(uuid) if !uuid.trim().is_empty() => uuid.trim().to_string(),
        _ => slug(site_name),
    }
}

/// Lowercase ASCII slug: runs of anything else collapse into a single `-`.
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_end_matches('-').to_string()
}

/// The placeholder stored in config instead of the real password.
pub fn sentinel(service: &str, account: &str) -> String {
    format!("{} {}", service, account)
}

/// Swap a placeholder password for the stored secret; real passwords pass through.
pub fn resolve_password(
    configured: &str,
    service: &str,
    account: &str,
    store: &dyn SecretStore,
) -> Result<String> {
    if configured != sentinel(service, account) {
        return Ok(configured.to_string());
    }

    tracing::debug!("Resolving password for {} from secret store", account);
    store.get_secret(service, account)?.ok_or_else(|| {
        DeployError::Secret(format!(
            "no secret stored for service {:?}, account {:?}",
            service, account
        ))
    })
}

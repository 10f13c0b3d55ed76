// Harvested credential storage

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::GatewayError;

pub mod harvester;
pub mod refresh;

use refresh::RefreshSignals;

/// Header patched by `token_refreshed` messages
pub const REAUTH_HEADER: &str = "X-Goog-First-Party-Reauth";

fn default_method() -> String {
    "POST".to_string()
}

/// A captured upstream request as sent by a harvester.
///
/// `body` is whatever the browser posted: usually the raw JSON string, but an
/// already-parsed object is accepted too.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestPayload {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub body: Value,
}

/// The single live upstream credential
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Credential {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(rename = "body")]
    pub body_template: Value,
    pub captured_at: DateTime<Utc>,
}

impl Credential {
    pub fn from_harvest(payload: HarvestPayload) -> Result<Self, GatewayError> {
        let body_template = match payload.body {
            Value::String(raw) => serde_json::from_str::<Value>(&raw).map_err(|e| {
                GatewayError::InvalidCredential(format!("body is not valid JSON: {}", e))
            })?,
            other => other,
        };

        let credential = Self {
            url: payload.url,
            method: payload.method,
            headers: payload.headers,
            body_template,
            captured_at: Utc::now(),
        };
        credential.validate()?;
        Ok(credential)
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.url.trim().is_empty() {
            return Err(GatewayError::InvalidCredential("url is empty".to_string()));
        }
        if !self
            .body_template
            .get("variables")
            .map(|v| v.is_object())
            .unwrap_or(false)
        {
            return Err(GatewayError::InvalidCredential(
                "body has no `variables` object".to_string(),
            ));
        }
        Ok(())
    }

    pub fn age(&self) -> Duration {
        (Utc::now() - self.captured_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Owns the canonical credential; hands out immutable snapshots.
///
/// Every write replaces the `Arc`, so `Arc::ptr_eq` on two snapshots tells
/// whether the credential changed in between.
pub struct CredentialStore {
    current: RwLock<Option<Arc<Credential>>>,
    path: Option<PathBuf>,
    signals: Arc<RefreshSignals>,
    stale_warn: Duration,
}

impl CredentialStore {
    pub fn new(path: Option<PathBuf>, signals: Arc<RefreshSignals>, stale_warn: Duration) -> Self {
        Self {
            current: RwLock::new(None),
            path,
            signals,
            stale_warn,
        }
    }

    /// Restore the last snapshot from disk. Missing or unreadable files leave the store empty.
    pub fn load(&self) {
        let Some(path) = &self.path else {
            return;
        };

        match load_credential_file(path) {
            Ok(Some(credential)) => {
                tracing::info!(
                    "Loaded credentials from {:?} (age: {}s)",
                    path,
                    credential.age().as_secs()
                );
                *self.current.write() = Some(Arc::new(credential));
            }
            Ok(None) => tracing::info!("No saved credentials found at {:?}", path),
            Err(e) => tracing::warn!("Error loading credentials from {:?}: {}", path, e),
        }
    }

    pub fn get(&self) -> Option<Arc<Credential>> {
        let credential = self.peek()?;
        if credential.age() > self.stale_warn {
            tracing::warn!(
                "Credentials might be stale ({} mins old)",
                credential.age().as_secs() / 60
            );
        }
        Some(credential)
    }

    /// Snapshot without the staleness warning
    pub fn peek(&self) -> Option<Arc<Credential>> {
        self.current.read().clone()
    }

    pub fn set(&self, credential: Credential) {
        self.persist(&credential);
        *self.current.write() = Some(Arc::new(credential));
        tracing::info!("Credentials updated at {}", Utc::now().format("%H:%M:%S"));
        self.signals.available.set();
    }

    /// Patch the re-auth header on the live credential. Returns false when
    /// there is nothing to patch.
    pub fn update_auth_header(&self, token: &str) -> bool {
        let updated = {
            let mut guard = self.current.write();
            let Some(existing) = guard.as_ref() else {
                tracing::warn!("Token refresh received but no credentials are loaded");
                return false;
            };

            let mut credential = Credential::clone(existing);
            let formatted = serde_json::to_string(&[token]).unwrap_or_default();
            let key = credential
                .headers
                .keys()
                .find(|k| k.eq_ignore_ascii_case(REAUTH_HEADER))
                .cloned()
                .unwrap_or_else(|| REAUTH_HEADER.to_string());
            if let Some(old) = credential.headers.get(&key) {
                tracing::debug!("Old token prefix: {}...", prefix(old, 20));
            }
            tracing::debug!("New token prefix: {}...", prefix(&formatted, 20));
            credential.headers.insert(key, formatted);
            credential.captured_at = Utc::now();

            *guard = Some(Arc::new(credential.clone()));
            credential
        };

        self.persist(&updated);
        tracing::info!("Token refreshed via harvester at {}", Utc::now().format("%H:%M:%S"));
        self.signals.available.set();
        true
    }

    pub fn age(&self) -> Option<Duration> {
        self.peek().map(|c| c.age())
    }

    /// True when there is no credential or it is older than `threshold`
    pub fn is_stale(&self, threshold: Duration) -> bool {
        match self.peek() {
            Some(credential) => credential.age() > threshold,
            None => true,
        }
    }

    fn persist(&self, credential: &Credential) {
        let Some(path) = &self.path else {
            return;
        };
        match save_credential_file(credential, path) {
            Ok(()) => tracing::debug!("Credentials saved to {:?}", path),
            Err(e) => tracing::warn!("Error saving credentials to {:?}: {}", path, e),
        }
    }
}

fn prefix(value: &str, len: usize) -> &str {
    match value.char_indices().nth(len) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

pub fn save_credential_file(credential: &Credential, path: &Path) -> anyhow::Result<()> {
    let content = serde_json::to_string_pretty(credential)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

pub fn load_credential_file(path: &Path) -> anyhow::Result<Option<Credential>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let credential: Credential = serde_json::from_str(&content)?;
    credential.validate()?;
    Ok(Some(credential))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> HarvestPayload {
        HarvestPayload {
            url: "https://example.test/batchGraphql".to_string(),
            method: "POST".to_string(),
            headers: HashMap::from([
                ("Cookie".to_string(), "sid=1".to_string()),
                (REAUTH_HEADER.to_string(), "[\"old\"]".to_string()),
            ]),
            body: json!(r#"{"operationName":"Stream","variables":{"model":"x"}}"#),
        }
    }

    fn store(path: Option<PathBuf>) -> (CredentialStore, Arc<RefreshSignals>) {
        let signals = Arc::new(RefreshSignals::new());
        let store = CredentialStore::new(path, signals.clone(), Duration::from_secs(1800));
        (store, signals)
    }

    #[test]
    fn test_from_harvest_parses_string_body() {
        let credential = Credential::from_harvest(payload()).unwrap();
        assert_eq!(credential.body_template["operationName"], "Stream");
        assert!(credential.body_template["variables"].is_object());
    }

    #[test]
    fn test_from_harvest_rejects_missing_variables() {
        let mut p = payload();
        p.body = json!({"operationName": "Stream"});
        assert!(matches!(
            Credential::from_harvest(p),
            Err(GatewayError::InvalidCredential(_))
        ));

        let mut p = payload();
        p.body = json!("not json");
        assert!(Credential::from_harvest(p).is_err());
    }

    #[test]
    fn test_set_persists_and_signals() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds").join("credentials.json");
        let (store, signals) = store(Some(path.clone()));

        signals.available.clear();
        store.set(Credential::from_harvest(payload()).unwrap());
        assert!(signals.available.is_set());
        assert!(path.exists());

        let (reloaded, _) = self::store(Some(path));
        reloaded.load();
        assert_eq!(reloaded.peek().unwrap().url, "https://example.test/batchGraphql");
    }

    #[test]
    fn test_update_auth_header_replaces_snapshot() {
        let (store, signals) = store(None);
        assert!(!store.update_auth_header("tok"));

        store.set(Credential::from_harvest(payload()).unwrap());
        let before = store.get().unwrap();
        signals.available.clear();

        assert!(store.update_auth_header("fresh"));
        let after = store.get().unwrap();

        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(before.headers[REAUTH_HEADER], "[\"old\"]");
        assert_eq!(after.headers[REAUTH_HEADER], "[\"fresh\"]");
        assert!(signals.available.is_set());
    }

    #[test]
    fn test_is_stale() {
        let (store, _) = store(None);
        assert!(store.is_stale(Duration::from_secs(3000)));

        let mut credential = Credential::from_harvest(payload()).unwrap();
        store.set(credential.clone());
        assert!(!store.is_stale(Duration::from_secs(3000)));

        credential.captured_at = Utc::now() - chrono::Duration::minutes(51);
        store.set(credential);
        assert!(store.is_stale(Duration::from_secs(3000)));
    }

    #[test]
    fn test_load_ignores_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, "{not json").unwrap();
        let (store, _) = store(Some(path));
        store.load();
        assert!(store.peek().is_none());
    }
}

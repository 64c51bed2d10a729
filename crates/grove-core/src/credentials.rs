//! API key storage and the one-time migration out of plaintext settings.
//!
//! Implementations:
//! - `InMemoryCredentialStore` / `InMemorySettings` - For testing
//! - `FileCredentialStore` / `JsonSettings` (in grove-daemon) - on disk
//!
//! Secrets are never cached: every operation reads the store again, since
//! another process may have changed it in between.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use thiserror::Error;
use tracing::{info, warn};

/// Prefix of every key this bridge writes into the credential store.
pub const KEY_PREFIX: &str = "grovebook.apiKey.";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Credential store error: {0}")]
    Store(String),

    #[error("Settings error: {0}")]
    Settings(String),
}

pub type Result<T> = std::result::Result<T, CredentialError>;

/// Namespaced store key for an origin.
pub fn credential_key(origin: &str) -> String {
    format!("{}{}", KEY_PREFIX, origin.trim_end_matches('/'))
}

/// Durable secret vault keyed by origin.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, origin: &str) -> Result<Option<String>>;

    async fn set(&self, origin: &str, secret: &str) -> Result<()>;

    async fn delete(&self, origin: &str) -> Result<()>;
}

/// Persistent bridge settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Upload automatically after edits settle
    pub auto_sync: bool,
    /// Snapshot every download into `backups/`
    pub backups: bool,
    /// Legacy plaintext `{origin: secret}` map
    pub api_keys: BTreeMap<String, String>,
    /// Set once the legacy map has been migrated
    pub migrated_api_keys: bool,
}

/// Process-wide settings storage.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load(&self) -> Result<Settings>;

    async fn save(&self, settings: &Settings) -> Result<()>;
}

/// Outcome of [`migrate_legacy_keys`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// False when migration had already run
    pub ran: bool,
    pub migrated: Vec<String>,
    pub failed: Vec<String>,
}

/// Move legacy plaintext keys into the credential store, once.
///
/// The completion flag is set even when some writes fail, so a broken entry
/// cannot cause a retry loop on every start.
pub async fn migrate_legacy_keys<C, S>(credentials: &C, settings: &S) -> Result<MigrationReport>
where
    C: CredentialStore + ?Sized,
    S: SettingsStore + ?Sized,
{
    let mut current = settings.load().await?;
    if current.migrated_api_keys {
        return Ok(MigrationReport::default());
    }

    let mut report = MigrationReport {
        ran: true,
        ..Default::default()
    };

    for (origin, secret) in &current.api_keys {
        match credentials.set(origin, secret).await {
            Ok(()) => report.migrated.push(origin.clone()),
            Err(e) => {
                warn!("Failed to migrate API key for {}: {}", origin, e);
                report.failed.push(origin.clone());
            }
        }
    }

    current.api_keys.clear();
    current.migrated_api_keys = true;
    settings.save(&current).await?;

    if !report.migrated.is_empty() {
        info!("Migrated API keys for: {}", report.migrated.join(", "));
    }
    Ok(report)
}

/// In-memory credential store for testing.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    secrets: RwLock<HashMap<String, String>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw view of a namespaced key.
    pub fn raw(&self, key: &str) -> Option<String> {
        self.secrets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn get(&self, origin: &str) -> Result<Option<String>> {
        Ok(self.raw(&credential_key(origin)))
    }

    async fn set(&self, origin: &str, secret: &str) -> Result<()> {
        self.secrets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(credential_key(origin), secret.to_string());
        Ok(())
    }

    async fn delete(&self, origin: &str) -> Result<()> {
        self.secrets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&credential_key(origin));
        Ok(())
    }
}

/// In-memory settings for testing.
#[derive(Default)]
pub struct InMemorySettings {
    settings: RwLock<Settings>,
}

impl InMemorySettings {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }

    pub fn snapshot(&self) -> Settings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl SettingsStore for InMemorySettings {
    async fn load(&self) -> Result<Settings> {
        Ok(self.snapshot())
    }

    async fn save(&self, settings: &Settings) -> Result<()> {
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Store that rejects one origin.
    struct Flaky {
        inner: InMemoryCredentialStore,
        reject: &'static str,
    }

    #[async_trait]
    impl CredentialStore for Flaky {
        async fn get(&self, origin: &str) -> Result<Option<String>> {
            self.inner.get(origin).await
        }

        async fn set(&self, origin: &str, secret: &str) -> Result<()> {
            if origin == self.reject {
                return Err(CredentialError::Store("vault locked".into()));
            }
            self.inner.set(origin, secret).await
        }

        async fn delete(&self, origin: &str) -> Result<()> {
            self.inner.delete(origin).await
        }
    }

    fn legacy(entries: &[(&str, &str)]) -> Settings {
        Settings {
            api_keys: entries
                .iter()
                .map(|(o, s)| (o.to_string(), s.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_store_is_namespaced() {
        let store = InMemoryCredentialStore::new();
        store.set("http://localhost:3000/", "secret").await.unwrap();

        assert_eq!(
            store.raw("grovebook.apiKey.http://localhost:3000"),
            Some("secret".into())
        );
        assert_eq!(
            store.get("http://localhost:3000").await.unwrap(),
            Some("secret".into())
        );

        store.delete("http://localhost:3000").await.unwrap();
        assert_eq!(store.get("http://localhost:3000").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_migration_moves_keys_and_clears_map() {
        let store = InMemoryCredentialStore::new();
        let settings = InMemorySettings::new(legacy(&[("http://a", "ka"), ("http://b", "kb")]));

        let report = migrate_legacy_keys(&store, &settings).await.unwrap();
        assert!(report.ran);
        assert_eq!(report.migrated, vec!["http://a", "http://b"]);
        assert!(report.failed.is_empty());

        assert_eq!(store.get("http://a").await.unwrap(), Some("ka".into()));
        let after = settings.snapshot();
        assert!(after.api_keys.is_empty());
        assert!(after.migrated_api_keys);
    }

    #[tokio::test]
    async fn test_migration_runs_once_even_when_empty() {
        let store = InMemoryCredentialStore::new();
        let settings = InMemorySettings::new(Settings::default());

        assert!(migrate_legacy_keys(&store, &settings).await.unwrap().ran);
        assert!(settings.snapshot().migrated_api_keys);

        // A key appearing later in the legacy map is not picked up again.
        let mut later = settings.snapshot();
        later.api_keys.insert("http://c".into(), "kc".into());
        settings.save(&later).await.unwrap();

        let report = migrate_legacy_keys(&store, &settings).await.unwrap();
        assert!(!report.ran);
        assert_eq!(store.get("http://c").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_partial_failure_still_sets_flag() {
        let store = Flaky {
            inner: InMemoryCredentialStore::new(),
            reject: "http://b",
        };
        let settings = InMemorySettings::new(legacy(&[("http://a", "ka"), ("http://b", "kb")]));

        let report = migrate_legacy_keys(&store, &settings).await.unwrap();
        assert_eq!(report.migrated, vec!["http://a"]);
        assert_eq!(report.failed, vec!["http://b"]);
        assert!(settings.snapshot().migrated_api_keys);
    }

    #[test]
    fn test_settings_json_shape() {
        let settings: Settings =
            serde_json::from_str(r#"{"autoSync":true,"apiKeys":{"http://a":"k"}}"#).unwrap();
        assert!(settings.auto_sync);
        assert!(!settings.backups);
        assert!(!settings.migrated_api_keys);
        assert_eq!(settings.api_keys.get("http://a"), Some(&"k".to_string()));
    }
}

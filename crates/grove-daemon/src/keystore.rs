//! On-disk credential vault.
//!
//! Secrets live in a JSON map `{ "grovebook.apiKey.<origin>": secret }`
//! readable only by the owner. Every operation re-reads the file so keys set
//! by another invocation (e.g. `grove-daemon key set`) are picked up at once.

use async_trait::async_trait;
use grove_core::credentials::{self, credential_key, CredentialError, CredentialStore};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

/// `CredentialStore` backed by a JSON file.
pub struct FileCredentialStore {
    path: PathBuf,
    /// Serialises read-modify-write cycles within this process
    write_lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> credentials::Result<BTreeMap<String, String>> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| CredentialError::Store(format!("{:?}: {}", self.path, e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(CredentialError::Store(e.to_string())),
        }
    }

    async fn write_all(&self, secrets: &BTreeMap<String, String>) -> credentials::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| CredentialError::Store(e.to_string()))?;
        }
        let contents = serde_json::to_string_pretty(secrets)
            .map_err(|e| CredentialError::Store(e.to_string()))?;

        // Write to a sibling and rename so a crash never truncates the vault
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents)
            .await
            .map_err(|e| CredentialError::Store(e.to_string()))?;
        restrict_permissions(&tmp).await?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| CredentialError::Store(e.to_string()))
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> credentials::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(|e| CredentialError::Store(e.to_string()))
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> credentials::Result<()> {
    Ok(())
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get(&self, origin: &str) -> credentials::Result<Option<String>> {
        Ok(self.read_all().await?.remove(&credential_key(origin)))
    }

    async fn set(&self, origin: &str, secret: &str) -> credentials::Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut secrets = self.read_all().await?;
        secrets.insert(credential_key(origin), secret.to_string());
        self.write_all(&secrets).await
    }

    async fn delete(&self, origin: &str) -> credentials::Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut secrets = self.read_all().await?;
        if secrets.remove(&credential_key(origin)).is_some() {
            self.write_all(&secrets).await?;
        }
        Ok(())
    }
}

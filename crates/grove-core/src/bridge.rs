//! Bridge: opens grovebooks into the working directory and uploads saves.
//!
//! The bridge owns every piece of process state (sync sessions, the server
//! version cache, the event bus) and reaches the outside world only through
//! the collaborator traits, so the whole open/save protocol runs against
//! in-memory fakes in tests.

use crate::credentials::{
    migrate_legacy_keys, CredentialError, CredentialStore, MigrationReport, SettingsStore,
};
use crate::document::Document;
use crate::events::{BridgeEvent, EventBus};
use crate::fs::{FileSystem, FsError};
use crate::markdown;
use crate::path_codec::{self, PathCodecError, RemoteFileRef, BACKUP_DIR};
use crate::remote::{GroveApi, ReloadSignal, RemoteError, Upload};
use crate::session::{SyncSessions, SyncStatus};
use crate::uri::{parse_open_link, OpenRequest, UriError};
use crate::version::{UploadFormat, VersionCache};

use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("No API key stored for {0}")]
    MissingCredential(String),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("Path error: {0}")]
    Path(#[from] PathCodecError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Link error: {0}")]
    Uri(#[from] UriError),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Behaviour switches read from settings at startup.
#[derive(Debug, Clone, Default)]
pub struct BridgeOptions {
    /// Snapshot every download into `<origin>/backups/`
    pub backups: bool,
}

/// A grovebook materialised in the working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedDocument {
    /// Path relative to the working directory
    pub path: String,
    pub content: String,
}

/// Result of a save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Content already matches the server; nothing uploaded
    Unchanged,
    Uploaded {
        format: UploadFormat,
        /// False when the reload request could not be delivered
        reload_requested: bool,
    },
}

/// A managed grovebook found in the working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedFile {
    pub path: String,
    pub remote: RemoteFileRef,
    pub status: Option<SyncStatus>,
}

/// Open/save orchestration over the collaborator traits.
pub struct Bridge<F, A, C, R>
where
    F: FileSystem,
    A: GroveApi,
    C: CredentialStore,
    R: ReloadSignal,
{
    fs: F,
    api: A,
    credentials: C,
    reload: R,
    options: BridgeOptions,
    versions: VersionCache,
    sessions: Mutex<SyncSessions>,
    events: Arc<EventBus>,
}

impl<F, A, C, R> Bridge<F, A, C, R>
where
    F: FileSystem,
    A: GroveApi,
    C: CredentialStore,
    R: ReloadSignal,
{
    pub fn new(fs: F, api: A, credentials: C, reload: R, options: BridgeOptions) -> Self {
        Self {
            fs,
            api,
            credentials,
            reload,
            options,
            versions: VersionCache::new(),
            sessions: Mutex::new(SyncSessions::new()),
            events: Arc::new(EventBus::new()),
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn credentials(&self) -> &C {
        &self.credentials
    }

    pub fn reload(&self) -> &R {
        &self.reload
    }

    fn sessions(&self) -> MutexGuard<'_, SyncSessions> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Report a failure as an error notification and pass it on.
    fn notify_err<T>(&self, context: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            warn!("{}: {}", context, e);
            self.events.error(format!("{}: {}", context, e));
        }
        result
    }

    async fn api_key(&self, origin: &str) -> Result<String> {
        self.credentials
            .get(origin)
            .await?
            .ok_or_else(|| BridgeError::MissingCredential(origin.to_string()))
    }

    // ========================================================================
    // Download direction
    // ========================================================================

    /// Open a deep link. `Ok(None)` when the link has nothing to open.
    pub async fn open_link(&self, link: &str) -> Result<Option<OpenedDocument>> {
        let request = match self.notify_err("Invalid link", parse_open_link(link).map_err(Into::into))? {
            Some(request) => request,
            None => {
                debug!("Link without open parameter ignored: {}", link);
                return Ok(None);
            }
        };
        if request.retry {
            debug!("Link is a retried dispatch for {}", request.remote_path);
        }
        self.open(&request).await.map(Some)
    }

    /// Download a grovebook and write it into the working directory.
    pub async fn open(&self, request: &OpenRequest) -> Result<OpenedDocument> {
        let result = self.try_open(request).await;
        self.notify_err(&format!("Failed to open {}", request.remote_path), result)
    }

    async fn try_open(&self, request: &OpenRequest) -> Result<OpenedDocument> {
        let path = path_codec::relative_path(&request.origin, &request.remote_path)?;
        // A path without project and file segments could never be uploaded
        path_codec::split_remote_path(&request.remote_path)?;
        let api_key = self.api_key(&request.origin).await?;

        let payload = self
            .api
            .fetch_file(&request.origin, &request.remote_path, &api_key)
            .await?;
        let content = match Document::from_payload(&payload) {
            Some(document) => markdown::decode(&document),
            None => payload,
        };

        self.fs.write(&path, content.as_bytes()).await?;
        // The watcher's debounced echo of this write arrives after this
        self.sessions().mark_synced(&path, &content);

        if self.options.backups {
            self.write_backup(request, &content).await;
        }

        info!("Opened {}{} as {}", request.origin, request.remote_path, path);
        self.events.emit(BridgeEvent::Opened {
            path: path.clone(),
            origin: request.origin.clone(),
            remote_path: request.remote_path.clone(),
        });
        self.emit_indicator_if_active(&path);

        Ok(OpenedDocument { path, content })
    }

    async fn write_backup(&self, request: &OpenRequest, content: &str) {
        let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
        let written = match path_codec::backup_path(&request.origin, &request.remote_path, &timestamp) {
            Ok(backup) => self.fs.write(&backup, content.as_bytes()).await.map(|_| backup),
            Err(e) => {
                warn!("Cannot derive backup path: {}", e);
                return;
            }
        };
        match written {
            Ok(backup) => debug!("Backup written to {}", backup),
            Err(e) => warn!("Failed to write backup: {}", e),
        }
    }

    // ========================================================================
    // Upload direction
    // ========================================================================

    /// Upload the on-disk content of a managed document.
    ///
    /// Unless `force` is set, content equal to the last synced content is not
    /// uploaded again.
    pub async fn save(&self, path: &str, force: bool) -> Result<SaveOutcome> {
        let content = self.notify_err(
            &format!("Failed to read {}", path),
            self.read_document(path).await,
        )?;
        self.save_content(path, &content, force).await
    }

    /// Current on-disk content of a document.
    pub async fn read_document(&self, path: &str) -> Result<String> {
        Ok(self.fs.read_to_string(path).await?)
    }

    /// Upload `content` as the new version of a managed document.
    pub async fn save_content(&self, path: &str, content: &str, force: bool) -> Result<SaveOutcome> {
        let result = self.try_save(path, content, force).await;
        self.notify_err(&format!("Failed to upload {}", path), result)
    }

    async fn try_save(&self, path: &str, content: &str, force: bool) -> Result<SaveOutcome> {
        let remote = path_codec::decode_relative(path)?;

        if !force && !self.sessions().is_dirty(path, content) {
            debug!("{} unchanged since last sync, skipping upload", path);
            return Ok(SaveOutcome::Unchanged);
        }

        let api_key = self.api_key(&remote.origin).await?;

        self.sessions().save_started(path);
        self.emit_indicator_if_active(path);

        let format = self
            .versions
            .resolve_format(&self.api, &remote.origin, &api_key)
            .await;
        let data = match format {
            UploadFormat::NativeText => content.as_bytes().to_vec(),
            UploadFormat::LegacyJson => markdown::encode(content).to_json().into_bytes(),
        };

        let upload = Upload {
            file_name: remote.file_name.clone(),
            project_id: remote.project_id.clone(),
            data,
        };
        if let Err(e) = self.api.upload_file(&remote.origin, &api_key, upload).await {
            self.sessions().upload_failed(path);
            self.emit_indicator_if_active(path);
            return Err(e.into());
        }

        self.sessions().upload_succeeded(path, content);
        self.emit_indicator_if_active(path);
        let format_name = match format {
            UploadFormat::NativeText => "native",
            UploadFormat::LegacyJson => "legacy",
        };
        info!("Uploaded {} ({} format)", path, format_name);
        self.events.emit(BridgeEvent::Uploaded {
            path: path.to_string(),
            format: format_name.to_string(),
        });

        let reload_requested = match self
            .reload
            .request_reload(&remote.origin, &api_key, &remote.file_name, &remote.project_id)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!("Reload request for {} failed: {}", path, e);
                self.events
                    .error(format!("Uploaded {}, but reload failed: {}", path, e));
                false
            }
        };

        Ok(SaveOutcome::Uploaded {
            format,
            reload_requested,
        })
    }

    // ========================================================================
    // Editor notifications
    // ========================================================================

    /// Live content of a document changed.
    ///
    /// Returns `None` for paths that are not grovebooks.
    pub fn content_changed(&self, path: &str, content: &str) -> Option<SyncStatus> {
        if path_codec::decode_relative(path).is_err() {
            return None;
        }
        let status = self.sessions().content_changed(path, content);
        self.emit_indicator_if_active(path);
        Some(status)
    }

    /// Whether `content` differs from the last synced content of `path`.
    pub fn is_dirty(&self, path: &str, content: &str) -> bool {
        self.sessions().is_dirty(path, content)
    }

    /// Whether `path` has an open session.
    pub fn is_open(&self, path: &str) -> bool {
        self.sessions().is_managed(path)
    }

    /// Document closed (or deleted from disk).
    pub fn close(&self, path: &str) {
        let was_active = {
            let mut sessions = self.sessions();
            let was_active = sessions.active() == Some(path);
            sessions.close(path);
            was_active
        };
        if was_active {
            self.events.emit(BridgeEvent::Indicator {
                path: None,
                status: None,
            });
        }
    }

    /// Switch the active document; the indicator is re-evaluated at once.
    pub fn set_active(&self, path: Option<&str>) -> Option<SyncStatus> {
        let status = self.sessions().set_active(path);
        self.events.emit(BridgeEvent::Indicator {
            path: path.map(str::to_string),
            status,
        });
        status
    }

    /// Current indicator state.
    pub fn indicator(&self) -> Option<SyncStatus> {
        self.sessions().indicator()
    }

    fn emit_indicator_if_active(&self, path: &str) {
        let status = {
            let sessions = self.sessions();
            if sessions.active() != Some(path) {
                return;
            }
            sessions.indicator()
        };
        self.events.emit(BridgeEvent::Indicator {
            path: Some(path.to_string()),
            status,
        });
    }

    // ========================================================================
    // Housekeeping
    // ========================================================================

    /// Every grovebook currently in the working directory.
    pub async fn managed_files(&self) -> Result<Vec<ManagedFile>> {
        let mut managed = Vec::new();
        for origin_dir in self.fs.list("").await? {
            if !origin_dir.is_dir {
                continue;
            }
            for entry in self.fs.list(&origin_dir.name).await? {
                if entry.is_dir || entry.name == BACKUP_DIR {
                    continue;
                }
                let path = format!("{}/{}", origin_dir.name, entry.name);
                if let Ok(remote) = path_codec::decode_relative(&path) {
                    let status = self.sessions().status(&path);
                    managed.push(ManagedFile {
                        path,
                        remote,
                        status,
                    });
                }
            }
        }
        managed.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(managed)
    }

    /// Run the one-time legacy key migration, reporting the outcome once.
    pub async fn migrate_credentials<S>(&self, settings: &S) -> Result<MigrationReport>
    where
        S: SettingsStore + ?Sized,
    {
        let report = self.notify_err(
            "API key migration failed",
            migrate_legacy_keys(&self.credentials, settings)
                .await
                .map_err(Into::into),
        )?;
        if !report.migrated.is_empty() {
            self.events.info(format!(
                "Moved API keys for {} into secure storage",
                report.migrated.join(", ")
            ));
        }
        if !report.failed.is_empty() {
            self.events.error(format!(
                "Could not move API keys for {}; add them again",
                report.failed.join(", ")
            ));
        }
        Ok(report)
    }

    /// Forget all sessions (process shutdown).
    pub fn shutdown(&self) {
        self.sessions().clear();
    }
}

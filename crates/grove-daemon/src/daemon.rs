//! Daemon state and event handlers for `grove-daemon watch`.
//!
//! The main loop multiplexes file watcher events, auto-sync expiries, reload
//! channel notices and deep links from stdin; each handler lives here so the
//! e2e tests can drive them without a terminal.

use crate::autosync::AutoSync;
use crate::reload::{ReloadChannels, ReloadEvent};
use crate::watcher::{FileEvent, FileEventKind};
use grove_core::{
    Bridge, BridgeEvent, CredentialStore, EventBus, FileSystem, GroveApi, Subscription, SyncStatus,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Bridge wired to the reload channel registry.
pub type ChannelBridge<F, A, C> = Bridge<F, A, C, ReloadChannels>;

/// Render bridge notifications as log lines.
pub fn log_events(events: &Arc<EventBus>) -> Subscription {
    events.subscribe(|event| match event {
        BridgeEvent::Info { message } => info!("{}", message),
        BridgeEvent::Error { message } => error!("{}", message),
        BridgeEvent::Indicator { path, status } => match (path, status) {
            (Some(path), Some(status)) => info!("[{}] {}", status_label(status), path),
            _ => debug!("Status indicator hidden"),
        },
        BridgeEvent::Opened { path, .. } => debug!("Opened {}", path),
        BridgeEvent::Uploaded { path, format } => debug!("Uploaded {} as {}", path, format),
    })
}

pub fn status_label(status: SyncStatus) -> &'static str {
    match status {
        SyncStatus::Synced => "synced",
        SyncStatus::Modified => "modified",
        SyncStatus::Syncing => "syncing",
    }
}

/// Watch-mode daemon.
pub struct Daemon<F, A, C>
where
    F: FileSystem + 'static,
    A: GroveApi + 'static,
    C: CredentialStore + 'static,
{
    bridge: Arc<ChannelBridge<F, A, C>>,
    /// Present when auto-sync is enabled
    autosync: Option<AutoSync>,
    /// In-flight saves and opens
    tasks: Vec<JoinHandle<()>>,
}

impl<F, A, C> Daemon<F, A, C>
where
    F: FileSystem + 'static,
    A: GroveApi + 'static,
    C: CredentialStore + 'static,
{
    /// `auto_sync_delay` enables debounced auto-sync; `None` uploads on
    /// every write.
    pub fn new(bridge: Arc<ChannelBridge<F, A, C>>, auto_sync_delay: Option<Duration>) -> Self {
        Self {
            bridge,
            autosync: auto_sync_delay.map(AutoSync::new),
            tasks: Vec::new(),
        }
    }

    pub fn bridge(&self) -> &Arc<ChannelBridge<F, A, C>> {
        &self.bridge
    }

    fn spawn(&mut self, task: impl std::future::Future<Output = ()> + Send + 'static) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(tokio::spawn(task));
    }

    /// Wait for every in-flight save/open to finish.
    pub async fn drain(&mut self) {
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Background task failed: {}", e);
            }
        }
    }

    /// Next auto-sync expiry; pending forever when auto-sync is off.
    pub async fn next_expired(&mut self) -> Option<String> {
        match self.autosync.as_mut() {
            Some(autosync) => autosync.next_expired().await,
            None => std::future::pending().await,
        }
    }

    /// Handle a change to a managed file on disk.
    pub async fn on_file_event(&mut self, event: FileEvent) {
        match event.kind {
            FileEventKind::Modified => self.on_file_modified(&event.path).await,
            FileEventKind::Deleted => {
                info!("{} deleted, closing session", event.path);
                if let Some(autosync) = self.autosync.as_mut() {
                    autosync.cancel(&event.path);
                }
                self.bridge.close(&event.path);
            }
        }
    }

    async fn on_file_modified(&mut self, path: &str) {
        let content = match self.bridge_fs_read(path).await {
            Some(content) => content,
            None => return,
        };

        // The most recently touched document counts as the active one
        self.bridge.set_active(Some(path));
        if self.bridge.content_changed(path, &content).is_none() {
            return;
        }
        if !self.bridge.is_dirty(path, &content) {
            debug!("{} matches last synced content", path);
            return;
        }

        match self.autosync.as_mut() {
            Some(autosync) => autosync.schedule(path),
            None => {
                let bridge = Arc::clone(&self.bridge);
                let path = path.to_string();
                self.spawn(async move {
                    let _ = bridge.save_content(&path, &content, false).await;
                });
            }
        }
    }

    async fn bridge_fs_read(&self, path: &str) -> Option<String> {
        match self.bridge.read_document(path).await {
            Ok(content) => Some(content),
            Err(e) => {
                warn!("Cannot read {}: {}", path, e);
                None
            }
        }
    }

    /// Auto-sync timer for `path` expired.
    pub fn on_autosync_expired(&mut self, path: String) {
        if !self.bridge.is_open(&path) {
            debug!("{} closed before auto-sync fired", path);
            return;
        }
        let bridge = Arc::clone(&self.bridge);
        self.spawn(async move {
            // Unchanged content is skipped inside save
            let _ = bridge.save(&path, false).await;
        });
    }

    /// Open a deep link in the background.
    pub fn on_link(&mut self, link: String) {
        let bridge = Arc::clone(&self.bridge);
        self.spawn(async move {
            if let Ok(Some(opened)) = bridge.open_link(&link).await {
                bridge.set_active(Some(&opened.path));
            }
        });
    }

    /// Surface reload outcomes reported by the server.
    pub fn on_reload_event(&self, event: ReloadEvent) {
        match event {
            ReloadEvent::Notice { origin, notice } => match notice.failure() {
                Some(message) => self
                    .bridge
                    .events()
                    .error(format!("Reload on {} failed: {}", origin, message)),
                None => debug!("Reload on {} succeeded", origin),
            },
            ReloadEvent::Closed { origin } => debug!("Reload channel to {} closed", origin),
        }
    }

    /// Cancel timers, finish in-flight work, close channels, drop sessions.
    pub async fn shutdown(&mut self) {
        if let Some(autosync) = self.autosync.as_mut() {
            autosync.cancel_all();
        }
        self.drain().await;
        self.bridge.reload().shutdown().await;
        self.bridge.shutdown();
    }
}

//! Per-document sync sessions and the status indicator.
//!
//! A session remembers the content last known to match the server. Comparing
//! live content against it classifies the document as synced or modified
//! without any network traffic.

use serde::Serialize;
use std::collections::HashMap;

/// Status shown for the active document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    Synced,
    Modified,
    Syncing,
}

#[derive(Debug, Clone)]
struct SessionRecord {
    last_synced: Option<String>,
    status: SyncStatus,
}

/// All open sessions plus the active document.
///
/// Keys are document paths relative to the working directory.
#[derive(Debug, Default)]
pub struct SyncSessions {
    records: HashMap<String, SessionRecord>,
    active: Option<String>,
}

impl SyncSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `path` has an open session.
    pub fn is_managed(&self, path: &str) -> bool {
        self.records.contains_key(path)
    }

    pub fn status(&self, path: &str) -> Option<SyncStatus> {
        self.records.get(path).map(|r| r.status)
    }

    pub fn last_synced(&self, path: &str) -> Option<&str> {
        self.records.get(path).and_then(|r| r.last_synced.as_deref())
    }

    /// `content` is now known to match the server (download or upload done).
    pub fn mark_synced(&mut self, path: &str, content: &str) -> SyncStatus {
        let record = self.record_mut(path);
        record.last_synced = Some(content.to_string());
        record.status = SyncStatus::Synced;
        SyncStatus::Synced
    }

    /// Live content changed.
    pub fn content_changed(&mut self, path: &str, content: &str) -> SyncStatus {
        let record = self.record_mut(path);
        record.status = if record.last_synced.as_deref() == Some(content) {
            SyncStatus::Synced
        } else {
            SyncStatus::Modified
        };
        record.status
    }

    /// Whether `content` differs from what was last synced.
    pub fn is_dirty(&self, path: &str, content: &str) -> bool {
        self.last_synced(path) != Some(content)
    }

    /// A save has started uploading.
    pub fn save_started(&mut self, path: &str) -> SyncStatus {
        let record = self.record_mut(path);
        record.status = SyncStatus::Syncing;
        record.status
    }

    /// An upload of `content` finished.
    ///
    /// Overlapping saves are not serialised: whichever upload completes last
    /// sets the last-synced content.
    pub fn upload_succeeded(&mut self, path: &str, content: &str) -> SyncStatus {
        self.mark_synced(path, content)
    }

    /// An upload failed; last-synced content is unchanged.
    pub fn upload_failed(&mut self, path: &str) -> SyncStatus {
        let record = self.record_mut(path);
        record.status = SyncStatus::Modified;
        record.status
    }

    /// Document closed: forget its session.
    pub fn close(&mut self, path: &str) {
        self.records.remove(path);
        if self.active.as_deref() == Some(path) {
            self.active = None;
        }
    }

    /// Switch the active document and return what the indicator should show.
    pub fn set_active(&mut self, path: Option<&str>) -> Option<SyncStatus> {
        self.active = path.map(str::to_string);
        self.indicator()
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Indicator state: hidden (`None`) unless the active document is managed.
    pub fn indicator(&self) -> Option<SyncStatus> {
        self.active.as_deref().and_then(|p| self.status(p))
    }

    /// Drop every session (process shutdown).
    pub fn clear(&mut self) {
        self.records.clear();
        self.active = None;
    }

    fn record_mut(&mut self, path: &str) -> &mut SessionRecord {
        self.records
            .entry(path.to_string())
            .or_insert_with(|| SessionRecord {
                last_synced: None,
                status: SyncStatus::Modified,
            })
    }
}

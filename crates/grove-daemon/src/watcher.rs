//! File watcher for the working directory.
//!
//! Uses notify-debouncer-mini and reports only managed grovebooks:
//! `<origin>/<encoded path>.grove.md`. Backups and anything else are ignored.

use anyhow::Result;
use grove_core::path_codec;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Debounce window for raw filesystem events.
pub const WATCH_DEBOUNCE: Duration = Duration::from_millis(200);

/// File event from the watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    /// Path relative to the working directory, `/`-separated
    pub path: String,
    pub kind: FileEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// Created or written
    Modified,
    Deleted,
}

/// Last seen mtime per file; filters events that did not change the file.
type MtimeCache = Arc<Mutex<HashMap<String, SystemTime>>>;

/// Watches the working directory for grovebook writes.
pub struct FileWatcher {
    workdir: PathBuf,
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<FileEvent>,
}

impl FileWatcher {
    pub fn new(workdir: PathBuf) -> Result<Self> {
        // FSEvents on macOS needs the real path (/var → /private/var)
        let workdir = workdir.canonicalize().unwrap_or(workdir);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let root = workdir.clone();
        let mtime_cache: MtimeCache = Arc::new(Mutex::new(HashMap::new()));

        let mut debouncer = new_debouncer(
            WATCH_DEBOUNCE,
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        if let Some(file_event) = Self::process_event(&event, &root, &mtime_cache) {
                            if event_tx.send(file_event).is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(e) => error!("File watcher error: {}", e),
            },
        )?;

        debouncer
            .watcher()
            .watch(&workdir, RecursiveMode::Recursive)?;

        Ok(Self {
            workdir,
            _debouncer: debouncer,
            event_rx,
        })
    }

    /// Turn a debounced event into a `FileEvent` for managed grovebooks.
    fn process_event(event: &DebouncedEvent, workdir: &Path, mtime_cache: &MtimeCache) -> Option<FileEvent> {
        let relative = managed_relative_path(workdir, &event.path)?;
        let mut cache = mtime_cache.lock().unwrap_or_else(|e| e.into_inner());

        let kind = match std::fs::metadata(&event.path) {
            Ok(metadata) => {
                if let Ok(mtime) = metadata.modified() {
                    if cache.get(&relative) == Some(&mtime) {
                        return None;
                    }
                    cache.insert(relative.clone(), mtime);
                }
                FileEventKind::Modified
            }
            Err(_) => {
                cache.remove(&relative);
                FileEventKind::Deleted
            }
        };

        debug!("File event: {:?} - {}", kind, relative);
        Some(FileEvent {
            path: relative,
            kind,
        })
    }

    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<FileEvent> {
        &mut self.event_rx
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }
}

/// Relative path of `path` if it is a managed grovebook under `workdir`.
pub fn managed_relative_path(workdir: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(workdir).ok()?;
    let segments: Vec<&str> = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<_>>()?;
    if segments.iter().any(|s| s.starts_with('.')) {
        return None;
    }
    let relative = segments.join("/");
    path_codec::decode_relative(&relative).ok()?;
    Some(relative)
}

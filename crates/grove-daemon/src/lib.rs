//! grove-daemon library: Exposes the daemon components for testing.
//!
//! This is a thin library layer under the `grove-daemon` binary,
//! allowing integration tests to access internal types.

pub mod autosync;
pub mod config;
pub mod daemon;
pub mod http;
pub mod keystore;
pub mod message;
pub mod native_fs;
pub mod reload;
pub mod watcher;

// Re-export key types for convenience
pub use autosync::{AutoSync, AUTO_SYNC_DELAY};
pub use config::{Config, ConfigError, JsonSettings};
pub use daemon::{ChannelBridge, Daemon};
pub use http::HttpGroveApi;
pub use keystore::FileCredentialStore;
pub use message::{ReloadNotice, ReloadRequest};
pub use native_fs::NativeFs;
pub use reload::{ReloadChannels, ReloadConfig, ReloadError, ReloadEvent};
pub use watcher::{FileEvent, FileEventKind, FileWatcher};

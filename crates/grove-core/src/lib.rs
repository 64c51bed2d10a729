//! grove-core: Editor bridge for remote grovebook documents.
//!
//! This crate provides the core functionality for:
//! - Converting between the remote block model and local markdown text
//! - Mapping remote files to local paths and back
//! - Choosing the upload format from the server's module version
//! - Tracking per-document sync state for the status indicator
//! - Credential storage and the legacy key migration
//! - FileSystem, GroveApi and ReloadSignal trait abstractions

pub mod bridge;
pub mod credentials;
pub mod document;
pub mod events;
pub mod fs;
pub mod markdown;
pub mod path_codec;
pub mod remote;
pub mod session;
pub mod uri;
pub mod version;

pub use bridge::{Bridge, BridgeError, BridgeOptions, ManagedFile, OpenedDocument, SaveOutcome};
pub use credentials::{
    CredentialError, CredentialStore, MigrationReport, Settings, SettingsStore,
};
pub use document::{Block, CodeBlock, Document};
pub use events::{BridgeEvent, EventBus, Subscription};
pub use fs::{FileEntry, FileSystem, InMemoryFs};
pub use path_codec::RemoteFileRef;
pub use remote::{GroveApi, ModuleInfo, ReloadSignal, RemoteError, Upload};
pub use session::SyncStatus;
pub use uri::OpenRequest;
pub use version::{UploadFormat, Version};

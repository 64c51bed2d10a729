//! Contracts for the remote grove server.
//!
//! Implementations:
//! - `HttpGroveApi` (in grove-daemon) - reqwest client
//! - `ReloadChannels` (in grove-daemon) - WebSocket hot-reload channel
//! - test fakes in `bridge` tests

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// Header carrying the per-server API key.
pub const API_KEY_HEADER: &str = "x-api-key";
/// Module registry endpoint (relative to the origin).
pub const MODULES_PATH: &str = "/api/tempModule/tempModules";
/// Upload endpoint (relative to the origin).
pub const UPLOAD_PATH: &str = "/api/grove/simpleUploadFile";
/// Hot-reload channel path (relative to the origin).
pub const HOT_RELOAD_PATH: &str = "/groveHotReload/";
/// Registry entry whose version gates the upload format.
pub const GROVE_MODULE: &str = "Grove";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Request failed: {0}")]
    Transport(String),

    #[error("Unexpected response: {0}")]
    Decode(String),

    #[error("Reload channel error: {0}")]
    Channel(String),
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// One entry of the module registry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModuleInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Body of the module registry response.
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleList {
    #[serde(default)]
    pub content: Vec<ModuleInfo>,
}

/// Multipart upload of one grovebook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub file_name: String,
    pub project_id: String,
    /// Encoded document: block JSON or native text
    pub data: Vec<u8>,
}

/// HTTP surface of a grove server.
#[async_trait]
pub trait GroveApi: Send + Sync {
    /// `GET {origin}{remote_path}`; returns the raw body.
    async fn fetch_file(&self, origin: &str, remote_path: &str, api_key: &str) -> Result<String>;

    /// `GET {origin}/api/tempModule/tempModules`.
    async fn list_modules(&self, origin: &str, api_key: &str) -> Result<Vec<ModuleInfo>>;

    /// `POST {origin}/api/grove/simpleUploadFile`; any 2xx is success.
    async fn upload_file(&self, origin: &str, api_key: &str, upload: Upload) -> Result<()>;
}

/// Push side of the hot-reload channel.
#[async_trait]
pub trait ReloadSignal: Send + Sync {
    /// Ask the server at `origin` to reload a notebook.
    async fn request_reload(
        &self,
        origin: &str,
        api_key: &str,
        file_name: &str,
        project_id: &str,
    ) -> Result<()>;
}

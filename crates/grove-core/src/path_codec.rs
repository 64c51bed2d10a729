//! Local file identity for remote grovebooks.
//!
//! A remote file `(origin, remote path)` maps to
//! `<workdir>/<encoded origin>/<encoded path>.grove.md`, and back.
//!
//! - Origin: `https://host:8080` → `https__host_8080`
//! - Path: percent-encoded into a single segment (`/` → `%2F`)
//!
//! The origin encoding is ambiguous for hosts ending in `_<digits>`; such
//! hosts decode with a bogus port.

use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Extension of every materialised grovebook.
pub const LOCAL_EXTENSION: &str = ".grove.md";
/// Directory (per origin) holding download snapshots.
pub const BACKUP_DIR: &str = "backups";
/// Every grovebook lives under this remote prefix; the next segment is the project.
pub const REMOTE_FILE_PREFIX: &str = "/api/grove/file/";

const SCHEME_SEP: &str = "__";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathCodecError {
    #[error("Not inside the working directory: {0}")]
    OutsideWorkdir(String),

    #[error("Not a grovebook file: {0}")]
    NotGrovebook(String),

    #[error("Invalid origin segment: {0}")]
    InvalidOrigin(String),

    #[error("Invalid remote path: {0}")]
    InvalidRemotePath(String),
}

pub type Result<T> = std::result::Result<T, PathCodecError>;

/// Identity of a remote grovebook recovered from a local path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileRef {
    /// `scheme://host[:port]`
    pub origin: String,
    /// Full remote path, e.g. `/api/grove/file/abc123/notebooks/demo`
    pub remote_path: String,
    pub project_id: String,
    /// Everything after the project segment, `/`-joined
    pub file_name: String,
}

/// Encode an origin into a single filesystem-safe segment.
pub fn encode_origin(origin: &str) -> Result<String> {
    let origin = origin.trim_end_matches('/');
    let (scheme, authority) = origin
        .split_once("://")
        .ok_or_else(|| PathCodecError::InvalidOrigin(origin.to_string()))?;
    if scheme.is_empty() || authority.is_empty() || authority.contains('/') {
        return Err(PathCodecError::InvalidOrigin(origin.to_string()));
    }
    Ok(format!("{}{}{}", scheme, SCHEME_SEP, authority.replace(':', "_")))
}

/// Inverse of [`encode_origin`].
pub fn decode_origin(segment: &str) -> Result<String> {
    let (scheme, authority) = segment
        .split_once(SCHEME_SEP)
        .ok_or_else(|| PathCodecError::InvalidOrigin(segment.to_string()))?;
    if scheme.is_empty() || authority.is_empty() {
        return Err(PathCodecError::InvalidOrigin(segment.to_string()));
    }

    let authority = match authority.rsplit_once('_') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            format!("{}:{}", host, port)
        }
        _ => authority.to_string(),
    };
    Ok(format!("{}://{}", scheme, authority))
}

/// Encode a remote path into a file name.
pub fn encode_path(remote_path: &str) -> String {
    format!("{}{}", urlencoding::encode(remote_path), LOCAL_EXTENSION)
}

/// Inverse of [`encode_path`].
pub fn decode_path(file_name: &str) -> Result<String> {
    let stem = file_name
        .strip_suffix(LOCAL_EXTENSION)
        .ok_or_else(|| PathCodecError::NotGrovebook(file_name.to_string()))?;
    urlencoding::decode(stem)
        .map(|s| s.into_owned())
        .map_err(|_| PathCodecError::InvalidRemotePath(stem.to_string()))
}

/// Local path of a remote grovebook, relative to the working directory.
pub fn relative_path(origin: &str, remote_path: &str) -> Result<String> {
    Ok(format!("{}/{}", encode_origin(origin)?, encode_path(remote_path)))
}

/// Absolute local path of a remote grovebook.
pub fn local_path(workdir: &Path, origin: &str, remote_path: &str) -> Result<PathBuf> {
    Ok(workdir
        .join(encode_origin(origin)?)
        .join(encode_path(remote_path)))
}

/// Relative path of a timestamped backup for a download.
pub fn backup_path(origin: &str, remote_path: &str, timestamp: &str) -> Result<String> {
    let encoded = urlencoding::encode(remote_path);
    Ok(format!(
        "{}/{}/{}.{}{}",
        encode_origin(origin)?,
        BACKUP_DIR,
        encoded,
        timestamp,
        LOCAL_EXTENSION
    ))
}

/// Recover remote identity from a path relative to the working directory.
pub fn decode_relative(relative: &str) -> Result<RemoteFileRef> {
    let relative = relative.trim_start_matches('/');
    let (origin_segment, file_name) = relative
        .split_once('/')
        .ok_or_else(|| PathCodecError::NotGrovebook(relative.to_string()))?;
    if file_name.contains('/') {
        // Backups and anything else nested deeper are not managed documents
        return Err(PathCodecError::NotGrovebook(relative.to_string()));
    }

    let origin = decode_origin(origin_segment)?;
    let remote_path = decode_path(file_name)?;
    let (project_id, file_name) = split_remote_path(&remote_path)?;

    Ok(RemoteFileRef {
        origin,
        remote_path,
        project_id,
        file_name,
    })
}

/// Recover remote identity from an absolute local path.
pub fn decode(workdir: &Path, local: &Path) -> Result<RemoteFileRef> {
    let relative = local
        .strip_prefix(workdir)
        .map_err(|_| PathCodecError::OutsideWorkdir(local.display().to_string()))?;

    let segments: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    decode_relative(&segments.join("/"))
}

/// Split `/api/grove/file/{projectId}/{fileName...}`.
pub fn split_remote_path(remote_path: &str) -> Result<(String, String)> {
    let rest = remote_path
        .strip_prefix(REMOTE_FILE_PREFIX)
        .ok_or_else(|| PathCodecError::InvalidRemotePath(remote_path.to_string()))?;
    match rest.split_once('/') {
        Some((project, file)) if !project.is_empty() && !file.is_empty() => {
            Ok((project.to_string(), file.to_string()))
        }
        _ => Err(PathCodecError::InvalidRemotePath(remote_path.to_string())),
    }
}

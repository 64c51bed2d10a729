//! Version-gated choice of upload format.
//!
//! Servers at or above [`NATIVE_MARKDOWN_MIN_VERSION`] store grovebooks as
//! native markdown; older servers need the legacy block JSON. The server's
//! version is probed once per origin and cached for the life of the process.

use crate::remote::{GroveApi, GROVE_MODULE};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Three-component numeric version. Ordering is major, then minor, then patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

/// First server version that accepts native markdown uploads.
pub const NATIVE_MARKDOWN_MIN_VERSION: Version = Version::new(2, 0, 0);

/// Assumed when the probe fails; always selects legacy JSON.
pub const BASELINE_VERSION: Version = Version::new(0, 0, 0);

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Lenient parse: missing or non-numeric components count as zero and
    /// anything after a component's leading digits is ignored (`2.1.0-rc1`).
    pub fn parse(s: &str) -> Self {
        let mut parts = s.trim().trim_start_matches('v').split('.').map(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse::<u64>().unwrap_or(0)
        });
        Self {
            major: parts.next().unwrap_or(0),
            minor: parts.next().unwrap_or(0),
            patch: parts.next().unwrap_or(0),
        }
    }

    pub fn at_least(&self, min: &Version) -> bool {
        self >= min
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// How a grovebook is sent to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadFormat {
    /// Local text uploaded as-is
    NativeText,
    /// Local text encoded to block JSON
    LegacyJson,
}

impl UploadFormat {
    pub fn for_version(version: &Version) -> Self {
        if version.at_least(&NATIVE_MARKDOWN_MIN_VERSION) {
            UploadFormat::NativeText
        } else {
            UploadFormat::LegacyJson
        }
    }
}

/// Per-origin cache of probed server versions.
///
/// Only successful probes are cached; entries are never invalidated.
#[derive(Default)]
pub struct VersionCache {
    versions: Mutex<HashMap<String, Version>>,
}

impl VersionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached version for an origin, if a probe has succeeded.
    pub fn cached(&self, origin: &str) -> Option<Version> {
        self.versions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(origin)
            .copied()
    }

    /// Version of the `Grove` module on `origin`, probing on first use.
    pub async fn server_version<A: GroveApi + ?Sized>(
        &self,
        api: &A,
        origin: &str,
        api_key: &str,
    ) -> Version {
        if let Some(version) = self.cached(origin) {
            return version;
        }

        let probed = match api.list_modules(origin, api_key).await {
            Ok(modules) => match modules.into_iter().find(|m| m.name == GROVE_MODULE) {
                Some(module) => Some(Version::parse(&module.version)),
                None => {
                    warn!("{} reports no {} module", origin, GROVE_MODULE);
                    None
                }
            },
            Err(e) => {
                warn!("Version probe failed for {}: {}", origin, e);
                None
            }
        };

        match probed {
            Some(version) => {
                info!("{} runs {} {}", origin, GROVE_MODULE, version);
                self.versions
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(origin.to_string(), version);
                version
            }
            None => {
                debug!("Assuming baseline version {} for {}", BASELINE_VERSION, origin);
                BASELINE_VERSION
            }
        }
    }

    /// Pick the upload format for `origin`.
    pub async fn resolve_format<A: GroveApi + ?Sized>(
        &self,
        api: &A,
        origin: &str,
        api_key: &str,
    ) -> UploadFormat {
        UploadFormat::for_version(&self.server_version(api, origin, api_key).await)
    }
}

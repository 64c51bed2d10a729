//! Deep-link parsing.
//!
//! `grovebook://open?open=/api/grove/file/abc/demo&baseUrl=https://host`
//! Only the query string matters; scheme and host of the link are ignored.

use thiserror::Error;
use url::Url;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UriError {
    #[error("Invalid link: {0}")]
    Invalid(String),

    #[error("Link has no baseUrl parameter")]
    MissingBaseUrl,
}

/// A parsed open request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    /// Server origin, without trailing slash
    pub origin: String,
    /// Remote file path
    pub remote_path: String,
    /// Set when this link is a re-dispatch after focusing another window
    pub retry: bool,
}

/// Parse a deep link.
///
/// Returns `Ok(None)` when the link carries no `open` parameter (a no-op).
pub fn parse_open_link(link: &str) -> Result<Option<OpenRequest>, UriError> {
    let url = Url::parse(link).map_err(|e| UriError::Invalid(format!("{}: {}", link, e)))?;

    let mut open = None;
    let mut base_url = None;
    let mut retry = false;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "open" if !value.is_empty() => open = Some(value.into_owned()),
            "baseUrl" if !value.is_empty() => base_url = Some(value.into_owned()),
            "retry" => retry = value == "true" || value == "1",
            _ => {}
        }
    }

    let Some(remote_path) = open else {
        return Ok(None);
    };
    let origin = base_url.ok_or(UriError::MissingBaseUrl)?;

    Ok(Some(OpenRequest {
        origin: origin.trim_end_matches('/').to_string(),
        remote_path,
        retry,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_link() {
        let request = parse_open_link(
            "grovebook://open?open=%2Fapi%2Fgrove%2Ffile%2Fabc%2Fdemo&baseUrl=http%3A%2F%2Flocalhost%3A3000%2F",
        )
        .unwrap()
        .unwrap();

        assert_eq!(request.origin, "http://localhost:3000");
        assert_eq!(request.remote_path, "/api/grove/file/abc/demo");
        assert!(!request.retry);
    }

    #[test]
    fn test_retry_flag() {
        let request =
            parse_open_link("vscode://kineviz.grove/open?open=/x&baseUrl=https://h&retry=true")
                .unwrap()
                .unwrap();
        assert!(request.retry);
    }

    #[test]
    fn test_missing_open_is_noop() {
        assert_eq!(parse_open_link("grovebook://open?baseUrl=https://h"), Ok(None));
    }

    #[test]
    fn test_missing_base_url_is_error() {
        assert_eq!(
            parse_open_link("grovebook://open?open=/x"),
            Err(UriError::MissingBaseUrl)
        );
    }

    #[test]
    fn test_garbage_is_invalid() {
        assert!(matches!(parse_open_link("not a link"), Err(UriError::Invalid(_))));
    }
}

//! Plain `http://` and `https://` links.

use crate::utils::error::{MetadataIndexerError, Result};
use url::Url;

/// Whether `link` is an absolute HTTP(S) URL with a host.
#[must_use]
pub fn is_http(link: &str) -> bool {
    (link.starts_with("http://") || link.starts_with("https://")) && parse(link).is_ok()
}

/// Parses an absolute HTTP(S) URL.
///
/// # Errors
///
/// `InvalidPrefix` for another scheme, `InvalidUri` when the URL does not
/// parse or has no host.
pub fn parse(link: &str) -> Result<Url> {
    if !(link.starts_with("http://") || link.starts_with("https://")) {
        return Err(MetadataIndexerError::InvalidPrefix(link.to_string()));
    }
    let url = Url::parse(link).map_err(|e| MetadataIndexerError::InvalidUri(format!("{link}: {e}")))?;
    if url.host_str().map_or(true, str::is_empty) {
        return Err(MetadataIndexerError::InvalidUri(link.to_string()));
    }
    Ok(url)
}

//! `sha256://<hex-hash>/<percent-encoded-url>` links (TZIP-16).

use crate::utils::error::{MetadataIndexerError, Result};

/// Scheme prefix of content-addressed links.
pub const PREFIX: &str = "sha256://";

/// Parsed `sha256://` link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sha256Uri {
    /// Hash exactly as written in the link (usually `0x`-prefixed hex).
    pub hash: String,
    /// Decoded inner URL.
    pub link: String,
}

impl Sha256Uri {
    /// Parses a `sha256://` link.
    ///
    /// # Errors
    ///
    /// `InvalidPrefix` for another scheme, `InvalidUri` when the hash or the
    /// inner URL is missing or undecodable.
    pub fn parse(link: &str) -> Result<Self> {
        let rest = link
            .strip_prefix(PREFIX)
            .ok_or_else(|| MetadataIndexerError::InvalidPrefix(link.to_string()))?;

        let (hash, encoded) = rest
            .split_once('/')
            .ok_or_else(|| MetadataIndexerError::InvalidUri(link.to_string()))?;
        if hash.is_empty() || encoded.is_empty() {
            return Err(MetadataIndexerError::InvalidUri(link.to_string()));
        }

        let decoded = urlencoding::decode(encoded)
            .map_err(|e| MetadataIndexerError::InvalidUri(format!("{link}: {e}")))?;

        Ok(Self {
            hash: hash.to_string(),
            link: decoded.into_owned(),
        })
    }

    /// The hash as lowercase hex without `0x`.
    #[must_use]
    pub fn normalized_hash(&self) -> String {
        self.hash
            .strip_prefix("0x")
            .unwrap_or(&self.hash)
            .to_ascii_lowercase()
    }
}

//! `sha256://` adapter: fetch over HTTP and verify the content hash.

use super::http::HttpAdapter;
use crate::uri::sha256::{self, Sha256Uri};
use crate::utils::error::{MetadataIndexerError, Result};
use sha2::{Digest, Sha256};

/// Payload returned when the hash is already known.
pub const ALREADY_KNOWN: &[u8] = b"{}";

pub struct Sha256Adapter {
    http: HttpAdapter,
    expected_hash: Option<String>,
}

impl Sha256Adapter {
    #[must_use]
    pub fn new(http: HttpAdapter, expected_hash: Option<String>) -> Self {
        Self {
            http,
            expected_hash,
        }
    }

    #[must_use]
    pub fn matches(link: &str) -> bool {
        link.starts_with(sha256::PREFIX)
    }

    /// Fetches the inner URL unless its hash equals the configured one.
    ///
    /// # Errors
    ///
    /// Parser and HTTP errors, or `HashMismatch` when the body does not
    /// hash to the value in the link.
    pub async fn resolve(&self, link: &str) -> Result<Vec<u8>> {
        let uri = Sha256Uri::parse(link)?;

        if self.expected_hash.as_deref() == Some(uri.hash.as_str()) {
            return Ok(ALREADY_KNOWN.to_vec());
        }

        let body = self.http.resolve(&uri.link).await?;

        let actual = hex::encode(Sha256::digest(&body));
        if actual != uri.normalized_hash() {
            return Err(MetadataIndexerError::HashMismatch {
                expected: uri.hash,
                actual: format!("0x{actual}"),
            });
        }
        Ok(body)
    }
}

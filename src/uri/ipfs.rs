//! `ipfs://<cid>[/<path>]` links and CID extraction.

use crate::utils::error::{MetadataIndexerError, Result};
use regex::bytes::Regex as BytesRegex;
use regex::Regex;
use std::sync::OnceLock;

/// Scheme prefix of IPFS links.
pub const PREFIX: &str = "ipfs://";

fn cid_regex() -> &'static Regex {
    static CID: OnceLock<Regex> = OnceLock::new();
    CID.get_or_init(|| {
        Regex::new(r"^(Qm[1-9A-HJ-NP-Za-km-z]{44}|baf[a-z2-7]{56})$").expect("valid CID regex")
    })
}

fn cid_v0_regex() -> &'static BytesRegex {
    static CID_V0: OnceLock<BytesRegex> = OnceLock::new();
    CID_V0.get_or_init(|| BytesRegex::new(r"Qm[1-9A-HJ-NP-Za-km-z]{44}").expect("valid CIDv0 regex"))
}

/// Parsed IPFS link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpfsLink {
    pub cid: String,
    /// Path inside the DAG including the leading `/`, or empty.
    pub path: String,
}

impl IpfsLink {
    /// `<cid><path>`, the part appended to `<gateway>/ipfs/`.
    #[must_use]
    pub fn target(&self) -> String {
        format!("{}{}", self.cid, self.path)
    }
}

/// Whether `cid` is a CIDv0 (`Qm…`) or a base32 CIDv1 (`baf…`).
#[must_use]
pub fn is_cid(cid: &str) -> bool {
    cid_regex().is_match(cid)
}

/// Parses an `ipfs://` link.
///
/// # Errors
///
/// `InvalidPrefix` when the scheme is not `ipfs://`, `InvalidCid` when the
/// first path segment is not a CID.
pub fn parse(link: &str) -> Result<IpfsLink> {
    let rest = link
        .strip_prefix(PREFIX)
        .ok_or_else(|| MetadataIndexerError::InvalidPrefix(link.to_string()))?;

    let (cid, path) = match rest.find('/') {
        Some(pos) => (&rest[..pos], &rest[pos..]),
        None => (rest, ""),
    };

    if !is_cid(cid) {
        return Err(MetadataIndexerError::InvalidCid(link.to_string()));
    }

    Ok(IpfsLink {
        cid: cid.to_string(),
        path: path.trim_end_matches('/').to_string(),
    })
}

/// Extracts the CID of an `ipfs://` link.
///
/// # Errors
///
/// See [`parse`].
pub fn cid(link: &str) -> Result<String> {
    parse(link).map(|l| l.cid)
}

/// Whether `link` is an `ipfs://` link with a valid CID.
#[must_use]
pub fn is_ipfs(link: &str) -> bool {
    parse(link).is_ok()
}

/// Every distinct CIDv0 occurring anywhere in `data`, in order of appearance.
#[must_use]
pub fn find_cids(data: &[u8]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for found in cid_v0_regex().find_iter(data) {
        let cid = String::from_utf8_lossy(found.as_bytes()).into_owned();
        if !out.contains(&cid) {
            out.push(cid);
        }
    }
    out
}

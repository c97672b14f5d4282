//! Parsers for the link schemes found in metadata big maps.
//!
//! Every parser returns a typed value or one of `InvalidPrefix`,
//! `InvalidUri` and `InvalidCid`; none of them panics on malformed input.

pub mod http;
pub mod ipfs;
pub mod sha256;
pub mod tezos_storage;

pub use ipfs::IpfsLink;
pub use sha256::Sha256Uri;
pub use tezos_storage::TezosStorageUri;

/// Whether `link` is an absolute URI of any scheme.
///
/// Token records whose link fails this check carry inline metadata only.
#[must_use]
pub fn is_valid_uri(link: &str) -> bool {
    !link.is_empty() && url::Url::parse(link).is_ok()
}

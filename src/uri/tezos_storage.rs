//! `tezos-storage:` links (TZIP-16).
//!
//! Two forms are accepted:
//!
//! * `tezos-storage:<key>`
//! * `tezos-storage://<address>[.<network>]/<key>`
//!
//! The key is percent-decoded. Missing address and network are filled in
//! from the record that carries the link.

use crate::utils::error::{MetadataIndexerError, Result};

/// Scheme prefix of on-chain storage links.
pub const PREFIX: &str = "tezos-storage:";

const ADDRESS_LENGTH: usize = 36;
const ADDRESS_PREFIXES: [&str; 4] = ["KT", "tz1", "tz2", "tz3"];

/// Parsed `tezos-storage:` link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TezosStorageUri {
    pub address: String,
    pub network: String,
    pub key: String,
}

/// Whether `address` looks like a Tezos account or contract address.
#[must_use]
pub fn is_address(address: &str) -> bool {
    address.len() == ADDRESS_LENGTH && ADDRESS_PREFIXES.iter().any(|p| address.starts_with(p))
}

impl TezosStorageUri {
    /// Parses a `tezos-storage:` link.
    ///
    /// # Errors
    ///
    /// `InvalidPrefix` for another scheme, `InvalidUri` for a malformed host
    /// or an empty or undecodable key.
    pub fn parse(link: &str) -> Result<Self> {
        let rest = link
            .strip_prefix(PREFIX)
            .ok_or_else(|| MetadataIndexerError::InvalidPrefix(link.to_string()))?;

        let mut uri = TezosStorageUri::default();

        let raw_key = if let Some(authority) = rest.strip_prefix("//") {
            let (host, key) = authority
                .split_once('/')
                .ok_or_else(|| MetadataIndexerError::InvalidUri(link.to_string()))?;
            uri.parse_host(host, link)?;
            key
        } else {
            rest
        };

        let key = urlencoding::decode(raw_key)
            .map_err(|e| MetadataIndexerError::InvalidUri(format!("{link}: {e}")))?;
        if key.is_empty() {
            return Err(MetadataIndexerError::InvalidUri(link.to_string()));
        }
        uri.key = key.into_owned();

        Ok(uri)
    }

    fn parse_host(&mut self, host: &str, link: &str) -> Result<()> {
        if host.is_empty() {
            return Ok(());
        }

        let (address, network) = match host.split_once('.') {
            Some((address, network)) => (address, network),
            None => (host, ""),
        };

        if !is_address(address) {
            return Err(MetadataIndexerError::InvalidUri(format!(
                "{link}: invalid address {address}"
            )));
        }

        self.address = address.to_string();
        self.network = network.to_string();
        Ok(())
    }

    /// Fills absent address and network from the record's own context.
    pub fn fill(&mut self, network: &str, address: &str) {
        if self.network.is_empty() {
            self.network = network.to_string();
        }
        if self.address.is_empty() {
            self.address = address.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDRESS: &str = "KT1QDFEu8JijYbsJqzoXq7mKvfaQQamHD1kX";

    #[test]
    fn test_parse_key_only() {
        let uri = TezosStorageUri::parse("tezos-storage:hello").unwrap();
        assert_eq!(
            uri,
            TezosStorageUri {
                address: String::new(),
                network: String::new(),
                key: "hello".into()
            }
        );
    }

    #[test]
    fn test_parse_with_address() {
        let uri = TezosStorageUri::parse(&format!("tezos-storage://{ADDRESS}/foo")).unwrap();
        assert_eq!(uri.address, ADDRESS);
        assert_eq!(uri.network, "");
        assert_eq!(uri.key, "foo");
    }

    #[test]
    fn test_parse_encoded_key() {
        let uri = TezosStorageUri::parse(&format!("tezos-storage://{ADDRESS}/%2Ffoo")).unwrap();
        assert_eq!(uri.address, ADDRESS);
        assert_eq!(uri.key, "/foo");
    }

    #[test]
    fn test_parse_with_network() {
        let uri =
            TezosStorageUri::parse(&format!("tezos-storage://{ADDRESS}.mainnet/%2Ffoo")).unwrap();
        assert_eq!(uri.address, ADDRESS);
        assert_eq!(uri.network, "mainnet");
        assert_eq!(uri.key, "/foo");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            TezosStorageUri::parse("ipfs://hello"),
            Err(MetadataIndexerError::InvalidPrefix(_))
        ));
        assert!(matches!(
            TezosStorageUri::parse("tezos-storage:"),
            Err(MetadataIndexerError::InvalidUri(_))
        ));
        assert!(matches!(
            TezosStorageUri::parse("tezos-storage://KT1short/foo"),
            Err(MetadataIndexerError::InvalidUri(_))
        ));
        assert!(matches!(
            TezosStorageUri::parse(&format!("tezos-storage://{ADDRESS}")),
            Err(MetadataIndexerError::InvalidUri(_))
        ));
    }

    #[test]
    fn test_fill_keeps_explicit_values() {
        let mut uri = TezosStorageUri::parse("tezos-storage:contents").unwrap();
        uri.fill("mainnet", ADDRESS);
        assert_eq!(uri.network, "mainnet");
        assert_eq!(uri.address, ADDRESS);

        let mut uri =
            TezosStorageUri::parse(&format!("tezos-storage://{ADDRESS}.ghostnet/k")).unwrap();
        uri.fill("mainnet", "KT1Other");
        assert_eq!(uri.network, "ghostnet");
        assert_eq!(uri.address, ADDRESS);
    }

    #[test]
    fn test_is_address() {
        assert!(is_address(ADDRESS));
        assert!(is_address("tz1VSUr8wwNhLAzempoch5d6hLRiTh8Cjcjb"));
        assert!(!is_address("tz4VSUr8wwNhLAzempoch5d6hLRiTh8Cjcjb"));
        assert!(!is_address("KT1"));
    }
}

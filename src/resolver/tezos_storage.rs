//! `tezos-storage:` adapter backed by the context store.

use crate::core::context::SharedContext;
use crate::uri::tezos_storage::{self, TezosStorageUri};
use crate::utils::error::{MetadataIndexerError, Result};

pub struct TezosStorageAdapter {
    context: SharedContext,
}

impl TezosStorageAdapter {
    #[must_use]
    pub fn new(context: SharedContext) -> Self {
        Self { context }
    }

    #[must_use]
    pub fn matches(link: &str) -> bool {
        link.starts_with(tezos_storage::PREFIX)
    }

    /// Looks the key up, defaulting network and address to the caller's.
    ///
    /// # Errors
    ///
    /// `TezosStorageKeyNotFound` when the context has no such key.
    pub async fn resolve(&self, network: &str, address: &str, link: &str) -> Result<Vec<u8>> {
        let mut uri = TezosStorageUri::parse(link)?;
        uri.fill(network, address);

        let context = self.context.read().await;
        context
            .get(&uri.network, &uri.address, &uri.key)
            .map(|item| item.value.clone())
            .ok_or_else(|| {
                MetadataIndexerError::TezosStorageKeyNotFound(format!(
                    "{}:{}:{}",
                    uri.network, uri.address, uri.key
                ))
            })
    }
}

//! Domain and wire types.

pub mod models;
pub mod tzkt;

pub use models::{
    context_key, index_name, ContextItem, ContractMetadata, IndexState, LevelChanges,
    MetadataKind, Status, TokenMetadata,
};
pub use tzkt::{Alias, BigMapAction, BigMapContent, BigMapUpdate, Block, Head, Message, TokenInfoValue};

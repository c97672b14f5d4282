//! Turns big-map updates into metadata records or context writes.

use super::context::Context;
use crate::types::models::{ContractMetadata, IndexState, LevelChanges, Status, TokenMetadata};
use crate::types::tzkt::{BigMapAction, BigMapContent, BigMapUpdate, Message, TokenInfoValue};
use crate::uri;
use crate::utils::counter::Counter;
use crate::utils::error::{MetadataIndexerError, Result};
use crate::utils::escape::{sanitize_value, strip_control};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Script expression hash of the empty string key.
///
/// Under the `metadata` big map this key holds the metadata URI; every
/// other key holds on-chain storage addressed by `tezos-storage:` links.
pub const EMPTY_KEY_HASH: &str = "expru5X1yxJG6ezR2uHMotwMLNmSzQyh5t1vUnhjx4cS6Pv9qE1Sdo";

/// Result of interpreting one update.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Contract(ContractMetadata),
    Token(TokenMetadata),
    /// The context store changed.
    Context,
    Skipped,
}

pub struct Interpreter {
    network: String,
    contract_counter: Arc<Counter>,
    token_counter: Arc<Counter>,
}

fn is_link_key(content: &BigMapContent) -> bool {
    content.hash == EMPTY_KEY_HASH || content.key_string().is_empty()
}

/// Hex string to UTF-8, `None` when either step fails.
fn decode_hex_utf8(raw: &str) -> Option<String> {
    let bytes = hex::decode(raw).ok()?;
    String::from_utf8(bytes).ok()
}

impl Interpreter {
    #[must_use]
    pub fn new(
        network: impl Into<String>,
        contract_counter: Arc<Counter>,
        token_counter: Arc<Counter>,
    ) -> Self {
        Self {
            network: network.into(),
            contract_counter,
            token_counter,
        }
    }

    #[must_use]
    pub fn network(&self) -> &str {
        &self.network
    }

    /// Interprets one update, mutating `context` for storage keys.
    ///
    /// # Errors
    ///
    /// `DecodingError` for malformed values.
    pub fn interpret(&self, update: &BigMapUpdate, context: &mut Context) -> Result<Outcome> {
        let Some(content) = &update.content else {
            return Ok(Outcome::Skipped);
        };

        match update.terminal_path() {
            "metadata" => self.contract_metadata(update, content, context),
            "token_metadata" => self.token_metadata(update, content),
            _ => Ok(Outcome::Skipped),
        }
    }

    fn contract_metadata(
        &self,
        update: &BigMapUpdate,
        content: &BigMapContent,
        context: &mut Context,
    ) -> Result<Outcome> {
        if !is_link_key(content) {
            if update.action == BigMapAction::RemoveKey {
                context.remove(&self.network, &update.contract.address, &content.key_string());
                return Ok(Outcome::Context);
            }
            return Ok(if context.add(update, &self.network)? {
                Outcome::Context
            } else {
                Outcome::Skipped
            });
        }

        if !matches!(update.action, BigMapAction::AddKey | BigMapAction::UpdateKey) {
            return Ok(Outcome::Skipped);
        }

        let raw = match &content.value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let link = decode_hex_utf8(raw.trim_matches('"')).ok_or_else(|| {
            MetadataIndexerError::DecodingError(format!(
                "metadata link of {} is not hex-encoded UTF-8",
                update.contract.address
            ))
        })?;

        Ok(Outcome::Contract(ContractMetadata::new(
            &self.network,
            &update.contract.address,
            &strip_control(&link),
            self.contract_counter.increment(),
        )))
    }

    fn token_metadata(&self, update: &BigMapUpdate, content: &BigMapContent) -> Result<Outcome> {
        if !matches!(update.action, BigMapAction::AddKey | BigMapAction::UpdateKey) {
            return Ok(Outcome::Skipped);
        }

        let value: TokenInfoValue = serde_json::from_value(content.value.clone()).map_err(|e| {
            MetadataIndexerError::DecodingError(format!(
                "token_metadata value of {}: {e}",
                update.contract.address
            ))
        })?;
        let token_id: u64 = value.token_id.parse().map_err(|_| {
            MetadataIndexerError::DecodingError(format!("token id {:?}", value.token_id))
        })?;

        let mut link = String::new();
        let mut fields = Map::new();
        for (key, raw) in value.token_info {
            let decoded = decode_hex_utf8(&raw);
            if key.is_empty() {
                if let Some(decoded) = decoded {
                    link = strip_control(&decoded).into_owned();
                }
                continue;
            }
            fields.insert(key, Value::String(decoded.unwrap_or(raw)));
        }
        let mut metadata = Value::Object(fields);
        sanitize_value(&mut metadata);

        let mut record = TokenMetadata::new(
            &self.network,
            &update.contract.address,
            token_id,
            &link,
            self.token_counter.increment(),
        );
        record.metadata = Some(metadata);
        if !uri::is_valid_uri(&record.link) {
            record.status = Status::Applied;
        }
        Ok(Outcome::Token(record))
    }

    /// Interprets a whole scanner message into the changes of its level.
    ///
    /// Undecodable updates are logged and skipped so one bad value never
    /// blocks the cursor.
    pub fn interpret_message(&self, message: &Message, context: &mut Context) -> LevelChanges {
        let mut state = IndexState::new(&self.network);
        state.level = message.level;
        let mut changes = LevelChanges::new(state);

        for update in &message.body {
            match self.interpret(update, context) {
                Ok(Outcome::Contract(record)) => changes.push_contract(record),
                Ok(Outcome::Token(record)) => changes.push_token(record),
                Ok(Outcome::Context | Outcome::Skipped) => {}
                Err(e) => tracing::warn!(
                    network = %self.network,
                    level = message.level,
                    id = update.id,
                    contract = %update.contract.address,
                    error = %e,
                    "Skipping update"
                ),
            }
        }
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tzkt::Alias;
    use serde_json::json;

    const ADDRESS: &str = "KT1G1cCRNBgQ48mVDjopHjEmTN5Sbtar8nn9";
    const ICON: &str = "ipfs://QmNrhZHUaEqxhyLfqoq1mtHSipkWHeT31LNHb1QEbDHgnc";

    fn interpreter() -> Interpreter {
        Interpreter::new("mainnet", Arc::new(Counter::new(0)), Arc::new(Counter::new(0)))
    }

    fn update(path: &str, action: BigMapAction, hash: &str, key: Value, value: Value) -> BigMapUpdate {
        BigMapUpdate {
            id: 1,
            level: 100,
            timestamp: None,
            bigmap: 1,
            contract: Alias {
                alias: None,
                address: ADDRESS.into(),
            },
            path: path.into(),
            action,
            content: Some(BigMapContent {
                hash: hash.into(),
                key,
                value,
            }),
            tags: None,
        }
    }

    fn contract_link(link: &str) -> BigMapUpdate {
        update(
            "metadata",
            BigMapAction::AddKey,
            EMPTY_KEY_HASH,
            json!(""),
            json!(hex::encode(link)),
        )
    }

    #[test]
    fn test_hedgehoge_token_info() {
        let value = json!({
            "token_id": "0",
            "token_info": {
                "name": "4865646765686f6765",
                "symbol": "484548",
                "decimals": "36",
                "icon": hex::encode(ICON),
                "test_object": "7b7d"
            }
        });
        let upd = update("assets.token_metadata", BigMapAction::AddKey, "expr", json!("0"), value);

        let outcome = interpreter().interpret(&upd, &mut Context::new()).unwrap();
        let Outcome::Token(token) = outcome else {
            panic!("expected token, got {outcome:?}");
        };
        assert_eq!(token.token_id, 0);
        assert_eq!(token.status, Status::Applied);
        assert_eq!(token.link, "");
        assert_eq!(token.update_id, 1);
        assert_eq!(
            serde_json::to_string(&token.metadata.unwrap()).unwrap(),
            format!(
                r#"{{"decimals":"6","icon":"{ICON}","name":"Hedgehoge","symbol":"HEH","test_object":"{{}}"}}"#
            )
        );
    }

    #[test]
    fn test_token_link_extracted() {
        let value = json!({
            "token_id": "42",
            "token_info": {"": hex::encode(ICON), "name": "4142"}
        });
        let upd = update("token_metadata", BigMapAction::UpdateKey, "expr", json!("42"), value);

        let Outcome::Token(token) = interpreter().interpret(&upd, &mut Context::new()).unwrap()
        else {
            panic!("expected token");
        };
        assert_eq!(token.token_id, 42);
        assert_eq!(token.link, ICON);
        assert_eq!(token.status, Status::New);
        assert_eq!(token.metadata, Some(json!({"name": "AB"})));
    }

    #[test]
    fn test_token_non_hex_kept_and_stripped() {
        let value = json!({
            "token_id": "1",
            "token_info": {"raw": "not hex", "nul": hex::encode("a\u{0000}b")}
        });
        let upd = update("token_metadata", BigMapAction::AddKey, "expr", json!("1"), value);

        let Outcome::Token(token) = interpreter().interpret(&upd, &mut Context::new()).unwrap()
        else {
            panic!("expected token");
        };
        assert_eq!(token.metadata, Some(json!({"raw": "not hex", "nul": "ab"})));
    }

    #[test]
    fn test_token_bad_id() {
        let value = json!({"token_id": "-1", "token_info": {}});
        let upd = update("token_metadata", BigMapAction::AddKey, "expr", json!("x"), value);
        let err = interpreter().interpret(&upd, &mut Context::new()).unwrap_err();
        assert!(matches!(err, MetadataIndexerError::DecodingError(_)));
    }

    #[test]
    fn test_contract_link_creates_record() {
        let interpreter = interpreter();
        let outcome = interpreter
            .interpret(&contract_link("ipfs://QmFoo"), &mut Context::new())
            .unwrap();
        let Outcome::Contract(record) = outcome else {
            panic!("expected contract");
        };
        assert_eq!(record.link, "ipfs://QmFoo");
        assert_eq!(record.status, Status::New);
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.update_id, 1);
    }

    #[test]
    fn test_contract_storage_key_goes_to_context() {
        let mut context = Context::new();
        let upd = update(
            "metadata",
            BigMapAction::AddKey,
            "exprOther",
            json!("contents"),
            json!(hex::encode(r#"{"name":"X"}"#)),
        );

        assert_eq!(interpreter().interpret(&upd, &mut context).unwrap(), Outcome::Context);
        assert_eq!(
            context.get("mainnet", ADDRESS, "contents").unwrap().value,
            br#"{"name":"X"}"#.to_vec()
        );

        let removal = update(
            "metadata",
            BigMapAction::RemoveKey,
            "exprOther",
            json!("contents"),
            Value::Null,
        );
        assert_eq!(interpreter().interpret(&removal, &mut context).unwrap(), Outcome::Context);
        assert!(context.get("mainnet", ADDRESS, "contents").is_none());
        assert_eq!(context.pending(), 0);
    }

    #[test]
    fn test_contract_non_json_storage_skipped() {
        let mut context = Context::new();
        let upd = update(
            "metadata",
            BigMapAction::AddKey,
            "exprOther",
            json!("version"),
            json!(hex::encode("1.0")),
        );
        assert_eq!(interpreter().interpret(&upd, &mut context).unwrap(), Outcome::Skipped);
        assert!(context.is_empty());
    }

    #[test]
    fn test_message_coalesces_and_skips_bad_updates() {
        let interpreter = interpreter();
        let mut bad = contract_link("x");
        bad.content.as_mut().unwrap().value = json!("zz");

        let message = Message {
            level: 100,
            body: vec![
                contract_link("ipfs://QmFirst"),
                bad,
                contract_link("ipfs://QmSecond"),
            ],
        };
        let changes = interpreter.interpret_message(&message, &mut Context::new());

        assert_eq!(changes.state.level, 100);
        assert_eq!(changes.state.index_name, "metadata_mainnet");
        assert_eq!(changes.contracts.len(), 1);
        assert_eq!(changes.contracts[0].link, "ipfs://QmSecond");
        assert_eq!(changes.contracts[0].update_id, 2);
    }
}

//! Token accessor
//!
//! Stores non-native assets (ERC-20 style tokens) per wallet.

use std::sync::Arc;

use serde_json::json;

use crate::engine::EngineFactory;
use crate::error::Result;
use crate::models::Token;
use crate::store::{derive_record_id, selector, EncryptedStore, Entity, StoreOptions};

const SCHEMA_GENERATION: &str = "v1";

impl Entity for Token {
    fn record_id(&self) -> String {
        derive_record_id(&[&self.wallet_id, &self.parent_coin_id, &self.token_id])
    }
}

/// Accessor for the `tokens` table.
pub struct TokenStore {
    store: EncryptedStore<Token>,
}

impl TokenStore {
    /// Open the tokens table. Tokens carry no secret fields.
    pub fn new(factory: Arc<dyn EngineFactory>) -> Result<Self> {
        let store = EncryptedStore::open(
            StoreOptions {
                table: "tokens".to_owned(),
                schema_generation: SCHEMA_GENERATION.to_owned(),
                secret_fields: Vec::new(),
                indexed_fields: vec!["wallet_id".to_owned(), "parent_coin_id".to_owned()],
                cipher: None,
            },
            factory,
        )?;
        Ok(Self { store })
    }

    /// Underlying generic store.
    pub fn store(&self) -> &EncryptedStore<Token> {
        &self.store
    }

    /// Upsert a token.
    pub fn insert(&self, token: &Token) -> Result<()> {
        self.store.insert(token)
    }

    /// All tokens of one wallet.
    pub fn by_wallet(&self, wallet_id: &str) -> Result<Vec<Token>> {
        self.store
            .get_all(Some(selector([("wallet_id", json!(wallet_id))])))
    }

    /// Update the balance of one token.
    pub fn update_balance(
        &self,
        wallet_id: &str,
        parent_coin_id: &str,
        token_id: &str,
        balance: &str,
    ) -> Result<usize> {
        self.store.find_and_update(
            selector([
                ("wallet_id", json!(wallet_id)),
                ("parent_coin_id", json!(parent_coin_id)),
                ("token_id", json!(token_id)),
            ]),
            &selector([("balance", json!(balance))]),
        )
    }
}

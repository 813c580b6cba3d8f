//! Coin accessor
//!
//! Stores the native currency of each network per wallet. Tokens live in
//! [`crate::tokens`]. Both extended public keys are declared secret fields;
//! balance updates are keyed by wallet and coin so they work regardless of
//! the table's encryption state.

use std::sync::Arc;

use serde_json::json;

use crate::cipher::SharedCipher;
use crate::engine::EngineFactory;
use crate::error::Result;
use crate::models::Coin;
use crate::store::{derive_record_id, selector, EncryptedStore, Entity, StoreOptions};

const SCHEMA_GENERATION: &str = "v1";

impl Entity for Coin {
    fn record_id(&self) -> String {
        derive_record_id(&[&self.wallet_id, &self.coin_id])
    }
}

/// Accessor for the `coins` table.
pub struct CoinStore {
    store: EncryptedStore<Coin>,
}

impl CoinStore {
    /// Open the coins table.
    pub fn new(factory: Arc<dyn EngineFactory>, cipher: Option<SharedCipher>) -> Result<Self> {
        let store = EncryptedStore::open(
            StoreOptions {
                table: "coins".to_owned(),
                schema_generation: SCHEMA_GENERATION.to_owned(),
                secret_fields: vec!["xpub".to_owned(), "zpub".to_owned()],
                indexed_fields: vec!["wallet_id".to_owned(), "coin_id".to_owned()],
                cipher,
            },
            factory,
        )?;
        Ok(Self { store })
    }

    /// Underlying generic store.
    pub fn store(&self) -> &EncryptedStore<Coin> {
        &self.store
    }

    /// Upsert a coin.
    pub fn insert(&self, coin: &Coin) -> Result<()> {
        self.store.insert(coin)
    }

    /// All coins of one wallet.
    pub fn by_wallet(&self, wallet_id: &str) -> Result<Vec<Coin>> {
        self.store
            .get_all(Some(selector([("wallet_id", json!(wallet_id))])))
    }

    /// Update the total balance pair of one coin.
    pub fn update_total_balance(
        &self,
        wallet_id: &str,
        coin_id: &str,
        total_balance: &str,
        total_unconfirmed_balance: &str,
    ) -> Result<usize> {
        self.store.find_and_update(
            selector([("wallet_id", json!(wallet_id)), ("coin_id", json!(coin_id))]),
            &selector([
                ("total_balance", json!(total_balance)),
                ("total_unconfirmed_balance", json!(total_unconfirmed_balance)),
            ]),
        )
    }

    /// Update the xpub-chain balance pair of one coin.
    pub fn update_xpub_balance(
        &self,
        wallet_id: &str,
        coin_id: &str,
        xpub_balance: &str,
        xpub_unconfirmed_balance: &str,
    ) -> Result<usize> {
        self.store.find_and_update(
            selector([("wallet_id", json!(wallet_id)), ("coin_id", json!(coin_id))]),
            &selector([
                ("xpub_balance", json!(xpub_balance)),
                ("xpub_unconfirmed_balance", json!(xpub_unconfirmed_balance)),
            ]),
        )
    }

    /// Physically purge every coin of one wallet (they carry xpubs).
    pub fn remove_wallet(&self, wallet_id: &str) -> Result<usize> {
        self.store
            .delete_truly(selector([("wallet_id", json!(wallet_id))]))
    }
}

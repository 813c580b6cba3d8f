//! Address accessor
//!
//! Stores every address of every wallet ever encountered across the chain,
//! with its derivation position when known.

use std::sync::Arc;

use serde_json::json;

use crate::engine::EngineFactory;
use crate::error::Result;
use crate::models::Address;
use crate::store::{derive_record_id, selector, EncryptedStore, Entity, StoreOptions};

const SCHEMA_GENERATION: &str = "v1";

impl Entity for Address {
    fn record_id(&self) -> String {
        derive_record_id(&[&self.wallet_id, &self.address])
    }
}

/// Derivation position of a known address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainIndex {
    /// Chain index (external/change)
    pub chain_index: i32,
    /// Address index within the chain
    pub address_index: i32,
    /// Whether the address is segwit
    pub is_segwit: bool,
}

/// Accessor for the `addresses` table.
pub struct AddressStore {
    store: EncryptedStore<Address>,
}

impl AddressStore {
    /// Open the addresses table.
    pub fn new(factory: Arc<dyn EngineFactory>) -> Result<Self> {
        let store = EncryptedStore::open(
            StoreOptions {
                table: "addresses".to_owned(),
                schema_generation: SCHEMA_GENERATION.to_owned(),
                secret_fields: Vec::new(),
                indexed_fields: vec!["wallet_id".to_owned(), "account_id".to_owned()],
                cipher: None,
            },
            factory,
        )?;
        Ok(Self { store })
    }

    /// Underlying generic store.
    pub fn store(&self) -> &EncryptedStore<Address> {
        &self.store
    }

    /// Upsert an address.
    pub fn insert(&self, address: &Address) -> Result<()> {
        self.store.insert(address)
    }

    /// All addresses of one account.
    pub fn by_account(&self, account_id: &str) -> Result<Vec<Address>> {
        self.store
            .get_all(Some(selector([("account_id", json!(account_id))])))
    }

    /// Derivation position of `address` in `wallet_id`'s records.
    ///
    /// Returns `None` when the address is unknown or its indices carry the
    /// `-1` missing-data sentinel.
    pub fn chain_index(&self, address: &str, wallet_id: &str) -> Result<Option<ChainIndex>> {
        let found = self.store.get_one(selector([
            ("address", json!(address)),
            ("wallet_id", json!(wallet_id)),
        ]))?;

        Ok(found.and_then(|record| {
            if record.chain_index == -1 || record.address_index == -1 {
                return None;
            }
            Some(ChainIndex {
                chain_index: record.chain_index,
                address_index: record.address_index,
                is_segwit: record.is_segwit,
            })
        }))
    }
}

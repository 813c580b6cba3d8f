//! Account accessor
//!
//! Stores derived accounts of all wallets. The extended public key is a
//! declared secret field, ciphered at rest while a passphrase is active, so
//! the derived id carries a hash of the xpub rather than the xpub itself.

use std::sync::Arc;

use serde_json::json;
use sha2::{Digest, Sha256};

use crate::cipher::SharedCipher;
use crate::engine::EngineFactory;
use crate::error::Result;
use crate::models::Account;
use crate::store::{derive_record_id, selector, EncryptedStore, Entity, StoreOptions};

const SCHEMA_GENERATION: &str = "v1";

impl Entity for Account {
    fn record_id(&self) -> String {
        AccountStore::derive_account_id(self)
    }
}

/// Accessor for the `accounts` table.
pub struct AccountStore {
    store: EncryptedStore<Account>,
}

impl AccountStore {
    /// Open the accounts table.
    pub fn new(factory: Arc<dyn EngineFactory>, cipher: Option<SharedCipher>) -> Result<Self> {
        let store = EncryptedStore::open(
            StoreOptions {
                table: "accounts".to_owned(),
                schema_generation: SCHEMA_GENERATION.to_owned(),
                secret_fields: vec!["xpub".to_owned()],
                indexed_fields: vec![
                    "wallet_id".to_owned(),
                    "coin_id".to_owned(),
                    "account_id".to_owned(),
                ],
                cipher,
            },
            factory,
        )?;
        Ok(Self { store })
    }

    /// Underlying generic store.
    pub fn store(&self) -> &EncryptedStore<Account> {
        &self.store
    }

    /// Deterministic account id from the natural key.
    pub fn derive_account_id(account: &Account) -> String {
        let xpub_hash = hex::encode(Sha256::digest(account.xpub.as_bytes()));
        let account_index = account.account_index.to_string();
        derive_record_id(&[
            &account.wallet_id,
            &account.coin_id,
            &xpub_hash,
            account.account_type.as_deref().unwrap_or(""),
            &account_index,
        ])
    }

    /// Upsert an account, stamping its derived id.
    pub fn insert(&self, mut account: Account) -> Result<Account> {
        account.account_id = Some(Self::derive_account_id(&account));
        self.store.insert(&account)?;
        Ok(account)
    }

    /// All accounts of one wallet.
    pub fn by_wallet(&self, wallet_id: &str) -> Result<Vec<Account>> {
        self.store
            .get_all(Some(selector([("wallet_id", json!(wallet_id))])))
    }

    /// Update the balance pair of one account.
    pub fn update_balance(
        &self,
        account_id: &str,
        total_balance: &str,
        total_unconfirmed_balance: &str,
    ) -> Result<usize> {
        self.store.find_and_update(
            selector([("account_id", json!(account_id))]),
            &selector([
                ("total_balance", json!(total_balance)),
                ("total_unconfirmed_balance", json!(total_unconfirmed_balance)),
            ]),
        )
    }

    /// Physically purge every account of one wallet.
    ///
    /// Accounts carry xpubs; on wallet removal they must not survive in
    /// engine history.
    pub fn remove_wallet(&self, wallet_id: &str) -> Result<usize> {
        self.store
            .delete_truly(selector([("wallet_id", json!(wallet_id))]))
    }
}

//! Transaction accessor and reconciler
//!
//! Stores the transaction history of every account. For UTXO-model networks
//! the records also carry inputs and outputs, which the transaction builder
//! reads when selecting spendable funds; the reconciler embedded here keeps
//! that selection safe across concurrent send flows by reserving outputs
//! already committed to an in-flight transaction.
//!
//! Status transitions are `Pending -> Success` or `Pending -> Failure`,
//! terminal otherwise except being superseded by a newer upsert under the
//! same natural key. Reservation and expiry are independent axes: a released
//! output can be re-blocked by a later attempt.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use crate::engine::{EngineFactory, Sorting};
use crate::error::Result;
use crate::models::{OutputRef, Transaction, TransactionStatus};
use crate::store::{derive_record_id, selector, EncryptedStore, Entity, StoreOptions};

const SCHEMA_GENERATION: &str = "v1";

/// Hours a `Pending` transaction may wait for confirmations before the
/// maintenance sweep flips it to `Failure`.
pub const PENDING_TO_FAIL_TIMEOUT_HOURS: i64 = 24;

/// Minutes a UTXO reservation stays active before the sweep returns the
/// outputs to the spendable pool.
pub const UTXO_BLOCK_WINDOW_MINUTES: i64 = 20;

impl Entity for Transaction {
    fn record_id(&self) -> String {
        derive_record_id(&[
            &self.wallet_id,
            &self.account_id,
            &self.hash,
            self.direction.as_str(),
        ])
    }
}

/// Whether `index` of `txn`'s outputs is reserved by an active block.
///
/// Transaction builders must consult this before selecting spendable
/// outputs: an index present with `blocked_at` inside the active window is
/// unspendable.
pub fn output_blocked(txn: &Transaction, index: u32, now: DateTime<Utc>) -> bool {
    match txn.blocked_at {
        Some(at) if now - at < Duration::minutes(UTXO_BLOCK_WINDOW_MINUTES) => {
            txn.blocked_output_indices.contains(&index)
        }
        _ => false,
    }
}

/// Accessor for the `transactions` table.
pub struct TransactionStore {
    store: EncryptedStore<Transaction>,
}

impl TransactionStore {
    /// Open the transactions table.
    pub fn new(factory: Arc<dyn EngineFactory>) -> Result<Self> {
        let store = EncryptedStore::open(
            StoreOptions {
                table: "transactions".to_owned(),
                schema_generation: SCHEMA_GENERATION.to_owned(),
                secret_fields: Vec::new(),
                indexed_fields: vec![
                    "confirmed".to_owned(),
                    "block_height".to_owned(),
                    "account_id".to_owned(),
                    "wallet_id".to_owned(),
                    "hash".to_owned(),
                    "status".to_owned(),
                ],
                cipher: None,
            },
            factory,
        )?;
        Ok(Self { store })
    }

    /// Underlying generic store.
    pub fn store(&self) -> &EncryptedStore<Transaction> {
        &self.store
    }

    /// Upsert a transaction by its derived natural key.
    pub fn insert(&self, txn: &Transaction) -> Result<()> {
        self.store.insert(txn)
    }

    /// One account's history, sorted and paged through a declared index.
    pub fn history(&self, account_id: &str, sorting: Sorting) -> Result<Vec<Transaction>> {
        self.store
            .execute_query(selector([("account_id", json!(account_id))]), Some(sorting))
    }

    /// All records still waiting for confirmations.
    pub fn pending(&self) -> Result<Vec<Transaction>> {
        self.store.get_all(Some(selector([(
            "status",
            json!(TransactionStatus::Pending),
        )])))
    }

    /// Lookup by hash within one account.
    pub fn by_hash(&self, account_id: &str, hash: &str) -> Result<Option<Transaction>> {
        self.store.get_one(selector([
            ("account_id", json!(account_id)),
            ("hash", json!(hash)),
        ]))
    }

    /// Flip every `Pending` record older than the expiry threshold to
    /// `Failure`. Returns the flip count.
    ///
    /// A periodic maintenance sweep: upstream sources sometimes stop
    /// reporting a transaction without ever confirming or rejecting it.
    pub fn fail_expired_txns(&self) -> Result<usize> {
        let cutoff = Utc::now() - Duration::hours(PENDING_TO_FAIL_TIMEOUT_HOURS);
        let mut expired: Vec<Transaction> = self
            .pending()?
            .into_iter()
            .filter(|txn| txn.confirmed < cutoff)
            .collect();
        for txn in &mut expired {
            txn.status = TransactionStatus::Failure;
        }
        self.store.insert_many(&expired)?;
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "expired pending transactions marked failed");
        }
        Ok(expired.len())
    }

    /// Reserve candidate previous outputs for a transaction in progress.
    ///
    /// For each output, the record that produced it (by hash within
    /// `account_id`) gets the output index appended to its reservation list
    /// and `blocked_at` stamped to now. Unknown refs are skipped with a
    /// warning. Returns the number of records updated.
    ///
    /// Read-modify-write without mutual exclusion: never run concurrent
    /// reservation passes for the same account.
    pub fn block_utxos(&self, outputs: &[OutputRef], account_id: &str) -> Result<usize> {
        let now = Utc::now();
        let mut updated: Vec<Transaction> = Vec::new();

        for output in outputs {
            if let Some(txn) = updated.iter_mut().find(|txn| txn.hash == output.hash) {
                if !txn.blocked_output_indices.contains(&output.index) {
                    txn.blocked_output_indices.push(output.index);
                }
                continue;
            }
            match self.by_hash(account_id, &output.hash)? {
                Some(mut txn) => {
                    if !txn.blocked_output_indices.contains(&output.index) {
                        txn.blocked_output_indices.push(output.index);
                    }
                    txn.blocked_at = Some(now);
                    updated.push(txn);
                }
                None => {
                    tracing::warn!(
                        hash = %output.hash,
                        index = output.index,
                        "no transaction record for candidate output, reservation skipped"
                    );
                }
            }
        }

        let count = updated.len();
        self.store.insert_many(&updated)?;
        Ok(count)
    }

    /// Clear reservations older than the active window, returning their
    /// outputs to the spendable pool. Returns the number of records swept.
    ///
    /// Bounds how long an abandoned send can lock funds.
    pub fn release_blocked_txns(&self) -> Result<usize> {
        let cutoff = Utc::now() - Duration::minutes(UTXO_BLOCK_WINDOW_MINUTES);
        let mut stale: Vec<Transaction> = self
            .store
            .get_all(None)?
            .into_iter()
            .filter(|txn| txn.blocked_at.is_some_and(|at| at < cutoff))
            .collect();
        for txn in &mut stale {
            txn.blocked_output_indices.clear();
            txn.blocked_at = None;
        }
        self.store.insert_many(&stale)?;
        if !stale.is_empty() {
            tracing::info!(count = stale.len(), "stale UTXO reservations released");
        }
        Ok(stale.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TransactionDirection;
    use crate::store::RecordMeta;

    fn sample_txn(hash: &str, direction: TransactionDirection) -> Transaction {
        Transaction {
            meta: RecordMeta::default(),
            account_id: "acc1".to_owned(),
            wallet_id: "w1".to_owned(),
            parent_coin_id: "btc".to_owned(),
            coin_id: "btc".to_owned(),
            is_token: false,
            hash: hash.to_owned(),
            total: Some("10500".to_owned()),
            fees: Some("500".to_owned()),
            amount: "10000".to_owned(),
            confirmations: 0,
            status: TransactionStatus::Pending,
            direction,
            confirmed: Utc::now(),
            block_height: 0,
            inputs: Vec::new(),
            outputs: Vec::new(),
            blocked_output_indices: Vec::new(),
            blocked_at: None,
        }
    }

    #[test]
    fn test_record_id_is_stable() {
        let txn = sample_txn("hash1", TransactionDirection::Sent);
        assert_eq!(txn.record_id(), "w1/acc1/hash1/sent");
    }

    #[test]
    fn test_output_blocked_window() {
        let now = Utc::now();
        let mut txn = sample_txn("hash1", TransactionDirection::Received);
        txn.blocked_output_indices = vec![2];

        txn.blocked_at = Some(now - Duration::minutes(5));
        assert!(output_blocked(&txn, 2, now));
        assert!(!output_blocked(&txn, 3, now));

        txn.blocked_at = Some(now - Duration::minutes(25));
        assert!(!output_blocked(&txn, 2, now));

        txn.blocked_at = None;
        assert!(!output_blocked(&txn, 2, now));
    }
}

//! Database models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::RecordMeta;

/// Derived account record: one discovered account of one coin in one wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Record bookkeeping fields
    #[serde(flatten)]
    pub meta: RecordMeta,
    /// Derived account id; stamped on insert
    pub account_id: Option<String>,
    /// Owning wallet id
    pub wallet_id: String,
    /// Coin id (network-unique asset identifier)
    pub coin_id: String,
    /// Extended public key; ciphered at rest while a passphrase is active
    pub xpub: String,
    /// Derivation scheme label, if any
    pub account_type: Option<String>,
    /// Account index within the derivation scheme
    pub account_index: u32,
    /// Confirmed balance, decimal string in the smallest unit
    pub total_balance: String,
    /// Unconfirmed balance, decimal string in the smallest unit
    pub total_unconfirmed_balance: String,
}

/// Native currency record of one network in one wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coin {
    /// Record bookkeeping fields
    #[serde(flatten)]
    pub meta: RecordMeta,
    /// Owning wallet id
    pub wallet_id: String,
    /// Coin id
    pub coin_id: String,
    /// Extended public key; ciphered at rest while a passphrase is active
    pub xpub: String,
    /// Segwit extended public key, for networks that split them; ciphered at rest
    pub zpub: Option<String>,
    /// Balance attributed to the xpub chain
    pub xpub_balance: String,
    /// Unconfirmed balance attributed to the xpub chain
    pub xpub_unconfirmed_balance: String,
    /// Balance attributed to the zpub chain
    pub zpub_balance: Option<String>,
    /// Unconfirmed balance attributed to the zpub chain
    pub zpub_unconfirmed_balance: Option<String>,
    /// Total confirmed balance
    pub total_balance: String,
    /// Total unconfirmed balance
    pub total_unconfirmed_balance: String,
}

/// Token (non-native asset) record of one wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    /// Record bookkeeping fields
    #[serde(flatten)]
    pub meta: RecordMeta,
    /// Owning wallet id
    pub wallet_id: String,
    /// Coin id of the parent network currency
    pub parent_coin_id: String,
    /// Token id
    pub token_id: String,
    /// Balance, decimal string in the smallest unit
    pub balance: String,
}

/// One derived address ever encountered across the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Address {
    /// Record bookkeeping fields
    #[serde(flatten)]
    pub meta: RecordMeta,
    /// Derived account id this address belongs to
    pub account_id: String,
    /// Owning wallet id
    pub wallet_id: String,
    /// Coin id
    pub coin_id: String,
    /// Address string
    pub address: String,
    /// Chain index (external/change); `-1` when unknown
    pub chain_index: i32,
    /// Address index within the chain; `-1` when unknown
    pub address_index: i32,
    /// Whether this is a segwit address
    pub is_segwit: bool,
}

/// Transaction confirmation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    /// Waiting for confirmations
    Pending,
    /// Confirmed on chain
    Success,
    /// Rejected, or pending past the expiry window
    Failure,
}

/// Direction of a transaction relative to the wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionDirection {
    /// Outgoing
    Sent,
    /// Incoming
    Received,
    /// Fee-only entry (token transactions on account-model chains)
    Fees,
}

impl TransactionDirection {
    /// Stable label used inside derived record ids.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionDirection::Sent => "sent",
            TransactionDirection::Received => "received",
            TransactionDirection::Fees => "fees",
        }
    }
}

/// One input or output of a UTXO-model transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputOutput {
    /// Address the value moved from/to
    pub address: String,
    /// Value, decimal string in the smallest unit
    pub value: String,
    /// Index within the transaction
    pub index: u32,
    /// Whether the address belongs to this wallet
    pub is_mine: bool,
}

/// Reference to one output of a prior transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRef {
    /// Hash of the transaction that produced the output
    pub hash: String,
    /// Output index within that transaction
    pub index: u32,
}

/// Blockchain transaction record.
///
/// For UTXO-model networks `inputs`/`outputs` are populated so a transaction
/// builder can select spendable outputs; `blocked_output_indices` and
/// `blocked_at` mark outputs provisionally committed to an in-flight send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Record bookkeeping fields
    #[serde(flatten)]
    pub meta: RecordMeta,
    /// Derived account id
    pub account_id: String,
    /// Owning wallet id
    pub wallet_id: String,
    /// Coin id of the parent network currency
    pub parent_coin_id: String,
    /// Coin id of the transacted asset (equals `parent_coin_id` unless a token)
    pub coin_id: String,
    /// Whether this is a token transaction
    pub is_token: bool,
    /// Transaction hash
    pub hash: String,
    /// Amount transferred plus fees
    pub total: Option<String>,
    /// Fees paid
    pub fees: Option<String>,
    /// Transferred amount excluding fees
    pub amount: String,
    /// Confirmation count at last sync
    pub confirmations: u32,
    /// Confirmation status
    pub status: TransactionStatus,
    /// Direction relative to the wallet
    pub direction: TransactionDirection,
    /// Creation time at first sight; updated to block time once confirmed
    pub confirmed: DateTime<Utc>,
    /// Block height (`0` while unconfirmed)
    pub block_height: i64,
    /// Inputs (UTXO-model networks)
    #[serde(default)]
    pub inputs: Vec<InputOutput>,
    /// Outputs (UTXO-model networks)
    #[serde(default)]
    pub outputs: Vec<InputOutput>,
    /// Output indices reserved by an in-flight send
    #[serde(default)]
    pub blocked_output_indices: Vec<u32>,
    /// When the reservation was made; stale reservations are swept
    #[serde(default)]
    pub blocked_at: Option<DateTime<Utc>>,
}

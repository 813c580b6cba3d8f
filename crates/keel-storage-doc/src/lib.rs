//! Encrypted document storage for the Keel wallet manager
//!
//! Local persistence layer for wallets, derived accounts, addresses,
//! balances and transaction history across multiple blockchains, over an
//! injected document engine.
//!
//! ## Core mechanisms
//!
//! - **Field Encryption**: passphrase-derived AES-256-CTR cipher bound to one
//!   installation identity, transparently applied to declared secret fields
//!   (extended public keys) on write and reversed on read
//! - **Versioned Store**: every record stamped with the schema generation
//!   that produced it; incompatible data detectable per table
//! - **True Purge**: replicate/destroy/rebuild sequence that physically
//!   erases records from the engine's retained history
//! - **Key Rotation**: the same rebuild sequence with a key swap between
//!   drain and reload, so a table never mixes two key epochs
//! - **UTXO Reservation**: outputs committed to an in-flight send are
//!   blocked for a bounded window so concurrent flows cannot double-spend

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod accounts;
pub mod addresses;
pub mod cipher;
pub mod coins;
pub mod engine;
pub mod error;
pub mod memory;
pub mod models;
pub mod store;
pub mod tokens;
pub mod transactions;

pub use accounts::AccountStore;
pub use addresses::{AddressStore, ChainIndex};
pub use cipher::{PassphraseCipher, SharedCipher, KEY_MATERIAL_LEN};
pub use coins::CoinStore;
pub use engine::{
    DocumentEngine, EngineFactory, Query, SortOrder, Sorting, DOC_DELETED_FIELD, DOC_ID_FIELD,
};
pub use error::{Error, Result};
pub use memory::{MemoryEngine, MemoryEngineFactory};
pub use models::*;
pub use store::{
    derive_record_id, selector, EncryptedStore, EncryptionState, Entity, EventKind, ObserverId,
    RecordMeta, StoreEvent, StoreOptions, IS_ENCRYPTED_FIELD, SCHEMA_GENERATION_FIELD,
};
pub use transactions::{
    output_blocked, TransactionStore, PENDING_TO_FAIL_TIMEOUT_HOURS, UTXO_BLOCK_WINDOW_MINUTES,
};

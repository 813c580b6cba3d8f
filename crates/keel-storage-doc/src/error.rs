//! Error types

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No stable installation identifier was available at cipher construction
    #[error("Installation identifier missing")]
    IdentityMissing,

    /// Passphrase key material had the wrong length
    #[error("Invalid key material length: expected 64 bytes, got {0}")]
    InvalidKeyLength(usize),

    /// Decryption failed: wrong passphrase, wrong installation, or corrupted
    /// ciphertext; the causes are deliberately not distinguished
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Query requested sorting/filtering by a field with no declared index
    #[error("No index declared for field: {0}")]
    MissingIndex(String),

    /// Targeted record lookup matched nothing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation issued while the table was inside a destroy/rebuild window
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Document engine error (generic)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;

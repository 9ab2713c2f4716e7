use thiserror::Error;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Failed to write blob {path}: {source}")]
    BlobWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read blob {path}: {source}")]
    BlobRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Database error: {0}")]
    Persistence(#[from] sled::Error),

    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Entry already exists: {0}")]
    Conflict(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("Data integrity error: {0}")]
    Corruption(String),

    #[error("Configured key does not match this vault")]
    KeyMismatch,

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Key derivation error: {0}")]
    Argon2(String),

    #[error("Invalid vault version: expected {expected}, found {found}")]
    InvalidVersion { expected: u32, found: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Handles str::from_utf8
    #[error("UTF-8 error: {0}")]
    Utf8Str(#[from] std::str::Utf8Error),

    #[error("Integer parse error: {0}")]
    ParseInt(#[from] std::num::ParseIntError),
}

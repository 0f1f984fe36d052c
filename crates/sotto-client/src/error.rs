use thiserror::Error;

use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Invalid input: {0}")]
    InvalidInput(&'static str),

    #[error("Not connected")]
    NotConnected,

    #[error("No key for peer {0}")]
    NoPeerKey(String),

    #[error("Could not reach any configured server")]
    ConnectionFailed,

    #[error("Crypto error: {0}")]
    Crypto(#[from] sotto_shared::CryptoError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Input is not a nonce:ciphertext transport string")]
    NotTransportEncoded,

    #[error("Invalid peer public key encoding")]
    InvalidPeerKey,
}

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// x25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// x25519 secret key size in bytes
pub const SECRET_KEY_SIZE: usize = 32;

/// Maximum wire frame size in bytes (256 KiB)
pub const MAX_FRAME_SIZE: usize = 262_144;

/// Default relay server host
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";

/// Default relay server port
pub const DEFAULT_SERVER_PORT: u16 = 7667;

/// Delimiter between the encoded nonce and ciphertext in a transport string.
/// Base64 never emits this character, so a well-formed transport string
/// splits into exactly two parts.
pub const TRANSPORT_DELIMITER: char = ':';

/// Rendered in place of a message body when authenticated decryption fails
pub const DECRYPT_FAILED_TEXT: &str = "[unable to decrypt]";

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_PEER_KEY: &str = "sotto-peer-key-v1";
pub const KDF_CONTEXT_PASSWORD: &str = "sotto-password-v1";

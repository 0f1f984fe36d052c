use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::constants::{KDF_CONTEXT_PEER_KEY, NONCE_SIZE, PUBKEY_SIZE, TRANSPORT_DELIMITER};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; 32];

/// A user's long-lived key-agreement key pair (x25519).
///
/// Generated once per local identity, persisted through the client's storage
/// interface, and reused across sessions. The public half is declared to the
/// relay on AUTH and distributed to peers via USER_KEYS_LIST / STATUS_UPDATE.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

/// Serializable format for storing/exporting a key pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPairExport {
    pub secret_key: [u8; 32],
    pub public_key: [u8; 32],
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Restore a key pair from a serialized export
    pub fn from_export(export: &KeyPairExport) -> Self {
        let secret = StaticSecret::from(export.secret_key);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Export for serialization
    pub fn to_export(&self) -> KeyPairExport {
        KeyPairExport {
            secret_key: self.secret.to_bytes(),
            public_key: self.public.to_bytes(),
        }
    }

    /// Hex encoding of the public key, as declared on the wire
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public.as_bytes())
    }

    /// Derive the symmetric key shared with a peer from its declared public
    /// key: x25519 Diffie-Hellman followed by a BLAKE3 KDF. Both sides
    /// derive the same key, and re-deriving with the same inputs is
    /// idempotent.
    pub fn derive_peer_key(&self, peer_public_hex: &str) -> Result<SymmetricKey, CryptoError> {
        let peer = parse_public_key_hex(peer_public_hex)?;
        let shared = self.secret.diffie_hellman(&peer);

        let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_PEER_KEY);
        hasher.update(shared.as_bytes());
        let hash = hasher.finalize();

        let mut key = [0u8; 32];
        key.copy_from_slice(&hash.as_bytes()[..32]);
        Ok(key)
    }
}

/// Parse a hex-encoded x25519 public key as carried in envelopes
pub fn parse_public_key_hex(s: &str) -> Result<PublicKey, CryptoError> {
    let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidPeerKey)?;
    if bytes.len() != PUBKEY_SIZE {
        return Err(CryptoError::InvalidPeerKey);
    }
    let mut arr = [0u8; PUBKEY_SIZE];
    arr.copy_from_slice(&bytes);
    Ok(PublicKey::from(arr))
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt a UTF-8 message for transport.
///
/// Returns `base64(nonce)` and `base64(ciphertext)` joined by
/// [`TRANSPORT_DELIMITER`], with a fresh random nonce per call.
pub fn encrypt_message(key: &SymmetricKey, plaintext: &str) -> Result<String, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce_bytes = generate_nonce();
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok(format!(
        "{}{}{}",
        BASE64.encode(nonce_bytes),
        TRANSPORT_DELIMITER,
        BASE64.encode(&ciphertext)
    ))
}

/// Decrypt a transport string produced by [`encrypt_message`].
///
/// [`CryptoError::NotTransportEncoded`] means the input does not have the
/// two-part `nonce:ciphertext` shape and is presumably plaintext; every
/// other failure (bad base64, short nonce, AEAD reject, non-UTF-8 result)
/// is [`CryptoError::DecryptionFailed`].
pub fn decrypt_message(key: &SymmetricKey, transport: &str) -> Result<String, CryptoError> {
    let parts: Vec<&str> = transport.split(TRANSPORT_DELIMITER).collect();
    if parts.len() != 2 {
        return Err(CryptoError::NotTransportEncoded);
    }

    let nonce_bytes = BASE64
        .decode(parts[0])
        .map_err(|_| CryptoError::DecryptionFailed)?;
    let ciphertext = BASE64
        .decode(parts[1])
        .map_err(|_| CryptoError::DecryptionFailed)?;
    if nonce_bytes.len() != NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(&nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, ciphertext.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed)?;

    String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_key_is_symmetric() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let k1 = alice.derive_peer_key(&bob.public_key_hex()).unwrap();
        let k2 = bob.derive_peer_key(&alice.public_key_hex()).unwrap();

        assert_eq!(k1, k2);
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let key_a = alice.derive_peer_key(&bob.public_key_hex()).unwrap();
        let key_b = bob.derive_peer_key(&alice.public_key_hex()).unwrap();

        let transport = encrypt_message(&key_a, "sotto voce").unwrap();
        let plaintext = decrypt_message(&key_b, &transport).unwrap();

        assert_eq!(plaintext, "sotto voce");
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let key = [7u8; 32];
        let a = encrypt_message(&key, "same text").unwrap();
        let b = encrypt_message(&key, "same text").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let eve = KeyPair::generate();

        let key_ab = alice.derive_peer_key(&bob.public_key_hex()).unwrap();
        let key_eb = eve.derive_peer_key(&bob.public_key_hex()).unwrap();

        let transport = encrypt_message(&key_ab, "secret").unwrap();
        assert!(matches!(
            decrypt_message(&key_eb, &transport),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = [3u8; 32];
        let transport = encrypt_message(&key, "important data").unwrap();

        let mut chars: Vec<char> = transport.chars().collect();
        let last = chars.len() - 1;
        chars[last] = if chars[last] == 'A' { 'B' } else { 'A' };
        let tampered: String = chars.into_iter().collect();

        assert!(matches!(
            decrypt_message(&key, &tampered),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_plaintext_is_not_transport_encoded() {
        let key = [0u8; 32];
        assert!(matches!(
            decrypt_message(&key, "just a plain message"),
            Err(CryptoError::NotTransportEncoded)
        ));
        // Three delimited parts is not a transport string either.
        assert!(matches!(
            decrypt_message(&key, "a:b:c"),
            Err(CryptoError::NotTransportEncoded)
        ));
    }

    #[test]
    fn test_transport_shape() {
        let key = [9u8; 32];
        let transport = encrypt_message(&key, "shape").unwrap();
        let parts: Vec<&str> = transport.split(TRANSPORT_DELIMITER).collect();

        assert_eq!(parts.len(), 2);
        assert_eq!(BASE64.decode(parts[0]).unwrap().len(), NONCE_SIZE);
    }

    #[test]
    fn test_keypair_export_roundtrip() {
        let kp = KeyPair::generate();
        let restored = KeyPair::from_export(&kp.to_export());
        assert_eq!(kp.public_key_hex(), restored.public_key_hex());
    }

    #[test]
    fn test_parse_public_key_rejects_bad_input() {
        assert!(parse_public_key_hex("not hex").is_err());
        assert!(parse_public_key_hex("abcd").is_err());
        assert!(parse_public_key_hex(&"ab".repeat(33)).is_err());
    }
}

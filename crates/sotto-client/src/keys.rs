//! Key agreement facade.
//!
//! One long-lived x25519 key pair per local identity, plus a cache of
//! symmetric keys derived per peer. Peer public keys arrive over
//! USER_KEYS_LIST and STATUS_UPDATE; chat content flows through
//! [`KeyAgreement::encrypt_for`] and [`KeyAgreement::decrypt_from`] and
//! nothing else.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tracing::warn;

use sotto_shared::constants::DECRYPT_FAILED_TEXT;
use sotto_shared::crypto::{decrypt_message, encrypt_message, KeyPair, SymmetricKey};
use sotto_shared::CryptoError;

use crate::error::ClientError;

pub struct KeyAgreement {
    key_pair: KeyPair,
    /// Derived symmetric key per peer user id. In-memory only; re-derived
    /// from declared public keys every process lifetime.
    peer_keys: Mutex<HashMap<String, SymmetricKey>>,
}

impl KeyAgreement {
    pub fn new(key_pair: KeyPair) -> Self {
        Self {
            key_pair,
            peer_keys: Mutex::new(HashMap::new()),
        }
    }

    /// The local public key as declared on the wire.
    pub fn public_key_hex(&self) -> String {
        self.key_pair.public_key_hex()
    }

    /// Derive and cache the symmetric key for a peer from its declared
    /// public key. Re-learning the same key is idempotent; a changed key
    /// replaces the cache entry. Malformed keys are ignored with a warning.
    pub fn learn_peer_key(&self, peer_id: &str, public_key_hex: &str) {
        match self.key_pair.derive_peer_key(public_key_hex) {
            Ok(key) => {
                self.peer_keys
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(peer_id.to_string(), key);
            }
            Err(err) => {
                warn!(peer = peer_id, error = %err, "Ignoring invalid peer key");
            }
        }
    }

    pub fn has_peer_key(&self, peer_id: &str) -> bool {
        self.peer_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(peer_id)
    }

    /// Encrypt `plaintext` for a peer. Fails when no key for the peer has
    /// been learned yet.
    pub fn encrypt_for(&self, peer_id: &str, plaintext: &str) -> Result<String, ClientError> {
        let keys = self.peer_keys.lock().unwrap_or_else(PoisonError::into_inner);
        let key = keys
            .get(peer_id)
            .ok_or_else(|| ClientError::NoPeerKey(peer_id.to_string()))?;
        Ok(encrypt_message(key, plaintext)?)
    }

    /// Decrypt `text` received from a peer. Infallible by contract:
    /// plaintext passes through unchanged, an unknown peer passes through
    /// with a warning, and undecryptable transport strings become the fixed
    /// placeholder so one bad frame never stalls the message pipeline.
    pub fn decrypt_from(&self, peer_id: &str, text: &str) -> String {
        let keys = self.peer_keys.lock().unwrap_or_else(PoisonError::into_inner);
        let key = match keys.get(peer_id) {
            Some(key) => key,
            None => {
                warn!(peer = peer_id, "No key for peer, passing message through");
                return text.to_string();
            }
        };

        match decrypt_message(key, text) {
            Ok(plaintext) => plaintext,
            Err(CryptoError::NotTransportEncoded) => text.to_string(),
            Err(err) => {
                warn!(peer = peer_id, error = %err, "Undecryptable message");
                DECRYPT_FAILED_TEXT.to_string()
            }
        }
    }
}

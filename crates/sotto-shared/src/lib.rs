//! # sotto-shared
//!
//! Wire protocol, cryptography, and input validation shared by the sotto
//! relay server and client.
//!
//! [`envelope::Envelope`] is the complete, closed set of frame types either
//! side may send; anything else fails decoding. [`crypto`] implements the
//! x25519 key agreement and the XChaCha20-Poly1305 transport encoding used
//! for end-to-end message content. The relay never sees either key half --
//! it forwards payloads as opaque JSON.

pub mod constants;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod validate;

pub use crypto::{KeyPair, KeyPairExport, SymmetricKey};
pub use envelope::{ChatPayload, DeliveredPayload, Envelope, FriendPayload, PresenceStatus};
pub use error::CryptoError;

//! Workspace and writer keys.
//!
//! A workspace is identified by the 32-byte Ed25519 public key of its
//! bootstrap writer; every other writer is identified by its own key. Keys
//! render as 64 lowercase hex characters. The DHT rendezvous topic is
//! `SHA-256(workspace key)`.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Byte length of a public key.
pub const KEY_LEN: usize = 32;

/// Byte length of an Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum KeyError {
    /// Key input was not 64 hex characters.
    #[error("invalid key: expected 64 hex characters, got {0}")]
    InvalidLength(usize),
    /// Key input contained non-hex characters.
    #[error("invalid key: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    /// The bytes do not form a valid Ed25519 point.
    #[error("invalid key: not a valid Ed25519 public key")]
    InvalidKey,
}

/// A 32-byte Ed25519 public key identifying a writer (or, for the
/// bootstrap writer, the workspace itself).
///
/// Ordering is lexicographic over the raw bytes; the linearizer relies on
/// this for its deterministic tie break.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; KEY_LEN]);

impl PublicKey {
    /// Parse from 64 lowercase (or uppercase) hex characters.
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let s = s.trim();
        if s.len() != KEY_LEN * 2 {
            return Err(KeyError::InvalidLength(s.len()));
        }
        let bytes = hex::decode(s)?;
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes);
        // Reject byte strings that can never verify anything.
        VerifyingKey::from_bytes(&key).map_err(|_| KeyError::InvalidKey)?;
        Ok(Self(key))
    }

    /// Render as 64 lowercase hex characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 16 hex characters, used for on-disk store directory names.
    pub fn short_hex(&self) -> String {
        self.to_hex()[..16].to_string()
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// The DHT rendezvous topic derived from this key: `SHA-256(key)`.
    pub fn topic(&self) -> Topic {
        Topic(sha256(&self.0))
    }

    /// Verify an Ed25519 signature over `message`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let Ok(vk) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        vk.verify(message, &sig).is_ok()
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({}…)", &self.to_hex()[..8])
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A detached Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; SIGNATURE_LEN]);

impl Signature {
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({}…)", hex::encode(&self.0[..4]))
    }
}

/// The 32-byte DHT rendezvous identifier for a workspace.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic(pub [u8; 32]);

impl Topic {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Topic({}…)", &hex::encode(self.0)[..8])
    }
}

/// A local writer's signing keypair.
///
/// Holds the secret half; the store directory keeps it in `writer.key`
/// (raw 32-byte seed) so the same writer identity survives restarts.
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore from a 32-byte secret seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    /// The 32-byte secret seed.
    pub fn seed(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key().to_bytes())
    }

    /// Sign `message` with this writer's secret key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing.sign(message).to_bytes())
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Keypair({:?})", self.public())
    }
}

fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(bytes);
    h.finalize().into()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let kp = Keypair::generate();
        let key = kp.public();
        let hex = key.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(PublicKey::from_hex(&hex).unwrap(), key);
    }

    #[test]
    fn from_hex_rejects_bad_input() {
        assert!(matches!(
            PublicKey::from_hex("abcd"),
            Err(KeyError::InvalidLength(4))
        ));
        assert!(PublicKey::from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn sign_and_verify() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"hello");
        assert!(kp.public().verify(b"hello", &sig));
        assert!(!kp.public().verify(b"tampered", &sig));

        let other = Keypair::generate();
        assert!(!other.public().verify(b"hello", &sig));
    }

    #[test]
    fn seed_restores_identity() {
        let kp = Keypair::generate();
        let restored = Keypair::from_seed(&kp.seed());
        assert_eq!(restored.public(), kp.public());

        let sig = restored.sign(b"msg");
        assert!(kp.public().verify(b"msg", &sig));
    }

    #[test]
    fn topic_is_deterministic_and_distinct_from_key() {
        let kp = Keypair::generate();
        let key = kp.public();
        assert_eq!(key.topic(), key.topic());
        assert_ne!(key.topic().0, key.0);
    }
}

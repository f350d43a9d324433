//! Content hashing and plugin signatures
//!
//! The signed payload is always the hex SHA-256 of the artifact bytes. Two
//! families are supported: a BLAKE3 keyed hash over a 32-byte shared secret for
//! internal use, and Ed25519 for plugins distributed to others.

use crate::security::trust::TrustError;
use ed25519_dalek::{Signer, Verifier};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Hex-encoded SHA-256 of `bytes`
pub fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureAlgorithm {
    /// BLAKE3 keyed hash, shared secret
    Blake3Keyed,
    Ed25519,
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blake3Keyed => write!(f, "blake3_keyed"),
            Self::Ed25519 => write!(f, "ed25519"),
        }
    }
}

impl std::str::FromStr for SignatureAlgorithm {
    type Err = TrustError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blake3_keyed" | "blake3" | "shared" => Ok(Self::Blake3Keyed),
            "ed25519" => Ok(Self::Ed25519),
            other => Err(TrustError::InvalidKey(format!("unknown algorithm '{}'", other))),
        }
    }
}

/// Key used to produce signatures
#[derive(Clone)]
pub enum SigningKey {
    Shared([u8; 32]),
    Ed25519(ed25519_dalek::SigningKey),
}

/// Key used to check signatures
#[derive(Clone, PartialEq, Eq)]
pub enum VerificationKey {
    Shared([u8; 32]),
    Ed25519(ed25519_dalek::VerifyingKey),
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigningKey({}, {})", self.algorithm(), self.verification_key().fingerprint())
    }
}

impl fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VerificationKey({}, {})", self.algorithm(), self.fingerprint())
    }
}

fn key_bytes(hex_key: &str) -> Result<[u8; 32], TrustError> {
    let bytes = hex::decode(hex_key.trim()).map_err(|e| TrustError::InvalidKey(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| TrustError::InvalidKey(format!("expected 32 key bytes, got {}", b.len())))
}

impl SigningKey {
    /// Generate a fresh random key
    pub fn generate(algorithm: SignatureAlgorithm) -> Self {
        match algorithm {
            SignatureAlgorithm::Blake3Keyed => {
                let mut secret = [0u8; 32];
                OsRng.fill_bytes(&mut secret);
                Self::Shared(secret)
            }
            SignatureAlgorithm::Ed25519 => Self::Ed25519(ed25519_dalek::SigningKey::generate(&mut OsRng)),
        }
    }

    pub fn from_hex(algorithm: SignatureAlgorithm, hex_key: &str) -> Result<Self, TrustError> {
        let bytes = key_bytes(hex_key)?;
        Ok(match algorithm {
            SignatureAlgorithm::Blake3Keyed => Self::Shared(bytes),
            SignatureAlgorithm::Ed25519 => Self::Ed25519(ed25519_dalek::SigningKey::from_bytes(&bytes)),
        })
    }

    /// Secret key material, hex-encoded
    pub fn to_hex(&self) -> String {
        match self {
            Self::Shared(secret) => hex::encode(secret),
            Self::Ed25519(key) => hex::encode(key.to_bytes()),
        }
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        match self {
            Self::Shared(_) => SignatureAlgorithm::Blake3Keyed,
            Self::Ed25519(_) => SignatureAlgorithm::Ed25519,
        }
    }

    pub fn verification_key(&self) -> VerificationKey {
        match self {
            Self::Shared(secret) => VerificationKey::Shared(*secret),
            Self::Ed25519(key) => VerificationKey::Ed25519(key.verifying_key()),
        }
    }
}

impl VerificationKey {
    pub fn from_hex(algorithm: SignatureAlgorithm, hex_key: &str) -> Result<Self, TrustError> {
        let bytes = key_bytes(hex_key)?;
        match algorithm {
            SignatureAlgorithm::Blake3Keyed => Ok(Self::Shared(bytes)),
            SignatureAlgorithm::Ed25519 => ed25519_dalek::VerifyingKey::from_bytes(&bytes)
                .map(Self::Ed25519)
                .map_err(|e| TrustError::InvalidKey(e.to_string())),
        }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        match self {
            Self::Shared(_) => SignatureAlgorithm::Blake3Keyed,
            Self::Ed25519(_) => SignatureAlgorithm::Ed25519,
        }
    }

    fn as_bytes(&self) -> &[u8; 32] {
        match self {
            Self::Shared(secret) => secret,
            Self::Ed25519(key) => key.as_bytes(),
        }
    }

    /// Short identifier: first 16 hex characters of the SHA-256 of the key
    pub fn fingerprint(&self) -> String {
        let mut hash = compute_hash(self.as_bytes());
        hash.truncate(16);
        hash
    }
}

/// Sign `content` (its content hash is the signed payload)
pub fn sign(content: &[u8], key: &SigningKey) -> Vec<u8> {
    let payload = compute_hash(content);
    match key {
        SigningKey::Shared(secret) => blake3::keyed_hash(secret, payload.as_bytes()).as_bytes().to_vec(),
        SigningKey::Ed25519(key) => key.sign(payload.as_bytes()).to_bytes().to_vec(),
    }
}

/// Check `signature` over `content`; any mismatch yields false
pub fn verify(content: &[u8], signature: &[u8], key: &VerificationKey) -> bool {
    let payload = compute_hash(content);
    match key {
        VerificationKey::Shared(secret) => {
            let Ok(bytes) = <[u8; 32]>::try_from(signature) else {
                return false;
            };
            // blake3::Hash equality is constant time
            blake3::keyed_hash(secret, payload.as_bytes()) == blake3::Hash::from(bytes)
        }
        VerificationKey::Ed25519(key) => {
            let Ok(bytes) = <[u8; 64]>::try_from(signature) else {
                return false;
            };
            let signature = ed25519_dalek::Signature::from_bytes(&bytes);
            key.verify(payload.as_bytes(), &signature).is_ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTENT: &[u8] = b"proc on_load {data} { return ok }";

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(compute_hash(CONTENT), compute_hash(CONTENT));
        assert_eq!(compute_hash(CONTENT).len(), 64);
        assert_ne!(compute_hash(b"a"), compute_hash(b"b"));
    }

    #[test]
    fn test_sign_verify_both_families() {
        for algorithm in [SignatureAlgorithm::Blake3Keyed, SignatureAlgorithm::Ed25519] {
            let key = SigningKey::generate(algorithm);
            let signature = sign(CONTENT, &key);
            assert!(verify(CONTENT, &signature, &key.verification_key()), "{}", algorithm);
        }
    }

    #[test]
    fn test_single_bit_mutation_fails() {
        for algorithm in [SignatureAlgorithm::Blake3Keyed, SignatureAlgorithm::Ed25519] {
            let key = SigningKey::generate(algorithm);
            let signature = sign(CONTENT, &key);
            for index in [0, CONTENT.len() / 2, CONTENT.len() - 1] {
                let mut mutated = CONTENT.to_vec();
                mutated[index] ^= 0x01;
                assert!(!verify(&mutated, &signature, &key.verification_key()));
            }
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        for algorithm in [SignatureAlgorithm::Blake3Keyed, SignatureAlgorithm::Ed25519] {
            let key1 = SigningKey::generate(algorithm);
            let key2 = SigningKey::generate(algorithm);
            let signature = sign(CONTENT, &key1);
            assert!(!verify(CONTENT, &signature, &key2.verification_key()));
        }
    }

    #[test]
    fn test_truncated_signature_fails() {
        let key = SigningKey::generate(SignatureAlgorithm::Ed25519);
        let signature = sign(CONTENT, &key);
        assert!(!verify(CONTENT, &signature[..10], &key.verification_key()));
    }

    #[test]
    fn test_hex_round_trip_keeps_fingerprint() {
        let key = SigningKey::generate(SignatureAlgorithm::Ed25519);
        let public = key.verification_key();
        let parsed = VerificationKey::from_hex(SignatureAlgorithm::Ed25519, &public.to_hex()).unwrap();
        assert_eq!(parsed.fingerprint(), public.fingerprint());
        assert_eq!(parsed.fingerprint().len(), 16);

        let restored = SigningKey::from_hex(SignatureAlgorithm::Ed25519, &key.to_hex()).unwrap();
        assert!(verify(CONTENT, &sign(CONTENT, &restored), &public));
    }

    #[test]
    fn test_bad_key_material() {
        assert!(VerificationKey::from_hex(SignatureAlgorithm::Blake3Keyed, "abcd").is_err());
        assert!(VerificationKey::from_hex(SignatureAlgorithm::Ed25519, "zz").is_err());
        assert!("rsa".parse::<SignatureAlgorithm>().is_err());
    }
}

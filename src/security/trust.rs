//! Trusted signers, plugin signatures and the trust store
//!
//! A plugin signature is only honored when the signature itself checks out,
//! the signer is still valid (not revoked, not expired) and the signer's trust
//! level meets the active policy's minimum.

use crate::security::policy::SecurityPolicy;
use crate::security::signing::{self, SignatureAlgorithm, SigningKey, VerificationKey};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

/// Trust errors
///
/// Every variant blocks a plugin load.
#[derive(Debug, Error)]
pub enum TrustError {
    #[error("Plugin '{0}' is not signed but the policy requires a signature")]
    SignatureMissing(String),

    #[error("Signature for plugin '{plugin_id}' is invalid: {reason}")]
    SignatureInvalid { plugin_id: String, reason: String },

    #[error("Unknown signer: {0}")]
    UnknownSigner(String),

    #[error("Signer '{signer_id}' has been revoked: {reason}")]
    SignerRevoked { signer_id: String, reason: String },

    #[error("Signer '{0}' has expired")]
    SignerExpired(String),

    #[error("Signer '{signer_id}' has trust level {level}, policy requires {required}")]
    InsufficientTrust {
        signer_id: String,
        level: TrustLevel,
        required: TrustLevel,
    },

    #[error("Signer already registered: {0}")]
    DuplicateSigner(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type TrustResult<T> = Result<T, TrustError>;

/// Standing of a signer, ordered from least to most trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Revoked,
    Unverified,
    Verified,
    Trusted,
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Revoked => "revoked",
            Self::Unverified => "unverified",
            Self::Verified => "verified",
            Self::Trusted => "trusted",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for TrustLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "revoked" => Ok(Self::Revoked),
            "unverified" => Ok(Self::Unverified),
            "verified" => Ok(Self::Verified),
            "trusted" => Ok(Self::Trusted),
            other => Err(format!("unknown trust level '{}'", other)),
        }
    }
}

/// A signer identity known to the store
///
/// For keyed BLAKE3 signers `public_key` holds the shared secret itself, so the
/// persisted trust store must be protected like a key file.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedSigner {
    pub signer_id: String,
    pub name: String,
    pub organization: Option<String>,

    /// Hex-encoded public key (the shared secret for keyed BLAKE3)
    pub public_key: String,
    pub algorithm: SignatureAlgorithm,
    pub fingerprint: String,
    pub trust_level: TrustLevel,
    pub plugins_signed: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revocation_reason: Option<String>,
}

impl TrustedSigner {
    pub fn new(
        name: impl Into<String>,
        organization: Option<String>,
        key: &VerificationKey,
        trust_level: TrustLevel,
    ) -> Self {
        Self {
            signer_id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            organization,
            public_key: key.to_hex(),
            algorithm: key.algorithm(),
            fingerprint: key.fingerprint(),
            trust_level,
            plugins_signed: 0,
            created_at: Utc::now(),
            expires_at: None,
            revoked_at: None,
            revocation_reason: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|at| at <= Utc::now()).unwrap_or(false)
    }

    pub fn is_valid(&self) -> bool {
        self.trust_level != TrustLevel::Revoked && !self.is_expired()
    }

    /// Revoke the signer; returns false if it was already revoked
    pub fn revoke(&mut self, reason: impl Into<String>) -> bool {
        if self.trust_level == TrustLevel::Revoked {
            return false;
        }
        self.trust_level = TrustLevel::Revoked;
        self.revoked_at = Some(Utc::now());
        self.revocation_reason = Some(reason.into());
        true
    }

    pub fn verification_key(&self) -> TrustResult<VerificationKey> {
        VerificationKey::from_hex(self.algorithm, &self.public_key)
    }

    /// Key material safe to display: shared secrets are masked
    pub fn display_key(&self) -> &str {
        match self.algorithm {
            SignatureAlgorithm::Blake3Keyed => REDACTED,
            SignatureAlgorithm::Ed25519 => &self.public_key,
        }
    }

    /// Copy suitable for printing or logging
    pub fn redacted(&self) -> Self {
        Self {
            public_key: self.display_key().to_string(),
            ..self.clone()
        }
    }
}

const REDACTED: &str = "<redacted>";

impl fmt::Debug for TrustedSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustedSigner")
            .field("signer_id", &self.signer_id)
            .field("name", &self.name)
            .field("organization", &self.organization)
            .field("public_key", &self.display_key())
            .field("algorithm", &self.algorithm)
            .field("fingerprint", &self.fingerprint)
            .field("trust_level", &self.trust_level)
            .field("plugins_signed", &self.plugins_signed)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .field("revoked_at", &self.revoked_at)
            .field("revocation_reason", &self.revocation_reason)
            .finish()
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// Detached signature of a plugin artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginSignature {
    pub plugin_id: String,
    pub signer_id: String,
    pub algorithm: SignatureAlgorithm,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
    pub content_hash: String,
    pub signed_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_valid: bool,
}

impl PluginSignature {
    pub fn mark_verified(&mut self) {
        self.verified_at = Some(Utc::now());
        self.is_valid = true;
    }

    pub fn invalidate(&mut self) {
        self.is_valid = false;
    }

    /// Read a detached `.sig` file
    pub fn load(path: &Path) -> TrustResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> TrustResult<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Outcome of a successful trust check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustDecision {
    pub plugin_id: String,
    pub content_hash: String,

    /// None when the plugin was accepted unsigned
    pub signer_id: Option<String>,
    pub signer_level: Option<TrustLevel>,
    pub policy: String,
}

impl TrustDecision {
    pub fn is_signed(&self) -> bool {
        self.signer_id.is_some()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TrustStoreFile {
    signers: Vec<TrustedSigner>,
    signatures: Vec<PluginSignature>,
}

/// Registry of signers and the signatures recorded against them
#[derive(Debug, Default)]
pub struct TrustStore {
    signers: DashMap<String, TrustedSigner>,
    signatures: DashMap<String, PluginSignature>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_signer(&self, signer: TrustedSigner) -> TrustResult<String> {
        let signer_id = signer.signer_id.clone();
        if self.signers.contains_key(&signer_id) {
            return Err(TrustError::DuplicateSigner(signer_id));
        }
        info!(signer_id = %signer_id, name = %signer.name, level = %signer.trust_level, "Signer added");
        self.signers.insert(signer_id.clone(), signer);
        Ok(signer_id)
    }

    pub fn get_signer(&self, signer_id: &str) -> Option<TrustedSigner> {
        self.signers.get(signer_id).map(|s| s.clone())
    }

    /// All signers, revoked ones included, oldest first
    pub fn list_signers(&self) -> Vec<TrustedSigner> {
        let mut signers: Vec<TrustedSigner> = self.signers.iter().map(|s| s.clone()).collect();
        signers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        signers
    }

    pub fn revoke_signer(&self, signer_id: &str, reason: &str) -> TrustResult<()> {
        let mut signer = self
            .signers
            .get_mut(signer_id)
            .ok_or_else(|| TrustError::UnknownSigner(signer_id.to_string()))?;
        if signer.revoke(reason) {
            warn!(signer_id = %signer_id, reason = %reason, "Signer revoked");
        }
        Ok(())
    }

    /// Set or clear a signer's expiry
    pub fn set_expiry(&self, signer_id: &str, expires_at: Option<DateTime<Utc>>) -> TrustResult<()> {
        let mut signer = self
            .signers
            .get_mut(signer_id)
            .ok_or_else(|| TrustError::UnknownSigner(signer_id.to_string()))?;
        signer.expires_at = expires_at;
        info!(signer_id = %signer_id, expires_at = ?expires_at, "Signer expiry updated");
        Ok(())
    }

    pub fn record_signature(&self, signature: PluginSignature) {
        self.signatures.insert(signature.plugin_id.clone(), signature);
    }

    /// Most recently recorded signature for a plugin
    pub fn signature(&self, plugin_id: &str) -> Option<PluginSignature> {
        self.signatures.get(plugin_id).map(|s| s.clone())
    }

    /// Sign `content` on behalf of a registered signer and record the result
    pub fn sign_plugin(
        &self,
        plugin_id: &str,
        content: &[u8],
        signer_id: &str,
        key: &SigningKey,
    ) -> TrustResult<PluginSignature> {
        let mut signer = self
            .signers
            .get_mut(signer_id)
            .ok_or_else(|| TrustError::UnknownSigner(signer_id.to_string()))?;
        Self::check_signer(&signer)?;

        if key.verification_key().fingerprint() != signer.fingerprint {
            return Err(TrustError::InvalidKey(format!(
                "key does not belong to signer '{}'",
                signer_id
            )));
        }

        let signature = PluginSignature {
            plugin_id: plugin_id.to_string(),
            signer_id: signer_id.to_string(),
            algorithm: key.algorithm(),
            signature: signing::sign(content, key),
            content_hash: signing::compute_hash(content),
            signed_at: Utc::now(),
            verified_at: None,
            is_valid: false,
        };
        signer.plugins_signed += 1;
        drop(signer);

        info!(plugin_id = %plugin_id, signer_id = %signer_id, "Plugin signed");
        self.record_signature(signature.clone());
        Ok(signature)
    }

    /// Decide whether `content` may be loaded as `plugin_id` under `policy`
    ///
    /// A signature that is present but does not verify is rejected even when the
    /// policy does not require one.
    pub fn verify_plugin(
        &self,
        plugin_id: &str,
        content: &[u8],
        signature: Option<&PluginSignature>,
        policy: &SecurityPolicy,
    ) -> TrustResult<TrustDecision> {
        let content_hash = signing::compute_hash(content);

        let Some(signature) = signature else {
            if policy.require_signature {
                warn!(plugin_id = %plugin_id, policy = %policy.name, "Unsigned plugin rejected");
                return Err(TrustError::SignatureMissing(plugin_id.to_string()));
            }
            return Ok(TrustDecision {
                plugin_id: plugin_id.to_string(),
                content_hash,
                signer_id: None,
                signer_level: None,
                policy: policy.name.clone(),
            });
        };

        let signer = self
            .get_signer(&signature.signer_id)
            .ok_or_else(|| TrustError::UnknownSigner(signature.signer_id.clone()))?;
        Self::check_signer(&signer)?;

        let mut record = signature.clone();
        if let Err(reason) = Self::check_signature(plugin_id, content, &content_hash, &record, &signer) {
            record.invalidate();
            self.record_signature(record);
            warn!(plugin_id = %plugin_id, reason = %reason, "Plugin signature rejected");
            return Err(TrustError::SignatureInvalid {
                plugin_id: plugin_id.to_string(),
                reason,
            });
        }

        record.mark_verified();
        self.record_signature(record);

        if signer.trust_level < policy.min_trust_level {
            return Err(TrustError::InsufficientTrust {
                signer_id: signer.signer_id,
                level: signer.trust_level,
                required: policy.min_trust_level,
            });
        }

        info!(plugin_id = %plugin_id, signer_id = %signer.signer_id, "Plugin signature verified");
        Ok(TrustDecision {
            plugin_id: plugin_id.to_string(),
            content_hash,
            signer_id: Some(signer.signer_id),
            signer_level: Some(signer.trust_level),
            policy: policy.name.clone(),
        })
    }

    fn check_signer(signer: &TrustedSigner) -> TrustResult<()> {
        if signer.trust_level == TrustLevel::Revoked {
            return Err(TrustError::SignerRevoked {
                signer_id: signer.signer_id.clone(),
                reason: signer.revocation_reason.clone().unwrap_or_default(),
            });
        }
        if signer.is_expired() {
            return Err(TrustError::SignerExpired(signer.signer_id.clone()));
        }
        Ok(())
    }

    fn check_signature(
        plugin_id: &str,
        content: &[u8],
        content_hash: &str,
        signature: &PluginSignature,
        signer: &TrustedSigner,
    ) -> Result<(), String> {
        if signature.plugin_id != plugin_id {
            return Err(format!("signature was issued for plugin '{}'", signature.plugin_id));
        }
        if signature.algorithm != signer.algorithm {
            return Err(format!(
                "algorithm {} does not match signer key ({})",
                signature.algorithm, signer.algorithm
            ));
        }
        if signature.content_hash != content_hash {
            return Err("content hash mismatch".to_string());
        }
        let key = signer.verification_key().map_err(|e| e.to_string())?;
        if !signing::verify(content, &signature.signature, &key) {
            return Err("signature does not match content".to_string());
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> TrustResult<()> {
        let mut signatures: Vec<PluginSignature> = self.signatures.iter().map(|s| s.clone()).collect();
        signatures.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
        let file = TrustStoreFile {
            signers: self.list_signers(),
            signatures,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> TrustResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let file: TrustStoreFile = serde_json::from_str(&text)?;
        let store = Self::new();
        for signer in file.signers {
            store.signers.insert(signer.signer_id.clone(), signer);
        }
        for signature in file.signatures {
            store.record_signature(signature);
        }
        Ok(store)
    }

    /// Load the store at `path`, or start empty if the file does not exist
    pub fn load_or_default(path: &Path) -> TrustResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::new())
        }
    }
}

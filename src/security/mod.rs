//! Plugin trust: security policies, signing and the trust store

pub mod policy;
pub mod signing;
pub mod trust;

pub use self::policy::{IsolationLevel, PolicyRegistry, PolicySelection, SecurityPolicy};
pub use self::signing::{compute_hash, sign, verify, SignatureAlgorithm, SigningKey, VerificationKey};
pub use self::trust::{
    PluginSignature, TrustDecision, TrustError, TrustLevel, TrustResult, TrustStore, TrustedSigner,
};

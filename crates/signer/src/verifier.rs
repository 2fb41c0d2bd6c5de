//! Signature verification with a single forced key refresh.

use crate::error::{SignerError, SignerResult};
use crate::key::PublicKey;
use crate::signer::verify_signature;
use async_trait::async_trait;
use std::sync::Arc;

/// Where the manifest signing key comes from.
#[async_trait]
pub trait KeySource: Send + Sync {
    /// Return the public key. With `bypass_cache`, the source must fetch a
    /// fresh copy instead of returning one it already holds.
    async fn public_key(&self, bypass_cache: bool) -> SignerResult<PublicKey>;
}

/// A key source that always returns one key.
#[derive(Clone, Debug)]
pub struct StaticKeySource {
    key: PublicKey,
}

impl StaticKeySource {
    pub fn new(key: PublicKey) -> Self {
        Self { key }
    }
}

#[async_trait]
impl KeySource for StaticKeySource {
    async fn public_key(&self, _bypass_cache: bool) -> SignerResult<PublicKey> {
        Ok(self.key.clone())
    }
}

/// Verifies manifest signatures.
///
/// The cached key is tried first. Only when that fails is the key fetched
/// again bypassing the cache, and verification is attempted exactly once
/// more. A second failure is final.
#[derive(Clone)]
pub struct SignatureVerifier {
    keys: Arc<dyn KeySource>,
}

impl SignatureVerifier {
    pub fn new(keys: Arc<dyn KeySource>) -> Self {
        Self { keys }
    }

    /// Returns `Ok(false)` when the signature does not verify under either
    /// key. Key retrieval failures are errors.
    pub async fn verify(&self, plain_text: &str, signature: &str) -> SignerResult<bool> {
        let cached = self.keys.public_key(false).await?;
        match verify_signature(plain_text, signature, &cached) {
            Ok(()) => return Ok(true),
            Err(SignerError::VerificationFailed | SignerError::InvalidSignature(_)) => {}
            Err(e) => return Err(e),
        }

        tracing::warn!("Manifest signature did not verify with cached key, refetching key");
        let fresh = self.keys.public_key(true).await?;
        match verify_signature(plain_text, signature, &fresh) {
            Ok(()) => Ok(true),
            Err(SignerError::VerificationFailed | SignerError::InvalidSignature(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

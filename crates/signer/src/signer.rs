//! Manifest signing and signature checks.

use crate::error::{SignerError, SignerResult};
use crate::key::{KeyPair, PublicKey};
use base64::Engine;
use ed25519_dalek::Signer as _;
use ed25519_dalek::Verifier;
use updraft_core::SignedEnvelope;

/// Signs manifest strings. Used by update servers and test fixtures.
pub struct ManifestSigner {
    keypair: KeyPair,
}

impl ManifestSigner {
    pub fn new(keypair: KeyPair) -> Self {
        Self { keypair }
    }

    /// Generate a new signer with a random key.
    pub fn generate() -> Self {
        Self::new(KeyPair::generate())
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.keypair.public
    }

    /// Sign the UTF-8 bytes of a manifest string, returning base64.
    pub fn sign(&self, manifest_string: &str) -> String {
        let sig = self
            .keypair
            .secret
            .signing_key()
            .sign(manifest_string.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(sig.to_bytes())
    }

    /// Wrap a manifest string in a signed envelope.
    pub fn envelope(&self, manifest_string: impl Into<String>) -> SignedEnvelope {
        let manifest_string = manifest_string.into();
        let signature = self.sign(&manifest_string);
        SignedEnvelope {
            manifest_string,
            signature,
        }
    }
}

/// Verify a base64 Ed25519 signature over `plain_text`.
pub fn verify_signature(
    plain_text: &str,
    signature_b64: &str,
    public_key: &PublicKey,
) -> SignerResult<()> {
    let sig_bytes = base64::engine::general_purpose::STANDARD
        .decode(signature_b64.trim())
        .map_err(|e| SignerError::InvalidSignature(format!("invalid base64: {e}")))?;

    let sig_array: [u8; 64] = sig_bytes.try_into().map_err(|b: Vec<u8>| {
        SignerError::InvalidSignature(format!("expected 64 bytes, got {}", b.len()))
    })?;

    let signature = ed25519_dalek::Signature::from_bytes(&sig_array);

    public_key
        .verifying_key()
        .verify(plain_text.as_bytes(), &signature)
        .map_err(|_| SignerError::VerificationFailed)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"{"id":"0754dad0-d200-d634-113c-ef1f26106028"}"#;

    #[test]
    fn test_sign_and_verify() {
        let signer = ManifestSigner::generate();
        let signature = signer.sign(MANIFEST);
        assert!(verify_signature(MANIFEST, &signature, signer.public_key()).is_ok());
    }

    #[test]
    fn test_verify_with_wrong_key() {
        let signer1 = ManifestSigner::generate();
        let signer2 = ManifestSigner::generate();
        let signature = signer1.sign(MANIFEST);

        assert!(matches!(
            verify_signature(MANIFEST, &signature, signer2.public_key()),
            Err(SignerError::VerificationFailed)
        ));
    }

    #[test]
    fn test_verify_tampered_text() {
        let signer = ManifestSigner::generate();
        let envelope = signer.envelope(MANIFEST);
        let tampered = envelope.manifest_string.replace("0754", "9999");

        assert!(verify_signature(&tampered, &envelope.signature, signer.public_key()).is_err());
    }

    #[test]
    fn test_malformed_signature() {
        let signer = ManifestSigner::generate();
        assert!(matches!(
            verify_signature(MANIFEST, "%%%", signer.public_key()),
            Err(SignerError::InvalidSignature(_))
        ));
        let short = base64::engine::general_purpose::STANDARD.encode([0u8; 10]);
        assert!(matches!(
            verify_signature(MANIFEST, &short, signer.public_key()),
            Err(SignerError::InvalidSignature(_))
        ));
    }
}

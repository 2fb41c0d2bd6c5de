//! Ed25519 key types and operations.

use crate::error::{SignerError, SignerResult};
use base64::Engine;
use ed25519_dalek::{SigningKey, VerifyingKey};
use std::fmt;

fn decode_key_bytes(s: &str, what: &str) -> SignerResult<[u8; 32]> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(s.trim())
        .map_err(|e| SignerError::KeyParsing(format!("invalid base64 {what}: {e}")))?;

    bytes.try_into().map_err(|b: Vec<u8>| {
        SignerError::KeyParsing(format!("expected 32-byte {what}, got {}", b.len()))
    })
}

/// A secret (private) key for signing manifests.
pub struct SecretKey {
    inner: SigningKey,
}

impl SecretKey {
    /// Generate a new random secret key.
    pub fn generate() -> Self {
        let mut rng = rand_core::OsRng;
        Self {
            inner: SigningKey::generate(&mut rng),
        }
    }

    /// Parse a base64-encoded 32-byte seed.
    pub fn from_base64(s: &str) -> SignerResult<Self> {
        let seed = decode_key_bytes(s, "secret key")?;
        Ok(Self {
            inner: SigningKey::from_bytes(&seed),
        })
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.inner.as_bytes())
    }

    /// Get the corresponding public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: self.inner.verifying_key(),
        }
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.inner
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

/// A public key for verifying manifest signatures.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    inner: VerifyingKey,
}

impl PublicKey {
    /// Parse a base64-encoded 32-byte Ed25519 public key.
    pub fn from_base64(s: &str) -> SignerResult<Self> {
        let key_bytes = decode_key_bytes(s, "public key")?;
        let inner = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| SignerError::KeyParsing(format!("invalid public key: {e}")))?;
        Ok(Self { inner })
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.inner.as_bytes())
    }

    pub(crate) fn verifying_key(&self) -> &VerifyingKey {
        &self.inner
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_base64()[..8])
    }
}

/// A key pair containing both secret and public keys.
pub struct KeyPair {
    pub secret: SecretKey,
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair.
    pub fn generate() -> Self {
        let secret = SecretKey::generate();
        let public = secret.public_key();
        Self { secret, public }
    }

    pub fn from_secret_base64(s: &str) -> SignerResult<Self> {
        let secret = SecretKey::from_base64(s)?;
        let public = secret.public_key();
        Ok(Self { secret, public })
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_key_roundtrip() {
        let keypair = KeyPair::generate();
        let parsed = KeyPair::from_secret_base64(&keypair.secret.to_base64()).unwrap();
        assert_eq!(parsed.public, keypair.public);
    }

    #[test]
    fn test_public_key_parse() {
        let keypair = KeyPair::generate();
        let encoded = format!("{}\n", keypair.public.to_base64());
        assert_eq!(PublicKey::from_base64(&encoded).unwrap(), keypair.public);
    }

    #[test]
    fn test_public_key_rejects_wrong_length() {
        let short = base64::engine::general_purpose::STANDARD.encode([1u8; 16]);
        assert!(matches!(
            PublicKey::from_base64(&short),
            Err(SignerError::KeyParsing(_))
        ));
        assert!(PublicKey::from_base64("not base64!").is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let keypair = KeyPair::generate();
        let debug = format!("{keypair:?} {:?}", keypair.secret);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains(&keypair.secret.to_base64()));
    }
}

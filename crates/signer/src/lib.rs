//! Manifest signatures for updraft.
//!
//! This crate provides:
//! - Ed25519 key generation and parsing
//! - Manifest signing (for servers and fixtures)
//! - Signature verification that refetches the key once on failure

pub mod error;
pub mod key;
pub mod signer;
pub mod verifier;

pub use error::{SignerError, SignerResult};
pub use key::{KeyPair, PublicKey, SecretKey};
pub use signer::{ManifestSigner, verify_signature};
pub use verifier::{KeySource, SignatureVerifier, StaticKeySource};

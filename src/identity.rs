//! # Node Identity
//!
//! - [`Keypair`]: the node's long-term Ed25519 signing key
//! - [`Identity`]: 32-byte public key, the peer's unique identifier
//!
//! ## Identity Model
//!
//! An identity is the Ed25519 public key itself. Its string form is a
//! self-certifying DID:
//!
//! ```text
//! did:tiermesh:<64 lowercase hex characters of the public key>
//! ```
//!
//! The string is a pure function of the public key, so anyone holding a
//! DID can verify signatures from its owner without further lookups.
//!
//! ## Key Validation
//!
//! [`identity_for`] refuses key material that is the wrong length, a
//! non-canonical field encoding, not a curve point, or a small-order
//! point. Keys arriving from configuration or the wire go through it.

use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{verify_with_domain, SignatureError};

/// DID method prefix of every identity string.
pub const DID_PREFIX: &str = "did:tiermesh:";

/// Length of an Ed25519 public or secret key in bytes.
pub const KEY_LENGTH: usize = 32;

/// Malformed key material.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidKeyError {
    #[error("key must be {expected} bytes, got {actual}")]
    WrongLength { expected: usize, actual: usize },
    #[error("key is not valid hex: {0}")]
    Encoding(String),
    #[error("key uses a non-canonical encoding")]
    NonCanonical,
    #[error("key is not a valid Ed25519 point")]
    InvalidPoint,
    #[error("key is a small-order point")]
    WeakKey,
    #[error("identity string must start with `did:tiermesh:`")]
    UnknownMethod,
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; KEY_LENGTH]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    /// Builds a keypair from a slice of secret key material.
    pub fn from_secret_slice(bytes: &[u8]) -> Result<Self, InvalidKeyError> {
        let bytes: [u8; KEY_LENGTH] = bytes.try_into().map_err(|_| InvalidKeyError::WrongLength {
            expected: KEY_LENGTH,
            actual: bytes.len(),
        })?;
        Ok(Self::from_secret_key_bytes(&bytes))
    }

    /// Parses a hex encoded secret key. A leading `0x` is accepted.
    pub fn from_secret_hex(s: &str) -> Result<Self, InvalidKeyError> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        let bytes = hex::decode(digits).map_err(|e| InvalidKeyError::Encoding(e.to_string()))?;
        Self::from_secret_slice(&bytes)
    }

    pub(crate) fn secret_key_bytes(&self) -> [u8; KEY_LENGTH] {
        self.signing_key.to_bytes()
    }

    /// Hex form of the secret key, for `--generate-key` output only.
    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    pub fn public_key_bytes(&self) -> [u8; KEY_LENGTH] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity::from_bytes(self.public_key_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &self.identity().to_did())
            .finish_non_exhaustive()
    }
}

/// Derives the identity for a raw Ed25519 public key.
///
/// This is the only constructor that accepts untrusted key material.
pub fn identity_for(public_key: &[u8]) -> Result<Identity, InvalidKeyError> {
    let bytes: [u8; KEY_LENGTH] =
        public_key.try_into().map_err(|_| InvalidKeyError::WrongLength {
            expected: KEY_LENGTH,
            actual: public_key.len(),
        })?;

    if !is_canonical_encoding(&bytes) {
        return Err(InvalidKeyError::NonCanonical);
    }

    let key = VerifyingKey::from_bytes(&bytes).map_err(|_| InvalidKeyError::InvalidPoint)?;
    if key.is_weak() {
        return Err(InvalidKeyError::WeakKey);
    }

    Ok(Identity(bytes))
}

/// The y coordinate (low 255 bits, little endian) must be below 2^255 - 19.
fn is_canonical_encoding(bytes: &[u8; KEY_LENGTH]) -> bool {
    if bytes[31] & 0x7f != 0x7f {
        return true;
    }
    if bytes[1..31].iter().any(|&b| b != 0xff) {
        return true;
    }
    bytes[0] < 0xed
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity([u8; KEY_LENGTH]);

impl Identity {
    /// Wraps bytes without validation. Use [`identity_for`] for untrusted input.
    #[inline]
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// First eight bytes in hex, for log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    pub fn to_did(self) -> String {
        format!("{DID_PREFIX}{}", self.to_hex())
    }

    /// Parses a `did:tiermesh:` identity string and validates the key it carries.
    pub fn from_did(s: &str) -> Result<Self, InvalidKeyError> {
        let hex_part = s.trim().strip_prefix(DID_PREFIX).ok_or(InvalidKeyError::UnknownMethod)?;
        let bytes = hex::decode(hex_part).map_err(|e| InvalidKeyError::Encoding(e.to_string()))?;
        identity_for(&bytes)
    }

    pub fn is_valid(&self) -> bool {
        identity_for(&self.0).is_ok()
    }

    /// Verifies a domain-separated signature made by this identity.
    pub fn verify(&self, domain: &[u8], data: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
        verify_with_domain(self, domain, data, signature)
    }
}

impl FromStr for Identity {
    type Err = InvalidKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_did(s)
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", self.short())
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{DID_PREFIX}{}", self.to_hex())
    }
}

impl From<Identity> for [u8; KEY_LENGTH] {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

impl AsRef<[u8]> for Identity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

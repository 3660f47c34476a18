//! Crypto engine boundary.
//!
//! The OpenPGP primitive engine (key parsing and armoring, encryption,
//! signing, signature verification) is consumed as an opaque capability
//! behind [`PgpEngine`]; nothing in this crate implements or depends on a
//! particular OpenPGP implementation.

use std::fmt;

use anyhow::Result;

use crate::key::{Certification, Fingerprint, Key, KeyId, UserId};

/// A generated key pair.
#[derive(Debug, Clone)]
pub struct KeyPair {
    /// Public part.
    pub public: Key,

    /// Secret part.
    pub secret: Key,
}

/// Parameters for key generation.
#[derive(Debug, Clone, Default)]
pub struct KeyGenParams {
    /// Identities to bind to the new key. The first one becomes the primary
    /// user ID.
    pub user_ids: Vec<UserId>,

    /// Passphrase protecting the secret key; `None` generates an unprotected
    /// key.
    pub password: Option<String>,

    /// Expiration time, unix seconds.
    pub expires: Option<i64>,
}

/// One signature of a decrypted or verified message, as reported by the
/// engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSignature {
    /// Whether the signature cryptographically validates.
    pub valid: bool,

    /// Fingerprint of the signing key.
    pub fingerprint: Fingerprint,

    /// Signature creation time, unix seconds.
    pub created: i64,
}

/// Result of decrypting and verifying a message.
#[derive(Debug, Clone)]
pub struct DecryptedPackage {
    /// The plaintext.
    pub data: Vec<u8>,

    /// Signatures found on the message.
    pub signatures: Vec<VerifiedSignature>,
}

/// The OpenPGP engine capability.
///
/// Implementations must report capability/validation questions as
/// success-or-reason, never panic on malformed input, and treat all key
/// material as untrusted.
pub trait PgpEngine: Send + Sync + fmt::Debug {
    /// Parses armored text into key descriptors. Multiple concatenated key
    /// blocks yield multiple keys.
    fn parse_armored(&self, armored: &str) -> Result<Vec<Key>>;

    /// Serializes a key to armored text.
    fn armor(&self, key: &Key) -> Result<String>;

    /// Merges an update for an already known key into the existing
    /// descriptor ("update in place"): new identities, certifications and
    /// sub-keys are added, existing ones keep their state. The fingerprints
    /// of both arguments must match.
    fn merge_keys(&self, existing: &Key, update: &Key) -> Result<Key>;

    /// Drops identities and sub-keys whose self-certification does not
    /// validate. Returns `None` if no identity survives, in which case the
    /// whole key must be discarded.
    fn sanitize_key(&self, key: &Key) -> Option<Key>;

    /// Verifies a third-party certification (or certification revocation)
    /// on `key`'s identity `email` against the claimed `signer`.
    fn verify_certification(
        &self,
        signer: &Key,
        key: &Key,
        email: &str,
        certification: &Certification,
    ) -> bool;

    /// Generates a fresh key pair.
    fn generate_key(&self, params: &KeyGenParams) -> Result<KeyPair>;

    /// Unlocks the secret sub-key `key_id` of `key` with the given
    /// password, returning the decrypted key object.
    fn unlock_key(&self, key: &Key, key_id: &KeyId, password: &str) -> Result<Key>;

    /// Signs `data` with the given secret key and encrypts it to the same
    /// key, returning an armored message. Used for sync packages.
    fn sign_encrypt(&self, data: &[u8], signer: &Key, password: &str) -> Result<String>;

    /// Decrypts an armored message with the given secret key and verifies
    /// its signatures.
    fn decrypt_verify(&self, message: &str, key: &Key, password: &str)
        -> Result<DecryptedPackage>;
}

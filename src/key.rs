//! Key data model.
//!
//! OpenPGP keys are opaque to this crate beyond the descriptor defined here:
//! identifiers, creation time, user identities with their certifications,
//! capability flags and revocation/expiration state. Parsing real key
//! material into this shape, and every cryptographic check on it, is the job
//! of the [`crate::pgp::PgpEngine`] collaborator.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Error, Result};
use serde::{Deserialize, Serialize};

use crate::tools::addr_cmp;

/// Reason code of a certification revocation meaning "key is retired or
/// superseded". Revocations carrying this code from a provider trust key are
/// what drives pseudo-revocation, see [`crate::trust`].
pub const REASON_KEY_SUPERSEDED: u8 = 101;

/// A key fingerprint: the stable 160-bit identifier of an OpenPGP key,
/// stored as 40 uppercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint as uppercase hex string.
    pub fn hex(&self) -> &str {
        &self.0
    }

    /// The 64-bit key ID, i.e. the low 16 hex characters of the fingerprint.
    pub fn key_id(&self) -> KeyId {
        KeyId(self.0[self.0.len() - 16..].to_string())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = Error;

    /// Accepts a fingerprint in any format (spaced, lowercase, prefixed
    /// with whitespace) and normalizes it.
    fn from_str(input: &str) -> Result<Self> {
        let normalized = normalize_fingerprint(input);
        if normalized.len() != 40 {
            bail!("invalid fingerprint {:?}", input);
        }
        Ok(Fingerprint(normalized))
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> String {
        fp.0
    }
}

/// A 64-bit OpenPGP key ID as 16 uppercase hex characters.
///
/// Key IDs are not collision free; they are only used where the protocol
/// demands them (sub-key references, the password cache, spoofing checks on
/// import). Everything else is keyed by [`Fingerprint`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyId(String);

impl KeyId {
    /// Key ID as uppercase hex string.
    pub fn hex(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for KeyId {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let normalized = normalize_fingerprint(input);
        if normalized.len() != 16 {
            bail!("invalid key id {:?}", input);
        }
        Ok(KeyId(normalized))
    }
}

impl TryFrom<String> for KeyId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<KeyId> for String {
    fn from(id: KeyId) -> String {
        id.0
    }
}

/// Bring a human-readable or otherwise formatted fingerprint back to the
/// uppercase-hex format.
pub fn normalize_fingerprint(fp: &str) -> String {
    fp.to_uppercase()
        .chars()
        .filter(|&c| c.is_ascii_digit() || ('A'..='F').contains(&c))
        .collect()
}

/// Make a fingerprint human-readable, in hex format.
pub fn format_fingerprint(fingerprint: &str) -> String {
    // split key into chunks of 4 with space, and 20 newline
    let mut res = String::new();

    for (i, c) in fingerprint.chars().enumerate() {
        if i > 0 && i % 20 == 0 {
            res += "\n";
        } else if i > 0 && i % 4 == 0 {
            res += " ";
        }

        res += &c.to_string();
    }

    res
}

/// A user identity on a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserId {
    /// Email address of the identity.
    pub email: String,

    /// Display name, may be empty.
    #[serde(default)]
    pub name: String,
}

/// A third-party certification or certification revocation on a user
/// identity, as reported by the crypto engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certification {
    /// Fingerprint of the issuing key.
    pub issuer: Fingerprint,

    /// Signature creation time, unix seconds.
    pub created: i64,

    /// True for a certification revocation, false for a certification.
    pub revocation: bool,

    /// Revocation reason code, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<u8>,
}

/// A user identity together with its certification state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyUser {
    /// The identity itself.
    pub id: UserId,

    /// Whether the identity carries a valid self-certification. Identities
    /// without one are dropped during sanitization and must never be
    /// presented to the user.
    pub valid_self_cert: bool,

    /// Third-party certifications and revocations on this identity.
    #[serde(default)]
    pub certifications: Vec<Certification>,
}

/// Result of validating a key, with the reason for failure.
///
/// Invalid keys and identities are normally excluded from result sets rather
/// than reported as errors; the reason is still needed for diagnostics and
/// for the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyValidity {
    /// Key is usable.
    Valid,
    /// The key owner revoked the key.
    Revoked,
    /// The key is past its expiration time.
    Expired,
    /// No user identity carries a valid self-certification.
    NoSelfCert,
    /// The key is structurally broken.
    Invalid,
}

impl KeyValidity {
    /// Whether the key may be used.
    pub fn is_valid(self) -> bool {
        self == KeyValidity::Valid
    }
}

impl fmt::Display for KeyValidity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            KeyValidity::Valid => "valid",
            KeyValidity::Revoked => "revoked",
            KeyValidity::Expired => "expired",
            KeyValidity::NoSelfCert => "no valid self-certification",
            KeyValidity::Invalid => "invalid",
        };
        write!(f, "{s}")
    }
}

/// Descriptor of an OpenPGP key.
///
/// Only ever constructed by a [`crate::pgp::PgpEngine`] (or by test
/// builders); the core treats it as read-mostly data. A key is owned by
/// exactly one key store at a time; its public part may be copied into other
/// keyrings by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    /// Primary key fingerprint.
    pub fingerprint: Fingerprint,

    /// Primary key ID.
    pub key_id: KeyId,

    /// Sub-key IDs bound to the primary key.
    #[serde(default)]
    pub subkey_ids: Vec<KeyId>,

    /// Key creation time, unix seconds.
    pub created: i64,

    /// Expiration time, unix seconds; `None` means the key does not expire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<i64>,

    /// Owner-issued key revocation.
    #[serde(default)]
    pub revoked: bool,

    /// Whether the key (or one of its sub-keys) can encrypt.
    pub can_encrypt: bool,

    /// Whether the key (or one of its sub-keys) can sign.
    pub can_sign: bool,

    /// Whether this descriptor carries secret material.
    pub is_private: bool,

    /// User identities.
    pub users: Vec<KeyUser>,

    /// Time of the last local modification (import, merge), unix seconds.
    /// Used as the recency tie-breaker in cross-keyring aggregation.
    pub last_modified: i64,
}

impl Key {
    /// Validates the key at the given time, reporting the failure reason.
    pub fn validity_at(&self, now: i64) -> KeyValidity {
        if self.revoked {
            return KeyValidity::Revoked;
        }
        if !self.users.iter().any(|u| u.valid_self_cert) {
            return KeyValidity::NoSelfCert;
        }
        if let Some(expires) = self.expires {
            if expires <= now {
                return KeyValidity::Expired;
            }
        }
        KeyValidity::Valid
    }

    /// Validates the key now.
    pub fn validity(&self) -> KeyValidity {
        self.validity_at(crate::tools::time())
    }

    /// Whether the key validates and exposes a usable encryption capability.
    pub fn is_valid_encryption_key_at(&self, now: i64) -> bool {
        self.validity_at(now).is_valid() && self.can_encrypt
    }

    /// The identity matching the given address, if any.
    pub fn user_for_address(&self, email: &str) -> Option<&KeyUser> {
        self.users.iter().find(|u| addr_cmp(&u.id.email, email))
    }

    /// Whether any identity matches the given address.
    pub fn has_address(&self, email: &str) -> bool {
        self.user_for_address(email).is_some()
    }

    /// All key IDs of this key: the primary key ID followed by sub-key IDs.
    pub fn all_ids(&self) -> impl Iterator<Item = &KeyId> {
        std::iter::once(&self.key_id).chain(self.subkey_ids.iter())
    }

    /// Whether the given ID names this key's primary key or one of its
    /// sub-keys.
    pub fn has_id(&self, id: &KeyId) -> bool {
        self.all_ids().any(|k| k == id)
    }
}

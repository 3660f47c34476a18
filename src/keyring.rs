//! Identity-centric keyring.
//!
//! A keyring wraps a [`KeyStore`] and exposes queries keyed by address or
//! fingerprint plus the mutations (import, remove, generate) that keep the
//! keyring-local invariants: no two keys may share a primary key ID under
//! different fingerprints, every mutation is recorded in the sync change log,
//! and the first imported private key becomes the default when none is set.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{bail, Context as _, Result};
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::key::{Fingerprint, Key, KeyId, UserId};
use crate::keystore::KeyStore;
use crate::pgp::{KeyGenParams, KeyPair};
use crate::sync::{record_change, ChangeType, SyncState};
use crate::tools::time;
use crate::trust::is_key_pseudo_revoked;
use crate::EventType;

/// ID of the user's main keyring, created on first registry init.
pub const MAIN_KEYRING_ID: &str = "main";

/// ID of the keyring backed by the external key agent, attached when an
/// agent capability is configured.
pub const AGENT_KEYRING_ID: &str = "agent";

/// Keyring identifier.
///
/// Provider ("API") keyrings use the form `domain|user`; the domain part
/// selects the provider trust key, see [`crate::trust`]. The IDs
/// [`MAIN_KEYRING_ID`] and [`AGENT_KEYRING_ID`] are reserved.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyringId(String);

impl KeyringId {
    /// Wraps a keyring ID string.
    pub fn new(id: impl Into<String>) -> Self {
        KeyringId(id.into())
    }

    /// The ID as string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The provider domain component of the ID, `None` for the reserved
    /// keyrings which are not tied to a provider.
    pub fn domain(&self) -> Option<&str> {
        self.0.split_once('|').map(|(domain, _)| domain)
    }

    /// Whether this is one of the reserved keyring IDs.
    pub fn is_reserved(&self) -> bool {
        self.0 == MAIN_KEYRING_ID || self.0 == AGENT_KEYRING_ID
    }
}

impl fmt::Display for KeyringId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// TOFU binding of an email address to a key fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBinding {
    /// Bound key fingerprint.
    pub fingerprint: Fingerprint,

    /// Creation time of the newest signature that established the binding,
    /// unix milliseconds. Bindings never move backward in time.
    pub last_seen: i64,
}

/// Per-keyring attributes, persisted independently of the key material.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyringAttributes {
    /// Fingerprint of the default key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_key: Option<Fingerprint>,

    /// Legacy attribute naming the default key by its primary key ID.
    /// Resolved to `default_key` once on load, then cleared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key_id: Option<String>,

    /// Display label for the UI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// TOFU bindings, keyed by lowercased email address.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub key_bindings: BTreeMap<String, KeyBinding>,

    /// Sync state; present iff sync is activated for this keyring.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncState>,

    /// Whether the stored key material already went through one-shot
    /// sanitization.
    #[serde(default)]
    pub sanitized: bool,
}

/// Filters for address-keyed key queries.
#[derive(Debug, Clone)]
pub struct AddressQuery {
    /// Search the public-key collection.
    pub public: bool,

    /// Search the private-key collection.
    pub private: bool,

    /// Only return keys that validate and expose a usable encryption
    /// capability (and are not pseudo-revoked).
    pub valid_for_encryption: bool,

    /// Only return keys where the matching identity carries a valid
    /// self-certification.
    pub verify_user: bool,

    /// Order candidates with the default key first, then newest-created
    /// first.
    pub sort: bool,
}

impl Default for AddressQuery {
    fn default() -> Self {
        Self {
            public: true,
            private: false,
            valid_for_encryption: true,
            verify_user: true,
            sort: true,
        }
    }
}

/// Per-key outcome of an import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    /// The key was new and has been added.
    Inserted(Fingerprint),

    /// A key with the same fingerprint existed; the import was merged into
    /// it.
    Updated(Fingerprint),

    /// The key was not imported.
    Rejected {
        /// Primary key ID of the rejected key.
        key_id: KeyId,
        /// Human readable reason.
        reason: String,
    },
}

/// Options for an import.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImportOptions {
    /// Do not record the mutation in the sync change log. Used when applying
    /// keys received *from* the sync package, which must not be re-uploaded
    /// as local changes.
    pub mute_sync: bool,
}

/// Flattened metadata of one key, as consumed by key listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyData {
    /// Primary key fingerprint.
    pub fingerprint: Fingerprint,

    /// Primary key ID.
    pub key_id: KeyId,

    /// Key creation time, unix seconds.
    pub created: i64,

    /// Last local modification time, unix seconds.
    pub last_modified: i64,

    /// Whether a private key for this fingerprint is held.
    pub has_private: bool,

    /// The key's identities; only the primary one unless `all_users` was
    /// requested.
    pub users: Vec<UserId>,
}

/// A keyring: one named collection of public and private keys plus its
/// attributes.
#[derive(Debug)]
pub struct Keyring {
    /// The keyring ID.
    pub id: KeyringId,
    pub(crate) store: KeyStore,
    pub(crate) public_keys: Vec<Key>,
    pub(crate) private_keys: Vec<Key>,
    pub(crate) attributes: KeyringAttributes,
}

fn attributes_key(id: &KeyringId) -> String {
    format!("keyring.{id}.attributes")
}

impl Keyring {
    /// Loads a keyring from its store, migrating legacy attributes and
    /// running one-shot sanitization of previously stored material.
    pub(crate) async fn load(context: &Context, id: KeyringId, store: KeyStore) -> Result<Self> {
        let (public_keys, private_keys) = store.load(context).await?;
        let attributes = match context.storage().get(&attributes_key(&id)).await? {
            Some(value) => serde_json::from_str(&value)
                .with_context(|| format!("corrupt attributes of keyring {id}"))?,
            None => KeyringAttributes::default(),
        };

        let mut keyring = Keyring {
            id,
            store,
            public_keys,
            private_keys,
            attributes,
        };
        keyring.migrate_legacy_default(context).await?;
        keyring.sanitize_stored_keys(context).await?;
        Ok(keyring)
    }

    /// Resolves the legacy "primary key ID" attribute to a fingerprint,
    /// once.
    async fn migrate_legacy_default(&mut self, context: &Context) -> Result<()> {
        let Some(legacy) = self.attributes.primary_key_id.take() else {
            return Ok(());
        };
        if self.attributes.default_key.is_none() {
            if let Ok(key_id) = legacy.parse::<KeyId>() {
                self.attributes.default_key = self
                    .private_keys
                    .iter()
                    .find(|k| k.key_id == key_id)
                    .map(|k| k.fingerprint.clone());
            }
        }
        info!(context, "Migrated legacy default key attribute of {}", self.id);
        self.save_attributes(context).await
    }

    /// Drops invalid identities from all stored keys, once per keyring.
    /// Agent-held keys are the agent's responsibility and are left alone.
    async fn sanitize_stored_keys(&mut self, context: &Context) -> Result<()> {
        if self.attributes.sanitized {
            return Ok(());
        }
        if !self.store.is_agent() {
            let engine = context.engine_arc();
            let before = self.public_keys.len() + self.private_keys.len();
            self.public_keys = self
                .public_keys
                .drain(..)
                .filter_map(|k| engine.sanitize_key(&k))
                .collect();
            self.private_keys = self
                .private_keys
                .drain(..)
                .filter_map(|k| engine.sanitize_key(&k))
                .collect();
            let after = self.public_keys.len() + self.private_keys.len();
            if after != before {
                warn!(
                    context,
                    "Sanitization dropped {} stored key(s) from {}",
                    before - after,
                    self.id
                );
            }
            self.store_keys(context).await?;
        }
        self.attributes.sanitized = true;
        self.save_attributes(context).await
    }

    /// Persists the keyring attributes.
    pub(crate) async fn save_attributes(&self, context: &Context) -> Result<()> {
        let value = serde_json::to_string(&self.attributes)?;
        context.storage().set(&attributes_key(&self.id), &value).await
    }

    /// Persists the key collections through the store.
    pub(crate) async fn store_keys(&self, context: &Context) -> Result<()> {
        self.store
            .store(context, &self.public_keys, &self.private_keys)
            .await
    }

    /// Deletes everything this keyring persisted.
    pub(crate) async fn remove_persisted(&self, context: &Context) -> Result<()> {
        self.store.remove(context).await?;
        context.storage().remove(&attributes_key(&self.id)).await
    }

    /// Looks up a key by fingerprint in the public or private collection.
    pub fn by_fingerprint(&self, fingerprint: &Fingerprint, private: bool) -> Option<&Key> {
        let collection = if private {
            &self.private_keys
        } else {
            &self.public_keys
        };
        collection.iter().find(|k| &k.fingerprint == fingerprint)
    }

    /// Whether a private key for the fingerprint is held.
    pub fn has_private_key(&self, fingerprint: &Fingerprint) -> bool {
        self.by_fingerprint(fingerprint, true).is_some()
    }

    /// Returns the matching keys for every given address.
    ///
    /// Keys that fail a requested filter are skipped, never an error.
    pub fn keys_by_address(
        &self,
        context: &Context,
        addresses: &[String],
        query: &AddressQuery,
    ) -> BTreeMap<String, Vec<Key>> {
        let now = time();
        let mut result = BTreeMap::new();
        for address in addresses {
            let mut matches: Vec<Key> = self
                .candidate_keys(query)
                .filter(|key| self.key_matches_address(context, key, address, query, now))
                .cloned()
                .collect();
            if query.sort {
                self.sort_keys(&mut matches);
            }
            result.insert(address.clone(), matches);
        }
        result
    }

    fn candidate_keys<'a>(&'a self, query: &AddressQuery) -> impl Iterator<Item = &'a Key> {
        let public = query.public.then_some(&self.public_keys);
        let private = query.private.then_some(&self.private_keys);
        public
            .into_iter()
            .flatten()
            .chain(private.into_iter().flatten())
    }

    fn key_matches_address(
        &self,
        context: &Context,
        key: &Key,
        address: &str,
        query: &AddressQuery,
        now: i64,
    ) -> bool {
        let Some(user) = key.user_for_address(address) else {
            return false;
        };
        if query.verify_user && !user.valid_self_cert {
            return false;
        }
        if query.valid_for_encryption
            && (!key.is_valid_encryption_key_at(now)
                || is_key_pseudo_revoked(context, &self.id, key))
        {
            return false;
        }
        true
    }

    /// Orders keys with the default key first, then newest-created first.
    fn sort_keys(&self, keys: &mut [Key]) {
        let default = self.attributes.default_key.clone();
        keys.sort_by(|a, b| {
            let a_default = Some(&a.fingerprint) == default.as_ref();
            let b_default = Some(&b.fingerprint) == default.as_ref();
            b_default
                .cmp(&a_default)
                .then_with(|| b.created.cmp(&a.created))
        });
    }

    /// Flattened metadata of every currently valid, non-pseudo-revoked key.
    ///
    /// Keys failing validation are skipped rather than reported.
    pub fn get_key_data(&self, context: &Context, all_users: bool) -> Vec<KeyData> {
        let now = time();
        let mut result = Vec::new();
        let mut seen = std::collections::BTreeSet::new();
        for key in self.public_keys.iter().chain(self.private_keys.iter()) {
            if !seen.insert(key.fingerprint.clone()) {
                continue;
            }
            if !key.validity_at(now).is_valid() || is_key_pseudo_revoked(context, &self.id, key) {
                continue;
            }
            let users: Vec<UserId> = key
                .users
                .iter()
                .filter(|u| u.valid_self_cert)
                .take(if all_users { usize::MAX } else { 1 })
                .map(|u| u.id.clone())
                .collect();
            result.push(KeyData {
                fingerprint: key.fingerprint.clone(),
                key_id: key.key_id.clone(),
                created: key.created,
                last_modified: key.last_modified,
                has_private: self.has_private_key(&key.fingerprint),
                users,
            });
        }
        result
    }

    /// Imports keys into the keyring.
    ///
    /// Public keys are processed before private keys so that a private-key
    /// update finds its public counterpart within the same call. A key whose
    /// primary or sub-key ID collides with an existing key under a different
    /// fingerprint is rejected (key-ID spoofing); the rest of the batch
    /// continues. Keys with an already known fingerprint are merged into the
    /// existing descriptor instead of replacing it.
    pub async fn import_keys(
        &mut self,
        context: &Context,
        keys: Vec<Key>,
        options: ImportOptions,
    ) -> Result<Vec<ImportOutcome>> {
        let (mut batch, private_batch): (Vec<Key>, Vec<Key>) =
            keys.into_iter().partition(|k| !k.is_private);
        batch.extend(private_batch);

        let mut outcomes = Vec::with_capacity(batch.len());
        let mut first_imported_private = None;
        let mut modified = false;

        for key in batch {
            let imported_private = key.is_private;
            let outcome = self.import_one(context, key, options);
            match &outcome {
                ImportOutcome::Inserted(fpr) | ImportOutcome::Updated(fpr) => {
                    modified = true;
                    if imported_private && first_imported_private.is_none() {
                        first_imported_private = Some(fpr.clone());
                    }
                }
                ImportOutcome::Rejected { key_id, reason } => {
                    warn!(context, "Import of key {} rejected: {}", key_id, reason);
                }
            }
            outcomes.push(outcome);
        }

        if modified {
            if self.attributes.default_key.is_none() {
                self.attributes.default_key = first_imported_private;
            }
            self.store_keys(context).await?;
            self.save_attributes(context).await?;
            context.emit_event(EventType::KeyringModified(self.id.clone()));
        }
        Ok(outcomes)
    }

    /// Parses armored text and imports the contained keys.
    pub async fn import_armored(
        &mut self,
        context: &Context,
        armored: &str,
        options: ImportOptions,
    ) -> Result<Vec<ImportOutcome>> {
        let keys = context.engine().parse_armored(armored)?;
        self.import_keys(context, keys, options).await
    }

    fn import_one(&mut self, context: &Context, key: Key, options: ImportOptions) -> ImportOutcome {
        if let Some(reason) = self.key_id_collision(&key) {
            return ImportOutcome::Rejected {
                key_id: key.key_id,
                reason,
            };
        }
        let Some(mut key) = context.engine().sanitize_key(&key) else {
            return ImportOutcome::Rejected {
                key_id: key.key_id,
                reason: "no user identity with a valid self-certification".to_string(),
            };
        };

        let fingerprint = key.fingerprint.clone();
        let collection = if key.is_private {
            &mut self.private_keys
        } else {
            &mut self.public_keys
        };

        if let Some(existing) = collection
            .iter_mut()
            .find(|k| k.fingerprint == fingerprint)
        {
            let merged = match context.engine().merge_keys(existing, &key) {
                Ok(merged) => merged,
                Err(err) => {
                    return ImportOutcome::Rejected {
                        key_id: key.key_id,
                        reason: format!("update could not be merged: {err:#}"),
                    }
                }
            };
            *existing = merged;
            existing.last_modified = time();
            record_change(
                self.attributes.sync.as_mut(),
                &fingerprint,
                ChangeType::Update,
                options.mute_sync,
            );
            ImportOutcome::Updated(fingerprint)
        } else {
            key.last_modified = time();
            collection.push(key);
            record_change(
                self.attributes.sync.as_mut(),
                &fingerprint,
                ChangeType::Insert,
                options.mute_sync,
            );
            ImportOutcome::Inserted(fingerprint)
        }
    }

    /// Checks whether the key shares a primary or sub-key ID with an
    /// existing key of a *different* fingerprint.
    fn key_id_collision(&self, key: &Key) -> Option<String> {
        for existing in self.public_keys.iter().chain(self.private_keys.iter()) {
            if existing.fingerprint == key.fingerprint {
                continue;
            }
            if let Some(id) = key.all_ids().find(|id| existing.has_id(id)) {
                return Some(format!(
                    "key ID {} collides with existing key {}",
                    id, existing.fingerprint
                ));
            }
        }
        None
    }

    /// Removes a key from the given collection.
    ///
    /// Fails when the fingerprint is unknown. Removing the default private
    /// key clears the default-key attribute; any cached password for the key
    /// is evicted.
    pub async fn remove_key(
        &mut self,
        context: &Context,
        fingerprint: &Fingerprint,
        private: bool,
    ) -> Result<()> {
        let collection = if private {
            &mut self.private_keys
        } else {
            &mut self.public_keys
        };
        let Some(index) = collection.iter().position(|k| &k.fingerprint == fingerprint) else {
            bail!("no {} key with fingerprint {} in keyring {}",
                if private { "private" } else { "public" }, fingerprint, self.id);
        };
        // Backend-authoritative deletion happens first so that a refusal
        // leaves the keyring untouched.
        self.store.delete_key(fingerprint).await?;

        let removed = collection.remove(index);
        if private {
            if self.attributes.default_key.as_ref() == Some(fingerprint) {
                self.attributes.default_key = None;
            }
            context.delete_cached_password(&removed.key_id);
        }
        record_change(
            self.attributes.sync.as_mut(),
            fingerprint,
            ChangeType::Delete,
            false,
        );
        self.store_keys(context).await?;
        self.save_attributes(context).await?;
        context.emit_event(EventType::KeyringModified(self.id.clone()));
        Ok(())
    }

    /// Generates a key pair through the store backend and adds it to the
    /// keyring. The new key becomes the default when none is set.
    pub async fn generate_key(
        &mut self,
        context: &Context,
        params: &KeyGenParams,
    ) -> Result<KeyPair> {
        let mut pair = self.store.generate_key(context, params).await?;
        let now = time();
        pair.public.last_modified = now;
        pair.secret.last_modified = now;

        self.public_keys.push(pair.public.clone());
        self.private_keys.push(pair.secret.clone());
        record_change(
            self.attributes.sync.as_mut(),
            &pair.secret.fingerprint,
            ChangeType::Insert,
            false,
        );
        if self.attributes.default_key.is_none() {
            self.attributes.default_key = Some(pair.secret.fingerprint.clone());
        }
        self.store_keys(context).await?;
        self.save_attributes(context).await?;
        info!(context, "Generated key {} in {}", pair.secret.fingerprint, self.id);
        context.emit_event(EventType::KeyringModified(self.id.clone()));
        Ok(pair)
    }

    /// The keyring's default private key.
    ///
    /// Returns the configured default if it still validates; otherwise falls
    /// back to the newest private key that is encryption- and
    /// signing-capable and not pseudo-revoked, persisting that choice.
    /// `None` if no private key validates.
    pub async fn default_key(&mut self, context: &Context) -> Result<Option<Key>> {
        let now = time();
        let usable = |key: &Key| {
            key.validity_at(now).is_valid()
                && key.can_encrypt
                && key.can_sign
                && !is_key_pseudo_revoked(context, &self.id, key)
        };

        if let Some(fpr) = self.attributes.default_key.clone() {
            if let Some(key) = self.by_fingerprint(&fpr, true) {
                if usable(key) {
                    return Ok(Some(key.clone()));
                }
            }
        }

        let fallback = self
            .private_keys
            .iter()
            .filter(|k| usable(k))
            .max_by_key(|k| k.created)
            .cloned();
        let new_default = fallback.as_ref().map(|k| k.fingerprint.clone());
        if new_default != self.attributes.default_key {
            self.attributes.default_key = new_default;
            self.save_attributes(context).await?;
        }
        Ok(fallback)
    }

    /// Sets the default key to the given private key.
    pub async fn set_default_key(
        &mut self,
        context: &Context,
        fingerprint: &Fingerprint,
    ) -> Result<()> {
        if self.by_fingerprint(fingerprint, true).is_none() {
            bail!("no private key with fingerprint {} in keyring {}", fingerprint, self.id);
        }
        self.attributes.default_key = Some(fingerprint.clone());
        self.save_attributes(context).await
    }
}

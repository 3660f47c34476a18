//! Change-log based cross-device keyring synchronization.
//!
//! Every keyring with sync activated keeps a [`SyncState`]: an opaque eTag
//! of the last seen remote package, a per-fingerprint change log and a dirty
//! flag. A sync cycle downloads the remote package conditionally by eTag,
//! merges the remote change log with last-timestamp-wins per fingerprint,
//! applies the resolved deletions, and uploads a signed and encrypted
//! snapshot of the held public keys when local changes exist. Concurrent
//! triggers are coalesced: at most one cycle runs per keyring, and at most
//! one superseding request waits behind it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use anyhow::{bail, Context as _, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::key::Fingerprint;
use crate::keyring::{ImportOptions, KeyringId};
use crate::log::LogExt;
use crate::password_cache::{can_unlock_silently, unlock_key, NoCachedPassword, UnlockOptions};
use crate::tools::time;
use crate::EventType;

/// Kind of a key mutation, as recorded in the change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    /// Key added or re-added.
    Insert,

    /// Key removed. Permanent once merged; an older INSERT never
    /// resurrects a deleted key.
    Delete,

    /// Key changed in place. Marks the keyring dirty but is never stored
    /// in the change log: updates travel with the next key snapshot.
    Update,
}

/// One change-log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    /// INSERT or DELETE.
    #[serde(rename = "type")]
    pub kind: ChangeType,

    /// Mutation time, unix seconds. Merges resolve by this timestamp and
    /// never regress an entry to an older one.
    pub time: i64,
}

/// Per-keyring sync state, persisted in the keyring attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    /// Version marker of the last downloaded remote package; empty before
    /// the first exchange.
    #[serde(rename = "eTag", default)]
    pub etag: String,

    /// Per-fingerprint log of local and merged mutations.
    #[serde(rename = "changeLog", default)]
    pub change_log: BTreeMap<Fingerprint, ChangeLogEntry>,

    /// Whether local changes await upload.
    #[serde(default)]
    pub modified: bool,
}

/// Records a local key mutation in the sync state.
///
/// No-op when sync is inactive (`state` is `None`) or the mutation is muted
/// (keys applied *from* a sync package must not be re-logged as local
/// changes). INSERT and DELETE overwrite the fingerprint's entry with the
/// current time; UPDATE only marks the keyring dirty.
pub(crate) fn record_change(
    state: Option<&mut SyncState>,
    fingerprint: &Fingerprint,
    kind: ChangeType,
    mute: bool,
) {
    let Some(state) = state else { return };
    if mute {
        return;
    }
    state.modified = true;
    if matches!(kind, ChangeType::Insert | ChangeType::Delete) {
        state
            .change_log
            .insert(fingerprint.clone(), ChangeLogEntry { kind, time: time() });
    }
}

/// Merges two change logs, keeping for each fingerprint whichever entry has
/// the newer timestamp. Timestamp ties resolve to DELETE, keeping the merge
/// commutative and deletions permanent.
pub(crate) fn merge_change_log(
    local: &BTreeMap<Fingerprint, ChangeLogEntry>,
    remote: &BTreeMap<Fingerprint, ChangeLogEntry>,
) -> BTreeMap<Fingerprint, ChangeLogEntry> {
    let mut merged = local.clone();
    for (fingerprint, entry) in remote {
        match merged.get(fingerprint) {
            Some(existing)
                if existing.time > entry.time
                    || (existing.time == entry.time && existing.kind == ChangeType::Delete) => {}
            _ => {
                merged.insert(fingerprint.clone(), *entry);
            }
        }
    }
    merged
}

/// One public key travelling in a sync package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsertedKey {
    /// Primary key fingerprint.
    pub fingerprint: Fingerprint,

    /// The armored public key.
    pub armored: String,
}

/// The plaintext of a sync package: the uploader's change log plus a
/// snapshot of every public key it holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncPacket {
    /// Change log at upload time.
    #[serde(rename = "changeLog")]
    pub change_log: BTreeMap<Fingerprint, ChangeLogEntry>,

    /// Snapshot of the held public keys.
    #[serde(rename = "insertedKeys")]
    pub inserted_keys: Vec<InsertedKey>,
}

/// Result of a conditional download.
#[derive(Debug, Clone)]
pub enum SyncDownload {
    /// No remote package exists yet (first sync ever).
    None,

    /// The remote package still matches the given eTag.
    NotModified,

    /// A newer remote package.
    Changed {
        /// Its eTag.
        etag: String,

        /// The encrypted, armored package.
        payload: String,
    },
}

/// Remote storage for encrypted sync packages.
///
/// The transport is untrusted: it only ever sees signed and encrypted
/// packages and opaque eTags.
pub trait SyncTransport: Send + Sync + fmt::Debug {
    /// Fetches the remote package if it differs from `etag`. An empty
    /// `etag` requests the package unconditionally.
    fn download<'a>(&'a self, etag: &'a str) -> BoxFuture<'a, Result<SyncDownload>>;

    /// Uploads a package conditionally: fails if the remote no longer
    /// matches `etag` (a concurrent device uploaded first). Returns the new
    /// eTag.
    fn upload<'a>(&'a self, etag: &'a str, payload: &'a str) -> BoxFuture<'a, Result<String>>;
}

/// Options for [`trigger_sync`].
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Run even if the signing key needs a password prompt.
    pub force: bool,

    /// Restrict the cycle to this key; must be the keyring's primary key,
    /// otherwise the trigger is ignored.
    pub key: Option<Fingerprint>,
}

/// Cooperative single-flight guard: one running cycle, one superseding
/// pending slot. A burst of triggers collapses into the running cycle plus
/// exactly one re-run.
#[derive(Debug, Default)]
pub(crate) struct SyncRunner {
    state: Mutex<RunnerState>,
}

#[derive(Debug, Default)]
struct RunnerState {
    running: bool,
    pending: Option<SyncOptions>,
}

impl SyncRunner {
    /// Claims the runner, or queues `options` (replacing any previously
    /// queued request) when a cycle is already running.
    fn try_begin(&self, options: SyncOptions) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.running {
            state.pending = Some(options);
            false
        } else {
            state.running = true;
            true
        }
    }

    /// Ends a cycle. Returns the queued request if one arrived during the
    /// run; the runner stays claimed in that case.
    fn finish(&self) -> Option<SyncOptions> {
        let mut state = self.state.lock().unwrap();
        match state.pending.take() {
            Some(next) => Some(next),
            None => {
                state.running = false;
                None
            }
        }
    }
}

/// Activates sync for a keyring, seeding an empty [`SyncState`], and runs
/// the first cycle.
pub async fn activate(context: &Context, keyring_id: &KeyringId) -> Result<()> {
    {
        let mut keyrings = context.keyrings().write().await;
        let keyring = keyrings
            .get_mut(keyring_id)
            .with_context(|| format!("no keyring {keyring_id}"))?;
        if keyring.attributes.sync.is_none() {
            keyring.attributes.sync = Some(SyncState::default());
            keyring.save_attributes(context).await?;
            info!(context, "Activated sync for keyring {}", keyring_id);
        }
    }
    trigger_sync(
        context,
        keyring_id,
        SyncOptions {
            force: true,
            key: None,
        },
    )
    .await
}

/// Deactivates sync for a keyring, dropping its state.
pub async fn deactivate(context: &Context, keyring_id: &KeyringId) -> Result<()> {
    let mut keyrings = context.keyrings().write().await;
    let keyring = keyrings
        .get_mut(keyring_id)
        .with_context(|| format!("no keyring {keyring_id}"))?;
    if keyring.attributes.sync.take().is_some() {
        keyring.save_attributes(context).await?;
        info!(context, "Deactivated sync for keyring {}", keyring_id);
    }
    Ok(())
}

/// Triggers a sync cycle for a keyring.
///
/// If a cycle is already running the request is queued, replacing any
/// previously queued one, and runs once the current cycle completes.
/// Transport and package failures are logged and left for the next trigger;
/// they never fail the caller.
pub async fn trigger_sync(
    context: &Context,
    keyring_id: &KeyringId,
    options: SyncOptions,
) -> Result<()> {
    if context.transport().is_none() {
        return Ok(());
    }
    let runner = context.sync_runner(keyring_id);
    if !runner.try_begin(options.clone()) {
        return Ok(());
    }

    context.emit_event(EventType::SyncStateChanged {
        id: keyring_id.clone(),
        syncing: true,
    });
    let mut current = options;
    loop {
        sync_cycle(context, keyring_id, &current)
            .await
            .with_context(|| format!("sync of keyring {keyring_id} failed"))
            .log_err(context);
        match runner.finish() {
            Some(next) => current = next,
            None => break,
        }
    }
    context.emit_event(EventType::SyncStateChanged {
        id: keyring_id.clone(),
        syncing: false,
    });
    Ok(())
}

async fn sync_cycle(context: &Context, keyring_id: &KeyringId, options: &SyncOptions) -> Result<()> {
    // Snapshot phase: resolve the signing key and claim the dirty flag.
    // Mutations arriving while the cycle runs set `modified` again and are
    // picked up by the next trigger.
    let (primary, was_modified) = {
        let mut keyrings = context.keyrings().write().await;
        let keyring = keyrings
            .get_mut(keyring_id)
            .with_context(|| format!("no keyring {keyring_id}"))?;
        if keyring.attributes.sync.is_none() {
            return Ok(());
        }
        let Some(primary) = keyring.default_key(context).await? else {
            return Ok(());
        };
        if let Some(requested) = &options.key {
            if requested != &primary.fingerprint {
                return Ok(());
            }
        }
        if !options.force && !can_unlock_silently(context, &primary) {
            return Ok(());
        }
        let Some(state) = keyring.attributes.sync.as_mut() else {
            return Ok(());
        };
        let was_modified = state.modified;
        state.modified = false;
        (primary, was_modified)
    };

    let result = run_phases(context, keyring_id, options, &primary, was_modified).await;

    // The cycle always ends by persisting the state; failures restore the
    // dirty flag so the next trigger retries.
    let mut keyrings = context.keyrings().write().await;
    if let Some(keyring) = keyrings.get_mut(keyring_id) {
        if result.is_err() {
            if let Some(state) = keyring.attributes.sync.as_mut() {
                state.modified = true;
            }
        }
        keyring.save_attributes(context).await?;
    }
    result
}

async fn run_phases(
    context: &Context,
    keyring_id: &KeyringId,
    options: &SyncOptions,
    primary: &crate::key::Key,
    was_modified: bool,
) -> Result<()> {
    let transport = context.transport().context("no sync transport")?;
    let etag = {
        let keyrings = context.keyrings().read().await;
        let keyring = keyrings
            .get(keyring_id)
            .with_context(|| format!("no keyring {keyring_id}"))?;
        match keyring.attributes.sync.as_ref() {
            Some(state) => state.etag.clone(),
            None => return Ok(()),
        }
    };

    let mut dirty = was_modified;
    match transport.download(&etag).await? {
        SyncDownload::None => {
            // First sync ever: nothing remote, upload the initial snapshot.
            dirty = true;
            let mut keyrings = context.keyrings().write().await;
            if let Some(state) = keyrings
                .get_mut(keyring_id)
                .and_then(|k| k.attributes.sync.as_mut())
            {
                state.etag.clear();
            }
        }
        SyncDownload::NotModified => {}
        SyncDownload::Changed {
            etag: new_etag,
            payload,
        } => {
            apply_remote_packet(context, keyring_id, options, primary, &new_etag, &payload)
                .await?;
        }
    }

    if !dirty {
        return Ok(());
    }

    // Upload phase. Never prompt just to upload: without a cached password
    // the keyring stays dirty until a later opportunity.
    let unlocked = match unlock_key(
        context,
        primary,
        &UnlockOptions {
            no_prompt: true,
            reason: "sync".to_string(),
            ..Default::default()
        },
    )
    .await
    {
        Ok(unlocked) => unlocked,
        Err(err) if err.downcast_ref::<NoCachedPassword>().is_some() => {
            let mut keyrings = context.keyrings().write().await;
            if let Some(state) = keyrings
                .get_mut(keyring_id)
                .and_then(|k| k.attributes.sync.as_mut())
            {
                state.modified = true;
            }
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    let (payload, upload_etag) = {
        let keyrings = context.keyrings().read().await;
        let keyring = keyrings
            .get(keyring_id)
            .with_context(|| format!("no keyring {keyring_id}"))?;
        let Some(state) = keyring.attributes.sync.as_ref() else {
            return Ok(());
        };
        let mut change_log = state.change_log.clone();
        let mut inserted_keys = Vec::with_capacity(keyring.public_keys.len());
        for key in &keyring.public_keys {
            change_log
                .entry(key.fingerprint.clone())
                .or_insert(ChangeLogEntry {
                    kind: ChangeType::Insert,
                    time: key.last_modified,
                });
            inserted_keys.push(InsertedKey {
                fingerprint: key.fingerprint.clone(),
                armored: context.engine().armor(key)?,
            });
        }
        let packet = SyncPacket {
            change_log,
            inserted_keys,
        };
        (serde_json::to_string(&packet)?, state.etag.clone())
    };

    let message = context
        .engine()
        .sign_encrypt(payload.as_bytes(), &unlocked.key, &unlocked.password)?;
    let new_etag = transport.upload(&upload_etag, &message).await?;

    let mut keyrings = context.keyrings().write().await;
    if let Some(state) = keyrings
        .get_mut(keyring_id)
        .and_then(|k| k.attributes.sync.as_mut())
    {
        state.etag = new_etag;
    }
    info!(context, "Uploaded sync package for keyring {}", keyring_id);
    Ok(())
}

/// Decrypts and verifies a downloaded package, imports its keys muted,
/// merges its change log and applies the resolved deletions.
async fn apply_remote_packet(
    context: &Context,
    keyring_id: &KeyringId,
    options: &SyncOptions,
    primary: &crate::key::Key,
    new_etag: &str,
    payload: &str,
) -> Result<()> {
    let unlocked = unlock_key(
        context,
        primary,
        &UnlockOptions {
            no_prompt: !options.force,
            reason: "sync".to_string(),
            ..Default::default()
        },
    )
    .await?;
    let decrypted = context
        .engine()
        .decrypt_verify(payload, &unlocked.key, &unlocked.password)?;
    if !decrypted
        .signatures
        .iter()
        .any(|s| s.valid && s.fingerprint == primary.fingerprint)
    {
        bail!("sync package not signed by the keyring's primary key");
    }
    let packet: SyncPacket =
        serde_json::from_slice(&decrypted.data).context("malformed sync package")?;

    let mut inserted = Vec::new();
    for key in &packet.inserted_keys {
        match context.engine().parse_armored(&key.armored) {
            // Sync packages only ever carry public keys.
            Ok(parsed) => inserted.extend(parsed.into_iter().filter(|k| !k.is_private)),
            Err(err) => {
                warn!(
                    context,
                    "Skipping unreadable sync key {}: {:#}", key.fingerprint, err
                );
            }
        }
    }

    let mut keyrings = context.keyrings().write().await;
    let keyring = keyrings
        .get_mut(keyring_id)
        .with_context(|| format!("no keyring {keyring_id}"))?;
    keyring
        .import_keys(context, inserted, ImportOptions { mute_sync: true })
        .await?;

    let (merged, deleted) = {
        let Some(state) = keyring.attributes.sync.as_ref() else {
            return Ok(());
        };
        let merged = merge_change_log(&state.change_log, &packet.change_log);
        let deleted: Vec<Fingerprint> = merged
            .iter()
            .filter(|(_, entry)| entry.kind == ChangeType::Delete)
            .map(|(fingerprint, _)| fingerprint.clone())
            .collect();
        (merged, deleted)
    };

    let before = keyring.public_keys.len();
    keyring
        .public_keys
        .retain(|key| !deleted.contains(&key.fingerprint));
    if keyring.public_keys.len() != before {
        keyring.store_keys(context).await?;
        context.emit_event(EventType::KeyringModified(keyring_id.clone()));
    }

    if let Some(state) = keyring.attributes.sync.as_mut() {
        state.change_log = merged;
        state.etag = new_etag.to_string();
    }
    info!(
        context,
        "Merged sync package into keyring {} ({} keys inserted, {} deleted)",
        keyring_id,
        packet.inserted_keys.len(),
        deleted.len()
    );
    Ok(())
}

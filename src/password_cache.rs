//! Password and unlock cache.
//!
//! Decrypted secret-key material and the passwords protecting it are the
//! most sensitive state in the process. The cache bounds their exposure two
//! ways: entries expire after a configurable timeout, and every entry
//! carries an operation budget ([`RATE_LIMIT`]) so that a compromised cache
//! entry cannot be milked indefinitely even while the timer runs.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Mutex;

use anyhow::Result;
use futures::future::BoxFuture;

use crate::context::Context;
use crate::key::{Key, KeyId};
use crate::tools::time;

/// Operations allowed per cached entry before it is evicted, regardless of
/// the remaining timeout.
pub const RATE_LIMIT: u32 = 100;

/// Error code for a dismissed password prompt.
///
/// Propagated as a distinguished error so callers can special-case the UI
/// behavior without treating the cancellation as a system fault.
#[derive(Debug, thiserror::Error)]
#[error("password prompt cancelled")]
pub struct PromptCancelled;

/// Error code for "the key cannot be unlocked without prompting" when the
/// caller forbade prompting.
#[derive(Debug, thiserror::Error)]
#[error("no cached password for key {key_id}")]
pub struct NoCachedPassword {
    /// Primary key ID of the locked key.
    pub key_id: KeyId,
}

/// Request data for the password-entry UI.
#[derive(Debug, Clone)]
pub struct PromptRequest {
    /// The locked key.
    pub key: Key,

    /// The sub-key that needs unlocking.
    pub key_id: KeyId,

    /// Primary user ID to display.
    pub user_id: Option<String>,

    /// Why the password is needed, e.g. "sync".
    pub reason: String,
}

/// Successful prompt result.
#[derive(Debug, Clone)]
pub struct PromptResponse {
    /// The unlocked key object.
    pub key: Key,

    /// The entered password.
    pub password: String,
}

/// Password-entry UI collaborator.
///
/// A dismissed dialog rejects with [`PromptCancelled`].
pub trait PasswordPrompt: Send + Sync + fmt::Debug {
    /// Asks the user for the password of a key.
    fn prompt<'a>(&'a self, request: PromptRequest) -> BoxFuture<'a, Result<PromptResponse>>;
}

/// A hit in the password cache.
#[derive(Debug, Clone)]
pub struct CachedPassword {
    /// The cached password.
    pub password: String,

    /// The already-unlocked key object for the requested sub-key, if that
    /// sub-key was unlocked before.
    pub key: Option<Key>,
}

#[derive(Debug)]
struct CacheEntry {
    password: String,
    unlocked: BTreeMap<KeyId, Key>,
    remaining_ops: u32,
    expires_at: i64,
}

#[derive(Debug)]
struct CacheState {
    enabled: bool,
    timeout: i64,
    entries: HashMap<KeyId, CacheEntry>,
}

/// Process-wide cache of passwords and unlocked secret keys, keyed by
/// primary key ID.
#[derive(Debug)]
pub struct PasswordCache {
    state: Mutex<CacheState>,
}

impl PasswordCache {
    /// Creates a cache with the given policy. `timeout` is in seconds.
    pub(crate) fn new(enabled: bool, timeout: i64) -> Self {
        PasswordCache {
            state: Mutex::new(CacheState {
                enabled,
                timeout,
                entries: HashMap::new(),
            }),
        }
    }

    /// Retrieves the cached password for the given primary key, and the
    /// unlocked key object if `key_id` was unlocked before.
    ///
    /// Every call consumes one operation from the entry's budget; the entry
    /// is evicted when the budget is exhausted, even if the timer has not
    /// fired yet.
    pub fn get(&self, primary: &KeyId, key_id: &KeyId) -> Option<CachedPassword> {
        self.get_at(time(), primary, key_id)
    }

    fn get_at(&self, now: i64, primary: &KeyId, key_id: &KeyId) -> Option<CachedPassword> {
        let mut state = self.state.lock().unwrap();
        if state
            .entries
            .get(primary)
            .map_or(true, |entry| entry.expires_at <= now)
        {
            state.entries.remove(primary);
            return None;
        }
        let entry = state.entries.get_mut(primary)?;
        entry.remaining_ops = entry.remaining_ops.saturating_sub(1);
        let hit = CachedPassword {
            password: entry.password.clone(),
            key: entry.unlocked.get(key_id).cloned(),
        };
        if entry.remaining_ops == 0 {
            state.entries.remove(primary);
        }
        Some(hit)
    }

    /// Caches the password for a primary key and records `key` as the
    /// unlocked object of sub-key `key_id`. Extends an existing entry with
    /// further sub-keys; the budget and timer of an existing entry are left
    /// running.
    ///
    /// No-op while caching is disabled. `cache_time` overrides the
    /// configured timeout, in seconds.
    pub fn set(
        &self,
        primary: &KeyId,
        key_id: &KeyId,
        key: Option<Key>,
        password: &str,
        cache_time: Option<i64>,
    ) {
        self.set_at(time(), primary, key_id, key, password, cache_time)
    }

    fn set_at(
        &self,
        now: i64,
        primary: &KeyId,
        key_id: &KeyId,
        key: Option<Key>,
        password: &str,
        cache_time: Option<i64>,
    ) {
        let mut state = self.state.lock().unwrap();
        if !state.enabled {
            return;
        }
        let timeout = cache_time.unwrap_or(state.timeout);
        let entry = state
            .entries
            .entry(primary.clone())
            .or_insert_with(|| CacheEntry {
                password: password.to_string(),
                unlocked: BTreeMap::new(),
                remaining_ops: RATE_LIMIT,
                expires_at: now + timeout,
            });
        entry.password = password.to_string();
        if let Some(key) = key {
            entry.unlocked.insert(key_id.clone(), key);
        }
    }

    /// Removes the entry for a primary key, e.g. on key removal or when a
    /// just-generated key is rolled back unconfirmed.
    pub fn delete(&self, primary: &KeyId) {
        self.state.lock().unwrap().entries.remove(primary);
    }

    /// Whether a live entry exists, without consuming an operation.
    pub fn has(&self, primary: &KeyId) -> bool {
        self.has_at(time(), primary)
    }

    fn has_at(&self, now: i64, primary: &KeyId) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.entries.get(primary) {
            Some(entry) if entry.expires_at > now => true,
            Some(_) => {
                state.entries.remove(primary);
                false
            }
            None => false,
        }
    }

    /// Applies a policy change. Any change of the enabled flag or the
    /// timeout flushes the entire cache.
    pub fn configure(&self, enabled: bool, timeout: i64) {
        let mut state = self.state.lock().unwrap();
        if state.enabled != enabled || state.timeout != timeout {
            state.entries.clear();
        }
        state.enabled = enabled;
        state.timeout = timeout;
    }

    /// Drops all entries.
    pub fn flush(&self) {
        self.state.lock().unwrap().entries.clear();
    }
}

/// An unlocked key together with the password that unlocked it.
#[derive(Debug, Clone)]
pub struct UnlockedKey {
    /// The decrypted key object.
    pub key: Key,

    /// The password. Empty for keys without a passphrase.
    pub password: String,
}

/// Options for [`unlock_key`].
#[derive(Debug, Clone, Default)]
pub struct UnlockOptions {
    /// Fail with [`NoCachedPassword`] instead of prompting.
    pub no_prompt: bool,

    /// Specific sub-key to unlock; defaults to the primary key.
    pub key_id: Option<KeyId>,

    /// Reason string shown by the prompt.
    pub reason: String,
}

/// Unlocks a secret key: first with the empty password, then from the
/// cache, and finally through the password prompt unless
/// [`UnlockOptions::no_prompt`] forbids it.
///
/// Successful prompted unlocks populate the cache when caching is enabled.
pub async fn unlock_key(context: &Context, key: &Key, options: &UnlockOptions) -> Result<UnlockedKey> {
    let primary = key.key_id.clone();
    let key_id = options.key_id.clone().unwrap_or_else(|| primary.clone());

    // Keys without a passphrase unlock silently.
    if let Ok(unlocked) = context.engine().unlock_key(key, &key_id, "") {
        return Ok(UnlockedKey {
            key: unlocked,
            password: String::new(),
        });
    }

    if let Some(hit) = context.password_cache().get(&primary, &key_id) {
        let unlocked = match hit.key {
            Some(unlocked) => unlocked,
            None => {
                let unlocked = context.engine().unlock_key(key, &key_id, &hit.password)?;
                context.password_cache().set(
                    &primary,
                    &key_id,
                    Some(unlocked.clone()),
                    &hit.password,
                    None,
                );
                unlocked
            }
        };
        return Ok(UnlockedKey {
            key: unlocked,
            password: hit.password,
        });
    }

    if options.no_prompt {
        return Err(NoCachedPassword { key_id: primary }.into());
    }

    let response = context
        .prompt()
        .prompt(PromptRequest {
            key: key.clone(),
            key_id: key_id.clone(),
            user_id: key.users.first().map(|u| u.id.email.clone()),
            reason: options.reason.clone(),
        })
        .await?;
    context.password_cache().set(
        &primary,
        &key_id,
        Some(response.key.clone()),
        &response.password,
        None,
    );
    Ok(UnlockedKey {
        key: response.key,
        password: response.password,
    })
}

/// Whether `key` can be unlocked without prompting the user: it has no
/// passphrase or a live cache entry exists.
pub fn can_unlock_silently(context: &Context, key: &Key) -> bool {
    context.engine().unlock_key(key, &key.key_id, "").is_ok()
        || context.password_cache().has(&key.key_id)
}

//! Keyring registry.
//!
//! The registry owns the process-wide map of keyrings and the cross-keyring
//! policy: the preferred-keyring queue that decides which keyring wins when
//! the same address or key ID is held in several of them, the aggregated
//! queries built on that queue, and public-key propagation between
//! keyrings.

use std::collections::BTreeMap;

use anyhow::{bail, Context as _, Result};
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::key::{Key, KeyId};
use crate::key_binding::is_key_bound;
use crate::keyring::{
    AddressQuery, ImportOptions, KeyData, Keyring, KeyringId, AGENT_KEYRING_ID, MAIN_KEYRING_ID,
};
use crate::keystore::KeyStore;
use crate::EventType;

const KEYRING_IDS_KEY: &str = "keyring.ids";

/// Loads all registered keyrings into the context.
///
/// Ensures the main keyring exists and attaches the agent keyring when an
/// agent capability is configured.
pub(crate) async fn init(context: &Context) -> Result<()> {
    let mut ids = load_ids(context).await?;
    let main = KeyringId::new(MAIN_KEYRING_ID);
    if !ids.contains(&main) {
        ids.push(main);
        store_ids(context, &ids).await?;
    }

    let mut keyrings = BTreeMap::new();
    for id in ids {
        // The agent keyring is attached from the capability below, never
        // from the persisted list.
        if id.as_str() == AGENT_KEYRING_ID {
            continue;
        }
        let keyring = Keyring::load(context, id.clone(), KeyStore::local(id.clone())).await?;
        keyrings.insert(id, keyring);
    }
    if let Some(agent) = context.agent() {
        let id = KeyringId::new(AGENT_KEYRING_ID);
        let keyring = Keyring::load(context, id.clone(), KeyStore::agent(agent)).await?;
        keyrings.insert(id, keyring);
    }

    let count = keyrings.len();
    *context.keyrings().write().await = keyrings;
    info!(context, "Loaded {} keyring(s)", count);
    Ok(())
}

async fn load_ids(context: &Context) -> Result<Vec<KeyringId>> {
    match context.storage().get(KEYRING_IDS_KEY).await? {
        Some(value) => serde_json::from_str(&value).context("corrupt keyring ID list"),
        None => Ok(Vec::new()),
    }
}

async fn store_ids(context: &Context, ids: &[KeyringId]) -> Result<()> {
    context
        .storage()
        .set(KEYRING_IDS_KEY, &serde_json::to_string(ids)?)
        .await
}

/// Creates and registers an empty provider keyring.
pub async fn create_keyring(context: &Context, id: KeyringId) -> Result<()> {
    if id.is_reserved() {
        bail!("keyring ID {id} is reserved");
    }
    let mut keyrings = context.keyrings().write().await;
    if keyrings.contains_key(&id) {
        bail!("keyring {id} already exists");
    }
    let keyring = Keyring::load(context, id.clone(), KeyStore::local(id.clone())).await?;
    keyrings.insert(id.clone(), keyring);

    let mut ids = load_ids(context).await?;
    ids.push(id.clone());
    store_ids(context, &ids).await?;
    info!(context, "Created keyring {}", id);
    context.emit_event(EventType::KeyringModified(id));
    Ok(())
}

/// Unregisters a keyring and deletes everything it persisted.
///
/// The reserved keyrings cannot be deleted: the main keyring must always
/// exist and the agent keyring mirrors the agent capability.
pub async fn delete_keyring(context: &Context, id: &KeyringId) -> Result<()> {
    if id.is_reserved() {
        bail!("keyring {id} cannot be deleted");
    }
    let mut keyrings = context.keyrings().write().await;
    let Some(keyring) = keyrings.remove(id) else {
        bail!("no keyring {id}");
    };
    keyring.remove_persisted(context).await?;

    let mut ids = load_ids(context).await?;
    ids.retain(|existing| existing != id);
    store_ids(context, &ids).await?;
    info!(context, "Deleted keyring {}", id);
    context.emit_event(EventType::KeyringModified(id.clone()));
    Ok(())
}

/// IDs of all registered keyrings.
pub async fn keyring_ids(context: &Context) -> Vec<KeyringId> {
    context.keyrings().read().await.keys().cloned().collect()
}

/// Builds the ordered list of keyrings consulted for a query against
/// `requested`: the agent keyring first if present and preferred, then the
/// requested provider keyring, then the main keyring, then the agent
/// keyring last if present but not preferred.
pub(crate) fn preferred_keyring_queue(
    keyrings: &BTreeMap<KeyringId, Keyring>,
    requested: &KeyringId,
    prefer_agent: bool,
) -> Vec<KeyringId> {
    let agent = KeyringId::new(AGENT_KEYRING_ID);
    let has_agent = keyrings.contains_key(&agent);
    let mut queue = Vec::with_capacity(3);
    if has_agent && prefer_agent {
        queue.push(agent.clone());
    }
    if !requested.is_reserved() && keyrings.contains_key(requested) {
        queue.push(requested.clone());
    }
    queue.push(KeyringId::new(MAIN_KEYRING_ID));
    if has_agent && !prefer_agent {
        queue.push(agent);
    }
    queue
}

/// Resolves one key per address across the preferred keyring queue.
///
/// Per address, the first keyring in the queue holding a usable key wins;
/// results are never merged across keyrings. Within the winning keyring a
/// bound key is preferred when key binding is enabled, otherwise the
/// default/newest key.
pub async fn get_key_by_address(
    context: &Context,
    keyring_id: &KeyringId,
    addresses: &[String],
    query: &AddressQuery,
) -> Result<BTreeMap<String, Option<Key>>> {
    let settings = context.settings();
    let keyrings = context.keyrings().read().await;
    let queue = preferred_keyring_queue(&keyrings, keyring_id, settings.prefer_agent);

    let mut result = BTreeMap::new();
    for address in addresses {
        let mut winner = None;
        for id in &queue {
            let Some(keyring) = keyrings.get(id) else {
                continue;
            };
            let mut matches = keyring
                .keys_by_address(context, std::slice::from_ref(address), query)
                .remove(address)
                .unwrap_or_default();
            if matches.is_empty() {
                continue;
            }
            if settings.key_binding {
                // An explicitly bound key beats the sort order; with no
                // binding recorded the first key counts as bound.
                if let Some(index) = matches
                    .iter()
                    .position(|key| is_key_bound(&keyring.attributes, address, key))
                {
                    winner = Some(matches.swap_remove(index));
                    break;
                }
            }
            winner = matches.into_iter().next();
            break;
        }
        result.insert(address.clone(), winner);
    }
    Ok(result)
}

#[derive(Debug)]
struct AggregatedKey {
    data: KeyData,
    bound: bool,
}

/// Aggregates key metadata across the preferred keyring queue.
///
/// Per fingerprint the most-recently-modified copy wins. With key binding
/// enabled, multiple keys carrying the same address collapse to one:
/// a bound key beats an unbound one, newer modification breaks ties.
pub async fn get_key_data(
    context: &Context,
    keyring_id: &KeyringId,
    all_users: bool,
) -> Result<Vec<KeyData>> {
    let settings = context.settings();
    let keyrings = context.keyrings().read().await;
    let queue = preferred_keyring_queue(&keyrings, keyring_id, settings.prefer_agent);

    let mut aggregated: BTreeMap<_, AggregatedKey> = BTreeMap::new();
    for id in &queue {
        let Some(keyring) = keyrings.get(id) else {
            continue;
        };
        for data in keyring.get_key_data(context, all_users) {
            let bound = settings.key_binding
                && data.users.iter().any(|user| {
                    keyring
                        .attributes
                        .key_bindings
                        .get(&user.email.to_lowercase())
                        .is_some_and(|b| b.fingerprint == data.fingerprint)
                });
            match aggregated.get(&data.fingerprint) {
                Some(existing) if existing.data.last_modified >= data.last_modified => {}
                _ => {
                    aggregated.insert(data.fingerprint.clone(), AggregatedKey { data, bound });
                }
            }
        }
    }

    let mut keys: Vec<AggregatedKey> = aggregated.into_values().collect();
    if settings.key_binding {
        collapse_by_address(&mut keys);
    }
    Ok(keys.into_iter().map(|key| key.data).collect())
}

/// Keeps at most one key per address: bound beats unbound, then newer
/// modification time. Losing keys drop the contested address; keys left
/// without any address are dropped entirely.
fn collapse_by_address(keys: &mut Vec<AggregatedKey>) {
    let mut winners: BTreeMap<String, (crate::key::Fingerprint, bool, i64)> = BTreeMap::new();
    for key in keys.iter() {
        for user in &key.data.users {
            let email = user.email.to_lowercase();
            let candidate = (key.data.fingerprint.clone(), key.bound, key.data.last_modified);
            match winners.get(&email) {
                Some((_, bound, modified))
                    if (*bound, *modified) >= (candidate.1, candidate.2) => {}
                _ => {
                    winners.insert(email, candidate);
                }
            }
        }
    }
    for key in keys.iter_mut() {
        key.data
            .users
            .retain(|user| {
                winners
                    .get(&user.email.to_lowercase())
                    .map_or(true, |(winner, _, _)| *winner == key.data.fingerprint)
            });
    }
    keys.retain(|key| !key.data.users.is_empty());
}

/// Options for [`sync_public_keys`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PropagateOptions {
    /// Consult every registered keyring instead of the preferred queue.
    pub all_keyrings: bool,
}

/// Propagates the newest copy of the given key IDs into `destination`.
///
/// Per key ID the most-recently-modified public copy across the source
/// keyrings is imported into the destination keyring, but only when that
/// copy lives elsewhere and is strictly newer than what the destination
/// already holds.
pub async fn sync_public_keys(
    context: &Context,
    destination: &KeyringId,
    key_ids: &[KeyId],
    options: PropagateOptions,
) -> Result<()> {
    let settings = context.settings();
    let mut keyrings = context.keyrings().write().await;
    let sources: Vec<KeyringId> = if options.all_keyrings {
        keyrings.keys().cloned().collect()
    } else {
        preferred_keyring_queue(&keyrings, destination, settings.prefer_agent)
    };

    let mut updates: Vec<Key> = Vec::new();
    for key_id in key_ids {
        // Seeding with the destination's own copy breaks ties in its
        // favor: only a strictly newer copy held elsewhere is worth a
        // write.
        let mut newest: Option<(&KeyringId, &Key)> = keyrings
            .get(destination)
            .and_then(|k| k.public_keys.iter().find(|key| key.has_id(key_id)))
            .map(|key| (destination, key));
        for id in &sources {
            let Some(keyring) = keyrings.get(id) else {
                continue;
            };
            for key in keyring.public_keys.iter().filter(|k| k.has_id(key_id)) {
                if newest
                    .map_or(true, |(_, best)| key.last_modified > best.last_modified)
                {
                    newest = Some((id, key));
                }
            }
        }
        if let Some((source, key)) = newest {
            if source != destination {
                updates.push(key.clone());
            }
        }
    }
    if updates.is_empty() {
        return Ok(());
    }

    let keyring = keyrings
        .get_mut(destination)
        .with_context(|| format!("no keyring {destination}"))?;
    updates.retain(|key| {
        keyring
            .by_fingerprint(&key.fingerprint, false)
            .map_or(true, |held| key.last_modified > held.last_modified)
    });
    if !updates.is_empty() {
        keyring
            .import_keys(context, updates, ImportOptions::default())
            .await?;
    }
    Ok(())
}

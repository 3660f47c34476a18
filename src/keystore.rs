//! Key store backends.
//!
//! A key store loads and persists raw key material for one keyring. Two
//! backends exist: a local store serializing armored key blocks through the
//! host's [`crate::storage::KvStorage`], and a store proxying to an external
//! key-management agent which is itself authoritative for the material it
//! holds. The set of backends is closed; callers never branch on the backend
//! except at construction time.

use std::fmt;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use futures::future::BoxFuture;

use crate::context::Context;
use crate::key::{Fingerprint, Key};
use crate::keyring::KeyringId;
use crate::pgp::{KeyGenParams, KeyPair};

/// External key-management agent capability.
///
/// The agent holds the authoritative copy of its keys; they cannot be
/// re-generated from this side, secret material is never exported and
/// deletions may be refused.
pub trait KeyAgent: Send + Sync + fmt::Debug {
    /// Loads descriptors of all keys held by the agent as
    /// `(public, private)` collections.
    fn load_keys<'a>(&'a self) -> BoxFuture<'a, Result<(Vec<Key>, Vec<Key>)>>;

    /// Delegates key generation to the agent.
    fn generate_key<'a>(&'a self, params: &'a KeyGenParams) -> BoxFuture<'a, Result<KeyPair>>;

    /// Asks the agent to delete a key. The agent may refuse.
    fn delete_key<'a>(&'a self, fingerprint: &'a Fingerprint) -> BoxFuture<'a, Result<()>>;
}

/// Backend holding the raw key material of one keyring.
#[derive(Debug)]
pub enum KeyStore {
    /// Armored keys persisted through the host storage.
    Local(LocalStore),

    /// Keys held by an external key-management agent.
    Agent(AgentStore),
}

/// Local storage backed key store.
#[derive(Debug)]
pub struct LocalStore {
    id: KeyringId,
}

/// Key store proxying to an external agent.
#[derive(Debug)]
pub struct AgentStore {
    agent: Arc<dyn KeyAgent>,
}

fn public_keys_key(id: &KeyringId) -> String {
    format!("keyring.{id}.public-keys")
}

fn private_keys_key(id: &KeyringId) -> String {
    format!("keyring.{id}.private-keys")
}

impl KeyStore {
    /// Creates a local store for the given keyring.
    pub fn local(id: KeyringId) -> Self {
        KeyStore::Local(LocalStore { id })
    }

    /// Creates an agent-backed store.
    pub fn agent(agent: Arc<dyn KeyAgent>) -> Self {
        KeyStore::Agent(AgentStore { agent })
    }

    /// Whether this store proxies to an external agent.
    pub fn is_agent(&self) -> bool {
        matches!(self, KeyStore::Agent(_))
    }

    /// Loads the `(public, private)` key collections from the backend.
    pub async fn load(&self, context: &Context) -> Result<(Vec<Key>, Vec<Key>)> {
        match self {
            KeyStore::Local(store) => {
                let public = store.load_collection(context, &public_keys_key(&store.id)).await?;
                let private = store.load_collection(context, &private_keys_key(&store.id)).await?;
                Ok((public, private))
            }
            KeyStore::Agent(store) => store.agent.load_keys().await,
        }
    }

    /// Persists the in-memory collections.
    ///
    /// No-op for an agent-backed store: the agent is authoritative for its
    /// own material.
    pub async fn store(&self, context: &Context, public: &[Key], private: &[Key]) -> Result<()> {
        match self {
            KeyStore::Local(store) => {
                store
                    .store_collection(context, &public_keys_key(&store.id), public)
                    .await?;
                store
                    .store_collection(context, &private_keys_key(&store.id), private)
                    .await?;
                Ok(())
            }
            KeyStore::Agent(_) => Ok(()),
        }
    }

    /// Deletes all persisted material of the keyring.
    pub async fn remove(&self, context: &Context) -> Result<()> {
        match self {
            KeyStore::Local(store) => {
                context.storage().remove(&public_keys_key(&store.id)).await?;
                context.storage().remove(&private_keys_key(&store.id)).await?;
                Ok(())
            }
            KeyStore::Agent(_) => {
                bail!("key agent refuses wholesale deletion of its keys")
            }
        }
    }

    /// Asks the backend to delete a single key. Only meaningful for the
    /// agent backend, where deletion is backend-authoritative; the local
    /// backend deletes through [`KeyStore::store`] after the keyring dropped
    /// the key from its collections.
    pub async fn delete_key(&self, fingerprint: &Fingerprint) -> Result<()> {
        match self {
            KeyStore::Local(_) => Ok(()),
            KeyStore::Agent(store) => store.agent.delete_key(fingerprint).await,
        }
    }

    /// Delegates key generation to the backend.
    pub async fn generate_key(&self, context: &Context, params: &KeyGenParams) -> Result<KeyPair> {
        match self {
            KeyStore::Local(_) => context.engine().generate_key(params),
            KeyStore::Agent(store) => store.agent.generate_key(params).await,
        }
    }
}

impl LocalStore {
    async fn load_collection(&self, context: &Context, storage_key: &str) -> Result<Vec<Key>> {
        let Some(value) = context.storage().get(storage_key).await? else {
            return Ok(Vec::new());
        };
        let blocks: Vec<String> = serde_json::from_str(&value)
            .with_context(|| format!("corrupt key collection under {storage_key:?}"))?;
        let mut keys = Vec::new();
        for armored in &blocks {
            match context.engine().parse_armored(armored) {
                Ok(parsed) => keys.extend(parsed),
                Err(err) => {
                    // One unreadable block must not take the whole keyring
                    // down with it.
                    warn!(context, "Skipping unreadable key block: {:#}", err);
                }
            }
        }
        Ok(keys)
    }

    async fn store_collection(
        &self,
        context: &Context,
        storage_key: &str,
        keys: &[Key],
    ) -> Result<()> {
        let mut blocks = Vec::with_capacity(keys.len());
        for key in keys {
            blocks.push(context.engine().armor(key)?);
        }
        let value = serde_json::to_string(&blocks)?;
        context.storage().set(storage_key, &value).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{make_key_pair, TestContext};

    #[tokio::test]
    async fn test_local_store_roundtrip() -> Result<()> {
        let t = TestContext::new().await;
        let id = KeyringId::new("provider.example|alice");
        let store = KeyStore::local(id.clone());

        let (public, private) = store.load(&t).await?;
        assert!(public.is_empty());
        assert!(private.is_empty());

        let pair = make_key_pair("alice@example.org", 1_700_000_000);
        store
            .store(&t, &[pair.public.clone()], &[pair.secret.clone()])
            .await?;

        let (public, private) = store.load(&t).await?;
        assert_eq!(public, vec![pair.public]);
        assert_eq!(private, vec![pair.secret]);

        store.remove(&t).await?;
        let (public, private) = store.load(&t).await?;
        assert!(public.is_empty());
        assert!(private.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_agent_store_is_backend_authoritative() -> Result<()> {
        let t = TestContext::new().await;
        let pair = make_key_pair("agent@example.org", 1_700_000_000);
        let agent = crate::test_utils::MockAgent::with_keys(vec![pair.clone()]);
        let store = KeyStore::agent(agent);

        let (public, private) = store.load(&t).await?;
        assert_eq!(public.len(), 1);
        assert_eq!(private.len(), 1);

        // store() is a no-op, load() still reflects the agent's state.
        store.store(&t, &[], &[]).await?;
        let (public, _) = store.load(&t).await?;
        assert_eq!(public.len(), 1);

        // Wholesale removal is refused.
        assert!(store.remove(&t).await.is_err());
        Ok(())
    }
}

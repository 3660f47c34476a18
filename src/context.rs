//! Context module.
//!
//! The context owns all process-scoped state: the collaborator handles
//! (storage, crypto engine, password prompt, sync transport, key agent,
//! lookup sources), the keyring registry, the password cache, the pinned
//! trust keys, the per-keyring sync runners, the settings and the event
//! channel. Components receive the context by reference instead of
//! touching ambient module state.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context as _, Result};
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};

use crate::events::{EventEmitter, Events};
use crate::key::{Key, KeyId};
use crate::keyring::{Keyring, KeyringId};
use crate::keystore::KeyAgent;
use crate::lookup::KeySource;
use crate::password_cache::{PasswordCache, PasswordPrompt};
use crate::pgp::PgpEngine;
use crate::registry;
use crate::storage::KvStorage;
use crate::sync::{SyncRunner, SyncTransport};
use crate::EventType;

const SETTINGS_KEY: &str = "core.settings";

/// User-tunable behavior, persisted through the host storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Whether passwords and unlocked keys may be cached at all.
    pub password_cache: bool,

    /// Password cache timeout, seconds.
    pub password_cache_time: i64,

    /// Whether TOFU key binding influences address queries.
    pub key_binding: bool,

    /// Whether the agent keyring is consulted before the local keyrings.
    pub prefer_agent: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            password_cache: true,
            password_cache_time: 1800,
            key_binding: false,
            prefer_agent: false,
        }
    }
}

/// The context.
///
/// Cheap to clone; all clones share the same [`InnerContext`].
#[derive(Debug, Clone)]
pub struct Context {
    pub(crate) inner: Arc<InnerContext>,
}

impl Deref for Context {
    type Target = InnerContext;

    fn deref(&self) -> &InnerContext {
        &self.inner
    }
}

/// The underlying shared state of a [`Context`].
#[derive(Debug)]
pub struct InnerContext {
    id: u32,
    storage: Arc<dyn KvStorage>,
    engine: Arc<dyn PgpEngine>,
    prompt: Arc<dyn PasswordPrompt>,
    transport: Option<Arc<dyn SyncTransport>>,
    agent: Option<Arc<dyn KeyAgent>>,
    sources: RwLock<Vec<Arc<dyn KeySource>>>,
    pub(crate) keyrings: tokio::sync::RwLock<BTreeMap<KeyringId, Keyring>>,
    password_cache: PasswordCache,
    trust_keys: RwLock<BTreeMap<String, Key>>,
    sync_runners: Mutex<BTreeMap<KeyringId, Arc<SyncRunner>>>,
    settings: RwLock<Settings>,
    pub(crate) events: Events,
}

/// Builder for a [`Context`].
///
/// Storage, engine and prompt are mandatory; transport, agent and lookup
/// sources are optional capabilities.
#[derive(Debug, Default)]
pub struct ContextBuilder {
    storage: Option<Arc<dyn KvStorage>>,
    engine: Option<Arc<dyn PgpEngine>>,
    prompt: Option<Arc<dyn PasswordPrompt>>,
    transport: Option<Arc<dyn SyncTransport>>,
    agent: Option<Arc<dyn KeyAgent>>,
    sources: Vec<Arc<dyn KeySource>>,
}

impl ContextBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the persistent storage backend.
    pub fn storage(mut self, storage: Arc<dyn KvStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Sets the OpenPGP engine.
    pub fn engine(mut self, engine: Arc<dyn PgpEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Sets the password prompt.
    pub fn prompt(mut self, prompt: Arc<dyn PasswordPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// Enables keyring sync through the given transport.
    pub fn transport(mut self, transport: Arc<dyn SyncTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Attaches an external key-management agent.
    pub fn agent(mut self, agent: Arc<dyn KeyAgent>) -> Self {
        self.agent = Some(agent);
        self
    }

    /// Appends a lookup source. Rank follows registration order.
    pub fn source(mut self, source: Arc<dyn KeySource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Builds the context and loads the keyring registry.
    pub async fn open(self) -> Result<Context> {
        let storage = self.storage.context("no storage backend configured")?;
        let engine = self.engine.context("no crypto engine configured")?;
        let prompt = self.prompt.context("no password prompt configured")?;

        let settings: Settings = match storage.get(SETTINGS_KEY).await? {
            Some(value) => serde_json::from_str(&value).context("corrupt settings")?,
            None => Settings::default(),
        };
        let password_cache =
            PasswordCache::new(settings.password_cache, settings.password_cache_time);

        let context = Context {
            inner: Arc::new(InnerContext {
                id: thread_rng().gen(),
                storage,
                engine,
                prompt,
                transport: self.transport,
                agent: self.agent,
                sources: RwLock::new(self.sources),
                keyrings: tokio::sync::RwLock::new(BTreeMap::new()),
                password_cache,
                trust_keys: RwLock::new(BTreeMap::new()),
                sync_runners: Mutex::new(BTreeMap::new()),
                settings: RwLock::new(settings),
                events: Events::new(),
            }),
        };
        registry::init(&context).await?;
        Ok(context)
    }
}

impl InnerContext {
    /// Random ID of this context instance, for logging.
    pub fn get_id(&self) -> u32 {
        self.id
    }

    /// The storage backend.
    pub fn storage(&self) -> &dyn KvStorage {
        &*self.storage
    }

    /// The crypto engine.
    pub fn engine(&self) -> &dyn PgpEngine {
        &*self.engine
    }

    /// The crypto engine as a shared handle.
    pub(crate) fn engine_arc(&self) -> Arc<dyn PgpEngine> {
        self.engine.clone()
    }

    /// The password prompt.
    pub(crate) fn prompt(&self) -> &dyn PasswordPrompt {
        &*self.prompt
    }

    /// The sync transport, if keyring sync is available.
    pub fn transport(&self) -> Option<Arc<dyn SyncTransport>> {
        self.transport.clone()
    }

    /// The external key agent, if one is attached.
    pub fn agent(&self) -> Option<Arc<dyn KeyAgent>> {
        self.agent.clone()
    }

    /// The ranked lookup sources.
    pub(crate) fn sources(&self) -> Vec<Arc<dyn KeySource>> {
        self.sources.read().unwrap().clone()
    }

    /// Appends a lookup source at the end of the ranking.
    pub fn add_source(&self, source: impl KeySource + 'static) {
        self.sources.write().unwrap().push(Arc::new(source));
    }

    /// The keyring registry map.
    pub(crate) fn keyrings(&self) -> &tokio::sync::RwLock<BTreeMap<KeyringId, Keyring>> {
        &self.keyrings
    }

    /// The password cache.
    pub fn password_cache(&self) -> &PasswordCache {
        &self.password_cache
    }

    /// Evicts any cached password of the given primary key.
    pub fn delete_cached_password(&self, key_id: &KeyId) {
        self.password_cache.delete(key_id);
    }

    /// The sync runner of a keyring.
    pub(crate) fn sync_runner(&self, id: &KeyringId) -> Arc<SyncRunner> {
        let mut runners = self.sync_runners.lock().unwrap();
        runners.entry(id.clone()).or_default().clone()
    }

    /// The pinned trust key for a provider domain.
    pub(crate) fn trust_key(&self, domain: &str) -> Option<Key> {
        self.trust_keys.read().unwrap().get(domain).cloned()
    }

    pub(crate) fn insert_trust_key(&self, domain: &str, key: Key) {
        self.trust_keys
            .write()
            .unwrap()
            .insert(domain.to_string(), key);
    }

    /// Drops all pinned trust keys.
    pub fn clear_trust_keys(&self) {
        self.trust_keys.write().unwrap().clear();
    }

    /// Snapshot of the current settings.
    pub fn settings(&self) -> Settings {
        self.settings.read().unwrap().clone()
    }

    /// Changes settings, persists them and applies dependent policies (a
    /// password-cache policy change flushes the cache).
    pub async fn set_settings(&self, apply: impl FnOnce(&mut Settings)) -> Result<()> {
        let settings = {
            let mut guard = self.settings.write().unwrap();
            apply(&mut guard);
            guard.clone()
        };
        self.password_cache
            .configure(settings.password_cache, settings.password_cache_time);
        self.storage()
            .set(SETTINGS_KEY, &serde_json::to_string(&settings)?)
            .await?;
        Ok(())
    }

    /// Emits an event to the event channel.
    pub fn emit_event(&self, event: EventType) {
        self.events.emit(event);
    }

    /// Returns a receiver for the event channel.
    pub fn get_event_emitter(&self) -> EventEmitter {
        self.events.get_emitter()
    }

    /// Drops all volatile state: cached passwords, pinned trust keys and
    /// the loaded keyrings. Persisted material is untouched; a subsequent
    /// [`Context::reload_keyrings`] restores the registry.
    pub async fn clear(&self) {
        self.password_cache.flush();
        self.clear_trust_keys();
        self.keyrings.write().await.clear();
    }
}

impl Context {
    /// Reloads the keyring registry from storage.
    pub async fn reload_keyrings(&self) -> Result<()> {
        registry::init(self).await
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Context id={}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::test_utils::{MockEngine, MockPrompt, TestContext};

    #[tokio::test]
    async fn test_builder_requires_collaborators() {
        let result = ContextBuilder::new()
            .storage(Arc::new(MemoryStorage::new()))
            .engine(Arc::new(MockEngine::new()))
            .open()
            .await;
        assert!(result.is_err());

        let result = ContextBuilder::new()
            .storage(Arc::new(MemoryStorage::new()))
            .engine(Arc::new(MockEngine::new()))
            .prompt(Arc::new(MockPrompt::new()))
            .open()
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_settings_roundtrip() -> Result<()> {
        let t = TestContext::new().await;
        assert_eq!(t.settings(), Settings::default());

        t.set_settings(|s| {
            s.key_binding = true;
            s.password_cache_time = 60;
        })
        .await?;

        let reloaded = TestContext::with_storage(t.storage.clone()).await;
        let settings = reloaded.settings();
        assert!(settings.key_binding);
        assert_eq!(settings.password_cache_time, 60);
        Ok(())
    }

    #[tokio::test]
    async fn test_clear_and_reload() -> Result<()> {
        let t = TestContext::new().await;
        t.clear().await;
        assert!(t.keyrings().read().await.is_empty());

        t.reload_keyrings().await?;
        assert!(!t.keyrings().read().await.is_empty());
        Ok(())
    }
}

//! Utilities to help writing tests.
//!
//! All out-of-scope collaborators have a mock here: an in-memory crypto
//! engine speaking JSON inside armor-style blocks, a scriptable password
//! prompt, an in-memory sync transport with eTag semantics, a key agent
//! and a lookup source. [`TestContext`] wires them into a [`Context`].

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use futures::future::BoxFuture;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};

use crate::context::{Context, ContextBuilder};
use crate::key::{Fingerprint, Key, KeyId, KeyUser, UserId};
use crate::keystore::KeyAgent;
use crate::lookup::{KeySource, LookupQuery, SourceHit};
use crate::password_cache::{PasswordPrompt, PromptCancelled, PromptRequest, PromptResponse};
use crate::pgp::{DecryptedPackage, KeyGenParams, KeyPair, PgpEngine, VerifiedSignature};
use crate::storage::MemoryStorage;
use crate::sync::{SyncDownload, SyncTransport};
use crate::tools::time;

/// A [`Context`] wired to in-memory mocks, with direct handles to them.
pub(crate) struct TestContext {
    pub ctx: Context,
    pub storage: Arc<MemoryStorage>,
    pub engine: Arc<MockEngine>,
    pub prompt: Arc<MockPrompt>,
}

impl Deref for TestContext {
    type Target = Context;

    fn deref(&self) -> &Context {
        &self.ctx
    }
}

impl TestContext {
    pub async fn new() -> Self {
        Self::build(Arc::new(MemoryStorage::new()), None, None).await
    }

    /// Opens a context on existing storage, simulating a restart.
    pub async fn with_storage(storage: Arc<MemoryStorage>) -> Self {
        Self::build(storage, None, None).await
    }

    /// Opens a context with a (possibly shared) sync transport.
    pub async fn with_transport(transport: Arc<MemoryTransport>) -> Self {
        Self::build(Arc::new(MemoryStorage::new()), Some(transport), None).await
    }

    /// Opens a context with an empty key agent attached.
    pub async fn with_agent() -> Self {
        Self::build(
            Arc::new(MemoryStorage::new()),
            None,
            Some(MockAgent::with_keys(Vec::new())),
        )
        .await
    }

    async fn build(
        storage: Arc<MemoryStorage>,
        transport: Option<Arc<MemoryTransport>>,
        agent: Option<Arc<MockAgent>>,
    ) -> Self {
        let engine = Arc::new(MockEngine::new());
        let prompt = Arc::new(MockPrompt::new());
        let mut builder = ContextBuilder::new()
            .storage(storage.clone())
            .engine(engine.clone())
            .prompt(prompt.clone());
        if let Some(transport) = transport {
            builder = builder.transport(transport);
        }
        if let Some(agent) = agent {
            builder = builder.agent(agent);
        }
        let ctx = builder.open().await.expect("failed to open test context");
        TestContext {
            ctx,
            storage,
            engine,
            prompt,
        }
    }
}

/// Builds a valid public key descriptor with one identity and a random
/// fingerprint.
pub(crate) fn make_key(email: &str, created: i64) -> Key {
    let mut rng = thread_rng();
    let fingerprint_bytes: [u8; 20] = rng.gen();
    let fingerprint: Fingerprint = hex::encode(fingerprint_bytes).parse().unwrap();
    let subkey_bytes: [u8; 8] = rng.gen();
    let subkey: KeyId = hex::encode(subkey_bytes).parse().unwrap();
    Key {
        key_id: fingerprint.key_id(),
        fingerprint,
        subkey_ids: vec![subkey],
        created,
        expires: None,
        revoked: false,
        can_encrypt: true,
        can_sign: true,
        is_private: false,
        users: vec![KeyUser {
            id: UserId {
                email: email.to_string(),
                name: String::new(),
            },
            valid_self_cert: true,
            certifications: Vec::new(),
        }],
        last_modified: created,
    }
}

/// Builds a public/secret pair sharing one fingerprint.
pub(crate) fn make_key_pair(email: &str, created: i64) -> KeyPair {
    let public = make_key(email, created);
    let mut secret = public.clone();
    secret.is_private = true;
    KeyPair { public, secret }
}

/// In-memory crypto engine.
///
/// Keys are "armored" as their JSON descriptor between armor-style
/// markers; messages carry the signer fingerprint and a hex payload.
/// Passwords are tracked per fingerprint, defaulting to the empty
/// password.
#[derive(Debug, Default)]
pub(crate) struct MockEngine {
    passwords: Mutex<std::collections::HashMap<Fingerprint, String>>,
}

#[derive(Serialize, Deserialize)]
struct MockMessage {
    signer: Fingerprint,
    created: i64,
    payload: String,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Protects the key with a password; unlocking needs it from now on.
    pub fn set_password(&self, fingerprint: &Fingerprint, password: &str) {
        self.passwords
            .lock()
            .unwrap()
            .insert(fingerprint.clone(), password.to_string());
    }

    pub fn armor(&self, key: &Key) -> Result<String> {
        let kind = if key.is_private { "PRIVATE" } else { "PUBLIC" };
        Ok(format!(
            "-----BEGIN PGP {kind} KEY BLOCK-----\n\n{}\n-----END PGP {kind} KEY BLOCK-----\n",
            serde_json::to_string(key)?
        ))
    }

    fn check_password(&self, key: &Key, password: &str) -> Result<()> {
        let expected = self
            .passwords
            .lock()
            .unwrap()
            .get(&key.fingerprint)
            .cloned()
            .unwrap_or_default();
        if password != expected {
            bail!("wrong password for key {}", key.fingerprint);
        }
        Ok(())
    }
}

fn parse_blocks(armored: &str) -> Result<Vec<String>> {
    let mut blocks = Vec::new();
    let mut current: Option<String> = None;
    for line in armored.lines() {
        if line.starts_with("-----BEGIN PGP") {
            current = Some(String::new());
        } else if line.starts_with("-----END PGP") {
            blocks.push(current.take().context("stray end marker")?);
        } else if let Some(block) = current.as_mut() {
            block.push_str(line.trim());
        }
    }
    if blocks.is_empty() {
        bail!("no armored block found");
    }
    Ok(blocks)
}

impl PgpEngine for MockEngine {
    fn parse_armored(&self, armored: &str) -> Result<Vec<Key>> {
        let mut keys = Vec::new();
        for block in parse_blocks(armored)? {
            keys.push(serde_json::from_str(&block)?);
        }
        Ok(keys)
    }

    fn armor(&self, key: &Key) -> Result<String> {
        MockEngine::armor(self, key)
    }

    fn merge_keys(&self, existing: &Key, update: &Key) -> Result<Key> {
        if existing.fingerprint != update.fingerprint {
            bail!("fingerprint mismatch in key merge");
        }
        let mut merged = existing.clone();
        for user in &update.users {
            if let Some(held) = merged
                .users
                .iter_mut()
                .find(|u| u.id.email == user.id.email)
            {
                held.valid_self_cert |= user.valid_self_cert;
                for certification in &user.certifications {
                    if !held.certifications.contains(certification) {
                        held.certifications.push(certification.clone());
                    }
                }
            } else {
                merged.users.push(user.clone());
            }
        }
        for subkey in &update.subkey_ids {
            if !merged.subkey_ids.contains(subkey) {
                merged.subkey_ids.push(subkey.clone());
            }
        }
        if update.expires.is_some() {
            merged.expires = update.expires;
        }
        merged.revoked |= update.revoked;
        merged.can_encrypt |= update.can_encrypt;
        merged.can_sign |= update.can_sign;
        Ok(merged)
    }

    fn sanitize_key(&self, key: &Key) -> Option<Key> {
        let mut key = key.clone();
        key.users.retain(|u| u.valid_self_cert);
        if key.users.is_empty() {
            return None;
        }
        Some(key)
    }

    fn verify_certification(
        &self,
        signer: &Key,
        _key: &Key,
        _email: &str,
        certification: &crate::key::Certification,
    ) -> bool {
        certification.issuer == signer.fingerprint && signer.can_sign
    }

    fn generate_key(&self, params: &KeyGenParams) -> Result<KeyPair> {
        let email = params
            .user_ids
            .first()
            .map(|u| u.email.clone())
            .context("no user identity for key generation")?;
        let mut pair = make_key_pair(&email, time());
        for user in params.user_ids.iter().skip(1) {
            let user = KeyUser {
                id: user.clone(),
                valid_self_cert: true,
                certifications: Vec::new(),
            };
            pair.public.users.push(user.clone());
            pair.secret.users.push(user);
        }
        pair.public.expires = params.expires;
        pair.secret.expires = params.expires;
        if let Some(password) = &params.password {
            self.set_password(&pair.secret.fingerprint, password);
        }
        Ok(pair)
    }

    fn unlock_key(&self, key: &Key, _key_id: &KeyId, password: &str) -> Result<Key> {
        self.check_password(key, password)?;
        Ok(key.clone())
    }

    fn sign_encrypt(&self, data: &[u8], signer: &Key, password: &str) -> Result<String> {
        self.check_password(signer, password)?;
        let message = MockMessage {
            signer: signer.fingerprint.clone(),
            created: time(),
            payload: hex::encode(data),
        };
        Ok(format!(
            "-----BEGIN PGP MESSAGE-----\n\n{}\n-----END PGP MESSAGE-----\n",
            serde_json::to_string(&message)?
        ))
    }

    fn decrypt_verify(
        &self,
        message: &str,
        key: &Key,
        password: &str,
    ) -> Result<DecryptedPackage> {
        self.check_password(key, password)?;
        let blocks = parse_blocks(message)?;
        let message: MockMessage = serde_json::from_str(&blocks[0])?;
        Ok(DecryptedPackage {
            data: hex::decode(&message.payload)?,
            signatures: vec![VerifiedSignature {
                valid: true,
                fingerprint: message.signer,
                created: message.created,
            }],
        })
    }
}

/// Scriptable password prompt. Without a scripted password every prompt
/// is "dismissed" and rejects with [`PromptCancelled`].
#[derive(Debug, Default)]
pub(crate) struct MockPrompt {
    password: Mutex<Option<String>>,
    calls: AtomicUsize,
}

impl MockPrompt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_password(&self, password: Option<&str>) {
        *self.password.lock().unwrap() = password.map(str::to_string);
    }

    /// How many times the prompt was shown.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl PasswordPrompt for MockPrompt {
    fn prompt<'a>(&'a self, request: PromptRequest) -> BoxFuture<'a, Result<PromptResponse>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::Relaxed);
            match self.password.lock().unwrap().clone() {
                Some(password) => Ok(PromptResponse {
                    key: request.key,
                    password,
                }),
                None => Err(PromptCancelled.into()),
            }
        })
    }
}

#[derive(Debug, Default)]
struct RemoteState {
    counter: u64,
    current: Option<(String, String)>,
}

/// In-memory sync transport with eTag semantics, shareable between test
/// contexts to simulate multiple devices.
#[derive(Debug, Default)]
pub(crate) struct MemoryTransport {
    state: Mutex<RemoteState>,
    delay_ms: AtomicU64,
    downloads: AtomicUsize,
    uploads: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every transport call, keeping cycles in flight long enough
    /// for coalescing tests.
    pub fn set_delay_ms(&self, delay: u64) {
        self.delay_ms.store(delay, Ordering::Relaxed);
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::Relaxed)
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::Relaxed)
    }

    async fn delay(&self) {
        let delay = self.delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }
}

impl SyncTransport for MemoryTransport {
    fn download<'a>(&'a self, etag: &'a str) -> BoxFuture<'a, Result<SyncDownload>> {
        Box::pin(async move {
            self.downloads.fetch_add(1, Ordering::Relaxed);
            self.delay().await;
            let state = self.state.lock().unwrap();
            Ok(match &state.current {
                None => SyncDownload::None,
                Some((current, _)) if current == etag => SyncDownload::NotModified,
                Some((current, payload)) => SyncDownload::Changed {
                    etag: current.clone(),
                    payload: payload.clone(),
                },
            })
        })
    }

    fn upload<'a>(&'a self, etag: &'a str, payload: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.uploads.fetch_add(1, Ordering::Relaxed);
            self.delay().await;
            let mut state = self.state.lock().unwrap();
            if let Some((current, _)) = &state.current {
                if current != etag {
                    bail!("upload conflict: remote version is {current}, got {etag}");
                }
            }
            state.counter += 1;
            let new_etag = state.counter.to_string();
            state.current = Some((new_etag.clone(), payload.to_string()));
            Ok(new_etag)
        })
    }
}

/// In-memory key agent holding a list of key pairs.
#[derive(Debug, Default)]
pub(crate) struct MockAgent {
    keys: Mutex<Vec<KeyPair>>,
}

impl MockAgent {
    pub fn with_keys(keys: Vec<KeyPair>) -> Arc<Self> {
        Arc::new(MockAgent {
            keys: Mutex::new(keys),
        })
    }
}

impl KeyAgent for MockAgent {
    fn load_keys<'a>(&'a self) -> BoxFuture<'a, Result<(Vec<Key>, Vec<Key>)>> {
        Box::pin(async move {
            let keys = self.keys.lock().unwrap();
            Ok((
                keys.iter().map(|pair| pair.public.clone()).collect(),
                keys.iter().map(|pair| pair.secret.clone()).collect(),
            ))
        })
    }

    fn generate_key<'a>(&'a self, params: &'a KeyGenParams) -> BoxFuture<'a, Result<KeyPair>> {
        Box::pin(async move {
            let email = params
                .user_ids
                .first()
                .map(|u| u.email.clone())
                .context("no user identity for key generation")?;
            let pair = make_key_pair(&email, time());
            self.keys.lock().unwrap().push(pair.clone());
            Ok(pair)
        })
    }

    fn delete_key<'a>(&'a self, fingerprint: &'a Fingerprint) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut keys = self.keys.lock().unwrap();
            let before = keys.len();
            keys.retain(|pair| &pair.public.fingerprint != fingerprint);
            if keys.len() == before {
                bail!("agent holds no key {fingerprint}");
            }
            Ok(())
        })
    }
}

/// Scriptable lookup source serving at most one key.
#[derive(Debug)]
pub(crate) struct MockSource {
    name: String,
    external: bool,
    hit: Option<SourceHit>,
    fail: bool,
}

impl MockSource {
    pub fn new(name: &str, external: bool) -> Self {
        MockSource {
            name: name.to_string(),
            external,
            hit: None,
            fail: false,
        }
    }

    pub fn with_key(mut self, t: &TestContext, key: &Key, last_modified: i64) -> Self {
        self.hit = Some(SourceHit {
            armored: t.engine.armor(key).unwrap(),
            last_modified,
        });
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

impl KeySource for MockSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn external(&self) -> bool {
        self.external
    }

    fn fetch<'a>(&'a self, _query: &'a LookupQuery) -> BoxFuture<'a, Result<Option<SourceHit>>> {
        Box::pin(async move {
            if self.fail {
                bail!("key source {} unavailable", self.name);
            }
            Ok(self.hit.clone())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_engine_armor_roundtrip() {
        let engine = MockEngine::new();
        let alice = make_key("alice@example.org", 1_700_000_000);
        let bob = make_key("bob@example.org", 1_700_000_100);

        let armored = format!(
            "{}{}",
            engine.armor(&alice).unwrap(),
            engine.armor(&bob).unwrap()
        );
        let parsed = engine.parse_armored(&armored).unwrap();
        assert_eq!(parsed, vec![alice, bob]);
    }

    #[test]
    fn test_mock_engine_message_roundtrip() {
        let engine = MockEngine::new();
        let pair = make_key_pair("alice@example.org", 1_700_000_000);
        engine.set_password(&pair.secret.fingerprint, "trustno1");

        assert!(engine.sign_encrypt(b"hello", &pair.secret, "").is_err());
        let message = engine
            .sign_encrypt(b"hello", &pair.secret, "trustno1")
            .unwrap();
        let decrypted = engine
            .decrypt_verify(&message, &pair.secret, "trustno1")
            .unwrap();
        assert_eq!(decrypted.data, b"hello");
        assert_eq!(decrypted.signatures[0].fingerprint, pair.secret.fingerprint);
        assert!(decrypted.signatures[0].valid);
    }
}

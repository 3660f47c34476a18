//! External key lookup.
//!
//! Missing public keys are searched through a fixed, ranked list of
//! sources: the authenticating key server first, then the web key
//! directory, then the opportunistic-encryption local store. By default the
//! first source returning a usable key wins; callers can instead ask for
//! the most recently modified copy across all sources.

use std::fmt;

use anyhow::{Context as _, Result};
use futures::future::BoxFuture;

use crate::context::Context;
use crate::key::{Fingerprint, Key, KeyId};
use crate::tools::{time, EmailAddress};

/// What to search for. At least one field should be set; sources ignore
/// fields they cannot query by.
#[derive(Debug, Clone, Default)]
pub struct LookupQuery {
    /// Email address of the wanted identity.
    pub email: Option<String>,

    /// Long key ID.
    pub key_id: Option<KeyId>,

    /// Full fingerprint.
    pub fingerprint: Option<Fingerprint>,
}

/// A raw hit from one source.
#[derive(Debug, Clone)]
pub struct SourceHit {
    /// The armored public key.
    pub armored: String,

    /// When the source last saw the key change, unix seconds.
    pub last_modified: i64,
}

/// One ranked key source.
pub trait KeySource: Send + Sync + fmt::Debug {
    /// Source name, for logging.
    fn name(&self) -> &str;

    /// Whether the source queries an external service. The
    /// opportunistic-encryption store is local and reports `false`.
    fn external(&self) -> bool;

    /// Looks up a key. `None` when the source has no match.
    fn fetch<'a>(&'a self, query: &'a LookupQuery) -> BoxFuture<'a, Result<Option<SourceHit>>>;
}

/// Options for [`lookup`].
#[derive(Debug, Clone, Default)]
pub struct LookupOptions {
    /// The search terms.
    pub query: LookupQuery,

    /// Query all sources and return the most recently modified copy
    /// instead of the first hit by rank.
    pub latest: bool,

    /// Skip sources that are not external services.
    pub external_only: bool,
}

/// Searches the ranked sources for a usable public key.
///
/// Every candidate must pass the standard valid-for-encryption check. A
/// source failing to respond, or returning a key that does not parse or
/// validate, is logged and does not abort the remaining sources.
pub async fn lookup(context: &Context, options: &LookupOptions) -> Result<Option<Key>> {
    if let Some(email) = &options.query.email {
        EmailAddress::new(email).with_context(|| format!("invalid lookup address {email:?}"))?;
    }
    let mut best: Option<(i64, Key)> = None;
    for source in context.sources() {
        if options.external_only && !source.external() {
            continue;
        }
        let hit = match source.fetch(&options.query).await {
            Ok(Some(hit)) => hit,
            Ok(None) => continue,
            Err(err) => {
                warn!(context, "Key source {} failed: {:#}", source.name(), err);
                continue;
            }
        };
        let Some(key) = usable_key(context, source.name(), &hit.armored) else {
            continue;
        };
        if !options.latest {
            info!(context, "Key {} found via {}", key.fingerprint, source.name());
            return Ok(Some(key));
        }
        match &best {
            Some((seen, _)) if *seen >= hit.last_modified => {}
            _ => best = Some((hit.last_modified, key)),
        }
    }
    Ok(best.map(|(_, key)| key))
}

/// Parses and validates one source hit; logs and discards bad material.
fn usable_key(context: &Context, source: &str, armored: &str) -> Option<Key> {
    let keys = match context.engine().parse_armored(armored) {
        Ok(keys) => keys,
        Err(err) => {
            warn!(context, "Unparseable key from {}: {:#}", source, err);
            return None;
        }
    };
    let now = time();
    for key in keys {
        let Some(key) = context.engine().sanitize_key(&key) else {
            continue;
        };
        if key.is_private || !key.is_valid_encryption_key_at(now) {
            continue;
        }
        return Some(key);
    }
    warn!(context, "No usable key in response from {}", source);
    None
}

//! Trust-on-first-use binding of email addresses to key fingerprints.
//!
//! Every successful decrypt/verify operation may bind the sender address to
//! the fingerprint of the first valid signature. Bindings only ever move
//! forward in time: a signature older than the recorded one never rebinds
//! the address.

use anyhow::{Context as _, Result};

use crate::context::Context;
use crate::key::Key;
use crate::keyring::{KeyBinding, KeyringAttributes, KeyringId};
use crate::pgp::VerifiedSignature;
use crate::tools::EmailAddress;

/// Applies the first valid signature to the binding map. Returns `true` if
/// the binding was created or moved forward.
pub(crate) fn apply_binding(
    attributes: &mut KeyringAttributes,
    email: &str,
    signatures: &[VerifiedSignature],
) -> bool {
    let Some(signature) = signatures.iter().find(|s| s.valid) else {
        return false;
    };
    // last_seen is in milliseconds, signature times in seconds.
    let seen = signature.created * 1000;
    let email = email.to_lowercase();
    match attributes.key_bindings.get(&email) {
        Some(existing) if existing.last_seen >= seen => false,
        _ => {
            attributes.key_bindings.insert(
                email,
                KeyBinding {
                    fingerprint: signature.fingerprint.clone(),
                    last_seen: seen,
                },
            );
            true
        }
    }
}

/// Records the sender binding of a verified message and persists the
/// keyring attributes when the binding moved.
///
/// No-op while key binding is disabled in the settings.
pub async fn update_key_binding(
    context: &Context,
    keyring_id: &KeyringId,
    email: &str,
    signatures: &[VerifiedSignature],
) -> Result<()> {
    if !context.settings().key_binding {
        return Ok(());
    }
    EmailAddress::new(email).with_context(|| format!("invalid binding address {email:?}"))?;
    let mut keyrings = context.keyrings().write().await;
    let keyring = keyrings
        .get_mut(keyring_id)
        .with_context(|| format!("no keyring {keyring_id}"))?;
    if apply_binding(&mut keyring.attributes, email, signatures) {
        keyring.save_attributes(context).await?;
        if let Some(binding) = keyring.attributes.key_bindings.get(&email.to_lowercase()) {
            info!(
                context,
                "Bound {} to key {} in keyring {}", email, binding.fingerprint, keyring_id
            );
        }
    }
    Ok(())
}

/// Whether `key` is the bound key for `email`.
///
/// An absent binding counts as bound; the caller decides what absence
/// means for its query.
pub fn is_key_bound(attributes: &KeyringAttributes, email: &str, key: &Key) -> bool {
    match attributes.key_bindings.get(&email.to_lowercase()) {
        Some(binding) => binding.fingerprint == key.fingerprint,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::make_key;

    fn signature(key: &Key, created: i64, valid: bool) -> VerifiedSignature {
        VerifiedSignature {
            valid,
            fingerprint: key.fingerprint.clone(),
            created,
        }
    }

    #[test]
    fn test_first_valid_signature_binds() {
        let mut attributes = KeyringAttributes::default();
        let bad = make_key("mallory@example.org", 1_700_000_000);
        let good = make_key("alice@example.org", 1_700_000_000);

        assert!(apply_binding(
            &mut attributes,
            "Alice@Example.org",
            &[signature(&bad, 2_000, false), signature(&good, 1_000, true)],
        ));
        let binding = &attributes.key_bindings["alice@example.org"];
        assert_eq!(binding.fingerprint, good.fingerprint);
        assert_eq!(binding.last_seen, 1_000_000);

        // No valid signature: nothing changes.
        assert!(!apply_binding(
            &mut attributes,
            "alice@example.org",
            &[signature(&bad, 3_000, false)],
        ));
    }

    #[test]
    fn test_binding_is_monotonic() {
        let mut attributes = KeyringAttributes::default();
        let old_key = make_key("alice@example.org", 1_600_000_000);
        let new_key = make_key("alice@example.org", 1_700_000_000);

        assert!(apply_binding(
            &mut attributes,
            "alice@example.org",
            &[signature(&new_key, 2_000, true)],
        ));

        // An older signature never rebinds, equal timestamps neither.
        assert!(!apply_binding(
            &mut attributes,
            "alice@example.org",
            &[signature(&old_key, 1_000, true)],
        ));
        assert!(!apply_binding(
            &mut attributes,
            "alice@example.org",
            &[signature(&old_key, 2_000, true)],
        ));
        assert_eq!(
            attributes.key_bindings["alice@example.org"].fingerprint,
            new_key.fingerprint
        );

        // A newer one does.
        assert!(apply_binding(
            &mut attributes,
            "alice@example.org",
            &[signature(&old_key, 3_000, true)],
        ));
        assert_eq!(
            attributes.key_bindings["alice@example.org"].fingerprint,
            old_key.fingerprint
        );
    }

    #[tokio::test]
    async fn test_update_rejects_malformed_address() {
        let t = crate::test_utils::TestContext::new().await;
        t.set_settings(|s| s.key_binding = true).await.unwrap();
        let key = make_key("alice@example.org", 1_700_000_000);
        let main = KeyringId::new(crate::keyring::MAIN_KEYRING_ID);

        let res = update_key_binding(
            &t,
            &main,
            "<alice@example.org>",
            &[signature(&key, 1_000, true)],
        )
        .await;
        assert!(res.is_err());
    }

    #[test]
    fn test_is_key_bound() {
        let mut attributes = KeyringAttributes::default();
        let bound = make_key("alice@example.org", 1_700_000_000);
        let other = make_key("alice@example.org", 1_700_000_100);

        // Absence counts as bound.
        assert!(is_key_bound(&attributes, "alice@example.org", &other));

        apply_binding(
            &mut attributes,
            "alice@example.org",
            &[signature(&bound, 1_000, true)],
        );
        assert!(is_key_bound(&attributes, "alice@example.org", &bound));
        assert!(!is_key_bound(&attributes, "alice@example.org", &other));
    }
}

//! Provider trust keys and pseudo-revocation.
//!
//! A provider can pin a "trust key" for its domain and certify the identity
//! of keys it vouches for. A certification *revocation* from the trust key
//! with reason code "key retired/superseded" marks a key as pseudo-revoked
//! for that provider's keyrings without the key owner's cooperation. A
//! later certification from the same trust key overrides the revocation, so
//! the provider can un-revoke.

use anyhow::{bail, Result};

use crate::context::Context;
use crate::key::{format_fingerprint, Key, REASON_KEY_SUPERSEDED};
use crate::keyring::KeyringId;

/// Pins the trust key for a provider domain.
///
/// The armored text must contain exactly one public key; the trust key is
/// not a member of any keyring.
pub fn set_trust_key(context: &Context, domain: &str, armored: &str) -> Result<()> {
    let mut keys = context.engine().parse_armored(armored)?;
    let Some(key) = keys.pop() else {
        bail!("no key in trust key block for domain {domain:?}");
    };
    if !keys.is_empty() {
        bail!("more than one key in trust key block for domain {domain:?}");
    }
    if key.is_private {
        bail!("trust key for domain {domain:?} must be a public key");
    }
    info!(
        context,
        "Pinned trust key {} for domain {}",
        format_fingerprint(key.fingerprint.hex()),
        domain
    );
    context.insert_trust_key(domain, key);
    Ok(())
}

/// Whether `key` is pseudo-revoked for the given keyring.
///
/// Resolves the trust key from the keyring ID's domain component; without a
/// pinned trust key for the domain nothing is pseudo-revoked. Otherwise the
/// key counts as pseudo-revoked iff some identity carries a validating
/// revocation with reason code [`REASON_KEY_SUPERSEDED`] from the trust key
/// and no later certification from the same trust key.
pub(crate) fn is_key_pseudo_revoked(context: &Context, keyring_id: &KeyringId, key: &Key) -> bool {
    let Some(domain) = keyring_id.domain() else {
        return false;
    };
    let Some(trust_key) = context.trust_key(domain) else {
        return false;
    };

    for user in &key.users {
        let mut revoked_at = None;
        for certification in &user.certifications {
            if certification.issuer != trust_key.fingerprint
                || !certification.revocation
                || certification.reason_code != Some(REASON_KEY_SUPERSEDED)
            {
                continue;
            }
            if !context
                .engine()
                .verify_certification(&trust_key, key, &user.id.email, certification)
            {
                continue;
            }
            revoked_at = match revoked_at {
                Some(prior) if prior >= certification.created => Some(prior),
                _ => Some(certification.created),
            };
        }
        let Some(revoked_at) = revoked_at else { continue };

        let recertified = user.certifications.iter().any(|certification| {
            certification.issuer == trust_key.fingerprint
                && !certification.revocation
                && certification.created > revoked_at
                && context
                    .engine()
                    .verify_certification(&trust_key, key, &user.id.email, certification)
        });
        if !recertified {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Certification;
    use crate::test_utils::{make_key, TestContext};

    fn certify(key: &mut Key, issuer: &Key, created: i64, revocation: bool, reason: Option<u8>) {
        key.users[0].certifications.push(Certification {
            issuer: issuer.fingerprint.clone(),
            created,
            revocation,
            reason_code: reason,
        });
    }

    async fn pin(t: &TestContext, domain: &str, key: &Key) {
        let armored = t.engine.armor(key).unwrap();
        set_trust_key(t, domain, &armored).unwrap();
    }

    #[tokio::test]
    async fn test_pseudo_revocation() {
        let t = TestContext::new().await;
        let keyring_id = KeyringId::new("provider.example|alice");
        let trust_key = make_key("trust@provider.example", 1_600_000_000);
        pin(&t, "provider.example", &trust_key).await;

        let mut key = make_key("alice@provider.example", 1_700_000_000);
        assert!(!is_key_pseudo_revoked(&t, &keyring_id, &key));

        // Revocation with the "key retired/superseded" reason code.
        certify(
            &mut key,
            &trust_key,
            1_700_000_100,
            true,
            Some(REASON_KEY_SUPERSEDED),
        );
        assert!(is_key_pseudo_revoked(&t, &keyring_id, &key));

        // A later certification from the same trust key un-revokes.
        certify(&mut key, &trust_key, 1_700_000_200, false, None);
        assert!(!is_key_pseudo_revoked(&t, &keyring_id, &key));
    }

    #[tokio::test]
    async fn test_earlier_certification_does_not_override() {
        let t = TestContext::new().await;
        let keyring_id = KeyringId::new("provider.example|alice");
        let trust_key = make_key("trust@provider.example", 1_600_000_000);
        pin(&t, "provider.example", &trust_key).await;

        let mut key = make_key("alice@provider.example", 1_700_000_000);
        certify(&mut key, &trust_key, 1_700_000_050, false, None);
        certify(
            &mut key,
            &trust_key,
            1_700_000_100,
            true,
            Some(REASON_KEY_SUPERSEDED),
        );
        assert!(is_key_pseudo_revoked(&t, &keyring_id, &key));
    }

    #[tokio::test]
    async fn test_other_reason_codes_are_ignored() {
        let t = TestContext::new().await;
        let keyring_id = KeyringId::new("provider.example|alice");
        let trust_key = make_key("trust@provider.example", 1_600_000_000);
        pin(&t, "provider.example", &trust_key).await;

        let mut key = make_key("alice@provider.example", 1_700_000_000);
        certify(&mut key, &trust_key, 1_700_000_100, true, Some(0));
        assert!(!is_key_pseudo_revoked(&t, &keyring_id, &key));
    }

    #[tokio::test]
    async fn test_foreign_issuer_is_ignored() {
        let t = TestContext::new().await;
        let keyring_id = KeyringId::new("provider.example|alice");
        let trust_key = make_key("trust@provider.example", 1_600_000_000);
        let mallory = make_key("mallory@example.org", 1_600_000_000);
        pin(&t, "provider.example", &trust_key).await;

        let mut key = make_key("alice@provider.example", 1_700_000_000);
        certify(
            &mut key,
            &mallory,
            1_700_000_100,
            true,
            Some(REASON_KEY_SUPERSEDED),
        );
        assert!(!is_key_pseudo_revoked(&t, &keyring_id, &key));
    }

    #[tokio::test]
    async fn test_no_trust_key_for_domain() {
        let t = TestContext::new().await;
        let trust_key = make_key("trust@provider.example", 1_600_000_000);
        pin(&t, "provider.example", &trust_key).await;

        let mut key = make_key("alice@other.example", 1_700_000_000);
        certify(
            &mut key,
            &trust_key,
            1_700_000_100,
            true,
            Some(REASON_KEY_SUPERSEDED),
        );
        // Different domain, and the reserved main keyring has no domain.
        assert!(!is_key_pseudo_revoked(
            &t,
            &KeyringId::new("other.example|alice"),
            &key
        ));
        assert!(!is_key_pseudo_revoked(
            &t,
            &KeyringId::new(crate::keyring::MAIN_KEYRING_ID),
            &key
        ));
    }
}

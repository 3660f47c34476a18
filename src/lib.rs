//! # keysync
//!
//! Key management and cross-device keyring synchronization core for an
//! OpenPGP webmail assistant.
//!
//! The crate owns keyrings and their backing stores, the policy that decides
//! which key serves which identity, the password/unlock cache, provider trust
//! (pseudo-revocation), TOFU key bindings and the change-log based protocol
//! that keeps a user's keyring consistent across devices through an untrusted
//! encrypted store.
//!
//! Cryptographic primitives, persistent storage, network transports and the
//! password-entry UI are *not* implemented here; they are consumed through
//! the collaborator traits [`pgp::PgpEngine`], [`storage::KvStorage`],
//! [`sync::SyncTransport`], [`lookup::KeySource`] and
//! [`password_cache::PasswordPrompt`].

#![forbid(unsafe_code)]
#![warn(
    missing_debug_implementations,
    clippy::correctness,
    clippy::wildcard_imports,
    clippy::needless_borrow
)]

#[macro_use]
mod log;

pub mod context;
pub mod events;
pub mod key;
pub mod key_binding;
pub mod keyring;
pub mod keystore;
pub mod lookup;
pub mod password_cache;
pub mod pgp;
pub mod registry;
pub mod storage;
pub mod sync;
pub mod tools;
pub mod trust;

#[cfg(test)]
mod test_utils;

pub use self::context::Context;
pub use self::events::EventType;

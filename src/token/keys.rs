//! Signing-key source with hot rotation.
//!
//! Keys live in an immutable snapshot behind a lock that is only ever
//! swapped wholesale, never mutated in place. Rotation installs a new
//! current key while keeping the rotated-out keys resolvable by `kid`, so
//! unexpired tokens signed under a previous key keep validating.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use rsa::RsaPrivateKey;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::{SigningKey, VerifyingKey};
use rsa::pkcs8::DecodePrivateKey;
use sha2::Sha256;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("failed to parse RSA key")]
    KeyParse,
}

/// One RSA signing key with its identifier, ready for both signing and
/// verification.
#[derive(Clone, Debug)]
pub struct SigningKeyEntry {
    kid: String,
    signing: SigningKey<Sha256>,
    verifying: VerifyingKey<Sha256>,
}

impl SigningKeyEntry {
    /// Load a key from PKCS#8 or PKCS#1, PEM or DER.
    ///
    /// # Errors
    ///
    /// Returns `KeyParse` when no supported encoding matches.
    pub fn from_pem_or_der(pem_or_der: &[u8], kid: impl Into<String>) -> Result<Self, KeyError> {
        let private = decode_private_key(pem_or_der)?;
        let signing = SigningKey::<Sha256>::new(private.clone());
        let verifying = VerifyingKey::<Sha256>::new(private.to_public_key());
        Ok(Self {
            kid: kid.into(),
            signing,
            verifying,
        })
    }

    #[must_use]
    pub fn kid(&self) -> &str {
        &self.kid
    }

    #[must_use]
    pub(crate) fn signing(&self) -> &SigningKey<Sha256> {
        &self.signing
    }

    #[must_use]
    pub(crate) fn verifying(&self) -> &VerifyingKey<Sha256> {
        &self.verifying
    }
}

fn decode_private_key(pem_or_der: &[u8]) -> Result<RsaPrivateKey, KeyError> {
    if pem_or_der.starts_with(b"-----BEGIN") {
        let text = std::str::from_utf8(pem_or_der).map_err(|_| KeyError::KeyParse)?;
        if let Ok(key) = RsaPrivateKey::from_pkcs8_pem(text) {
            return Ok(key);
        }
        if let Ok(key) = RsaPrivateKey::from_pkcs1_pem(text) {
            return Ok(key);
        }
        return Err(KeyError::KeyParse);
    }

    if let Ok(key) = RsaPrivateKey::from_pkcs8_der(pem_or_der) {
        return Ok(key);
    }
    if let Ok(key) = RsaPrivateKey::from_pkcs1_der(pem_or_der) {
        return Ok(key);
    }
    Err(KeyError::KeyParse)
}

/// Process-wide source of signing keys: one current key for issuance,
/// every loaded key resolvable for validation.
pub trait SigningKeySource: Send + Sync {
    fn current_key(&self) -> Arc<SigningKeyEntry>;
    fn key_by_id(&self, kid: &str) -> Option<Arc<SigningKeyEntry>>;
}

#[derive(Debug)]
struct KeyRingSnapshot {
    current: Arc<SigningKeyEntry>,
    by_kid: HashMap<String, Arc<SigningKeyEntry>>,
}

/// Atomically swappable key set. Read-mostly; rotation replaces the whole
/// snapshot.
#[derive(Debug)]
pub struct KeyRing {
    snapshot: RwLock<Arc<KeyRingSnapshot>>,
}

impl KeyRing {
    #[must_use]
    pub fn new(initial: SigningKeyEntry) -> Self {
        let current = Arc::new(initial);
        let mut by_kid = HashMap::new();
        by_kid.insert(current.kid().to_string(), Arc::clone(&current));
        Self {
            snapshot: RwLock::new(Arc::new(KeyRingSnapshot { current, by_kid })),
        }
    }

    /// Install a new current key. Previously loaded keys stay valid for
    /// validation during the rotation window.
    pub fn rotate(&self, next: SigningKeyEntry) {
        let next = Arc::new(next);
        let mut guard = self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut by_kid = guard.by_kid.clone();
        by_kid.insert(next.kid().to_string(), Arc::clone(&next));
        *guard = Arc::new(KeyRingSnapshot {
            current: next,
            by_kid,
        });
    }

    fn read(&self) -> Arc<KeyRingSnapshot> {
        Arc::clone(
            &self
                .snapshot
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }
}

impl SigningKeySource for KeyRing {
    fn current_key(&self) -> Arc<SigningKeyEntry> {
        Arc::clone(&self.read().current)
    }

    fn key_by_id(&self, kid: &str) -> Option<Arc<SigningKeyEntry>> {
        self.read().by_kid.get(kid).map(Arc::clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::test_keys::TEST_PRIVATE_KEY_PEM;

    #[test]
    fn loads_pkcs8_pem() {
        let entry = SigningKeyEntry::from_pem_or_der(TEST_PRIVATE_KEY_PEM.as_bytes(), "k1");
        assert_eq!(entry.map(|entry| entry.kid().to_string()).ok().as_deref(), Some("k1"));
    }

    #[test]
    fn rejects_garbage_key_material() {
        assert!(matches!(
            SigningKeyEntry::from_pem_or_der(b"-----BEGIN nonsense", "k"),
            Err(KeyError::KeyParse)
        ));
        assert!(matches!(
            SigningKeyEntry::from_pem_or_der(&[0u8; 16], "k"),
            Err(KeyError::KeyParse)
        ));
    }

    #[test]
    fn rotation_keeps_old_keys_resolvable() -> Result<(), KeyError> {
        let ring = KeyRing::new(SigningKeyEntry::from_pem_or_der(
            TEST_PRIVATE_KEY_PEM.as_bytes(),
            "k1",
        )?);
        assert_eq!(ring.current_key().kid(), "k1");

        ring.rotate(SigningKeyEntry::from_pem_or_der(
            TEST_PRIVATE_KEY_PEM.as_bytes(),
            "k2",
        )?);
        assert_eq!(ring.current_key().kid(), "k2");
        assert!(ring.key_by_id("k1").is_some());
        assert!(ring.key_by_id("k2").is_some());
        assert!(ring.key_by_id("k3").is_none());
        Ok(())
    }
}

//! Password hashing and verification.
//!
//! Argon2id with a per-credential random salt; the PHC string keeps the
//! hash, salt, and parameters together so parameter upgrades verify old
//! records transparently. Hashing is memory-hard and CPU-bound, so it runs
//! on the blocking pool behind a semaphore: a login storm beyond the cap is
//! shed as `Throttled` instead of queueing unboundedly.

use argon2::{
    Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier, Version,
    password_hash::{Error as PasswordHashError, SaltString},
};
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::account::PasswordCredential;

const DEFAULT_MEMORY_KIB: u32 = 64 * 1024;
const DEFAULT_TIME_COST: u32 = 3;
const DEFAULT_PARALLELISM: u32 = 1;
const DEFAULT_MAX_CONCURRENT: usize = 4;

#[derive(Debug, Error)]
pub enum HasherError {
    /// The bounded hashing pool is saturated.
    #[error("hashing pool saturated")]
    Throttled,

    /// Stored credential record cannot be parsed. Data corruption; fatal
    /// to the calling operation and never retried.
    #[error("malformed stored credential")]
    Corrupt,

    #[error("hashing failed: {0}")]
    Hash(String),

    #[error("hashing task failed: {0}")]
    Task(String),
}

/// Argon2id cost parameters and the concurrency cap for the worker pool.
#[derive(Clone, Copy, Debug)]
pub struct HasherConfig {
    memory_kib: u32,
    time_cost: u32,
    parallelism: u32,
    max_concurrent: usize,
}

impl Default for HasherConfig {
    fn default() -> Self {
        Self {
            memory_kib: DEFAULT_MEMORY_KIB,
            time_cost: DEFAULT_TIME_COST,
            parallelism: DEFAULT_PARALLELISM,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }
}

impl HasherConfig {
    #[must_use]
    pub fn with_memory_kib(mut self, memory_kib: u32) -> Self {
        self.memory_kib = memory_kib;
        self
    }

    #[must_use]
    pub fn with_time_cost(mut self, time_cost: u32) -> Self {
        self.time_cost = time_cost;
        self
    }

    #[must_use]
    pub fn with_parallelism(mut self, parallelism: u32) -> Self {
        self.parallelism = parallelism;
        self
    }

    #[must_use]
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }
}

/// One-way credential hasher over a bounded blocking pool.
#[derive(Debug)]
pub struct CredentialHasher {
    config: HasherConfig,
    pool: Semaphore,
}

impl CredentialHasher {
    #[must_use]
    pub fn new(config: HasherConfig) -> Self {
        Self {
            pool: Semaphore::new(config.max_concurrent),
            config,
        }
    }

    /// Hash a password with a fresh random salt.
    ///
    /// # Errors
    ///
    /// `Throttled` when the pool is saturated; `Hash` on parameter or
    /// hashing failures.
    pub async fn hash(&self, password: SecretString) -> Result<PasswordCredential, HasherError> {
        let _permit = self.pool.try_acquire().map_err(|_| HasherError::Throttled)?;
        let config = self.config;
        tokio::task::spawn_blocking(move || hash_blocking(&config, &password))
            .await
            .map_err(|err| HasherError::Task(err.to_string()))?
    }

    /// Verify a password against a stored credential.
    ///
    /// Mismatch is `Ok(false)`; the comparison is delegated to the
    /// algorithm's own verifier, never a byte-by-byte shortcut.
    ///
    /// # Errors
    ///
    /// `Throttled` when the pool is saturated; `Corrupt` when the stored
    /// record cannot be parsed.
    pub async fn verify(
        &self,
        password: SecretString,
        stored: PasswordCredential,
    ) -> Result<bool, HasherError> {
        let _permit = self.pool.try_acquire().map_err(|_| HasherError::Throttled)?;
        tokio::task::spawn_blocking(move || verify_blocking(&password, &stored))
            .await
            .map_err(|err| HasherError::Task(err.to_string()))?
    }
}

fn context(config: &HasherConfig) -> Result<Argon2<'static>, HasherError> {
    let params = Params::new(
        config.memory_kib,
        config.time_cost,
        config.parallelism,
        None,
    )
    .map_err(|err| HasherError::Hash(err.to_string()))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

fn hash_blocking(
    config: &HasherConfig,
    password: &SecretString,
) -> Result<PasswordCredential, HasherError> {
    let argon = context(config)?;
    let salt = SaltString::generate(&mut OsRng);
    let hash = argon
        .hash_password(password.expose_secret().as_bytes(), &salt)
        .map_err(|err| HasherError::Hash(err.to_string()))?;
    Ok(PasswordCredential::from_phc(hash.to_string()))
}

fn verify_blocking(
    password: &SecretString,
    stored: &PasswordCredential,
) -> Result<bool, HasherError> {
    let parsed = PasswordHash::new(stored.phc()).map_err(|_| HasherError::Corrupt)?;
    // Cost parameters come from the PHC string itself.
    match Argon2::default().verify_password(password.expose_secret().as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(PasswordHashError::Password) => Ok(false),
        Err(_) => Err(HasherError::Corrupt),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> HasherConfig {
        // Minimum argon2 costs keep the test suite quick.
        HasherConfig::default()
            .with_memory_kib(8)
            .with_time_cost(1)
            .with_max_concurrent(2)
    }

    fn secret(value: &str) -> SecretString {
        SecretString::from(value.to_string())
    }

    #[tokio::test]
    async fn hash_then_verify_round_trip() -> Result<(), HasherError> {
        let hasher = CredentialHasher::new(fast_config());
        let stored = hasher.hash(secret("Passw0rd!")).await?;
        assert!(hasher.verify(secret("Passw0rd!"), stored.clone()).await?);
        assert!(!hasher.verify(secret("passw0rd!"), stored).await?);
        Ok(())
    }

    #[tokio::test]
    async fn salts_differ_between_hashes() -> Result<(), HasherError> {
        let hasher = CredentialHasher::new(fast_config());
        let first = hasher.hash(secret("same")).await?;
        let second = hasher.hash(secret("same")).await?;
        assert_ne!(first.phc(), second.phc());
        Ok(())
    }

    #[tokio::test]
    async fn phc_string_declares_argon2id() -> Result<(), HasherError> {
        let hasher = CredentialHasher::new(fast_config());
        let stored = hasher.hash(secret("x")).await?;
        assert!(stored.phc().starts_with("$argon2id$"));
        Ok(())
    }

    #[tokio::test]
    async fn malformed_record_is_corrupt_not_mismatch() {
        let hasher = CredentialHasher::new(fast_config());
        let stored = PasswordCredential::from_phc("not-a-phc-string".to_string());
        let result = hasher.verify(secret("x"), stored).await;
        assert!(matches!(result, Err(HasherError::Corrupt)));
    }

    #[tokio::test]
    async fn saturated_pool_sheds_load() {
        let hasher = CredentialHasher::new(fast_config().with_max_concurrent(0));
        let result = hasher.hash(secret("x")).await;
        assert!(matches!(result, Err(HasherError::Throttled)));
    }
}

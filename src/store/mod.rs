//! User Store collaborator contract.
//!
//! The core never talks to a database engine directly; it reads and writes
//! accounts through this trait. Conditional update against the previously
//! read version is the single cross-replica coordination primitive.

pub mod memory;

pub use memory::MemoryUserStore;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::account::{Account, Contact, Version};

#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique field (contact, OAuth identity) is already taken.
    #[error("duplicate unique field")]
    Conflict,

    /// The supplied version no longer matches the stored record.
    #[error("version mismatch on conditional update")]
    ConcurrencyConflict,

    #[error("account not found")]
    NotFound,

    #[error(transparent)]
    Unavailable(#[from] anyhow::Error),
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Account>, StoreError>;

    /// Look up by normalized contact value.
    async fn get_by_contact(&self, contact: &Contact) -> Result<Option<Account>, StoreError>;

    async fn get_by_oauth_identity(
        &self,
        provider: &str,
        subject_id: &str,
    ) -> Result<Option<Account>, StoreError>;

    /// Persist a new account. Fails `Conflict` when a unique field is
    /// already taken.
    async fn create(&self, account: &Account) -> Result<(), StoreError>;

    /// Conditional update: commits only when `expected_version` still
    /// matches, and returns the successor version.
    async fn update(
        &self,
        account: &Account,
        expected_version: Version,
    ) -> Result<Version, StoreError>;
}

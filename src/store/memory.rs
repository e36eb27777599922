//! In-memory User Store with real conditional-update semantics.
//!
//! Reference implementation of the store contract; also what the
//! integration tests run against. Uniqueness and version checks behave
//! like a real store so concurrency tests mean something.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use uuid::Uuid;

use crate::account::{Account, AuthMethod, Contact, Version};

use super::{StoreError, UserStore};

#[derive(Debug, Default)]
pub struct MemoryUserStore {
    accounts: Mutex<HashMap<Uuid, Account>>,
}

impl MemoryUserStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Account>> {
        self.accounts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn violates_uniqueness(accounts: &HashMap<Uuid, Account>, candidate: &Account) -> bool {
        accounts.values().any(|existing| {
            if existing.id == candidate.id {
                return false;
            }
            if existing.contact == candidate.contact {
                return true;
            }
            matches!(
                (&existing.auth_method, &candidate.auth_method),
                (
                    AuthMethod::OAuth {
                        provider: existing_provider,
                        subject_id: existing_subject,
                    },
                    AuthMethod::OAuth {
                        provider: candidate_provider,
                        subject_id: candidate_subject,
                    },
                ) if existing_provider == candidate_provider
                    && existing_subject == candidate_subject
            )
        })
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Account>, StoreError> {
        Ok(self.lock().get(&id).cloned())
    }

    async fn get_by_contact(&self, contact: &Contact) -> Result<Option<Account>, StoreError> {
        Ok(self
            .lock()
            .values()
            .find(|account| &account.contact == contact)
            .cloned())
    }

    async fn get_by_oauth_identity(
        &self,
        provider: &str,
        subject_id: &str,
    ) -> Result<Option<Account>, StoreError> {
        Ok(self
            .lock()
            .values()
            .find(|account| {
                matches!(
                    &account.auth_method,
                    AuthMethod::OAuth {
                        provider: stored_provider,
                        subject_id: stored_subject,
                    } if stored_provider == provider && stored_subject == subject_id
                )
            })
            .cloned())
    }

    async fn create(&self, account: &Account) -> Result<(), StoreError> {
        let mut accounts = self.lock();
        if accounts.contains_key(&account.id)
            || Self::violates_uniqueness(&accounts, account)
        {
            return Err(StoreError::Conflict);
        }
        accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn update(
        &self,
        account: &Account,
        expected_version: Version,
    ) -> Result<Version, StoreError> {
        let mut accounts = self.lock();
        let stored = accounts.get(&account.id).ok_or(StoreError::NotFound)?;
        if stored.version != expected_version {
            return Err(StoreError::ConcurrencyConflict);
        }
        if Self::violates_uniqueness(&accounts, account) {
            return Err(StoreError::Conflict);
        }
        let next_version = expected_version.next();
        let mut committed = account.clone();
        committed.version = next_version;
        accounts.insert(committed.id, committed);
        Ok(next_version)
    }
}

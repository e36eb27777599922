//! Account lifecycle manager: the sole entry point of the core.
//!
//! Orchestrates registration, verification, login, OAuth, role elevation,
//! status changes, and session management over the collaborator traits.
//! Every state transition is a read-modify-conditional-write against the
//! User Store; version conflicts are retried a bounded number of times
//! with a fresh read, so a losing writer re-decides against current state
//! instead of overwriting it. Domain events are published only after the
//! durable write commits.

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::account::{
    Account, AccountStatus, AuthMethod, CodePurpose, Contact, Role, VerificationState,
};
use crate::clock::{Clock, SystemClock};
use crate::credential::{CredentialHasher, HasherConfig, HasherError};
use crate::error::AuthError;
use crate::events::{self, EventSink, topics};
use crate::lockout::{self, LockoutConfig};
use crate::notifier::{Notifier, TEMPLATE_PASSWORD_RESET, TEMPLATE_VERIFY_CONTACT};
use crate::otp::{CodeEngine, CodeOutcome, OtpConfig};
use crate::store::{StoreError, UserStore};
use crate::token::{
    AccessTokenClaims, RefreshTokenGrant, RotateOutcome, SigningKeySource, TokenConfig,
    TokenError, TokenIssuer,
};

const DEFAULT_MAX_WRITE_RETRIES: u32 = 3;
const DEFAULT_COLLABORATOR_TIMEOUT: Duration = Duration::from_secs(5);

/// Knobs for the whole core, grouped by component.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    hasher: HasherConfig,
    otp: OtpConfig,
    lockout: LockoutConfig,
    tokens: TokenConfig,
    max_write_retries: u32,
    collaborator_timeout: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            hasher: HasherConfig::default(),
            otp: OtpConfig::default(),
            lockout: LockoutConfig::default(),
            tokens: TokenConfig::default(),
            max_write_retries: DEFAULT_MAX_WRITE_RETRIES,
            collaborator_timeout: DEFAULT_COLLABORATOR_TIMEOUT,
        }
    }
}

impl CoreConfig {
    #[must_use]
    pub fn with_hasher(mut self, hasher: HasherConfig) -> Self {
        self.hasher = hasher;
        self
    }

    #[must_use]
    pub fn with_otp(mut self, otp: OtpConfig) -> Self {
        self.otp = otp;
        self
    }

    #[must_use]
    pub fn with_lockout(mut self, lockout: LockoutConfig) -> Self {
        self.lockout = lockout;
        self
    }

    #[must_use]
    pub fn with_tokens(mut self, tokens: TokenConfig) -> Self {
        self.tokens = tokens;
        self
    }

    #[must_use]
    pub fn with_max_write_retries(mut self, retries: u32) -> Self {
        self.max_write_retries = retries;
        self
    }

    #[must_use]
    pub fn with_collaborator_timeout(mut self, timeout: Duration) -> Self {
        self.collaborator_timeout = timeout;
        self
    }

    #[must_use]
    pub fn lockout(&self) -> &LockoutConfig {
        &self.lockout
    }

    #[must_use]
    pub fn otp(&self) -> &OtpConfig {
        &self.otp
    }
}

/// Registration input.
#[derive(Debug)]
pub struct NewAccount {
    pub contact: Contact,
    /// Optional at registration; without one the account must set a
    /// password through the reset-code flow before logging in.
    pub password: Option<SecretString>,
    pub full_name: String,
    pub location: Option<String>,
}

/// Caller-side context for session issuance.
#[derive(Clone, Debug, Default)]
pub struct ClientInfo {
    pub device_info: String,
    pub ip: Option<String>,
}

/// Whether the triggering notification actually went out. Failures are
/// non-fatal; the caller can request a resend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryStatus {
    Delivered,
    Failed,
}

#[derive(Debug)]
pub struct Registration {
    pub account_id: Uuid,
    pub delivery: DeliveryStatus,
}

#[derive(Debug)]
pub struct SessionTokens {
    pub access_token: String,
    pub refresh_token: RefreshTokenGrant,
}

#[derive(Debug)]
pub struct OAuthLogin {
    pub tokens: SessionTokens,
    pub created: bool,
}

/// Identity triple already validated by the external provider; this core
/// never performs the token exchange itself.
#[derive(Clone, Debug)]
pub struct OAuthIdentity {
    pub provider: String,
    pub subject_id: String,
    pub email: String,
    pub display_name: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResendOutcome {
    Queued { delivery: DeliveryStatus },
    Cooldown,
    AlreadyVerified,
}

/// Result of one read-modify-write round: whether anything needs to be
/// persisted, carrying the value to hand back.
enum Applied<T> {
    Changed(T),
    Unchanged(T),
}

enum RotationResult {
    Rotated(RefreshTokenGrant, Role),
    Reused,
    Invalid,
    Expired,
}

pub struct LifecycleManager {
    store: Arc<dyn UserStore>,
    notifier: Arc<dyn Notifier>,
    events: Arc<dyn EventSink>,
    hasher: CredentialHasher,
    codes: CodeEngine,
    tokens: TokenIssuer,
    clock: Arc<dyn Clock>,
    config: CoreConfig,
}

impl LifecycleManager {
    #[must_use]
    pub fn new(
        store: Arc<dyn UserStore>,
        notifier: Arc<dyn Notifier>,
        events: Arc<dyn EventSink>,
        keys: Arc<dyn SigningKeySource>,
        config: CoreConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            events,
            hasher: CredentialHasher::new(config.hasher),
            codes: CodeEngine::new(config.otp),
            tokens: TokenIssuer::new(keys, config.tokens.clone()),
            clock: Arc::new(SystemClock),
            config,
        }
    }

    /// Replace the wall clock; tests drive expiry deterministically.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Create an account in `Unverified` state and dispatch its first
    /// verification code.
    ///
    /// # Errors
    ///
    /// `Conflict` when the contact is taken, `Throttled` under hashing
    /// pressure, `Validation` on malformed input.
    pub async fn register(&self, new_account: NewAccount) -> Result<Registration, AuthError> {
        let contact = normalize_contact(&new_account.contact)?;
        let full_name = new_account.full_name.trim().to_string();
        if full_name.is_empty() {
            return Err(AuthError::Validation("full name is required".to_string()));
        }

        // Pre-check for a friendly error; the store's create still
        // backstops the race.
        if self.find_by_contact(&contact).await?.is_some() {
            return Err(AuthError::Conflict);
        }

        let credential = match new_account.password {
            Some(password) => Some(self.hash_password(password).await?),
            None => None,
        };

        let now = self.clock.now_unix();
        let mut account = Account::new(
            contact.clone(),
            AuthMethod::Password { credential },
            full_name.clone(),
            now,
        )
        .with_location(
            new_account
                .location
                .map(|location| location.trim().to_string())
                .filter(|location| !location.is_empty()),
        );

        let issued = self
            .codes
            .issue(CodePurpose::VerifyContact, now)
            .map_err(AuthError::Internal)?;
        account.pending_code = Some(issued.record);

        self.store_call(self.store.create(&account)).await?;
        info!("account {} registered", account.id);

        let delivery = self
            .dispatch_code(&contact, TEMPLATE_VERIFY_CONTACT, &issued.code, &full_name)
            .await;
        // Only advertised once the write committed.
        self.publish(
            topics::USER_CREATED,
            events::user_created(account.id, &contact, now),
        )
        .await;

        Ok(Registration {
            account_id: account.id,
            delivery,
        })
    }

    /// Validate a submitted verification code.
    ///
    /// The attempt counter is persisted on every outcome; `Valid` flips
    /// the account to `Verified` and publishes `user.verified`.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown accounts, `Concurrency` after retries.
    pub async fn verify_code(
        &self,
        account_id: Uuid,
        submitted: &str,
    ) -> Result<CodeOutcome, AuthError> {
        let outcome = self
            .mutate_account(account_id, |account, now| {
                let Some(record) = account.pending_code.as_mut() else {
                    // No outstanding code behaves like an expired one and
                    // forces a re-issue.
                    return Ok(Applied::Unchanged(CodeOutcome::Expired));
                };
                if record.purpose != CodePurpose::VerifyContact {
                    return Ok(Applied::Unchanged(CodeOutcome::Expired));
                }
                let outcome = self.codes.validate(submitted, record, now);
                match outcome {
                    CodeOutcome::Valid => {
                        account.verification = VerificationState::Verified;
                        account.pending_code = None;
                    }
                    // Spent or burned codes are dropped so the next read
                    // treats them as absent.
                    CodeOutcome::Expired | CodeOutcome::RateLimited => {
                        account.pending_code = None;
                    }
                    CodeOutcome::Mismatch => {}
                }
                Ok(Applied::Changed(outcome))
            })
            .await?;

        if outcome == CodeOutcome::Valid {
            info!("account {account_id} verified");
            self.publish(
                topics::USER_VERIFIED,
                events::user_verified(account_id, self.clock.now_unix()),
            )
            .await;
        }
        Ok(outcome)
    }

    /// Re-issue the verification code, subject to a cooldown.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown accounts, `Concurrency` after retries.
    pub async fn resend_verification_code(
        &self,
        account_id: Uuid,
    ) -> Result<ResendOutcome, AuthError> {
        enum Decision {
            AlreadyVerified,
            Cooldown,
            Issue(String, Contact, String),
        }

        let cooldown = self.config.otp.resend_cooldown_seconds();
        let decision = self
            .mutate_account(account_id, |account, now| {
                if account.verification == VerificationState::Verified {
                    return Ok(Applied::Unchanged(Decision::AlreadyVerified));
                }
                if let Some(record) = &account.pending_code {
                    if record.purpose == CodePurpose::VerifyContact
                        && now < record.expires_at_unix
                        && now - record.issued_at_unix < cooldown
                    {
                        return Ok(Applied::Unchanged(Decision::Cooldown));
                    }
                }
                let issued = self
                    .codes
                    .issue(CodePurpose::VerifyContact, now)
                    .map_err(AuthError::Internal)?;
                account.pending_code = Some(issued.record);
                Ok(Applied::Changed(Decision::Issue(
                    issued.code,
                    account.contact.clone(),
                    account.full_name.clone(),
                )))
            })
            .await?;

        match decision {
            Decision::AlreadyVerified => Ok(ResendOutcome::AlreadyVerified),
            Decision::Cooldown => Ok(ResendOutcome::Cooldown),
            Decision::Issue(code, contact, full_name) => {
                let delivery = self
                    .dispatch_code(&contact, TEMPLATE_VERIFY_CONTACT, &code, &full_name)
                    .await;
                Ok(ResendOutcome::Queued { delivery })
            }
        }
    }

    /// Password login.
    ///
    /// # Errors
    ///
    /// `InvalidCredentials` is deliberately generic: unknown contact,
    /// wrong password, and ineligible accounts are indistinguishable.
    /// `Locked` carries the remaining lockout; the fifth consecutive
    /// failure both engages the lock and reports it.
    pub async fn login(
        &self,
        contact: &Contact,
        password: SecretString,
        client: &ClientInfo,
    ) -> Result<SessionTokens, AuthError> {
        let contact = normalize_contact(contact)?;
        let Some(account) = self.find_by_contact(&contact).await? else {
            debug!("login attempt for unknown contact");
            return Err(AuthError::InvalidCredentials);
        };

        // Lock check before any hashing: no wasted memory-hard work on a
        // locked account, and no timing signal about the password.
        let now = self.clock.now_unix();
        let eval = lockout::evaluate(&account.lock, now);
        if eval.is_locked {
            return Err(AuthError::Locked {
                remaining_seconds: eval.remaining_seconds,
            });
        }

        if account.status != AccountStatus::Active
            || account.verification != VerificationState::Verified
        {
            return Err(AuthError::InvalidCredentials);
        }
        let Some(credential) = account.password_credential().cloned() else {
            return Err(AuthError::InvalidCredentials);
        };

        if self.verify_password(password, credential).await? {
            return self.finish_login(account.id, client).await;
        }

        // Apply the failure against fresh state so a racing reset or
        // success is not blindly overwritten.
        let lock = self
            .mutate_account(account.id, |fresh, now| {
                fresh.lock = lockout::on_failure(&fresh.lock, now, &self.config.lockout);
                Ok(Applied::Changed(fresh.lock.clone()))
            })
            .await?;

        let eval = lockout::evaluate(&lock, self.clock.now_unix());
        if eval.is_locked {
            if let Some(until) = lock.locked_until_unix {
                warn!("account {} locked until {until}", account.id);
                self.publish(
                    topics::ACCOUNT_LOCKED,
                    events::account_locked(account.id, until, self.clock.now_unix()),
                )
                .await;
            }
            return Err(AuthError::Locked {
                remaining_seconds: eval.remaining_seconds,
            });
        }
        Err(AuthError::InvalidCredentials)
    }

    /// Log in or create an account from a provider-validated identity.
    ///
    /// # Errors
    ///
    /// `LinkingConflict` when a password account already owns the email;
    /// whether to link is the calling product's decision.
    pub async fn oauth_login_or_create(
        &self,
        identity: &OAuthIdentity,
        client: &ClientInfo,
    ) -> Result<OAuthLogin, AuthError> {
        if identity.provider.trim().is_empty() || identity.subject_id.trim().is_empty() {
            return Err(AuthError::Validation(
                "provider and subject id are required".to_string(),
            ));
        }
        let contact = normalize_contact(&Contact::Email(identity.email.clone()))?;

        if let Some(account) = self
            .find_by_oauth(&identity.provider, &identity.subject_id)
            .await?
        {
            if account.status != AccountStatus::Active {
                return Err(AuthError::InvalidCredentials);
            }
            let tokens = self.finish_login(account.id, client).await?;
            return Ok(OAuthLogin {
                tokens,
                created: false,
            });
        }

        if self.find_by_contact(&contact).await?.is_some() {
            return Err(AuthError::LinkingConflict);
        }

        let now = self.clock.now_unix();
        let full_name = identity
            .display_name
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_string();
        let mut account = Account::new(
            contact.clone(),
            AuthMethod::OAuth {
                provider: identity.provider.clone(),
                subject_id: identity.subject_id.clone(),
            },
            full_name,
            now,
        );
        // The provider already proved control of the email.
        account.verification = VerificationState::Verified;
        account.last_login_at_unix = Some(now);
        account.last_login_ip = client.ip.clone();
        let grant = self
            .tokens
            .issue_refresh_token(&mut account, &client.device_info, now)
            .map_err(AuthError::Internal)?;

        self.store_call(self.store.create(&account)).await?;
        info!("account {} created from {} identity", account.id, identity.provider);
        self.publish(
            topics::USER_CREATED,
            events::user_created(account.id, &contact, now),
        )
        .await;

        let access_token = self.issue_access(account.id, account.role)?;
        Ok(OAuthLogin {
            tokens: SessionTokens {
                access_token,
                refresh_token: grant,
            },
            created: true,
        })
    }

    /// Forward-only role elevation; returns the previous role.
    ///
    /// # Errors
    ///
    /// `Validation` for non-forward transitions; `Concurrency` when the
    /// version race loses all bounded retries, in which case the caller
    /// retries against fresh state (and typically no-ops).
    pub async fn elevate_role(&self, account_id: Uuid, new_role: Role) -> Result<Role, AuthError> {
        let previous = self
            .mutate_account(account_id, |account, _now| {
                if account.role == new_role {
                    return Ok(Applied::Unchanged(None));
                }
                if !account.role.can_elevate_to(new_role) {
                    return Err(AuthError::Validation(format!(
                        "role transition {} -> {} is not allowed",
                        account.role.as_str(),
                        new_role.as_str()
                    )));
                }
                let old_role = account.role;
                account.role = new_role;
                Ok(Applied::Changed(Some(old_role)))
            })
            .await?;

        match previous {
            Some(old_role) => {
                info!(
                    "account {account_id} role {} -> {}",
                    old_role.as_str(),
                    new_role.as_str()
                );
                self.publish(
                    topics::USER_ROLE_CHANGED,
                    events::user_role_changed(account_id, old_role, new_role, self.clock.now_unix()),
                )
                .await;
                Ok(old_role)
            }
            // Already at the requested role: a retried elevation no-ops.
            None => Ok(new_role),
        }
    }

    /// # Errors
    ///
    /// `Validation` when the status transition is not allowed.
    pub async fn deactivate(&self, account_id: Uuid) -> Result<(), AuthError> {
        self.set_status(account_id, AccountStatus::Deactivated).await
    }

    /// # Errors
    ///
    /// `Validation` when the status transition is not allowed.
    pub async fn suspend(&self, account_id: Uuid) -> Result<(), AuthError> {
        self.set_status(account_id, AccountStatus::Suspended).await
    }

    /// # Errors
    ///
    /// `Validation` when the status transition is not allowed.
    pub async fn reactivate(&self, account_id: Uuid) -> Result<(), AuthError> {
        self.set_status(account_id, AccountStatus::Active).await
    }

    /// Issue a password-reset code. Opaque about whether the contact
    /// exists, is an OAuth account, or is inside the resend cooldown.
    ///
    /// # Errors
    ///
    /// Only infrastructure errors surface; probing outcomes do not.
    pub async fn request_password_reset(&self, contact: &Contact) -> Result<(), AuthError> {
        let Ok(contact) = contact.normalized() else {
            return Ok(());
        };
        let Some(account) = self.find_by_contact(&contact).await? else {
            return Ok(());
        };
        if !matches!(account.auth_method, AuthMethod::Password { .. }) {
            return Ok(());
        }

        let cooldown = self.config.otp.resend_cooldown_seconds();
        let issued = self
            .mutate_account(account.id, |account, now| {
                if let Some(record) = &account.pending_code {
                    if record.purpose == CodePurpose::PasswordReset
                        && now < record.expires_at_unix
                        && now - record.issued_at_unix < cooldown
                    {
                        return Ok(Applied::Unchanged(None));
                    }
                }
                let issued = self
                    .codes
                    .issue(CodePurpose::PasswordReset, now)
                    .map_err(AuthError::Internal)?;
                account.pending_code = Some(issued.record);
                Ok(Applied::Changed(Some((
                    issued.code,
                    account.contact.clone(),
                    account.full_name.clone(),
                ))))
            })
            .await?;

        if let Some((code, contact, full_name)) = issued {
            // Delivery failures stay opaque here too; the user can simply
            // request again.
            let _ = self
                .dispatch_code(&contact, TEMPLATE_PASSWORD_RESET, &code, &full_name)
                .await;
        }
        Ok(())
    }

    /// Consume a reset code and install a new password. On success the
    /// lock state resets and every refresh token is revoked.
    ///
    /// # Errors
    ///
    /// `Validation` for OAuth accounts; `Throttled` under hashing
    /// pressure. Code outcomes other than `Valid` are returned, not
    /// raised.
    pub async fn reset_password(
        &self,
        account_id: Uuid,
        submitted: &str,
        new_password: SecretString,
    ) -> Result<CodeOutcome, AuthError> {
        let outcome = self
            .mutate_account(account_id, |account, now| {
                if !matches!(account.auth_method, AuthMethod::Password { .. }) {
                    return Err(AuthError::Validation(
                        "password reset applies only to password accounts".to_string(),
                    ));
                }
                let Some(record) = account.pending_code.as_mut() else {
                    return Ok(Applied::Unchanged(CodeOutcome::Expired));
                };
                if record.purpose != CodePurpose::PasswordReset {
                    return Ok(Applied::Unchanged(CodeOutcome::Expired));
                }
                let outcome = self.codes.validate(submitted, record, now);
                match outcome {
                    // The code is single-use: spent on success, burned on
                    // expiry or rate limit.
                    CodeOutcome::Valid | CodeOutcome::Expired | CodeOutcome::RateLimited => {
                        account.pending_code = None;
                    }
                    CodeOutcome::Mismatch => {}
                }
                Ok(Applied::Changed(outcome))
            })
            .await?;
        if outcome != CodeOutcome::Valid {
            return Ok(outcome);
        }

        let credential = self.hash_password(new_password).await?;
        self.mutate_account(account_id, |account, _now| {
            account
                .set_password_credential(credential.clone())
                .map_err(AuthError::Internal)?;
            account.lock = lockout::on_success(&account.lock);
            self.tokens.revoke_all_refresh_tokens(account);
            Ok(Applied::Changed(()))
        })
        .await?;
        info!("password reset for account {account_id}");
        Ok(CodeOutcome::Valid)
    }

    /// Rotate a refresh token: the presented token is invalidated and a
    /// fresh access+refresh pair returned.
    ///
    /// # Errors
    ///
    /// `TokenReuse` when a stale secret is replayed (the device family is
    /// revoked before this returns), `TokenExpired` past expiry,
    /// `InvalidToken` otherwise.
    pub async fn rotate_refresh_token(
        &self,
        account_id: Uuid,
        token_id: Uuid,
        presented_secret: &str,
    ) -> Result<SessionTokens, AuthError> {
        let result = self
            .mutate_account(account_id, |account, now| {
                if account.status != AccountStatus::Active {
                    return Ok(Applied::Unchanged(RotationResult::Invalid));
                }
                let outcome = self
                    .tokens
                    .rotate_refresh_token(account, token_id, presented_secret, now)
                    .map_err(AuthError::Internal)?;
                Ok(match outcome {
                    RotateOutcome::Rotated(grant) => {
                        Applied::Changed(RotationResult::Rotated(grant, account.role))
                    }
                    // Family revocation must be persisted.
                    RotateOutcome::Reused => Applied::Changed(RotationResult::Reused),
                    RotateOutcome::Invalid => Applied::Unchanged(RotationResult::Invalid),
                    RotateOutcome::Expired => Applied::Unchanged(RotationResult::Expired),
                })
            })
            .await?;

        match result {
            RotationResult::Rotated(grant, role) => Ok(SessionTokens {
                access_token: self.issue_access(account_id, role)?,
                refresh_token: grant,
            }),
            RotationResult::Reused => {
                warn!("refresh token reuse detected for account {account_id}");
                Err(AuthError::TokenReuse)
            }
            RotationResult::Invalid => Err(AuthError::InvalidToken),
            RotationResult::Expired => Err(AuthError::TokenExpired),
        }
    }

    /// Revoke one refresh token. Idempotent.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown accounts, `Concurrency` after retries.
    pub async fn revoke_refresh_token(
        &self,
        account_id: Uuid,
        token_id: Uuid,
    ) -> Result<(), AuthError> {
        self.mutate_account(account_id, |account, _now| {
            if self.tokens.revoke_refresh_token(account, token_id) {
                Ok(Applied::Changed(()))
            } else {
                Ok(Applied::Unchanged(()))
            }
        })
        .await
    }

    /// Revoke every live refresh token; returns how many were revoked.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown accounts, `Concurrency` after retries.
    pub async fn revoke_all_sessions(&self, account_id: Uuid) -> Result<usize, AuthError> {
        self.mutate_account(account_id, |account, _now| {
            let revoked = self.tokens.revoke_all_refresh_tokens(account);
            if revoked > 0 {
                Ok(Applied::Changed(revoked))
            } else {
                Ok(Applied::Unchanged(0))
            }
        })
        .await
    }

    /// Validate an access token and return its claims.
    ///
    /// # Errors
    ///
    /// `TokenExpired` past expiry, `InvalidToken` for anything else.
    pub fn validate_access_token(&self, token: &str) -> Result<AccessTokenClaims, AuthError> {
        self.tokens
            .validate_access_token(token, self.clock.now_unix())
            .map_err(|err| match err {
                TokenError::Expired => AuthError::TokenExpired,
                _ => AuthError::InvalidToken,
            })
    }

    async fn set_status(
        &self,
        account_id: Uuid,
        new_status: AccountStatus,
    ) -> Result<(), AuthError> {
        let change = self
            .mutate_account(account_id, |account, _now| {
                if account.status == new_status {
                    return Ok(Applied::Unchanged(None));
                }
                if !account.status.can_transition_to(new_status) {
                    return Err(AuthError::Validation(format!(
                        "status transition {} -> {} is not allowed",
                        account.status.as_str(),
                        new_status.as_str()
                    )));
                }
                let old_status = account.status;
                account.status = new_status;
                Ok(Applied::Changed(Some(old_status)))
            })
            .await?;

        if let Some(old_status) = change {
            info!(
                "account {account_id} status {} -> {}",
                old_status.as_str(),
                new_status.as_str()
            );
            self.publish(
                topics::ACCOUNT_STATUS_CHANGED,
                events::account_status_changed(
                    account_id,
                    old_status,
                    new_status,
                    self.clock.now_unix(),
                ),
            )
            .await;
        }
        Ok(())
    }

    async fn finish_login(
        &self,
        account_id: Uuid,
        client: &ClientInfo,
    ) -> Result<SessionTokens, AuthError> {
        let (grant, role) = self
            .mutate_account(account_id, |account, now| {
                account.lock = lockout::on_success(&account.lock);
                account.last_login_at_unix = Some(now);
                account.last_login_ip = client.ip.clone();
                let grant = self
                    .tokens
                    .issue_refresh_token(account, &client.device_info, now)
                    .map_err(AuthError::Internal)?;
                Ok(Applied::Changed((grant, account.role)))
            })
            .await?;
        debug!("login committed for account {account_id}");
        Ok(SessionTokens {
            access_token: self.issue_access(account_id, role)?,
            refresh_token: grant,
        })
    }

    fn issue_access(&self, account_id: Uuid, role: Role) -> Result<String, AuthError> {
        self.tokens
            .issue_access_token(account_id, role, self.clock.now_unix())
            .map_err(|err| AuthError::Internal(anyhow::Error::new(err)))
    }

    async fn hash_password(
        &self,
        password: SecretString,
    ) -> Result<crate::account::PasswordCredential, AuthError> {
        self.hasher.hash(password).await.map_err(map_hasher_error)
    }

    async fn verify_password(
        &self,
        password: SecretString,
        credential: crate::account::PasswordCredential,
    ) -> Result<bool, AuthError> {
        self.hasher
            .verify(password, credential)
            .await
            .map_err(map_hasher_error)
    }

    /// Read-modify-conditional-write with bounded retries on version
    /// conflicts; each retry re-reads and re-decides against fresh state.
    async fn mutate_account<T, F>(&self, account_id: Uuid, mut apply: F) -> Result<T, AuthError>
    where
        F: FnMut(&mut Account, i64) -> Result<Applied<T>, AuthError>,
    {
        let mut attempt = 0;
        loop {
            let mut account = self.load(account_id).await?;
            let expected = account.version;
            let now = self.clock.now_unix();
            match apply(&mut account, now)? {
                Applied::Unchanged(value) => return Ok(value),
                Applied::Changed(value) => {
                    account.updated_at_unix = now;
                    match self.store_call(self.store.update(&account, expected)).await {
                        Ok(_version) => return Ok(value),
                        Err(AuthError::Concurrency) => {
                            attempt += 1;
                            if attempt >= self.config.max_write_retries {
                                return Err(AuthError::Concurrency);
                            }
                            debug!("version conflict on account {account_id}, retrying");
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        }
    }

    async fn load(&self, account_id: Uuid) -> Result<Account, AuthError> {
        self.store_call(self.store.get_by_id(account_id))
            .await?
            .ok_or(AuthError::NotFound)
    }

    async fn find_by_contact(&self, contact: &Contact) -> Result<Option<Account>, AuthError> {
        self.store_call(self.store.get_by_contact(contact)).await
    }

    async fn find_by_oauth(
        &self,
        provider: &str,
        subject_id: &str,
    ) -> Result<Option<Account>, AuthError> {
        self.store_call(self.store.get_by_oauth_identity(provider, subject_id))
            .await
    }

    /// Bound a store call by the collaborator timeout. A timeout means
    /// the write may or may not have committed: `Unknown`.
    async fn store_call<T, F>(&self, call: F) -> Result<T, AuthError>
    where
        F: std::future::Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.config.collaborator_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(map_store_error(err)),
            Err(_) => {
                warn!("user store call timed out");
                Err(AuthError::Unknown)
            }
        }
    }

    async fn dispatch_code(
        &self,
        contact: &Contact,
        template_id: &str,
        code: &str,
        full_name: &str,
    ) -> DeliveryStatus {
        let payload = json!({ "code": code, "full_name": full_name });
        let send = self
            .notifier
            .send(contact.channel(), contact.value(), template_id, payload);
        match tokio::time::timeout(self.config.collaborator_timeout, send).await {
            Ok(Ok(())) => DeliveryStatus::Delivered,
            Ok(Err(err)) => {
                warn!("code delivery failed: {err}");
                DeliveryStatus::Failed
            }
            Err(_) => {
                warn!("code delivery timed out");
                DeliveryStatus::Failed
            }
        }
    }

    /// Fire-and-forget from the core's perspective; durability is the
    /// sink's concern.
    async fn publish(&self, topic: &str, payload: serde_json::Value) {
        let publish = self.events.publish(topic, payload);
        match tokio::time::timeout(self.config.collaborator_timeout, publish).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("event publish failed on {topic}: {err}"),
            Err(_) => warn!("event publish timed out on {topic}"),
        }
    }
}

fn normalize_contact(contact: &Contact) -> Result<Contact, AuthError> {
    contact
        .normalized()
        .map_err(|err| AuthError::Validation(err.to_string()))
}

fn map_store_error(err: StoreError) -> AuthError {
    match err {
        StoreError::Conflict => AuthError::Conflict,
        StoreError::ConcurrencyConflict => AuthError::Concurrency,
        StoreError::NotFound => AuthError::NotFound,
        StoreError::Unavailable(err) => AuthError::Internal(err),
    }
}

fn map_hasher_error(err: HasherError) -> AuthError {
    match err {
        HasherError::Throttled => AuthError::Throttled,
        HasherError::Corrupt | HasherError::Hash(_) | HasherError::Task(_) => {
            AuthError::Internal(anyhow::Error::new(err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_config_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.max_write_retries, DEFAULT_MAX_WRITE_RETRIES);
        assert_eq!(config.collaborator_timeout, DEFAULT_COLLABORATOR_TIMEOUT);
    }

    #[test]
    fn map_store_errors_to_taxonomy() {
        assert!(matches!(
            map_store_error(StoreError::Conflict),
            AuthError::Conflict
        ));
        assert!(matches!(
            map_store_error(StoreError::ConcurrencyConflict),
            AuthError::Concurrency
        ));
        assert!(matches!(
            map_store_error(StoreError::NotFound),
            AuthError::NotFound
        ));
    }

    #[test]
    fn throttled_hashing_stays_throttled() {
        assert!(matches!(
            map_hasher_error(HasherError::Throttled),
            AuthError::Throttled
        ));
        assert!(matches!(
            map_hasher_error(HasherError::Corrupt),
            AuthError::Internal(_)
        ));
    }
}

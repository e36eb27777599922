//! The durable `Account` aggregate and its value types.
//!
//! The aggregate is never deleted by this crate; deactivation is a status
//! flag. Every mutation goes through the store's version check, so the
//! `version` field here is whatever was read, and the store hands back the
//! successor on a committed write.

use anyhow::{Context, Result};
use regex::Regex;
use uuid::Uuid;

/// Opaque optimistic-concurrency token. The store compares it on write and
/// assigns the successor; callers never interpret the inner value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Version(u64);

impl Version {
    #[must_use]
    pub fn initial() -> Self {
        Self(0)
    }

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

/// Channel a notification is delivered over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    Email,
    Sms,
}

/// The unique contact an account is reachable at and looked up by.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Contact {
    Email(String),
    Phone(String),
}

impl Contact {
    /// Normalize and validate user-supplied contact input.
    ///
    /// Emails are trimmed and lowercased before the uniqueness check so
    /// `Alice@x.com` and `alice@x.com` collide. Phone numbers are reduced
    /// to `+` and digits.
    ///
    /// # Errors
    ///
    /// Returns an error when the value does not look like an email address
    /// or an E.164-style phone number.
    pub fn normalized(&self) -> Result<Self> {
        match self {
            Self::Email(raw) => {
                let email = raw.trim().to_lowercase();
                let valid = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$")
                    .is_ok_and(|regex| regex.is_match(&email));
                if !valid {
                    anyhow::bail!("invalid email address");
                }
                Ok(Self::Email(email))
            }
            Self::Phone(raw) => {
                let phone: String = raw
                    .chars()
                    .filter(|ch| ch.is_ascii_digit() || *ch == '+')
                    .collect();
                let valid = Regex::new(r"^\+?[0-9]{7,15}$")
                    .is_ok_and(|regex| regex.is_match(&phone));
                if !valid {
                    anyhow::bail!("invalid phone number");
                }
                Ok(Self::Phone(phone))
            }
        }
    }

    #[must_use]
    pub fn channel(&self) -> Channel {
        match self {
            Self::Email(_) => Channel::Email,
            Self::Phone(_) => Channel::Sms,
        }
    }

    #[must_use]
    pub fn value(&self) -> &str {
        match self {
            Self::Email(value) | Self::Phone(value) => value,
        }
    }
}

/// Hashed password credential in PHC string format (hash, salt, and
/// algorithm parameters in one self-describing record).
#[derive(Clone, PartialEq, Eq)]
pub struct PasswordCredential {
    phc: String,
}

impl PasswordCredential {
    #[must_use]
    pub fn from_phc(phc: String) -> Self {
        Self { phc }
    }

    #[must_use]
    pub fn phc(&self) -> &str {
        &self.phc
    }
}

impl std::fmt::Debug for PasswordCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordCredential")
            .field("phc", &"***")
            .finish()
    }
}

/// How the account authenticates. A tagged union so a password hash can
/// never coexist with an OAuth identity on the same record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthMethod {
    /// Password over the account's contact channel. `credential` is `None`
    /// only for accounts registered without a password; they must set one
    /// through the password-reset code flow before they can log in.
    Password {
        credential: Option<PasswordCredential>,
    },
    /// Identity asserted by an external provider; `(provider, subject_id)`
    /// is unique per provider.
    OAuth { provider: String, subject_id: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerificationState {
    Unverified,
    Verified,
}

/// What an outstanding one-time code proves when validated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodePurpose {
    VerifyContact,
    PasswordReset,
}

/// An outstanding one-time code. Only the hash is stored; the raw code
/// goes out through the notifier exactly once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingCode {
    pub code_hash: [u8; 32],
    pub purpose: CodePurpose,
    pub issued_at_unix: i64,
    pub expires_at_unix: i64,
    pub attempt_count: u32,
}

/// Transient, automatic lockout state. Lock expiry is lazy: `locked_until`
/// in the past means unlocked on next evaluation, no background sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LockState {
    pub consecutive_failures: u32,
    pub lock_cycle: u32,
    pub locked_until_unix: Option<i64>,
}

/// Administrative/voluntary status, orthogonal to the transient lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccountStatus {
    Active,
    Deactivated,
    Suspended,
}

impl AccountStatus {
    /// Allowed-transition table for status changes. Self-transitions are
    /// handled as no-ops by the caller, not here.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Deactivated | Self::Suspended)
                | (Self::Deactivated | Self::Suspended, Self::Active)
        )
    }
}

impl AccountStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Deactivated => "deactivated",
            Self::Suspended => "suspended",
        }
    }
}

/// Platform-wide initial role. Transitions only move forward; demotion
/// semantics live outside this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    NotAllocated,
    Member,
    Admin,
}

impl Role {
    /// Forward-only elevation table.
    #[must_use]
    pub fn can_elevate_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::NotAllocated, Self::Member | Self::Admin) | (Self::Member, Self::Admin)
        )
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotAllocated => "not_allocated",
            Self::Member => "member",
            Self::Admin => "admin",
        }
    }

    /// # Errors
    ///
    /// Returns an error for unknown role names.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "not_allocated" => Ok(Self::NotAllocated),
            "member" => Ok(Self::Member),
            "admin" => Ok(Self::Admin),
            other => Err(anyhow::anyhow!("unknown role: {other}")),
        }
    }
}

/// Server-side record of a refresh token. Only the secret's hash is kept;
/// `family_id` ties every rotation of one device session together so a
/// reuse can revoke the whole chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshTokenRecord {
    pub token_id: Uuid,
    pub family_id: Uuid,
    pub secret_hash: [u8; 32],
    pub device_info: String,
    pub issued_at_unix: i64,
    pub expires_at_unix: i64,
    pub revoked: bool,
}

/// The durable identity record owned by this crate.
#[derive(Clone, Debug)]
pub struct Account {
    pub id: Uuid,
    pub contact: Contact,
    pub auth_method: AuthMethod,
    pub verification: VerificationState,
    pub pending_code: Option<PendingCode>,
    pub lock: LockState,
    pub status: AccountStatus,
    pub role: Role,
    pub refresh_tokens: Vec<RefreshTokenRecord>,
    pub full_name: String,
    pub location: Option<String>,
    pub version: Version,
    pub created_at_unix: i64,
    pub updated_at_unix: i64,
    pub last_login_at_unix: Option<i64>,
    pub last_login_ip: Option<String>,
}

impl Account {
    /// Fresh aggregate as produced by registration: unverified, unlocked,
    /// active, with no role allocated yet.
    #[must_use]
    pub fn new(contact: Contact, auth_method: AuthMethod, full_name: String, now_unix: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            contact,
            auth_method,
            verification: VerificationState::Unverified,
            pending_code: None,
            lock: LockState::default(),
            status: AccountStatus::Active,
            role: Role::NotAllocated,
            refresh_tokens: Vec::new(),
            full_name,
            location: None,
            version: Version::initial(),
            created_at_unix: now_unix,
            updated_at_unix: now_unix,
            last_login_at_unix: None,
            last_login_ip: None,
        }
    }

    #[must_use]
    pub fn with_location(mut self, location: Option<String>) -> Self {
        self.location = location;
        self
    }

    /// The stored password credential, if this is a password account that
    /// has one set.
    #[must_use]
    pub fn password_credential(&self) -> Option<&PasswordCredential> {
        match &self.auth_method {
            AuthMethod::Password { credential } => credential.as_ref(),
            AuthMethod::OAuth { .. } => None,
        }
    }

    /// Replace the password credential.
    ///
    /// # Errors
    ///
    /// Fails on OAuth accounts, which must never carry a password hash.
    pub fn set_password_credential(&mut self, credential: PasswordCredential) -> Result<()> {
        match &mut self.auth_method {
            AuthMethod::Password { credential: slot } => {
                *slot = Some(credential);
                Ok(())
            }
            AuthMethod::OAuth { .. } => {
                Err(anyhow::anyhow!("cannot set a password on an OAuth account"))
                    .context("credential update rejected")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_contact_normalizes() {
        let contact = Contact::Email(" Alice@Example.COM ".to_string());
        assert_eq!(
            contact.normalized().ok(),
            Some(Contact::Email("alice@example.com".to_string()))
        );
    }

    #[test]
    fn email_contact_rejects_garbage() {
        assert!(Contact::Email("not-an-email".to_string()).normalized().is_err());
        assert!(Contact::Email("missing-domain@".to_string()).normalized().is_err());
    }

    #[test]
    fn phone_contact_strips_formatting() {
        let contact = Contact::Phone("+1 (555) 010-2030".to_string());
        assert_eq!(
            contact.normalized().ok(),
            Some(Contact::Phone("+15550102030".to_string()))
        );
    }

    #[test]
    fn phone_contact_rejects_short_numbers() {
        assert!(Contact::Phone("12345".to_string()).normalized().is_err());
    }

    #[test]
    fn status_transition_table() {
        use AccountStatus::{Active, Deactivated, Suspended};
        assert!(Active.can_transition_to(Deactivated));
        assert!(Active.can_transition_to(Suspended));
        assert!(Deactivated.can_transition_to(Active));
        assert!(Suspended.can_transition_to(Active));
        assert!(!Deactivated.can_transition_to(Suspended));
        assert!(!Suspended.can_transition_to(Deactivated));
    }

    #[test]
    fn role_elevation_is_forward_only() {
        use Role::{Admin, Member, NotAllocated};
        assert!(NotAllocated.can_elevate_to(Member));
        assert!(NotAllocated.can_elevate_to(Admin));
        assert!(Member.can_elevate_to(Admin));
        assert!(!Admin.can_elevate_to(Member));
        assert!(!Member.can_elevate_to(NotAllocated));
        assert!(!Admin.can_elevate_to(Admin));
    }

    #[test]
    fn role_round_trips_through_names() {
        for role in [Role::NotAllocated, Role::Member, Role::Admin] {
            assert_eq!(Role::parse(role.as_str()).ok(), Some(role));
        }
        assert!(Role::parse("root").is_err());
    }

    #[test]
    fn oauth_account_rejects_password() {
        let mut account = Account::new(
            Contact::Email("a@example.com".to_string()),
            AuthMethod::OAuth {
                provider: "github".to_string(),
                subject_id: "123".to_string(),
            },
            "A".to_string(),
            1_700_000_000,
        );
        assert!(account
            .set_password_credential(PasswordCredential::from_phc("$argon2id$...".to_string()))
            .is_err());
    }

    #[test]
    fn credential_debug_redacts_hash() {
        let credential = PasswordCredential::from_phc("$argon2id$secret".to_string());
        let rendered = format!("{credential:?}");
        assert!(!rendered.contains("secret"));
    }
}

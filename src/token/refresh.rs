//! Refresh-token issuance, rotation, and revocation.
//!
//! The raw secret is handed out exactly once at issuance; the account only
//! keeps a SHA-256 of it. Rotation is mandatory on every use, and a rotated
//! (revoked) token presented again revokes its whole device family: that is
//! the token-theft tripwire, not an optimization.

use anyhow::{Context, Result};
use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::account::{Account, RefreshTokenRecord};

use super::TokenConfig;

/// A freshly issued refresh token. `secret` is the only copy of the raw
/// value that will ever exist.
pub struct RefreshTokenGrant {
    pub token_id: Uuid,
    pub secret: String,
    pub expires_at_unix: i64,
}

impl std::fmt::Debug for RefreshTokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshTokenGrant")
            .field("token_id", &self.token_id)
            .field("secret", &"***")
            .field("expires_at_unix", &self.expires_at_unix)
            .finish()
    }
}

/// Outcome of presenting a refresh token for rotation.
#[derive(Debug)]
pub enum RotateOutcome {
    /// Old token invalidated, replacement issued.
    Rotated(RefreshTokenGrant),
    /// The token was already rotated; its device family is now revoked.
    Reused,
    /// Unknown token id or wrong secret.
    Invalid,
    Expired,
}

pub(super) fn issue(
    account: &mut Account,
    device_info: &str,
    family_id: Option<Uuid>,
    now_unix: i64,
    config: &TokenConfig,
) -> Result<RefreshTokenGrant> {
    let secret = generate_secret()?;
    let token_id = Uuid::new_v4();
    let expires_at_unix = now_unix + config.refresh_ttl_seconds();
    account.refresh_tokens.push(RefreshTokenRecord {
        token_id,
        family_id: family_id.unwrap_or_else(Uuid::new_v4),
        secret_hash: hash_secret(&secret),
        device_info: device_info.to_string(),
        issued_at_unix: now_unix,
        expires_at_unix,
        revoked: false,
    });
    prune(account, config.max_refresh_tokens());
    Ok(RefreshTokenGrant {
        token_id,
        secret,
        expires_at_unix,
    })
}

pub(super) fn rotate(
    account: &mut Account,
    token_id: Uuid,
    presented_secret: &str,
    now_unix: i64,
    config: &TokenConfig,
) -> Result<RotateOutcome> {
    let Some(index) = account
        .refresh_tokens
        .iter()
        .position(|record| record.token_id == token_id)
    else {
        return Ok(RotateOutcome::Invalid);
    };

    let presented_hash = hash_secret(presented_secret);
    let record = &account.refresh_tokens[index];
    if !bool::from(presented_hash.ct_eq(&record.secret_hash)) {
        return Ok(RotateOutcome::Invalid);
    }

    if record.revoked {
        // Correct secret on an already-rotated token: likely theft. Burn
        // every token in the family.
        let family_id = record.family_id;
        revoke_family(account, family_id);
        return Ok(RotateOutcome::Reused);
    }

    if now_unix >= record.expires_at_unix {
        return Ok(RotateOutcome::Expired);
    }

    let family_id = record.family_id;
    let device_info = record.device_info.clone();
    account.refresh_tokens[index].revoked = true;
    let grant = issue(account, &device_info, Some(family_id), now_unix, config)?;
    Ok(RotateOutcome::Rotated(grant))
}

/// Mark one token revoked. Idempotent; unknown ids are a no-op.
pub(super) fn revoke(account: &mut Account, token_id: Uuid) -> bool {
    for record in &mut account.refresh_tokens {
        if record.token_id == token_id && !record.revoked {
            record.revoked = true;
            return true;
        }
    }
    false
}

pub(super) fn revoke_all(account: &mut Account) -> usize {
    let mut revoked = 0;
    for record in &mut account.refresh_tokens {
        if !record.revoked {
            record.revoked = true;
            revoked += 1;
        }
    }
    revoked
}

fn revoke_family(account: &mut Account, family_id: Uuid) {
    for record in &mut account.refresh_tokens {
        if record.family_id == family_id {
            record.revoked = true;
        }
    }
}

/// Keep the collection bounded; the oldest records go first.
fn prune(account: &mut Account, cap: usize) {
    while account.refresh_tokens.len() > cap {
        let Some(oldest) = account
            .refresh_tokens
            .iter()
            .enumerate()
            .min_by_key(|(_, record)| record.issued_at_unix)
            .map(|(index, _)| index)
        else {
            return;
        };
        account.refresh_tokens.remove(oldest);
    }
}

fn generate_secret() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate refresh token secret")?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

fn hash_secret(secret: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{AuthMethod, Contact};

    const NOW: i64 = 1_700_000_000;

    fn account() -> Account {
        Account::new(
            Contact::Email("a@example.com".to_string()),
            AuthMethod::Password { credential: None },
            "A".to_string(),
            NOW,
        )
    }

    fn config() -> TokenConfig {
        TokenConfig::default()
    }

    #[test]
    fn issue_stores_hash_not_secret() -> Result<()> {
        let mut account = account();
        let grant = issue(&mut account, "cli", None, NOW, &config())?;
        let record = &account.refresh_tokens[0];
        assert_eq!(record.secret_hash, hash_secret(&grant.secret));
        assert!(!record.revoked);
        assert_eq!(record.device_info, "cli");
        Ok(())
    }

    #[test]
    fn rotation_invalidates_the_old_token() -> Result<()> {
        let mut account = account();
        let first = issue(&mut account, "cli", None, NOW, &config())?;
        let outcome = rotate(&mut account, first.token_id, &first.secret, NOW + 10, &config())?;
        let RotateOutcome::Rotated(second) = outcome else {
            panic!("expected rotation, got {outcome:?}");
        };
        assert_ne!(first.token_id, second.token_id);

        let old = account
            .refresh_tokens
            .iter()
            .find(|record| record.token_id == first.token_id);
        assert!(old.is_some_and(|record| record.revoked));

        // The replacement stays in the same family.
        let new = account
            .refresh_tokens
            .iter()
            .find(|record| record.token_id == second.token_id);
        assert_eq!(
            new.map(|record| record.family_id),
            old.map(|record| record.family_id)
        );
        Ok(())
    }

    #[test]
    fn reuse_revokes_the_family_but_spares_other_devices() -> Result<()> {
        let mut account = account();
        let stolen = issue(&mut account, "phone", None, NOW, &config())?;
        let other = issue(&mut account, "laptop", None, NOW, &config())?;

        let rotated = rotate(&mut account, stolen.token_id, &stolen.secret, NOW + 1, &config())?;
        let RotateOutcome::Rotated(replacement) = rotated else {
            panic!("expected rotation");
        };

        // Replay of the stale secret: reuse, and the whole family burns.
        let outcome = rotate(&mut account, stolen.token_id, &stolen.secret, NOW + 2, &config())?;
        assert!(matches!(outcome, RotateOutcome::Reused));
        assert!(account
            .refresh_tokens
            .iter()
            .filter(|record| record.device_info == "phone")
            .all(|record| record.revoked));
        let _ = replacement;

        // The unrelated device keeps working.
        let outcome = rotate(&mut account, other.token_id, &other.secret, NOW + 3, &config())?;
        assert!(matches!(outcome, RotateOutcome::Rotated(_)));
        Ok(())
    }

    #[test]
    fn wrong_secret_is_invalid_not_reuse() -> Result<()> {
        let mut account = account();
        let grant = issue(&mut account, "cli", None, NOW, &config())?;
        let outcome = rotate(&mut account, grant.token_id, "wrong-secret", NOW, &config())?;
        assert!(matches!(outcome, RotateOutcome::Invalid));
        Ok(())
    }

    #[test]
    fn expired_token_cannot_rotate() -> Result<()> {
        let mut account = account();
        let grant = issue(&mut account, "cli", None, NOW, &config())?;
        let outcome = rotate(
            &mut account,
            grant.token_id,
            &grant.secret,
            grant.expires_at_unix,
            &config(),
        )?;
        assert!(matches!(outcome, RotateOutcome::Expired));
        Ok(())
    }

    #[test]
    fn collection_is_bounded_oldest_first() -> Result<()> {
        let config = TokenConfig::default().with_max_refresh_tokens(3);
        let mut account = account();
        for offset in 0..5 {
            issue(&mut account, "cli", None, NOW + offset, &config)?;
        }
        assert_eq!(account.refresh_tokens.len(), 3);
        assert!(account
            .refresh_tokens
            .iter()
            .all(|record| record.issued_at_unix >= NOW + 2));
        Ok(())
    }

    #[test]
    fn revoke_all_marks_every_live_token() -> Result<()> {
        let mut account = account();
        issue(&mut account, "a", None, NOW, &config())?;
        issue(&mut account, "b", None, NOW, &config())?;
        assert_eq!(revoke_all(&mut account), 2);
        assert!(account.refresh_tokens.iter().all(|record| record.revoked));
        assert_eq!(revoke_all(&mut account), 0);
        Ok(())
    }
}

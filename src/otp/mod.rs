//! One-time code engine for contact verification and password resets.
//!
//! Codes are 6 decimal digits from the OS CSPRNG, stored only as a SHA-256
//! hash next to their expiry and attempt counter. Validation is
//! constant-time on the hash and counts every call, correct or not.

use anyhow::{Context, Result};
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::account::{CodePurpose, PendingCode};

const DEFAULT_TTL_SECONDS: i64 = 10 * 60;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_RESEND_COOLDOWN_SECONDS: i64 = 60;

const CODE_DIGITS: u32 = 6;
const CODE_SPACE: u32 = 10u32.pow(CODE_DIGITS);
// Largest multiple of the code space that fits in u32; rejection sampling
// above it keeps the draw uniform.
const REJECTION_LIMIT: u32 = u32::MAX - (u32::MAX % CODE_SPACE);

/// Outcome of validating a submitted code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodeOutcome {
    Valid,
    Expired,
    Mismatch,
    RateLimited,
}

#[derive(Clone, Copy, Debug)]
pub struct OtpConfig {
    ttl_seconds: i64,
    max_attempts: u32,
    resend_cooldown_seconds: i64,
}

impl Default for OtpConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: DEFAULT_TTL_SECONDS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            resend_cooldown_seconds: DEFAULT_RESEND_COOLDOWN_SECONDS,
        }
    }
}

impl OtpConfig {
    #[must_use]
    pub fn with_ttl_seconds(mut self, seconds: i64) -> Self {
        self.ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_resend_cooldown_seconds(mut self, seconds: i64) -> Self {
        self.resend_cooldown_seconds = seconds;
        self
    }

    #[must_use]
    pub fn resend_cooldown_seconds(&self) -> i64 {
        self.resend_cooldown_seconds
    }
}

/// A freshly issued code: the raw digits for the notifier and the record
/// that goes on the account.
#[derive(Debug)]
pub struct IssuedCode {
    pub code: String,
    pub record: PendingCode,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CodeEngine {
    config: OtpConfig,
}

impl CodeEngine {
    #[must_use]
    pub fn new(config: OtpConfig) -> Self {
        Self { config }
    }

    /// Issue a new code. The raw digits leave this crate only through the
    /// notifier; the account stores the hash.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS random source fails.
    pub fn issue(&self, purpose: CodePurpose, now_unix: i64) -> Result<IssuedCode> {
        let code = generate_code()?;
        let record = PendingCode {
            code_hash: hash_code(&code),
            purpose,
            issued_at_unix: now_unix,
            expires_at_unix: now_unix + self.config.ttl_seconds,
            attempt_count: 0,
        };
        Ok(IssuedCode { code, record })
    }

    /// Validate a submitted code against the outstanding record.
    ///
    /// Increments `attempt_count` on every call. Expired codes are always
    /// `Expired`, even on a correct submission. Past the attempt cap the
    /// outcome is `RateLimited` regardless of correctness and the caller
    /// must invalidate the record, forcing a re-issue.
    pub fn validate(
        &self,
        submitted: &str,
        record: &mut PendingCode,
        now_unix: i64,
    ) -> CodeOutcome {
        record.attempt_count = record.attempt_count.saturating_add(1);
        if now_unix >= record.expires_at_unix {
            return CodeOutcome::Expired;
        }
        if record.attempt_count > self.config.max_attempts {
            return CodeOutcome::RateLimited;
        }
        let submitted_hash = hash_code(submitted.trim());
        if bool::from(submitted_hash.ct_eq(&record.code_hash)) {
            CodeOutcome::Valid
        } else {
            CodeOutcome::Mismatch
        }
    }
}

/// Draw a uniform 6-digit code from the OS CSPRNG.
fn generate_code() -> Result<String> {
    loop {
        let mut bytes = [0u8; 4];
        OsRng
            .try_fill_bytes(&mut bytes)
            .context("failed to generate one-time code")?;
        let draw = u32::from_be_bytes(bytes);
        if draw < REJECTION_LIMIT {
            return Ok(format!("{:06}", draw % CODE_SPACE));
        }
    }
}

fn hash_code(code: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn engine() -> CodeEngine {
        CodeEngine::new(OtpConfig::default())
    }

    #[test]
    fn issued_code_is_six_digits() -> Result<()> {
        let issued = engine().issue(CodePurpose::VerifyContact, NOW)?;
        assert_eq!(issued.code.len(), 6);
        assert!(issued.code.chars().all(|ch| ch.is_ascii_digit()));
        assert_eq!(issued.record.attempt_count, 0);
        assert_eq!(issued.record.expires_at_unix, NOW + DEFAULT_TTL_SECONDS);
        Ok(())
    }

    #[test]
    fn record_never_holds_the_raw_code() -> Result<()> {
        let issued = engine().issue(CodePurpose::VerifyContact, NOW)?;
        assert_eq!(issued.record.code_hash, hash_code(&issued.code));
        assert_ne!(issued.record.code_hash.as_slice(), issued.code.as_bytes());
        Ok(())
    }

    #[test]
    fn correct_code_within_window_is_valid() -> Result<()> {
        let engine = engine();
        let IssuedCode { code, mut record } = engine.issue(CodePurpose::VerifyContact, NOW)?;
        assert_eq!(engine.validate(&code, &mut record, NOW + 60), CodeOutcome::Valid);
        assert_eq!(record.attempt_count, 1);
        Ok(())
    }

    #[test]
    fn wrong_code_is_mismatch() -> Result<()> {
        let engine = engine();
        let IssuedCode { code, mut record } = engine.issue(CodePurpose::VerifyContact, NOW)?;
        let wrong = if code == "000000" { "000001" } else { "000000" };
        assert_eq!(engine.validate(wrong, &mut record, NOW), CodeOutcome::Mismatch);
        Ok(())
    }

    #[test]
    fn expired_code_is_expired_even_when_correct() -> Result<()> {
        let engine = engine();
        let IssuedCode { code, mut record } = engine.issue(CodePurpose::VerifyContact, NOW)?;
        let after_expiry = record.expires_at_unix;
        assert_eq!(
            engine.validate(&code, &mut record, after_expiry),
            CodeOutcome::Expired
        );
        Ok(())
    }

    #[test]
    fn attempts_past_cap_are_rate_limited_even_when_correct() -> Result<()> {
        let engine = CodeEngine::new(OtpConfig::default().with_max_attempts(3));
        let IssuedCode { code, mut record } = engine.issue(CodePurpose::VerifyContact, NOW)?;
        let wrong = if code == "000000" { "000001" } else { "000000" };
        for _ in 0..3 {
            assert_eq!(engine.validate(wrong, &mut record, NOW), CodeOutcome::Mismatch);
        }
        // Fourth attempt exceeds the cap; correctness no longer matters.
        assert_eq!(
            engine.validate(&code, &mut record, NOW),
            CodeOutcome::RateLimited
        );
        Ok(())
    }

    #[test]
    fn validate_counts_every_call() -> Result<()> {
        let engine = engine();
        let IssuedCode { mut record, .. } = engine.issue(CodePurpose::PasswordReset, NOW)?;
        engine.validate("000000", &mut record, NOW);
        engine.validate("111111", &mut record, NOW);
        assert_eq!(record.attempt_count, 2);
        Ok(())
    }
}

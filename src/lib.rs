//! # Identeco (Account Authentication & Lifecycle Core)
//!
//! `identeco` is an identity core: registration, contact verification,
//! password and OAuth login, session tokens, role elevation, and account
//! status transitions, driven entirely through [`lifecycle::LifecycleManager`].
//! It owns the state machine and the security-sensitive decisions; storage,
//! message delivery, and event publication stay behind collaborator traits
//! so the surrounding product supplies its own infrastructure.
//!
//! ## Model
//!
//! - **Accounts** carry one normalized contact (email or phone), one
//!   authentication method (password or OAuth identity), a verification
//!   state, lockout state, status, role, and their refresh-token records.
//! - **Verification codes** are 6-digit one-time codes, stored hashed, with
//!   an expiry and a per-code attempt cap.
//! - **Sessions** are a short-lived RS256 access token plus an opaque
//!   refresh token that rotates on every use; replay of a rotated secret
//!   revokes the whole device family.
//! - **Concurrency** is optimistic: every write is conditional on the
//!   version read, retried a bounded number of times against fresh state.
//!
//! ## Error posture
//!
//! Login failures are deliberately generic (`InvalidCredentials`) so
//! callers cannot enumerate accounts; lockout (`Locked`) is the only
//! pre-credential signal, and password-reset requests are fully opaque.

pub mod account;
pub mod clock;
pub mod credential;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod lockout;
pub mod notifier;
pub mod otp;
pub mod store;
pub mod token;

pub use crate::error::AuthError;
pub use crate::lifecycle::{
    ClientInfo, CoreConfig, DeliveryStatus, LifecycleManager, NewAccount, OAuthIdentity,
    OAuthLogin, Registration, ResendOutcome, SessionTokens,
};

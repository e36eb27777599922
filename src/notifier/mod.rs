//! Notifier collaborator contract.
//!
//! The core never builds or sends messages itself; it hands a template id
//! and payload to this trait. Delivery failures are reported distinctly so
//! monitoring can alert on channel outages, but they never roll back the
//! state transition that triggered them.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

use crate::account::Channel;

/// Template for the contact-verification code message.
pub const TEMPLATE_VERIFY_CONTACT: &str = "verify-contact";
/// Template for the password-reset code message.
pub const TEMPLATE_PASSWORD_RESET: &str = "password-reset";

#[derive(Debug, Error)]
#[error("delivery failed: {0}")]
pub struct DeliveryError(pub String);

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        channel: Channel,
        destination: &str,
        template_id: &str,
        payload: Value,
    ) -> Result<(), DeliveryError>;
}

/// Drops every message; for wiring where delivery is out of scope.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn send(
        &self,
        _channel: Channel,
        _destination: &str,
        _template_id: &str,
        _payload: Value,
    ) -> Result<(), DeliveryError> {
        Ok(())
    }
}

/// A message captured by [`MemoryNotifier`].
#[derive(Clone, Debug)]
pub struct SentMessage {
    pub channel: Channel,
    pub destination: String,
    pub template_id: String,
    pub payload: Value,
}

/// Records messages instead of delivering them; test double.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<SentMessage>>,
}

impl MemoryNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn send(
        &self,
        channel: Channel,
        destination: &str,
        template_id: &str,
        payload: Value,
    ) -> Result<(), DeliveryError> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SentMessage {
                channel,
                destination: destination.to_string(),
                template_id: template_id.to_string(),
                payload,
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_notifier_records_messages() -> Result<(), DeliveryError> {
        let notifier = MemoryNotifier::new();
        notifier
            .send(
                Channel::Email,
                "a@example.com",
                TEMPLATE_VERIFY_CONTACT,
                json!({ "code": "123456" }),
            )
            .await?;

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destination, "a@example.com");
        assert_eq!(sent[0].template_id, TEMPLATE_VERIFY_CONTACT);
        Ok(())
    }
}

//! EventSink collaborator contract and domain event payloads.
//!
//! Events are published after the durable state transition commits, never
//! before. Delivery is at-least-once at the collaborator boundary, so every
//! payload carries an `event_id` for consumer-side idempotency.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

use crate::account::{AccountStatus, Contact, Role};

pub mod topics {
    pub const USER_CREATED: &str = "user.created";
    pub const USER_VERIFIED: &str = "user.verified";
    pub const USER_ROLE_CHANGED: &str = "user.role_changed";
    pub const ACCOUNT_LOCKED: &str = "account.locked";
    pub const ACCOUNT_STATUS_CHANGED: &str = "account.status_changed";
}

/// Publish outcome is `Ok` or unknown; the core treats failures as
/// fire-and-forget and logs them.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, topic: &str, payload: Value) -> anyhow::Result<()>;
}

#[must_use]
pub fn user_created(account_id: Uuid, contact: &Contact, timestamp_unix: i64) -> Value {
    json!({
        "event_id": Uuid::new_v4().to_string(),
        "account_id": account_id.to_string(),
        "contact": contact.value(),
        "timestamp": timestamp_unix,
    })
}

#[must_use]
pub fn user_verified(account_id: Uuid, timestamp_unix: i64) -> Value {
    json!({
        "event_id": Uuid::new_v4().to_string(),
        "account_id": account_id.to_string(),
        "timestamp": timestamp_unix,
    })
}

#[must_use]
pub fn user_role_changed(
    account_id: Uuid,
    old_role: Role,
    new_role: Role,
    timestamp_unix: i64,
) -> Value {
    json!({
        "event_id": Uuid::new_v4().to_string(),
        "account_id": account_id.to_string(),
        "old_role": old_role.as_str(),
        "new_role": new_role.as_str(),
        "timestamp": timestamp_unix,
    })
}

#[must_use]
pub fn account_locked(account_id: Uuid, until_unix: i64, timestamp_unix: i64) -> Value {
    json!({
        "event_id": Uuid::new_v4().to_string(),
        "account_id": account_id.to_string(),
        "until": until_unix,
        "timestamp": timestamp_unix,
    })
}

#[must_use]
pub fn account_status_changed(
    account_id: Uuid,
    old_status: AccountStatus,
    new_status: AccountStatus,
    timestamp_unix: i64,
) -> Value {
    json!({
        "event_id": Uuid::new_v4().to_string(),
        "account_id": account_id.to_string(),
        "old_status": old_status.as_str(),
        "new_status": new_status.as_str(),
        "timestamp": timestamp_unix,
    })
}

/// Swallows every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn publish(&self, _topic: &str, _payload: Value) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Records events instead of fanning them out; test double.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    published: Mutex<Vec<(String, Value)>>,
}

impl MemoryEventSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn published(&self) -> Vec<(String, Value)> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Payloads published on one topic, in order.
    #[must_use]
    pub fn on_topic(&self, topic: &str) -> Vec<Value> {
        self.published()
            .into_iter()
            .filter(|(published_topic, _)| published_topic == topic)
            .map(|(_, payload)| payload)
            .collect()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn publish(&self, topic: &str, payload: Value) -> anyhow::Result<()> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((topic.to_string(), payload));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_carry_event_ids() {
        let payload = user_created(
            Uuid::new_v4(),
            &Contact::Email("a@example.com".to_string()),
            1_700_000_000,
        );
        assert!(payload.get("event_id").is_some());
        assert_eq!(
            payload.get("contact").and_then(Value::as_str),
            Some("a@example.com")
        );
    }

    #[test]
    fn role_change_payload_names_both_roles() {
        let payload =
            user_role_changed(Uuid::new_v4(), Role::NotAllocated, Role::Admin, 1_700_000_000);
        assert_eq!(
            payload.get("old_role").and_then(Value::as_str),
            Some("not_allocated")
        );
        assert_eq!(payload.get("new_role").and_then(Value::as_str), Some("admin"));
    }

    #[tokio::test]
    async fn memory_sink_records_by_topic() -> anyhow::Result<()> {
        let sink = MemoryEventSink::new();
        sink.publish(topics::USER_CREATED, json!({"n": 1})).await?;
        sink.publish(topics::USER_VERIFIED, json!({"n": 2})).await?;
        assert_eq!(sink.on_topic(topics::USER_CREATED).len(), 1);
        assert_eq!(sink.on_topic(topics::ACCOUNT_LOCKED).len(), 0);
        Ok(())
    }
}

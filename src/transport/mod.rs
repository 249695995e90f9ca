//! Broker transport seam.
//!
//! The container never talks to a broker directly; endpoints depend only on
//! the [`Transport`] and [`ListenChannel`] traits:
//!   - **send**: point-to-point delivery to a named queue
//!   - **publish**: fan-out to every queue bound to a matching topic
//!   - **declare_listener**: create/attach a queue (optionally bound), then
//!     `activate` → `receive(timeout)` → `ack`/`reject`
//!
//! [`InMemoryBroker`] implements the seam in-process.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

use crate::envelope::Message;
use crate::types::Result;

mod memory;

pub use memory::{BrokerStats, InMemoryBroker, QueueInfo};

/// Broker-assigned handle used to ack or reject one delivery.
pub type DeliveryTag = u64;

/// A received message awaiting ack/reject.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub message: Message,
}

/// What queue a listener consumes from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerSpec {
    /// Named queue; `None` declares an anonymous queue owned by the listener.
    pub queue: Option<String>,
    /// Topic pattern bound to the queue (`*` = one word, `#` = any words).
    pub binding: Option<String>,
}

impl ListenerSpec {
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            queue: Some(name.into()),
            binding: None,
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_binding(mut self, binding: impl Into<String>) -> Self {
        self.binding = Some(binding.into());
        self
    }
}

/// Broker connection.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Deliver to a named queue. Unroutable messages are dropped by the broker.
    async fn send(&self, queue: &str, message: Message) -> Result<()>;

    /// Deliver one copy to every queue with a binding matching `topic`.
    /// Returns the number of queues reached.
    async fn publish(&self, topic: &str, message: Message) -> Result<usize>;

    /// Declare (or attach to) a queue. The returned channel is inactive until
    /// [`ListenChannel::activate`] is called; messages queue up meanwhile.
    async fn declare_listener(&self, spec: ListenerSpec) -> Result<Box<dyn ListenChannel>>;
}

/// One consumer attached to one queue.
#[async_trait]
pub trait ListenChannel: Send + Sync + fmt::Debug {
    fn queue_name(&self) -> &str;

    /// Begin consuming.
    async fn activate(&mut self) -> Result<()>;

    /// Wait up to `timeout` for the next delivery; `Ok(None)` on timeout.
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Delivery>>;

    async fn ack(&mut self, tag: DeliveryTag) -> Result<()>;

    async fn reject(&mut self, tag: DeliveryTag, requeue: bool) -> Result<()>;

    /// Stop consuming. Unacked deliveries return to the queue.
    async fn close(&mut self) -> Result<()>;
}

/// AMQP-style topic matching over `.`-separated words.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    fn matches(pattern: &[&str], topic: &[&str]) -> bool {
        match (pattern.split_first(), topic.split_first()) {
            (None, None) => true,
            (Some((&"#", rest)), _) => {
                matches(rest, topic) || (!topic.is_empty() && matches(pattern, &topic[1..]))
            }
            (Some((&"*", rest)), Some((_, topic_rest))) => matches(rest, topic_rest),
            (Some((word, rest)), Some((t, topic_rest))) => word == t && matches(rest, topic_rest),
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let topic: Vec<&str> = topic.split('.').collect();
    matches(&pattern, &topic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_topic_exact_and_wildcards() {
        assert!(topic_matches("policy_events", "policy_events"));
        assert!(!topic_matches("policy_events", "policy_events.x"));
        assert!(topic_matches("data.*", "data.raw"));
        assert!(!topic_matches("data.*", "data.raw.l0"));
        assert!(topic_matches("data.#", "data.raw.l0"));
        assert!(topic_matches("data.#", "data"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.raw.#", "ctd.raw"));
    }

    proptest! {
        #[test]
        fn prop_topic_matches_itself(words in prop::collection::vec("[a-z0-9_]{1,6}", 1..5)) {
            let topic = words.join(".");
            prop_assert!(topic_matches(&topic, &topic));
            prop_assert!(topic_matches("#", &topic));
        }
    }
}

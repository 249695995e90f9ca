//! Policy change notifications.
//!
//! Policy changes arrive as [`PolicyEvent`]s published on the configured
//! policy event topic. The [`PolicyEventListener`] binds an anonymous queue
//! to that topic and feeds each event to the controller in the background.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::controller::GovernanceController;
use crate::endpoint::{DeliveryHandler, EndpointFactory, ListenerHandle};
use crate::envelope::Message;
use crate::transport::ListenerSpec;
use crate::types::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyEvent {
    /// A service policy changed. Without a service name, the common policy.
    ServicePolicy {
        #[serde(default)]
        service_name: Option<String>,
        #[serde(default)]
        op: Option<String>,
        #[serde(default)]
        deleted: bool,
    },
    ResourcePolicy {
        resource_id: String,
        #[serde(default)]
        deleted: bool,
    },
}

#[derive(Debug)]
struct PolicyEventHandler {
    controller: Arc<GovernanceController>,
}

#[async_trait]
impl DeliveryHandler for PolicyEventHandler {
    async fn on_delivery(&self, message: Message) -> Result<()> {
        let event: PolicyEvent = serde_json::from_value(message.body)
            .map_err(|e| Error::bad_request(format!("malformed policy event: {}", e)))?;
        self.controller.handle_policy_event(event).await
    }
}

/// Background subscriber applying policy events to the controller.
#[derive(Debug)]
pub struct PolicyEventListener {
    topic: String,
    handle: Mutex<Option<ListenerHandle>>,
}

impl PolicyEventListener {
    pub async fn start(endpoints: &EndpointFactory, controller: Arc<GovernanceController>) -> Result<Self> {
        let topic = controller.config().policy_event_topic.clone();
        let channel = endpoints
            .declare(ListenerSpec::anonymous().with_binding(topic.clone()))
            .await?;
        let handle = endpoints
            .listener(channel, Arc::new(PolicyEventHandler { controller }))
            .activate()
            .await?;

        tracing::info!("Policy event listener started topic={}", topic);
        Ok(Self {
            topic,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn is_running(&self) -> bool {
        self.handle.lock().await.is_some()
    }

    /// Stop consuming. Safe to call more than once.
    pub async fn stop(&self, wait: Duration) -> Result<()> {
        let Some(handle) = self.handle.lock().await.take() else {
            return Ok(());
        };
        handle.shutdown(wait).await?;
        tracing::info!("Policy event listener stopped topic={}", self.topic);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ProcessRegistry;
    use crate::envelope::Headers;
    use crate::governance::policy::{AccessRule, InMemoryPolicyStore};
    use crate::interceptor::InterceptorStack;
    use crate::transport::InMemoryBroker;
    use crate::types::{ConvIdGenerator, GovernanceConfig, MessagingConfig};
    use serde_json::json;

    #[test]
    fn test_event_wire_format() {
        let event: PolicyEvent =
            serde_json::from_value(json!({"type": "service_policy", "service_name": "bank"})).unwrap();
        assert_eq!(
            event,
            PolicyEvent::ServicePolicy {
                service_name: Some("bank".into()),
                op: None,
                deleted: false,
            }
        );

        let event: PolicyEvent =
            serde_json::from_value(json!({"type": "resource_policy", "resource_id": "r1", "deleted": true}))
                .unwrap();
        assert_eq!(
            event,
            PolicyEvent::ResourcePolicy {
                resource_id: "r1".into(),
                deleted: true,
            }
        );
    }

    #[tokio::test]
    async fn test_listener_applies_published_events() {
        let broker = Arc::new(InMemoryBroker::new());
        let messaging = MessagingConfig {
            receive_poll: Duration::from_millis(20),
            ..MessagingConfig::default()
        };
        let endpoints = EndpointFactory::new(
            broker,
            Arc::new(InterceptorStack::default()),
            Arc::new(ConvIdGenerator::new("h")),
            messaging,
            "ion",
        );
        let store = Arc::new(InMemoryPolicyStore::new());
        store.set_common_rules(vec![AccessRule::permit("all", 1)]).await;
        let controller = Arc::new(GovernanceController::new(
            GovernanceConfig::default(),
            store,
            Arc::new(ProcessRegistry::new()),
        ));

        let listener = PolicyEventListener::start(&endpoints, controller.clone()).await.unwrap();
        endpoints
            .publisher("policy_events", None)
            .publish(json!({"type": "service_policy"}), Headers::new())
            .await
            .unwrap();

        let mut loaded = false;
        for _ in 0..50 {
            if controller.policy_snapshot().await.common_loaded {
                loaded = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(loaded);
        assert_eq!(controller.policy_snapshot().await.common_rules, 1);

        listener.stop(Duration::from_secs(1)).await.unwrap();
        assert!(!listener.is_running().await);
        listener.stop(Duration::from_secs(1)).await.unwrap();
    }
}

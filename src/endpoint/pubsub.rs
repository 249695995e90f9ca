//! Publish/subscribe endpoints.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::listener::DeliveryHandler;
use super::stamp_sender;
use crate::container::{ProcessHandle, ProcessInfo};
use crate::envelope::{names, now_millis, Headers, Message};
use crate::interceptor::{AnnotationCategory, Direction, InterceptorStack, Invocation};
use crate::transport::Transport;
use crate::types::{Error, Result};

/// Sends messages to every queue bound to one topic.
#[derive(Debug, Clone)]
pub struct Publisher {
    transport: Arc<dyn Transport>,
    interceptors: Arc<InterceptorStack>,
    topic: String,
    process: Option<Arc<ProcessInfo>>,
}

impl Publisher {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        interceptors: Arc<InterceptorStack>,
        topic: String,
        process: Option<Arc<ProcessInfo>>,
    ) -> Self {
        Self {
            transport,
            interceptors,
            topic,
            process,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish through the outgoing interceptors. Returns the number of
    /// queues reached; a policy veto is reported as Unauthorized.
    pub async fn publish(&self, body: Value, headers: Headers) -> Result<usize> {
        let mut headers = headers;
        headers.insert(names::TS, now_millis());
        headers.insert(names::RECEIVER, self.topic.as_str());
        stamp_sender(&mut headers, self.process.as_deref());

        let invocation = Invocation::new(Direction::Outgoing, Message::new(body, headers))
            .with_process(self.process.clone());
        let invocation = self.interceptors.process(invocation).await?;

        if let Some(rejection) = invocation.rejection() {
            return match rejection.category {
                AnnotationCategory::Policy => Err(Error::unauthorized(rejection.reason)),
                AnnotationCategory::Conversation => {
                    tracing::debug!(topic = %self.topic, reason = %rejection.reason, "publish dropped");
                    Ok(0)
                }
            };
        }

        self.transport.publish(&self.topic, invocation.message).await
    }
}

/// Feeds subscribed messages into a stream process's handler.
#[derive(Debug)]
pub struct StreamDispatcher {
    interceptors: Arc<InterceptorStack>,
    process: Arc<ProcessInfo>,
    handle: ProcessHandle,
}

impl StreamDispatcher {
    pub fn new(interceptors: Arc<InterceptorStack>, process: Arc<ProcessInfo>, handle: ProcessHandle) -> Self {
        Self {
            interceptors,
            process,
            handle,
        }
    }
}

#[async_trait]
impl DeliveryHandler for StreamDispatcher {
    async fn on_delivery(&self, message: Message) -> Result<()> {
        let invocation = Invocation::new(Direction::Incoming, message)
            .with_process(Some(self.process.clone()));
        let invocation = self.interceptors.process(invocation).await?;

        // No reply path exists for stream messages, so a veto can only be logged.
        if let Some(rejection) = invocation.rejection() {
            tracing::warn!(
                process_id = %self.process.id,
                category = ?rejection.category,
                reason = %rejection.reason,
                "stream message rejected"
            );
            return Ok(());
        }

        let Message { body, headers } = invocation.message;
        self.handle.stream(body, headers).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::Interceptor;
    use crate::transport::{InMemoryBroker, ListenerSpec};
    use std::time::Duration;

    #[derive(Debug)]
    struct DenyAll;

    #[async_trait]
    impl Interceptor for DenyAll {
        fn name(&self) -> &str {
            "deny_all"
        }

        async fn outgoing(&self, inv: &mut Invocation) -> Result<()> {
            inv.reject(AnnotationCategory::Policy, "not allowed to publish");
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_bound_queues() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut ch = broker
            .declare_listener(ListenerSpec::anonymous().with_binding("data.raw"))
            .await
            .unwrap();
        ch.activate().await.unwrap();

        let publisher = Publisher::new(
            broker.clone(),
            Arc::new(InterceptorStack::default()),
            "data.raw".to_string(),
            None,
        );
        let n = publisher
            .publish(serde_json::json!({"v": 1}), Headers::new())
            .await
            .unwrap();
        assert_eq!(n, 1);

        let d = ch.receive(Duration::from_millis(200)).await.unwrap().unwrap();
        assert_eq!(d.message.body["v"], 1);
        assert_eq!(d.message.headers.receiver(), Some("data.raw"));
        assert!(d.message.headers.ts().is_some());
    }

    #[tokio::test]
    async fn test_publish_policy_veto_is_unauthorized() {
        let broker = Arc::new(InMemoryBroker::new());
        let publisher = Publisher::new(
            broker,
            Arc::new(InterceptorStack::new(vec![Arc::new(DenyAll)])),
            "t".to_string(),
            None,
        );
        let err = publisher
            .publish(serde_json::json!({}), Headers::new())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 401);
        assert_eq!(err.message(), "not allowed to publish");
    }
}

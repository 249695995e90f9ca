//! Endpoints: the protocol logic layered over a transport channel.
//!
//! - [`Publisher`]: fire-and-forget messages to a topic
//! - [`RpcClient`]: request/response with conversation tracking and deadlines
//! - [`RpcServer`]: dispatches requests to a process's operation table
//! - [`StreamDispatcher`]: feeds subscribed messages to a stream process
//!
//! Every endpoint passes its messages through the shared
//! [`InterceptorStack`] before they reach the transport or the process.

use std::sync::Arc;
use std::time::Duration;

use crate::container::ProcessInfo;
use crate::envelope::{names, Headers};
use crate::interceptor::InterceptorStack;
use crate::transport::{ListenChannel, ListenerSpec, Transport};
use crate::types::{ConvIdGenerator, MessagingConfig, Result};

mod listener;
mod pubsub;
mod rpc;

pub use listener::{DeliveryHandler, ListenerHandle, PendingListener};
pub use pubsub::{Publisher, StreamDispatcher};
pub use rpc::{handler_budget_secs, RpcClient, RpcServer};

/// Builds endpoints that share one transport, interceptor stack and
/// conversation-id source.
#[derive(Debug)]
pub struct EndpointFactory {
    transport: Arc<dyn Transport>,
    interceptors: Arc<InterceptorStack>,
    conv_ids: Arc<ConvIdGenerator>,
    messaging: MessagingConfig,
    sys_name: String,
}

impl EndpointFactory {
    pub fn new(
        transport: Arc<dyn Transport>,
        interceptors: Arc<InterceptorStack>,
        conv_ids: Arc<ConvIdGenerator>,
        messaging: MessagingConfig,
        sys_name: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            interceptors,
            conv_ids,
            messaging,
            sys_name: sys_name.into(),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn interceptors(&self) -> &Arc<InterceptorStack> {
        &self.interceptors
    }

    pub fn messaging(&self) -> &MessagingConfig {
        &self.messaging
    }

    /// Queue shared by every process of a service.
    pub fn service_queue(&self, service: &str) -> String {
        format!("{}.{}", self.sys_name, service)
    }

    /// Queue addressed to one process id or resource id.
    pub fn process_queue(&self, target: &str) -> String {
        format!("{}.{}", self.sys_name, target)
    }

    pub fn rpc_client(&self, target: impl Into<String>, process: Option<Arc<ProcessInfo>>) -> RpcClient {
        RpcClient::new(
            self.transport.clone(),
            self.interceptors.clone(),
            self.conv_ids.clone(),
            target.into(),
            process,
            self.messaging.rpc_timeout,
        )
    }

    pub fn publisher(&self, topic: impl Into<String>, process: Option<Arc<ProcessInfo>>) -> Publisher {
        Publisher::new(
            self.transport.clone(),
            self.interceptors.clone(),
            topic.into(),
            process,
        )
    }

    /// Declare a listener queue without consuming from it yet.
    pub async fn declare(&self, spec: ListenerSpec) -> Result<Box<dyn ListenChannel>> {
        self.transport.declare_listener(spec).await
    }

    /// Pair a declared channel with its handler.
    pub fn listener(
        &self,
        channel: Box<dyn ListenChannel>,
        handler: Arc<dyn DeliveryHandler>,
    ) -> PendingListener {
        PendingListener::new(channel, handler, self.receive_poll())
    }

    fn receive_poll(&self) -> Duration {
        self.messaging.receive_poll.max(Duration::from_millis(1))
    }
}

/// Stamp sender identity headers for messages leaving a process.
pub(crate) fn stamp_sender(headers: &mut Headers, process: Option<&ProcessInfo>) {
    let Some(process) = process else {
        return;
    };
    headers.insert(names::SENDER, process.id.as_str());
    headers.insert(names::SENDER_NAME, process.name.as_str());
    headers.insert(names::SENDER_TYPE, process.process_type.as_str());
    headers.insert(names::SENDER_SERVICE, process.service_name());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ProcessType;
    use crate::transport::InMemoryBroker;
    use crate::types::ProcessId;

    #[test]
    fn test_queue_names_are_namespaced() {
        let factory = EndpointFactory::new(
            Arc::new(InMemoryBroker::new()),
            Arc::new(InterceptorStack::default()),
            Arc::new(ConvIdGenerator::new("h")),
            MessagingConfig::default(),
            "ion",
        );
        assert_eq!(factory.service_queue("bank"), "ion.bank");
        assert_eq!(factory.process_queue("cc.3"), "ion.cc.3");
    }

    #[test]
    fn test_stamp_sender() {
        let info = ProcessInfo::new(ProcessId::parse("cc.1").unwrap(), "bank", ProcessType::Service);
        let mut headers = Headers::new();
        stamp_sender(&mut headers, Some(&info));
        assert_eq!(headers.sender(), Some("cc.1"));
        assert_eq!(headers.get_str(names::SENDER_TYPE), Some("service"));
        assert_eq!(headers.get_str(names::SENDER_SERVICE), Some("bank"));

        let mut empty = Headers::new();
        stamp_sender(&mut empty, None);
        assert!(empty.is_empty());
    }
}

//! The process model seen by service authors.
//!
//! A [`Service`] implementation holds the business logic; the supervisor
//! owns the instance and drives it from a single control task, so no
//! internal locking is needed for process-local state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::types::ProcessType;
use crate::endpoint::{EndpointFactory, Publisher, RpcClient};
use crate::envelope::{names, Headers};
use crate::governance::PreconditionFn;
use crate::types::{ProcessId, Result};

/// Immutable facts about a spawned process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub id: ProcessId,
    pub name: String,
    pub process_type: ProcessType,
    /// Service queue name (service and stream processes).
    pub listen_name: Option<String>,
    pub resource_type: Option<String>,
    /// Target resource id (agents).
    pub resource_id: Option<String>,
    /// Operation table, fixed at spawn.
    pub operations: HashSet<String>,
    pub config: Value,
    pub started_at: DateTime<Utc>,
}

impl ProcessInfo {
    pub fn new(id: ProcessId, name: impl Into<String>, process_type: ProcessType) -> Self {
        Self {
            id,
            name: name.into(),
            process_type,
            listen_name: None,
            resource_type: None,
            resource_id: None,
            operations: HashSet::new(),
            config: Value::Object(Map::new()),
            started_at: Utc::now(),
        }
    }

    pub fn with_operations<I, S>(mut self, ops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.operations = ops.into_iter().map(Into::into).collect();
        self
    }

    /// Service name: the listen name, falling back to the process name.
    pub fn service_name(&self) -> &str {
        self.listen_name.as_deref().unwrap_or(&self.name)
    }

    /// Name under which service-scope policy is looked up.
    pub fn policy_service_name(&self) -> &str {
        match self.process_type {
            ProcessType::Agent => self.resource_type.as_deref().unwrap_or(&self.name),
            _ => self.service_name(),
        }
    }

    pub fn has_operation(&self, op: &str) -> bool {
        self.operations.contains(op)
    }
}

/// Business logic of a process.
#[async_trait]
pub trait Service: Send + 'static {
    /// Declared operation names; requests for anything else are rejected
    /// before reaching [`Service::call`].
    fn operations(&self) -> Vec<&'static str>;

    async fn on_init(&mut self, _ctx: &ProcessContext) -> Result<()> {
        Ok(())
    }

    async fn on_start(&mut self, _ctx: &ProcessContext) -> Result<()> {
        Ok(())
    }

    async fn on_quit(&mut self) -> Result<()> {
        Ok(())
    }

    /// Execute one declared operation.
    async fn call(&mut self, op: &str, args: Map<String, Value>, ctx: &CallContext) -> Result<Value>;

    /// Stream processes receive subscribed messages here.
    async fn on_stream(&mut self, _body: Value, headers: &Headers, ctx: &ProcessContext) -> Result<()> {
        tracing::warn!(
            process_id = %ctx.info().id,
            conv_id = headers.conv_id().unwrap_or(""),
            "stream message ignored: process has no stream handler"
        );
        Ok(())
    }

    /// Named checks that policy data may attach to operations. Collected
    /// once at spawn.
    fn precondition_checks(&self) -> Vec<(&'static str, PreconditionFn)> {
        Vec::new()
    }
}

/// Everything a running process can reach.
#[derive(Debug, Clone)]
pub struct ProcessContext {
    info: Arc<ProcessInfo>,
    endpoints: Arc<EndpointFactory>,
    publishers: Arc<HashMap<String, Publisher>>,
}

impl ProcessContext {
    pub fn new(
        info: Arc<ProcessInfo>,
        endpoints: Arc<EndpointFactory>,
        publishers: HashMap<String, Publisher>,
    ) -> Self {
        Self {
            info,
            endpoints,
            publishers: Arc::new(publishers),
        }
    }

    pub fn info(&self) -> &Arc<ProcessInfo> {
        &self.info
    }

    pub fn config(&self) -> &Value {
        &self.info.config
    }

    /// Publisher declared under `process.publish_streams.<name>`.
    pub fn publisher(&self, name: &str) -> Option<&Publisher> {
        self.publishers.get(name)
    }

    pub fn publisher_names(&self) -> Vec<&str> {
        self.publishers.keys().map(String::as_str).collect()
    }

    /// RPC client for a named service, sending as this process.
    pub fn service_client(&self, service: &str) -> RpcClient {
        self.endpoints
            .rpc_client(self.endpoints.service_queue(service), Some(self.info.clone()))
    }

    /// RPC client for a specific process or resource id.
    pub fn process_client(&self, target: &str) -> RpcClient {
        self.endpoints
            .rpc_client(self.endpoints.process_queue(target), Some(self.info.clone()))
    }
}

/// Context of one operation call: the process plus the request headers.
#[derive(Debug, Clone)]
pub struct CallContext {
    process: ProcessContext,
    request: Headers,
}

impl CallContext {
    pub fn new(process: ProcessContext, request: Headers) -> Self {
        Self { process, request }
    }

    pub fn process(&self) -> &ProcessContext {
        &self.process
    }

    pub fn headers(&self) -> &Headers {
        &self.request
    }

    pub fn actor_id(&self) -> Option<&str> {
        self.request.actor_id()
    }

    /// Security headers to forward on nested calls made for this request.
    pub fn security_headers(&self) -> Headers {
        let mut headers = Headers::new();
        for name in [names::ACTOR_ID, names::ACTOR_ROLES] {
            if let Some(value) = self.request.get(name) {
                headers.insert(name, value.clone());
            }
        }
        let original = self
            .request
            .get_str(names::ORIGINAL_CONV_ID)
            .or_else(|| self.request.conv_id());
        if let Some(conv_id) = original {
            headers.insert(names::ORIGINAL_CONV_ID, conv_id);
        }
        headers
    }

    /// Service client carrying the caller's identity.
    pub fn service_client(&self, service: &str) -> RpcClient {
        self.process
            .service_client(service)
            .with_headers(self.security_headers())
    }

    /// Process client carrying the caller's identity.
    pub fn process_client(&self, target: &str) -> RpcClient {
        self.process
            .process_client(target)
            .with_headers(self.security_headers())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(process_type: ProcessType) -> ProcessInfo {
        ProcessInfo::new(
            ProcessId::parse("cc.1").unwrap(),
            "bank",
            process_type,
        )
    }

    #[test]
    fn test_service_name_falls_back_to_name() {
        let mut p = info(ProcessType::Service);
        assert_eq!(p.service_name(), "bank");
        p.listen_name = Some("bank_svc".into());
        assert_eq!(p.service_name(), "bank_svc");
        assert_eq!(p.policy_service_name(), "bank_svc");
    }

    #[test]
    fn test_agent_policy_name_uses_resource_type() {
        let mut p = info(ProcessType::Agent);
        assert_eq!(p.policy_service_name(), "bank");
        p.resource_type = Some("InstrumentDevice".into());
        assert_eq!(p.policy_service_name(), "InstrumentDevice");
    }

    #[test]
    fn test_operations() {
        let p = info(ProcessType::Service).with_operations(["deposit", "withdraw"]);
        assert!(p.has_operation("deposit"));
        assert!(!p.has_operation("close"));
    }
}

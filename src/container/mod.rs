//! The capability container.
//!
//! [`Container`] is the explicit handle every caller goes through: it owns
//! the endpoint factory, the process registry, the governance controller and
//! the supervisor, and exposes spawn/terminate, precondition management and
//! process queries. Build one with [`Container::builder`].

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::endpoint::{EndpointFactory, Publisher, RpcClient};
use crate::envelope::Headers;
use crate::governance::{
    GovernanceController, InMemoryPolicyStore, PolicyEventListener, PolicyInterceptor, PolicyStore,
    Precondition,
};
use crate::interceptor::{ConversationInterceptor, Interceptor, InterceptorStack, MessageLogInterceptor};
use crate::transport::{InMemoryBroker, Transport};
use crate::types::{
    is_valid_identifier, Config, ContainerId, ConvIdGenerator, Error, ProcessId, ProcessIdPool, Result,
};

mod catalog;
mod control;
mod lifecycle;
mod process;
mod registry;
mod resource;
mod supervisor;
mod types;

pub use catalog::{CatalogEntry, ProcessCatalog, ServiceFactory};
pub use control::ProcessHandle;
pub use lifecycle::{CallbackId, LifecycleNotifier, ProcessStateEvent, StateCallback};
pub use process::{CallContext, ProcessContext, ProcessInfo, Service};
pub use registry::ProcessRegistry;
pub(crate) use registry::ProcessRuntime;
pub use resource::{NoopResourceRegistry, ResourceRegistry};
pub use types::{ProcessState, ProcessType};

use supervisor::ProcessSupervisor;

// =============================================================================
// Builder
// =============================================================================

/// Assembles a [`Container`] from its collaborators. Anything not supplied
/// falls back to an in-memory implementation.
#[derive(Debug, Default)]
pub struct ContainerBuilder {
    config: Config,
    transport: Option<Arc<dyn Transport>>,
    policy_store: Option<Arc<dyn PolicyStore>>,
    resources: Option<Arc<dyn ResourceRegistry>>,
    catalog: ProcessCatalog,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl ContainerBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn policy_store(mut self, store: Arc<dyn PolicyStore>) -> Self {
        self.policy_store = Some(store);
        self
    }

    pub fn resource_registry(mut self, resources: Arc<dyn ResourceRegistry>) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn catalog(mut self, catalog: ProcessCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Make an extra interceptor available under its name. It only runs if
    /// `governance.interceptor_order` lists it.
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn build(self) -> Result<Container> {
        let config = self.config;
        let id = match &config.container.id {
            Some(id) if is_valid_identifier(id) => ContainerId::from_string(id.clone())
                .map_err(Error::container_config)?,
            Some(id) => {
                return Err(Error::container_config(format!("invalid container id: {:?}", id)));
            }
            None => ContainerId::new(),
        };

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(InMemoryBroker::new()));
        let store = self
            .policy_store
            .unwrap_or_else(|| Arc::new(InMemoryPolicyStore::new()));
        let resources = self
            .resources
            .unwrap_or_else(|| Arc::new(NoopResourceRegistry));

        let registry = Arc::new(ProcessRegistry::new());
        let governance = Arc::new(GovernanceController::new(
            config.governance.clone(),
            store,
            registry.clone(),
        ));

        let mut available: HashMap<String, Arc<dyn Interceptor>> = HashMap::new();
        available.insert("message_log".into(), Arc::new(MessageLogInterceptor));
        available.insert("conversation".into(), Arc::new(ConversationInterceptor));
        available.insert(
            "governance".into(),
            Arc::new(PolicyInterceptor::new(governance.clone())),
        );
        for extra in self.interceptors {
            available.insert(extra.name().to_string(), extra);
        }
        let stack = InterceptorStack::from_order(&config.governance.interceptor_order, &available)?;

        let endpoints = Arc::new(EndpointFactory::new(
            transport,
            Arc::new(stack),
            Arc::new(ConvIdGenerator::new(id.as_str())),
            config.messaging.clone(),
            config.container.sys_name.clone(),
        ));
        let lifecycle = Arc::new(LifecycleNotifier::new());
        let supervisor = ProcessSupervisor::new(
            config.container.clone(),
            endpoints.clone(),
            self.catalog,
            registry.clone(),
            governance.clone(),
            resources,
            lifecycle.clone(),
            ProcessIdPool::new(&id),
        );

        tracing::debug!("Built container id={}", id);
        Ok(Container {
            id,
            config,
            endpoints,
            registry,
            governance,
            lifecycle,
            supervisor,
            policy_events: Mutex::new(None),
        })
    }
}

// =============================================================================
// Container
// =============================================================================

#[derive(Debug)]
pub struct Container {
    id: ContainerId,
    config: Config,
    endpoints: Arc<EndpointFactory>,
    registry: Arc<ProcessRegistry>,
    governance: Arc<GovernanceController>,
    lifecycle: Arc<LifecycleNotifier>,
    supervisor: ProcessSupervisor,
    policy_events: Mutex<Option<PolicyEventListener>>,
}

impl Container {
    pub fn builder() -> ContainerBuilder {
        ContainerBuilder::default()
    }

    pub fn id(&self) -> &ContainerId {
        &self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn governance(&self) -> &Arc<GovernanceController> {
        &self.governance
    }

    pub fn endpoints(&self) -> &Arc<EndpointFactory> {
        &self.endpoints
    }

    /// Load the common policy and begin listening for policy events.
    pub async fn start(&self) -> Result<()> {
        if self.governance.is_enabled() {
            if let Err(e) = self.governance.update_common_policy().await {
                tracing::warn!(error = %e, "common policy not loaded at startup");
            }
            let mut slot = self.policy_events.lock().await;
            if slot.is_none() {
                *slot = Some(PolicyEventListener::start(&self.endpoints, self.governance.clone()).await?);
            }
        }
        tracing::info!("Container started id={}", self.id);
        Ok(())
    }

    /// Terminate every process, most recently started first, then stop the
    /// policy event listener.
    pub async fn stop(&self) -> Result<()> {
        let mut ids = self.registry.ids_in_start_order().await;
        ids.reverse();
        for id in ids {
            if let Err(e) = self.supervisor.terminate(&id, true).await {
                tracing::warn!(process_id = %id, error = %e, "terminate during shutdown failed");
            }
        }

        if let Some(listener) = self.policy_events.lock().await.take() {
            listener.stop(self.config.container.shutdown_timeout).await?;
        }
        tracing::info!("Container stopped id={}", self.id);
        Ok(())
    }

    // =========================================================================
    // Process control
    // =========================================================================

    /// Spawn a process of the catalog class `module.class`.
    pub async fn spawn_process(
        &self,
        name: &str,
        module: &str,
        class: &str,
        config: Value,
        process_id: Option<&str>,
    ) -> Result<ProcessId> {
        self.supervisor
            .spawn(name, module, class, config, process_id)
            .await
    }

    pub async fn terminate_process(&self, process_id: &ProcessId) -> Result<()> {
        self.supervisor.terminate(process_id, true).await
    }

    // =========================================================================
    // Preconditions
    // =========================================================================

    pub async fn register_process_operation_precondition(
        &self,
        process_name: &str,
        op: &str,
        precondition: Precondition,
    ) -> Result<()> {
        let process = self
            .registry
            .by_name(process_name)
            .await
            .ok_or_else(|| Error::not_found(format!("unknown process name: {}", process_name)))?;
        self.governance
            .register_process_operation_precondition(&process, op, precondition)
            .await
    }

    pub async fn unregister_process_operation_precondition(
        &self,
        process_name: &str,
        op: &str,
        precondition: &Precondition,
    ) -> bool {
        self.governance
            .unregister_process_operation_precondition(process_name, op, precondition)
            .await
    }

    pub async fn unregister_all_process_operation_precondition(&self, process_name: &str, op: &str) -> usize {
        self.governance
            .unregister_all_process_operation_precondition(process_name, op)
            .await
    }

    pub async fn check_process_operation_preconditions(
        &self,
        process: &ProcessInfo,
        body: &Value,
        headers: &Headers,
    ) -> Result<()> {
        self.governance
            .check_process_operation_preconditions(process, body, headers)
            .await
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get_process(&self, process_id: &ProcessId) -> Option<Arc<ProcessInfo>> {
        self.registry.get(process_id).await
    }

    pub async fn get_process_by_name(&self, name: &str) -> Option<Arc<ProcessInfo>> {
        self.registry.by_name(name).await
    }

    pub async fn process_state(&self, process_id: &ProcessId) -> Option<ProcessState> {
        self.registry.state(process_id).await
    }

    pub async fn list_local_processes(&self, process_type: Option<ProcessType>) -> Vec<Arc<ProcessInfo>> {
        self.registry.list(process_type).await
    }

    pub async fn get_local_service_processes(&self, service: &str) -> Vec<Arc<ProcessInfo>> {
        self.registry.service_processes(service).await
    }

    pub async fn is_local_service_process(&self, service: &str) -> bool {
        self.registry
            .list(Some(ProcessType::Service))
            .await
            .iter()
            .any(|p| p.service_name() == service)
    }

    pub async fn is_local_agent_process(&self, resource_type: &str) -> bool {
        self.registry
            .list(Some(ProcessType::Agent))
            .await
            .iter()
            .any(|p| p.resource_type.as_deref() == Some(resource_type))
    }

    // =========================================================================
    // State callbacks
    // =========================================================================

    pub async fn add_state_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&ProcessStateEvent) + Send + Sync + 'static,
    {
        self.lifecycle.add(callback).await
    }

    pub async fn remove_state_callback(&self, id: CallbackId) -> bool {
        self.lifecycle.remove(id).await
    }

    // =========================================================================
    // Clients
    // =========================================================================

    /// RPC client for a service, sent from outside any process.
    pub fn service_client(&self, service: &str) -> RpcClient {
        self.endpoints
            .rpc_client(self.endpoints.service_queue(service), None)
    }

    /// RPC client for one process id or resource id.
    pub fn process_client(&self, target: &str) -> RpcClient {
        self.endpoints
            .rpc_client(self.endpoints.process_queue(target), None)
    }

    pub fn publisher(&self, topic: &str) -> Publisher {
        self.endpoints.publisher(topic, None)
    }
}

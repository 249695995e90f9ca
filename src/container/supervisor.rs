//! Process supervisor.
//!
//! Spawns processes from the catalog, wires their endpoints according to
//! their [`ProcessType`], registers them and tears them down again. Every
//! state change is announced through the [`LifecycleNotifier`] exactly once
//! and in order.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::catalog::{CatalogEntry, ProcessCatalog};
use super::control::ProcessHandle;
use super::lifecycle::{LifecycleNotifier, ProcessStateEvent};
use super::process::{ProcessContext, ProcessInfo};
use super::registry::{ProcessRegistry, ProcessRuntime};
use super::resource::ResourceRegistry;
use super::types::{ProcessState, ProcessType};
use crate::endpoint::{DeliveryHandler, EndpointFactory, ListenerHandle, Publisher, RpcServer, StreamDispatcher};
use crate::governance::{GovernanceController, PreconditionChecks};
use crate::transport::ListenerSpec;
use crate::types::{
    config_path, config_str, ensure_object, merge_config, ContainerConfig, Error, ProcessId,
    ProcessIdPool, Result,
};

#[derive(Debug)]
pub(crate) struct ProcessSupervisor {
    config: ContainerConfig,
    endpoints: Arc<EndpointFactory>,
    catalog: ProcessCatalog,
    registry: Arc<ProcessRegistry>,
    governance: Arc<GovernanceController>,
    resources: Arc<dyn ResourceRegistry>,
    lifecycle: Arc<LifecycleNotifier>,
    ids: ProcessIdPool,
}

impl ProcessSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: ContainerConfig,
        endpoints: Arc<EndpointFactory>,
        catalog: ProcessCatalog,
        registry: Arc<ProcessRegistry>,
        governance: Arc<GovernanceController>,
        resources: Arc<dyn ResourceRegistry>,
        lifecycle: Arc<LifecycleNotifier>,
        ids: ProcessIdPool,
    ) -> Self {
        Self {
            config,
            endpoints,
            catalog,
            registry,
            governance,
            resources,
            lifecycle,
            ids,
        }
    }

    // =========================================================================
    // Spawn
    // =========================================================================

    pub(crate) async fn spawn(
        &self,
        name: &str,
        module: &str,
        class: &str,
        config: Value,
        process_id: Option<&str>,
    ) -> Result<ProcessId> {
        let process_id = match process_id {
            Some(id) => ProcessId::parse(id)
                .map_err(|e| Error::bad_request(format!("invalid process id {:?}: {}", id, e)))?,
            None => self.ids.next_id(),
        };
        if name.is_empty() {
            return Err(Error::bad_request("process name must not be empty"));
        }
        ensure_object(&config)?;

        let mut merged = match &self.config.process_defaults {
            Value::Object(_) => self.config.process_defaults.clone(),
            _ => Value::Object(Map::new()),
        };
        if config.is_object() {
            merge_config(&mut merged, &config);
        }

        let entry = self.catalog.resolve(module, class)?;
        let process_type = match config_str(&merged, "process.type") {
            Some(t) => t.parse()?,
            None => entry.process_type,
        };

        self.registry.reserve(&process_id, name, process_type).await?;
        let mut pending = ProcessStateEvent::new(process_id.clone(), name, ProcessState::Pending);
        pending.process_type = Some(process_type);
        self.lifecycle.emit(pending).await;

        match self.start(process_id.clone(), name, entry, process_type, merged).await {
            Ok(info) => {
                if process_type == ProcessType::Immediate {
                    self.terminate(&info.id, false).await?;
                    self.lifecycle
                        .emit(ProcessStateEvent::for_process(&info, ProcessState::Exited))
                        .await;
                } else {
                    self.governance.update_process_policies(&info, true, false).await?;
                }
                Ok(process_id)
            }
            Err(e) => {
                self.registry.release(&process_id).await;
                tracing::error!(process_id = %process_id, error = %e, "process failed to start");
                let mut failed = ProcessStateEvent::new(process_id, name, ProcessState::Failed);
                failed.process_type = Some(process_type);
                self.lifecycle.emit(failed).await;
                Err(e)
            }
        }
    }

    /// Create, initialise and start the service, activate its listeners and
    /// register it under its reserved id. Nothing stays registered or
    /// consuming on failure.
    async fn start(
        &self,
        process_id: ProcessId,
        name: &str,
        entry: &CatalogEntry,
        process_type: ProcessType,
        config: Value,
    ) -> Result<Arc<ProcessInfo>> {
        let mut service = entry.create(&config)?;
        let checks: PreconditionChecks = service
            .precondition_checks()
            .into_iter()
            .map(|(name, check)| (name.to_string(), check))
            .collect();

        let mut info = ProcessInfo::new(process_id, name, process_type).with_operations(service.operations());
        info.listen_name = config_str(&config, "process.listen_name").map(str::to_string);
        info.resource_type = config_str(&config, "agent.resource_type").map(str::to_string);
        info.resource_id = config_str(&config, "agent.resource_id").map(str::to_string);
        info.config = config;
        let info = Arc::new(info);

        let publishers = self.create_publishers(&info)?;
        let ctx = ProcessContext::new(info.clone(), self.endpoints.clone(), publishers);

        service.on_init(&ctx).await?;
        service.on_start(&ctx).await?;
        let handle = ProcessHandle::spawn(service, ctx.clone());

        let listeners = match self.activate_listeners(&info, &ctx, &handle).await {
            Ok(listeners) => listeners,
            Err(e) => {
                self.quit(&info, &handle).await;
                return Err(e);
            }
        };

        let resource_reg_id = match self.resources.register_process(&info).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(process_id = %info.id, error = %e, "resource registry rejected process");
                None
            }
        };

        let runtime = ProcessRuntime {
            handle: Some(handle),
            listeners,
            resource_reg_id,
        };
        let registered = self.registry.insert(info.clone(), Arc::new(checks), runtime).await;
        match registered {
            Ok(true) => tracing::warn!(
                process_id = %info.id,
                "process name {} already registered, name lookups now resolve to the new process",
                info.name
            ),
            Ok(false) => {}
            Err((e, runtime)) => {
                self.teardown(&info, runtime).await;
                return Err(e);
            }
        }

        tracing::info!(
            "Spawned process id={} name={} type={}",
            info.id,
            info.name,
            info.process_type
        );
        self.lifecycle
            .emit(ProcessStateEvent::for_process(&info, ProcessState::Running))
            .await;
        Ok(info)
    }

    fn create_publishers(&self, info: &Arc<ProcessInfo>) -> Result<HashMap<String, Publisher>> {
        let mut publishers = HashMap::new();
        if !info.process_type.has_publishers() {
            return Ok(publishers);
        }
        let Some(streams) = config_path(&info.config, "process.publish_streams") else {
            return Ok(publishers);
        };
        let streams = streams.as_object().ok_or_else(|| {
            Error::container_config("process.publish_streams must map stream names to topics")
        })?;
        for (stream, topic) in streams {
            let topic = topic.as_str().ok_or_else(|| {
                Error::container_config(format!("publish stream {} needs a topic name", stream))
            })?;
            publishers.insert(
                stream.clone(),
                self.endpoints.publisher(topic, Some(info.clone())),
            );
        }
        Ok(publishers)
    }

    /// Listeners each process type is wired with.
    fn listener_plan(
        &self,
        info: &Arc<ProcessInfo>,
        ctx: &ProcessContext,
        handle: &ProcessHandle,
    ) -> Vec<(ListenerSpec, Arc<dyn DeliveryHandler>)> {
        let rpc = || -> Arc<dyn DeliveryHandler> {
            Arc::new(RpcServer::new(
                self.endpoints.transport().clone(),
                self.endpoints.interceptors().clone(),
                self.governance.clone(),
                ctx.clone(),
                handle.clone(),
                self.endpoints.messaging().clone(),
            ))
        };
        let own_queue = || ListenerSpec::queue(self.endpoints.process_queue(info.id.as_str()));

        match info.process_type {
            ProcessType::Service => vec![(
                ListenerSpec::queue(self.endpoints.service_queue(info.service_name())),
                rpc(),
            )],
            ProcessType::Stream => {
                let binding = config_str(&info.config, "process.input_binding")
                    .unwrap_or(info.service_name())
                    .to_string();
                let dispatcher: Arc<dyn DeliveryHandler> = Arc::new(StreamDispatcher::new(
                    self.endpoints.interceptors().clone(),
                    info.clone(),
                    handle.clone(),
                ));
                vec![
                    (own_queue(), rpc()),
                    (
                        ListenerSpec::queue(self.endpoints.service_queue(info.service_name()))
                            .with_binding(binding),
                        dispatcher,
                    ),
                ]
            }
            ProcessType::Agent => {
                let mut plan = vec![(own_queue(), rpc())];
                if let Some(resource_id) = &info.resource_id {
                    plan.push((
                        ListenerSpec::queue(self.endpoints.process_queue(resource_id)),
                        rpc(),
                    ));
                }
                plan
            }
            ProcessType::Standalone => vec![(own_queue(), rpc())],
            ProcessType::Simple | ProcessType::Immediate => Vec::new(),
        }
    }

    async fn activate_listeners(
        &self,
        info: &Arc<ProcessInfo>,
        ctx: &ProcessContext,
        handle: &ProcessHandle,
    ) -> Result<Vec<ListenerHandle>> {
        let mut active: Vec<ListenerHandle> = Vec::new();
        for (spec, handler) in self.listener_plan(info, ctx, handle) {
            let activated = match self.endpoints.declare(spec).await {
                Ok(channel) => self.endpoints.listener(channel, handler).activate().await,
                Err(e) => Err(e),
            };
            match activated {
                Ok(listener) => active.push(listener),
                Err(e) => {
                    tracing::warn!(process_id = %info.id, error = %e, "listener activation failed");
                    self.shutdown_listeners(info, active).await;
                    return Err(e);
                }
            }
        }
        Ok(active)
    }

    // =========================================================================
    // Terminate
    // =========================================================================

    /// Stop a process and release everything it owns, announcing
    /// TERMINATING and TERMINATED when `notify` is set.
    pub(crate) async fn terminate(&self, process_id: &ProcessId, notify: bool) -> Result<()> {
        let (info, runtime) = self
            .registry
            .begin_termination(process_id)
            .await
            .ok_or_else(|| Error::not_found(format!("unknown process: {}", process_id)))?;

        if notify {
            self.lifecycle
                .emit(ProcessStateEvent::for_process(&info, ProcessState::Terminating))
                .await;
        }

        self.teardown(&info, runtime).await;
        self.registry.remove(process_id).await;

        tracing::info!("Terminated process id={} name={}", info.id, info.name);
        if notify {
            self.lifecycle
                .emit(ProcessStateEvent::for_process(&info, ProcessState::Terminated))
                .await;
        }
        Ok(())
    }

    /// Stop consuming, quit the process and release its resource
    /// registration.
    async fn teardown(&self, info: &ProcessInfo, runtime: ProcessRuntime) {
        for listener in &runtime.listeners {
            listener.stop();
        }
        if let Some(handle) = &runtime.handle {
            self.quit(info, handle).await;
        }
        self.shutdown_listeners(info, runtime.listeners).await;

        if let Some(resource_id) = &runtime.resource_reg_id {
            if let Err(e) = self.resources.unregister_process(resource_id).await {
                tracing::warn!(process_id = %info.id, error = %e, "resource unregistration failed");
            }
        }
    }

    /// Run the quit hook, bounded by the shutdown timeout. Failures are
    /// logged; teardown continues regardless.
    async fn quit(&self, info: &ProcessInfo, handle: &ProcessHandle) {
        match tokio::time::timeout(self.shutdown_timeout(), handle.quit()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(process_id = %info.id, error = %e, "quit hook failed"),
            Err(_) => tracing::warn!(process_id = %info.id, "quit hook timed out"),
        }
    }

    async fn shutdown_listeners(&self, info: &ProcessInfo, listeners: Vec<ListenerHandle>) {
        let wait = self.shutdown_timeout();
        let results = futures::future::join_all(listeners.into_iter().map(|l| l.shutdown(wait))).await;
        for e in results.into_iter().filter_map(|r| r.err()) {
            tracing::warn!(process_id = %info.id, error = %e, "listener shutdown failed");
        }
    }

    fn shutdown_timeout(&self) -> Duration {
        self.config.shutdown_timeout
    }
}

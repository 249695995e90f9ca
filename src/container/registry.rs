//! Process registry.
//!
//! Tracks every registered process by id and by name, together with the
//! runtime pieces the supervisor needs to tear it down again. Name lookup
//! follows the latest registration; id lookup is always exact.
//!
//! An id is reserved as PENDING before the process starts, so two spawns
//! can never both claim it. Reservations are visible by id only.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::control::ProcessHandle;
use super::process::ProcessInfo;
use super::types::{ProcessState, ProcessType};
use crate::endpoint::ListenerHandle;
use crate::governance::PreconditionChecks;
use crate::types::{Error, ProcessId, Result};

/// Resources owned by a running process.
#[derive(Debug, Default)]
pub(crate) struct ProcessRuntime {
    pub handle: Option<ProcessHandle>,
    pub listeners: Vec<ListenerHandle>,
    pub resource_reg_id: Option<String>,
}

struct ProcessRecord {
    info: Arc<ProcessInfo>,
    state: ProcessState,
    checks: Arc<PreconditionChecks>,
    runtime: Option<ProcessRuntime>,
}

impl ProcessRecord {
    fn is_reservation(&self) -> bool {
        self.state == ProcessState::Pending && self.runtime.is_none()
    }
}

impl fmt::Debug for ProcessRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut checks: Vec<&str> = self.checks.keys().map(String::as_str).collect();
        checks.sort_unstable();
        f.debug_struct("ProcessRecord")
            .field("info", &self.info)
            .field("state", &self.state)
            .field("checks", &checks)
            .field("runtime", &self.runtime)
            .finish()
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    by_id: HashMap<ProcessId, ProcessRecord>,
    by_name: HashMap<String, ProcessId>,
    start_order: Vec<ProcessId>,
}

#[derive(Debug, Default)]
pub struct ProcessRegistry {
    inner: RwLock<RegistryInner>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` for a process about to start. The record stays PENDING
    /// until [`insert`](Self::insert) fills it or [`release`](Self::release)
    /// drops it.
    pub(crate) async fn reserve(
        &self,
        id: &ProcessId,
        name: &str,
        process_type: ProcessType,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.by_id.contains_key(id) {
            return Err(Error::conflict(format!("process id already registered: {}", id)));
        }
        inner.by_id.insert(
            id.clone(),
            ProcessRecord {
                info: Arc::new(ProcessInfo::new(id.clone(), name, process_type)),
                state: ProcessState::Pending,
                checks: Arc::new(PreconditionChecks::new()),
                runtime: None,
            },
        );
        Ok(())
    }

    /// Drop a reservation that never became a running process.
    pub(crate) async fn release(&self, id: &ProcessId) -> bool {
        let mut inner = self.inner.write().await;
        if inner.by_id.get(id).is_some_and(ProcessRecord::is_reservation) {
            inner.by_id.remove(id);
            return true;
        }
        false
    }

    /// Register a running process, filling its reservation if it has one.
    /// Returns `true` when the name was already taken by another process.
    /// A rejected runtime is handed back so the caller can tear it down.
    pub(crate) async fn insert(
        &self,
        info: Arc<ProcessInfo>,
        checks: Arc<PreconditionChecks>,
        runtime: ProcessRuntime,
    ) -> std::result::Result<bool, (Error, ProcessRuntime)> {
        let mut inner = self.inner.write().await;
        if inner
            .by_id
            .get(&info.id)
            .is_some_and(|r| !r.is_reservation())
        {
            let err = Error::conflict(format!("process id already registered: {}", info.id));
            return Err((err, runtime));
        }

        let duplicate = inner
            .by_name
            .insert(info.name.clone(), info.id.clone())
            .is_some();
        inner.start_order.push(info.id.clone());
        inner.by_id.insert(
            info.id.clone(),
            ProcessRecord {
                info,
                state: ProcessState::Running,
                checks,
                runtime: Some(runtime),
            },
        );
        Ok(duplicate)
    }

    pub async fn get(&self, id: &ProcessId) -> Option<Arc<ProcessInfo>> {
        self.inner.read().await.by_id.get(id).map(|r| r.info.clone())
    }

    pub async fn by_name(&self, name: &str) -> Option<Arc<ProcessInfo>> {
        let inner = self.inner.read().await;
        let id = inner.by_name.get(name)?;
        inner.by_id.get(id).map(|r| r.info.clone())
    }

    pub async fn state(&self, id: &ProcessId) -> Option<ProcessState> {
        self.inner.read().await.by_id.get(id).map(|r| r.state)
    }

    pub(crate) async fn set_state(&self, id: &ProcessId, state: ProcessState) -> Result<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .by_id
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("unknown process: {}", id)))?;

        if !record.state.can_transition_to(state) {
            return Err(Error::inconsistent(format!(
                "cannot move process {} from {:?} to {:?}",
                id, record.state, state
            )));
        }
        record.state = state;
        Ok(())
    }

    /// Move a running process to TERMINATING and hand back its runtime.
    /// `None` when the process is unknown or already terminating.
    pub(crate) async fn begin_termination(
        &self,
        id: &ProcessId,
    ) -> Option<(Arc<ProcessInfo>, ProcessRuntime)> {
        let mut inner = self.inner.write().await;
        let record = inner.by_id.get_mut(id)?;
        let runtime = record.runtime.take()?;
        if record.state.can_transition_to(ProcessState::Terminating) {
            record.state = ProcessState::Terminating;
        }
        Some((record.info.clone(), runtime))
    }

    pub(crate) async fn remove(&self, id: &ProcessId) -> Option<Arc<ProcessInfo>> {
        let mut inner = self.inner.write().await;
        let record = inner.by_id.remove(id)?;
        inner.start_order.retain(|p| p != id);

        if inner.by_name.get(&record.info.name) == Some(id) {
            // Fall back to the most recent remaining process with that name.
            let successor = inner
                .start_order
                .iter()
                .rev()
                .find(|p| {
                    inner
                        .by_id
                        .get(*p)
                        .is_some_and(|r| r.info.name == record.info.name)
                })
                .cloned();
            match successor {
                Some(next) => {
                    inner.by_name.insert(record.info.name.clone(), next);
                }
                None => {
                    inner.by_name.remove(&record.info.name);
                }
            }
        }
        Some(record.info)
    }

    /// Registered processes in start order, optionally of one type.
    pub async fn list(&self, process_type: Option<ProcessType>) -> Vec<Arc<ProcessInfo>> {
        let inner = self.inner.read().await;
        inner
            .start_order
            .iter()
            .filter_map(|id| inner.by_id.get(id))
            .filter(|r| process_type.map_or(true, |t| r.info.process_type == t))
            .map(|r| r.info.clone())
            .collect()
    }

    /// Processes whose service-scope policy lives under `service`: services
    /// by listen name, agents by resource type.
    pub async fn service_processes(&self, service: &str) -> Vec<Arc<ProcessInfo>> {
        self.policy_subjects(service)
            .await
            .into_iter()
            .map(|(info, _)| info)
            .collect()
    }

    pub(crate) async fn policy_subjects(
        &self,
        service: &str,
    ) -> Vec<(Arc<ProcessInfo>, Arc<PreconditionChecks>)> {
        let inner = self.inner.read().await;
        inner
            .start_order
            .iter()
            .filter_map(|id| inner.by_id.get(id))
            .filter(|r| {
                matches!(r.info.process_type, ProcessType::Service | ProcessType::Agent)
                    && r.info.policy_service_name() == service
            })
            .map(|r| (r.info.clone(), r.checks.clone()))
            .collect()
    }

    pub async fn ids_in_start_order(&self) -> Vec<ProcessId> {
        self.inner.read().await.start_order.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governance::{PreconditionFn, Verdict};

    fn info(id: &str, name: &str, process_type: ProcessType) -> Arc<ProcessInfo> {
        Arc::new(ProcessInfo::new(ProcessId::parse(id).unwrap(), name, process_type))
    }

    async fn insert(registry: &ProcessRegistry, info: &Arc<ProcessInfo>) -> bool {
        registry
            .insert(info.clone(), Arc::new(PreconditionChecks::new()), ProcessRuntime::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_name_last_wins() {
        let registry = ProcessRegistry::new();
        let a = info("c.1", "worker", ProcessType::Standalone);
        let b = info("c.2", "worker", ProcessType::Standalone);

        assert!(!insert(&registry, &a).await);
        assert!(insert(&registry, &b).await);
        assert_eq!(registry.by_name("worker").await.unwrap().id, b.id);
        assert_eq!(registry.get(&a.id).await.unwrap().id, a.id);

        registry.remove(&b.id).await;
        assert_eq!(registry.by_name("worker").await.unwrap().id, a.id);
        registry.remove(&a.id).await;
        assert!(registry.by_name("worker").await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_id_conflicts() {
        let registry = ProcessRegistry::new();
        let a = info("c.1", "worker", ProcessType::Standalone);
        insert(&registry, &a).await;
        let err = registry
            .insert(a.clone(), Arc::new(PreconditionChecks::new()), ProcessRuntime::default())
            .await
            .unwrap_err();
        assert_eq!(err.0.status_code(), 409);
    }

    #[tokio::test]
    async fn test_reservation_blocks_id_until_released() {
        let registry = ProcessRegistry::new();
        let a = info("c.1", "worker", ProcessType::Service);
        registry.reserve(&a.id, "worker", ProcessType::Service).await.unwrap();

        let err = registry
            .reserve(&a.id, "other", ProcessType::Service)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 409);
        assert_eq!(registry.state(&a.id).await, Some(ProcessState::Pending));
        assert_eq!(registry.get(&a.id).await.unwrap().name, "worker");
        assert!(registry.by_name("worker").await.is_none());
        assert!(registry.list(None).await.is_empty());
        assert!(registry.begin_termination(&a.id).await.is_none());

        assert!(registry.release(&a.id).await);
        assert!(registry.state(&a.id).await.is_none());
        registry.reserve(&a.id, "worker", ProcessType::Service).await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_fills_reservation() {
        let registry = ProcessRegistry::new();
        let a = info("c.1", "worker", ProcessType::Service);
        registry.reserve(&a.id, "worker", ProcessType::Service).await.unwrap();

        assert!(!insert(&registry, &a).await);
        assert_eq!(registry.state(&a.id).await, Some(ProcessState::Running));
        assert_eq!(registry.by_name("worker").await.unwrap().id, a.id);
        assert_eq!(registry.ids_in_start_order().await, vec![a.id.clone()]);
        assert!(!registry.release(&a.id).await);
    }

    #[test]
    fn test_record_debug_lists_check_names() {
        let mut checks = PreconditionChecks::new();
        let check: PreconditionFn =
            Arc::new(|_: &serde_json::Value, _: &crate::envelope::Headers| Ok(Verdict::Allow));
        checks.insert("has_funds".to_string(), check);
        let record = ProcessRecord {
            info: info("c.1", "bank", ProcessType::Service),
            state: ProcessState::Running,
            checks: Arc::new(checks),
            runtime: None,
        };
        let text = format!("{:?}", record);
        assert!(text.contains("has_funds"));
        assert!(text.contains("Running"));
    }

    #[tokio::test]
    async fn test_begin_termination_once() {
        let registry = ProcessRegistry::new();
        let a = info("c.1", "worker", ProcessType::Service);
        insert(&registry, &a).await;

        assert!(registry.begin_termination(&a.id).await.is_some());
        assert_eq!(registry.state(&a.id).await, Some(ProcessState::Terminating));
        assert!(registry.begin_termination(&a.id).await.is_none());
    }

    #[tokio::test]
    async fn test_set_state_validates_transitions() {
        let registry = ProcessRegistry::new();
        let a = info("c.1", "once", ProcessType::Immediate);
        insert(&registry, &a).await;

        assert!(registry.set_state(&a.id, ProcessState::Pending).await.is_err());
        registry.set_state(&a.id, ProcessState::Exited).await.unwrap();
        assert_eq!(registry.state(&a.id).await, Some(ProcessState::Exited));
    }

    #[tokio::test]
    async fn test_service_processes_include_agents_by_resource_type() {
        let registry = ProcessRegistry::new();
        let svc = info("c.1", "bank", ProcessType::Service);
        let mut agent = ProcessInfo::new(ProcessId::parse("c.2").unwrap(), "dev_agent", ProcessType::Agent);
        agent.resource_type = Some("bank".into());
        let agent = Arc::new(agent);
        let other = info("c.3", "bank", ProcessType::Standalone);
        for p in [&svc, &agent, &other] {
            insert(&registry, p).await;
        }

        let ids: Vec<_> = registry
            .service_processes("bank")
            .await
            .iter()
            .map(|p| p.id.to_string())
            .collect();
        assert_eq!(ids, vec!["c.1", "c.2"]);
        assert_eq!(registry.list(Some(ProcessType::Standalone)).await.len(), 1);
        assert_eq!(registry.ids_in_start_order().await.len(), 3);
    }
}

//! Governance controller.
//!
//! Owns the three policy caches (common, per-service, per-resource) and the
//! precondition table. Every scope is either unloaded (no cache entry) or
//! loaded (an entry, possibly empty). Loaded entries are immutable `Arc`s,
//! replaced whole on refresh, so a concurrent reader sees the old entry or
//! the new one and never a mix.
//!
//! Lock order: the cache lock is always taken before the precondition table
//! lock, and the process registry is consulted before either.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use super::events::PolicyEvent;
use super::policy::{
    decide, AccessRequest, AccessRule, Decision, PolicyStore, RuleEvaluator, ServicePolicy,
    TargetMatcher,
};
use super::preconditions::{evaluate_preconditions, Precondition, PreconditionChecks, PreconditionTable};
use crate::container::{ProcessInfo, ProcessRegistry, ProcessType};
use crate::envelope::Headers;
use crate::types::{Error, GovernanceConfig, Result};

// =============================================================================
// Cache and bookkeeping types
// =============================================================================

#[derive(Debug, Default)]
struct PolicyCache {
    common: Option<Arc<Vec<AccessRule>>>,
    services: HashMap<String, Arc<ServicePolicy>>,
    resources: HashMap<String, Arc<Vec<AccessRule>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "scope", content = "key", rename_all = "snake_case")]
pub enum PolicyScope {
    Common,
    Service(String),
    Resource(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Loaded,
    Invalidated,
    Reset,
}

/// One entry of the policy update log.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyUpdateRecord {
    pub timestamp: DateTime<Utc>,
    pub scope: PolicyScope,
    pub op: Option<String>,
    pub action: PolicyAction,
    pub rules: usize,
}

/// Cardinalities of the cached policy, per scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PolicySnapshot {
    pub common_loaded: bool,
    pub common_rules: usize,
    pub services: usize,
    pub service_rules: usize,
    pub service_preconditions: usize,
    pub resources: usize,
    pub resource_rules: usize,
    /// Registered precondition entries, local and policy-sourced.
    pub registered_preconditions: usize,
}

// =============================================================================
// Controller
// =============================================================================

#[derive(Debug)]
pub struct GovernanceController {
    config: GovernanceConfig,
    store: Arc<dyn PolicyStore>,
    evaluator: Arc<dyn RuleEvaluator>,
    processes: Arc<ProcessRegistry>,
    cache: RwLock<PolicyCache>,
    preconditions: RwLock<PreconditionTable>,
    update_log: Mutex<VecDeque<PolicyUpdateRecord>>,
}

impl GovernanceController {
    pub fn new(
        config: GovernanceConfig,
        store: Arc<dyn PolicyStore>,
        processes: Arc<ProcessRegistry>,
    ) -> Self {
        Self {
            config,
            store,
            evaluator: Arc::new(TargetMatcher),
            processes,
            cache: RwLock::new(PolicyCache::default()),
            preconditions: RwLock::new(PreconditionTable::new()),
            update_log: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn RuleEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn config(&self) -> &GovernanceConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn is_system_actor(&self, actor_id: &str) -> bool {
        self.config.system_actor_id.as_deref() == Some(actor_id)
    }

    // =========================================================================
    // Policy loading
    // =========================================================================

    pub async fn update_common_policy(&self) -> Result<()> {
        let rules = self.store.get_active_common_rules().await?;
        let count = rules.len();
        self.cache.write().await.common = Some(Arc::new(rules));
        self.record(PolicyScope::Common, None, PolicyAction::Loaded, count).await;
        tracing::debug!("Loaded common policy rules={}", count);
        Ok(())
    }

    /// Fetch and replace the policy of one service, then re-register its
    /// policy preconditions on every local process of that service. With
    /// `op`, only that operation's preconditions are refreshed; a service
    /// that was never loaded is always loaded in full.
    pub async fn update_service_policy(&self, service: &str, op: Option<&str>) -> Result<()> {
        let mut op = op;
        let policy = loop {
            if !self.cache.read().await.services.contains_key(service) {
                op = None;
            }
            let fetched = self.store.get_active_service_rules(service, op).await?;
            let subjects = self.processes.policy_subjects(service).await;

            let mut cache = self.cache.write().await;
            let policy = match (op, cache.services.get(service)) {
                (Some(op), Some(existing)) => {
                    let mut preconditions: Vec<_> = existing
                        .preconditions
                        .iter()
                        .filter(|p| p.op != op)
                        .cloned()
                        .collect();
                    preconditions.extend(fetched.preconditions);
                    ServicePolicy {
                        rules: fetched.rules,
                        preconditions,
                    }
                }
                // Invalidated while fetching: nothing left to merge into.
                (Some(_), None) => continue,
                (None, _) => fetched,
            };
            let policy = Arc::new(policy);
            cache.services.insert(service.to_string(), policy.clone());
            apply_policy_preconditions(&mut *self.preconditions.write().await, &subjects, op, &policy);
            break policy;
        };

        self.record(
            PolicyScope::Service(service.to_string()),
            op.map(str::to_string),
            PolicyAction::Loaded,
            policy.rules.len(),
        )
        .await;
        tracing::debug!(
            "Loaded service policy service={} rules={} preconditions={}",
            service,
            policy.rules.len(),
            policy.preconditions.len()
        );
        Ok(())
    }

    /// Load the rules of one resource unless they are already cached.
    pub async fn update_resource_policy(&self, resource_id: &str) -> Result<()> {
        if self.cache.read().await.resources.contains_key(resource_id) {
            tracing::debug!("Resource policy already cached resource_id={}", resource_id);
            return Ok(());
        }

        let rules = self.store.get_active_resource_rules(resource_id).await?;
        let count = rules.len();
        self.cache
            .write()
            .await
            .resources
            .insert(resource_id.to_string(), Arc::new(rules));
        self.record(
            PolicyScope::Resource(resource_id.to_string()),
            None,
            PolicyAction::Loaded,
            count,
        )
        .await;
        tracing::debug!("Loaded resource policy resource_id={} rules={}", resource_id, count);
        Ok(())
    }

    /// Forget a cached resource policy. Returns whether it was cached.
    pub async fn invalidate_resource(&self, resource_id: &str) -> bool {
        let removed = self.cache.write().await.resources.remove(resource_id).is_some();
        if removed {
            self.record(
                PolicyScope::Resource(resource_id.to_string()),
                None,
                PolicyAction::Invalidated,
                0,
            )
            .await;
        }
        removed
    }

    /// Forget a cached service policy and the preconditions it attached.
    pub async fn invalidate_service(&self, service: &str) -> bool {
        let subjects = self.processes.policy_subjects(service).await;
        let removed = {
            let mut cache = self.cache.write().await;
            let mut table = self.preconditions.write().await;
            for name in unique_names(&subjects) {
                table.remove_policy_sourced(name, None);
            }
            cache.services.remove(service).is_some()
        };
        if removed {
            self.record(
                PolicyScope::Service(service.to_string()),
                None,
                PolicyAction::Invalidated,
                0,
            )
            .await;
        }
        removed
    }

    /// Load the policy scopes a newly started process depends on. With
    /// `safe_mode`, a policy store failure is logged and the process runs
    /// without loaded policy. `force` refetches scopes that are cached.
    pub async fn update_process_policies(
        &self,
        process: &ProcessInfo,
        safe_mode: bool,
        force: bool,
    ) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        match self.load_process_policies(process, force).await {
            Ok(()) => Ok(()),
            Err(e) if safe_mode => {
                if self.config.bootstrap_processes.iter().any(|n| *n == process.name) {
                    tracing::debug!(
                        process_id = %process.id,
                        error = %e,
                        "policy store not ready during bootstrap"
                    );
                } else {
                    tracing::warn!(
                        process_id = %process.id,
                        error = %e,
                        "policy store unavailable, process running without loaded policy"
                    );
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn load_process_policies(&self, process: &ProcessInfo, force: bool) -> Result<()> {
        if !matches!(process.process_type, ProcessType::Service | ProcessType::Agent) {
            return Ok(());
        }
        if !self.store.is_available().await {
            return Err(Error::server("policy store unavailable"));
        }

        let service = process.policy_service_name();
        let registered = !force && {
            let subjects = self.processes.policy_subjects(service).await;
            let cache = self.cache.read().await;
            match cache.services.get(service) {
                Some(policy) => {
                    let mut table = self.preconditions.write().await;
                    apply_policy_preconditions(&mut table, &subjects, None, policy);
                    true
                }
                None => false,
            }
        };
        if !registered {
            self.update_service_policy(service, None).await?;
        }

        if process.process_type == ProcessType::Agent {
            if let Some(resource_id) = &process.resource_id {
                if force {
                    self.invalidate_resource(resource_id).await;
                }
                self.update_resource_policy(resource_id).await?;
            }
        }
        Ok(())
    }

    /// Return every scope to unloaded and drop policy-sourced preconditions.
    /// The next check reloads what it needs.
    pub async fn reset_policy_cache(&self) {
        {
            let mut cache = self.cache.write().await;
            let mut table = self.preconditions.write().await;
            *cache = PolicyCache::default();
            table.clear_policy_sourced();
        }
        self.record(PolicyScope::Common, None, PolicyAction::Reset, 0).await;
        tracing::info!("Policy cache reset");
    }

    pub async fn handle_policy_event(&self, event: PolicyEvent) -> Result<()> {
        tracing::debug!(?event, "policy event");
        match event {
            PolicyEvent::ServicePolicy {
                service_name: None, ..
            } => self.update_common_policy().await,
            PolicyEvent::ServicePolicy {
                service_name: Some(service),
                deleted: true,
                ..
            } => {
                self.invalidate_service(&service).await;
                Ok(())
            }
            PolicyEvent::ServicePolicy {
                service_name: Some(service),
                op,
                ..
            } => {
                let cached = self.cache.read().await.services.contains_key(&service);
                if !cached && self.processes.policy_subjects(&service).await.is_empty() {
                    tracing::debug!("Ignoring policy event for service={}", service);
                    return Ok(());
                }
                self.update_service_policy(&service, op.as_deref()).await
            }
            PolicyEvent::ResourcePolicy {
                resource_id,
                deleted,
            } => {
                let was_cached = self.invalidate_resource(&resource_id).await;
                if deleted || !was_cached {
                    return Ok(());
                }
                self.update_resource_policy(&resource_id).await
            }
        }
    }

    async fn record(&self, scope: PolicyScope, op: Option<String>, action: PolicyAction, rules: usize) {
        let mut log = self.update_log.lock().await;
        log.push_back(PolicyUpdateRecord {
            timestamp: Utc::now(),
            scope,
            op,
            action,
            rules,
        });
        while log.len() > self.config.policy_log_size {
            log.pop_front();
        }
    }

    pub async fn policy_update_log(&self) -> Vec<PolicyUpdateRecord> {
        self.update_log.lock().await.iter().cloned().collect()
    }

    pub async fn policy_snapshot(&self) -> PolicySnapshot {
        let cache = self.cache.read().await;
        let registered_preconditions = self.preconditions.read().await.total();
        PolicySnapshot {
            common_loaded: cache.common.is_some(),
            common_rules: cache.common.as_ref().map_or(0, |r| r.len()),
            services: cache.services.len(),
            service_rules: cache.services.values().map(|p| p.rules.len()).sum(),
            service_preconditions: cache.services.values().map(|p| p.preconditions.len()).sum(),
            resources: cache.resources.len(),
            resource_rules: cache.resources.values().map(|r| r.len()).sum(),
            registered_preconditions,
        }
    }

    // =========================================================================
    // Preconditions
    // =========================================================================

    pub async fn register_process_operation_precondition(
        &self,
        process: &ProcessInfo,
        op: &str,
        precondition: Precondition,
    ) -> Result<()> {
        if !process.has_operation(op) {
            return Err(Error::not_found(format!(
                "process {} has no operation {}",
                process.name, op
            )));
        }
        self.preconditions
            .write()
            .await
            .register(&process.name, op, precondition);
        tracing::debug!("Registered precondition process={} op={}", process.name, op);
        Ok(())
    }

    /// Remove one precondition; an empty `op` is a no-op.
    pub async fn unregister_process_operation_precondition(
        &self,
        process_name: &str,
        op: &str,
        precondition: &Precondition,
    ) -> bool {
        if op.is_empty() {
            return false;
        }
        self.preconditions
            .write()
            .await
            .unregister(process_name, op, precondition)
    }

    pub async fn unregister_all_process_operation_precondition(&self, process_name: &str, op: &str) -> usize {
        self.preconditions
            .write()
            .await
            .unregister_all(process_name, op)
    }

    pub async fn precondition_count(&self, process_name: &str, op: &str) -> usize {
        self.preconditions.read().await.count(process_name, op)
    }

    /// Run the preconditions registered for `(process.name, headers.op)`,
    /// newest first. A deny becomes Unauthorized with the predicate's reason.
    pub async fn check_process_operation_preconditions(
        &self,
        process: &ProcessInfo,
        body: &Value,
        headers: &Headers,
    ) -> Result<()> {
        let Some(op) = headers.op() else {
            return Ok(());
        };
        let list = self.preconditions.read().await.get(&process.name, op);
        if list.is_empty() {
            return Ok(());
        }
        evaluate_preconditions(&list, body, headers, self.config.precondition_errors)
    }

    // =========================================================================
    // Access evaluation
    // =========================================================================

    /// Evaluate access rules for a request to `process`: resource rules
    /// first, then service and common rules together. Unloaded scopes are
    /// loaded on demand; a scope that cannot be loaded contributes nothing.
    pub async fn check_access(&self, process: &ProcessInfo, headers: &Headers) -> Decision {
        let request = AccessRequest::from_headers(headers);

        let resource_id = headers.resource_id().or(process.resource_id.as_deref());
        if let Some(resource_id) = resource_id {
            if let Some(rules) = self.cached_resource(resource_id).await {
                let decision = decide(rules.iter(), &request, self.evaluator.as_ref());
                if decision != Decision::NotApplicable {
                    return decision;
                }
            }
        }

        let service = self.cached_service(process.policy_service_name()).await;
        let common = self.cached_common().await;
        let service_rules: &[AccessRule] = service
            .as_deref()
            .map(|p| p.rules.as_slice())
            .unwrap_or_default();
        let common_rules: &[AccessRule] = common.as_deref().map(Vec::as_slice).unwrap_or_default();

        decide(
            service_rules.iter().chain(common_rules.iter()),
            &request,
            self.evaluator.as_ref(),
        )
    }

    /// Access rules only; a deny is Unauthorized. Operation preconditions
    /// run separately at dispatch, for every request.
    pub async fn authorize(&self, process: &ProcessInfo, headers: &Headers) -> Result<()> {
        if let Decision::Deny(reason) = self.check_access(process, headers).await {
            tracing::debug!(
                process_id = %process.id,
                op = headers.op().unwrap_or(""),
                actor = headers.actor_id().unwrap_or(""),
                "access denied: {}",
                reason
            );
            return Err(Error::unauthorized(reason));
        }
        Ok(())
    }

    async fn cached_common(&self) -> Option<Arc<Vec<AccessRule>>> {
        if let Some(rules) = self.cache.read().await.common.clone() {
            return Some(rules);
        }
        if let Err(e) = self.update_common_policy().await {
            tracing::warn!(error = %e, "could not load common policy");
            return None;
        }
        self.cache.read().await.common.clone()
    }

    async fn cached_service(&self, service: &str) -> Option<Arc<ServicePolicy>> {
        if let Some(policy) = self.cache.read().await.services.get(service).cloned() {
            return Some(policy);
        }
        if let Err(e) = self.update_service_policy(service, None).await {
            tracing::warn!(service, error = %e, "could not load service policy");
            return None;
        }
        self.cache.read().await.services.get(service).cloned()
    }

    async fn cached_resource(&self, resource_id: &str) -> Option<Arc<Vec<AccessRule>>> {
        if let Some(rules) = self.cache.read().await.resources.get(resource_id).cloned() {
            return Some(rules);
        }
        if let Err(e) = self.update_resource_policy(resource_id).await {
            tracing::warn!(resource_id, error = %e, "could not load resource policy");
            return None;
        }
        self.cache.read().await.resources.get(resource_id).cloned()
    }
}

/// Replace the policy-sourced preconditions of every process under one
/// service with those `policy` names, limited to `op` when given.
fn apply_policy_preconditions(
    table: &mut PreconditionTable,
    subjects: &[(Arc<ProcessInfo>, Arc<PreconditionChecks>)],
    op: Option<&str>,
    policy: &ServicePolicy,
) {
    let mut checks_by_name: HashMap<&str, &Arc<PreconditionChecks>> = HashMap::new();
    for (info, checks) in subjects {
        checks_by_name.entry(info.name.as_str()).or_insert(checks);
    }

    for name in unique_names(subjects) {
        table.remove_policy_sourced(name, op);
        let Some(checks) = checks_by_name.get(name) else {
            continue;
        };
        for rule in policy
            .preconditions
            .iter()
            .filter(|r| op.map_or(true, |op| r.op == op))
        {
            match checks.get(&rule.check) {
                Some(check) => table.register(
                    name,
                    &rule.op,
                    Precondition::policy(rule.check.clone(), check.clone()),
                ),
                None => tracing::warn!(
                    process = name,
                    op = %rule.op,
                    check = %rule.check,
                    "policy names a precondition check the process does not provide"
                ),
            }
        }
    }
}

fn unique_names(subjects: &[(Arc<ProcessInfo>, Arc<PreconditionChecks>)]) -> Vec<&str> {
    let mut seen = HashSet::new();
    subjects
        .iter()
        .map(|(info, _)| info.name.as_str())
        .filter(|name| seen.insert(*name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ProcessRuntime;
    use crate::envelope::names;
    use crate::governance::policy::{InMemoryPolicyStore, PreconditionRule};
    use crate::governance::preconditions::{PreconditionFn, Verdict};
    use crate::types::{PreconditionFailureMode, ProcessId};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn bank_info() -> Arc<ProcessInfo> {
        Arc::new(
            ProcessInfo::new(ProcessId::parse("c.1").unwrap(), "bank", ProcessType::Service)
                .with_operations(["withdraw", "deposit"]),
        )
    }

    fn has_funds() -> PreconditionFn {
        Arc::new(|body: &Value, _: &Headers| {
            if body["amount"].as_i64().unwrap_or(0) > 100 {
                Ok(Verdict::deny("insufficient funds"))
            } else {
                Ok(Verdict::Allow)
            }
        })
    }

    async fn setup(store: Arc<InMemoryPolicyStore>) -> (GovernanceController, Arc<ProcessInfo>) {
        let registry = Arc::new(ProcessRegistry::new());
        let info = bank_info();
        let mut checks = PreconditionChecks::new();
        checks.insert("has_funds".to_string(), has_funds());
        registry
            .insert(info.clone(), Arc::new(checks), ProcessRuntime::default())
            .await
            .unwrap();
        let controller = GovernanceController::new(GovernanceConfig::default(), store, registry);
        (controller, info)
    }

    fn request(op: &str, actor: &str, roles: &[&str]) -> Headers {
        Headers::new()
            .with(names::OP, op)
            .with(names::ACTOR_ID, actor)
            .with(names::ACTOR_ROLES, json!({ "org": roles }))
    }

    async fn bank_store() -> Arc<InMemoryPolicyStore> {
        let store = Arc::new(InMemoryPolicyStore::new());
        store
            .set_service_policy(
                "bank",
                ServicePolicy {
                    rules: vec![
                        AccessRule::permit("members", 10).for_roles(["MEMBER"]),
                        AccessRule::deny("others", 20).with_description("members only"),
                    ],
                    preconditions: vec![PreconditionRule {
                        op: "withdraw".into(),
                        check: "has_funds".into(),
                    }],
                },
            )
            .await;
        store
            .set_common_rules(vec![AccessRule::permit("ops", 1).for_roles(["OPERATOR"])])
            .await;
        store
    }

    // =========================================================================
    // Preconditions
    // =========================================================================

    #[tokio::test]
    async fn test_precondition_register_then_unregister() {
        let (controller, info) = setup(Arc::new(InMemoryPolicyStore::new())).await;
        let denied = Precondition::local("deny", |_, _| Ok(Verdict::deny("denied")));

        controller
            .register_process_operation_precondition(&info, "withdraw", denied.clone())
            .await
            .unwrap();
        let err = controller
            .check_process_operation_preconditions(&info, &json!({}), &Headers::new().with(names::OP, "withdraw"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 401);
        assert_eq!(err.message(), "denied");

        assert!(
            controller
                .unregister_process_operation_precondition("bank", "withdraw", &denied)
                .await
        );
        controller
            .check_process_operation_preconditions(&info, &json!({}), &Headers::new().with(names::OP, "withdraw"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_register_unknown_op_is_not_found() {
        let (controller, info) = setup(Arc::new(InMemoryPolicyStore::new())).await;
        let p = Precondition::local("x", |_, _| Ok(Verdict::Allow));
        let err = controller
            .register_process_operation_precondition(&info, "close", p)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_empty_op_unregister_is_noop() {
        let (controller, info) = setup(Arc::new(InMemoryPolicyStore::new())).await;
        let p = Precondition::local("x", |_, _| Ok(Verdict::Allow));
        controller
            .register_process_operation_precondition(&info, "deposit", p.clone())
            .await
            .unwrap();
        assert!(!controller.unregister_process_operation_precondition("bank", "", &p).await);
        assert_eq!(controller.precondition_count("bank", "deposit").await, 1);
        assert_eq!(
            controller
                .unregister_all_process_operation_precondition("bank", "deposit")
                .await,
            1
        );
    }

    #[tokio::test]
    async fn test_fail_open_mode() {
        let store = Arc::new(InMemoryPolicyStore::new());
        let registry = Arc::new(ProcessRegistry::new());
        let config = GovernanceConfig {
            precondition_errors: PreconditionFailureMode::FailOpen,
            ..GovernanceConfig::default()
        };
        let controller = GovernanceController::new(config, store, registry);
        let info = bank_info();
        controller
            .register_process_operation_precondition(
                &info,
                "withdraw",
                Precondition::local("broken", |_, _| Err(Error::server("boom"))),
            )
            .await
            .unwrap();
        controller
            .check_process_operation_preconditions(&info, &json!({}), &Headers::new().with(names::OP, "withdraw"))
            .await
            .unwrap();
    }

    // =========================================================================
    // Policy loading
    // =========================================================================

    #[tokio::test]
    async fn test_service_policy_registers_named_checks() {
        let (controller, info) = setup(bank_store().await).await;
        controller.update_process_policies(&info, false, false).await.unwrap();
        assert_eq!(controller.precondition_count("bank", "withdraw").await, 1);

        let err = controller
            .check_process_operation_preconditions(
                &info,
                &json!({"amount": 500}),
                &Headers::new().with(names::OP, "withdraw"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.message(), "insufficient funds");

        // Reloading replaces rather than duplicates.
        controller.update_service_policy("bank", None).await.unwrap();
        assert_eq!(controller.precondition_count("bank", "withdraw").await, 1);
    }

    #[tokio::test]
    async fn test_unknown_check_is_skipped() {
        let store = bank_store().await;
        store
            .set_service_policy(
                "bank",
                ServicePolicy {
                    rules: vec![],
                    preconditions: vec![PreconditionRule {
                        op: "deposit".into(),
                        check: "no_such_check".into(),
                    }],
                },
            )
            .await;
        let (controller, _) = setup(store).await;
        controller.update_service_policy("bank", None).await.unwrap();
        assert_eq!(controller.precondition_count("bank", "deposit").await, 0);
    }

    #[tokio::test]
    async fn test_resource_policy_cached_until_invalidated() {
        let store = Arc::new(InMemoryPolicyStore::new());
        store
            .set_resource_rules("dev1", vec![AccessRule::deny("locked", 1)])
            .await;
        let (controller, _) = setup(store.clone()).await;

        controller.update_resource_policy("dev1").await.unwrap();
        controller.update_resource_policy("dev1").await.unwrap();
        assert_eq!(store.fetch_count(), 1);

        assert!(controller.invalidate_resource("dev1").await);
        controller.update_resource_policy("dev1").await.unwrap();
        assert_eq!(store.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_safe_mode_tolerates_store_outage() {
        let store = bank_store().await;
        store.set_available(false);
        let (controller, info) = setup(store).await;

        controller.update_process_policies(&info, true, false).await.unwrap();
        assert!(controller.update_process_policies(&info, false, false).await.is_err());
        assert_eq!(controller.policy_snapshot().await.services, 0);
    }

    #[tokio::test]
    async fn test_reset_round_trip() {
        let (controller, info) = setup(bank_store().await).await;
        controller.update_process_policies(&info, false, false).await.unwrap();
        controller.update_common_policy().await.unwrap();
        let before = controller.policy_snapshot().await;

        controller.reset_policy_cache().await;
        let empty = controller.policy_snapshot().await;
        assert!(!empty.common_loaded);
        assert_eq!(empty.services, 0);
        assert_eq!(empty.registered_preconditions, 0);

        // The next check reloads the scopes it touches.
        let _ = controller.check_access(&info, &request("deposit", "bob", &["MEMBER"])).await;
        assert_eq!(controller.policy_snapshot().await, before);
    }

    #[tokio::test]
    async fn test_update_log_is_bounded() {
        let store = Arc::new(InMemoryPolicyStore::new());
        let config = GovernanceConfig {
            policy_log_size: 3,
            ..GovernanceConfig::default()
        };
        let controller = GovernanceController::new(config, store, Arc::new(ProcessRegistry::new()));
        for _ in 0..5 {
            controller.update_common_policy().await.unwrap();
        }
        let log = controller.policy_update_log().await;
        assert_eq!(log.len(), 3);
        assert!(log.iter().all(|r| r.scope == PolicyScope::Common));
    }

    // =========================================================================
    // Access evaluation
    // =========================================================================

    #[tokio::test]
    async fn test_check_access_service_and_common() {
        let (controller, info) = setup(bank_store().await).await;

        assert_eq!(
            controller.check_access(&info, &request("deposit", "bob", &["MEMBER"])).await,
            Decision::Permit
        );
        // Common OPERATOR permit has the lowest ordinal.
        assert_eq!(
            controller.check_access(&info, &request("deposit", "ops", &["OPERATOR"])).await,
            Decision::Permit
        );
        assert_eq!(
            controller.check_access(&info, &request("deposit", "eve", &[])).await,
            Decision::Deny("members only".to_string())
        );
    }

    #[tokio::test]
    async fn test_resource_rules_take_precedence() {
        let store = bank_store().await;
        store
            .set_resource_rules("acct-9", vec![AccessRule::deny("frozen", 1).with_description("account frozen")])
            .await;
        let (controller, info) = setup(store).await;

        let headers = request("deposit", "bob", &["MEMBER"]).with(names::RESOURCE_ID, "acct-9");
        let err = controller
            .authorize(&info, &headers)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 401);
        assert_eq!(err.message(), "account frozen");
    }

    #[tokio::test]
    async fn test_policy_events() {
        let store = bank_store().await;
        let (controller, info) = setup(store.clone()).await;
        controller.update_process_policies(&info, false, false).await.unwrap();

        store.remove_service_policy("bank").await;
        controller
            .handle_policy_event(PolicyEvent::ServicePolicy {
                service_name: Some("bank".into()),
                op: None,
                deleted: false,
            })
            .await
            .unwrap();
        assert_eq!(controller.policy_snapshot().await.service_rules, 0);
        assert_eq!(controller.precondition_count("bank", "withdraw").await, 0);

        controller
            .handle_policy_event(PolicyEvent::ServicePolicy {
                service_name: Some("elsewhere".into()),
                op: None,
                deleted: false,
            })
            .await
            .unwrap();
        assert_eq!(controller.policy_snapshot().await.services, 1);

        controller
            .handle_policy_event(PolicyEvent::ServicePolicy {
                service_name: None,
                op: None,
                deleted: false,
            })
            .await
            .unwrap();
        assert!(controller.policy_snapshot().await.common_loaded);
    }
}

//! Access rules and the policy store seam.
//!
//! Rules are plain data: an effect, an ordinal and a target describing which
//! operations, actors and roles they cover. A [`RuleEvaluator`] decides
//! whether a rule applies to a request; [`decide`] walks rules by ascending
//! ordinal and returns the first applicable rule's effect.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

use crate::envelope::Headers;
use crate::types::{Error, Result};

// =============================================================================
// Rule model
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Permit,
    Deny,
}

/// What a rule covers. An empty list matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleTarget {
    pub operations: Vec<String>,
    pub actors: Vec<String>,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRule {
    pub id: String,
    /// Lower ordinals are evaluated first.
    #[serde(default)]
    pub ordinal: i64,
    pub effect: Effect,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub target: RuleTarget,
}

impl AccessRule {
    pub fn permit(id: impl Into<String>, ordinal: i64) -> Self {
        Self::new(id, ordinal, Effect::Permit)
    }

    pub fn deny(id: impl Into<String>, ordinal: i64) -> Self {
        Self::new(id, ordinal, Effect::Deny)
    }

    fn new(id: impl Into<String>, ordinal: i64, effect: Effect) -> Self {
        Self {
            id: id.into(),
            ordinal,
            effect,
            description: String::new(),
            target: RuleTarget::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn for_operations<I: IntoIterator<Item = S>, S: Into<String>>(mut self, ops: I) -> Self {
        self.target.operations = ops.into_iter().map(Into::into).collect();
        self
    }

    pub fn for_actors<I: IntoIterator<Item = S>, S: Into<String>>(mut self, actors: I) -> Self {
        self.target.actors = actors.into_iter().map(Into::into).collect();
        self
    }

    pub fn for_roles<I: IntoIterator<Item = S>, S: Into<String>>(mut self, roles: I) -> Self {
        self.target.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    fn deny_reason(&self) -> String {
        if self.description.is_empty() {
            format!("denied by policy rule {}", self.id)
        } else {
            self.description.clone()
        }
    }
}

/// A named precondition check attached to one operation by policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreconditionRule {
    pub op: String,
    pub check: String,
}

/// Everything the policy store holds for one service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicePolicy {
    pub rules: Vec<AccessRule>,
    pub preconditions: Vec<PreconditionRule>,
}

// =============================================================================
// Evaluation
// =============================================================================

/// The facts about a request that rules are matched against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessRequest {
    pub op: String,
    pub actor_id: String,
    /// Role names across every scope.
    pub roles: HashSet<String>,
}

impl AccessRequest {
    pub fn from_headers(headers: &Headers) -> Self {
        Self {
            op: headers.op().unwrap_or_default().to_string(),
            actor_id: headers.actor_id().unwrap_or_default().to_string(),
            roles: headers.actor_roles().into_values().flatten().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Permit,
    Deny(String),
    NotApplicable,
}

/// Decides whether a rule applies to a request.
pub trait RuleEvaluator: Send + Sync + fmt::Debug {
    fn applies(&self, rule: &AccessRule, request: &AccessRequest) -> bool;
}

/// Matches a rule's target lists against the request.
#[derive(Debug, Default)]
pub struct TargetMatcher;

impl RuleEvaluator for TargetMatcher {
    fn applies(&self, rule: &AccessRule, request: &AccessRequest) -> bool {
        let target = &rule.target;
        let op_ok = target.operations.is_empty() || target.operations.iter().any(|o| *o == request.op);
        let actor_ok = target.actors.is_empty() || target.actors.iter().any(|a| *a == request.actor_id);
        let role_ok = target.roles.is_empty() || target.roles.iter().any(|r| request.roles.contains(r));
        op_ok && actor_ok && role_ok
    }
}

/// First applicable rule by ascending ordinal wins; ties keep input order.
pub fn decide<'a, I>(rules: I, request: &AccessRequest, evaluator: &dyn RuleEvaluator) -> Decision
where
    I: IntoIterator<Item = &'a AccessRule>,
{
    let mut ordered: Vec<&AccessRule> = rules.into_iter().collect();
    ordered.sort_by_key(|rule| rule.ordinal);

    ordered
        .into_iter()
        .find(|rule| evaluator.applies(rule, request))
        .map(|rule| match rule.effect {
            Effect::Permit => Decision::Permit,
            Effect::Deny => Decision::Deny(rule.deny_reason()),
        })
        .unwrap_or(Decision::NotApplicable)
}

// =============================================================================
// Policy store
// =============================================================================

/// Source of active policy.
#[async_trait]
pub trait PolicyStore: Send + Sync + fmt::Debug {
    /// Whether the store can currently answer queries.
    async fn is_available(&self) -> bool {
        true
    }

    /// Rules and preconditions for a service; with `op`, only that
    /// operation's preconditions are returned.
    async fn get_active_service_rules(&self, service: &str, op: Option<&str>) -> Result<ServicePolicy>;

    async fn get_active_resource_rules(&self, resource_id: &str) -> Result<Vec<AccessRule>>;

    /// Rules that apply to every service.
    async fn get_active_common_rules(&self) -> Result<Vec<AccessRule>> {
        Ok(self.get_active_service_rules("", None).await?.rules)
    }
}

/// Policy store held in memory; the default when no external store is wired.
#[derive(Debug)]
pub struct InMemoryPolicyStore {
    common: RwLock<Vec<AccessRule>>,
    services: RwLock<HashMap<String, ServicePolicy>>,
    resources: RwLock<HashMap<String, Vec<AccessRule>>>,
    available: AtomicBool,
    fetches: AtomicUsize,
}

impl Default for InMemoryPolicyStore {
    fn default() -> Self {
        Self {
            common: RwLock::new(Vec::new()),
            services: RwLock::new(HashMap::new()),
            resources: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            fetches: AtomicUsize::new(0),
        }
    }
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_common_rules(&self, rules: Vec<AccessRule>) {
        *self.common.write().await = rules;
    }

    pub async fn set_service_policy(&self, service: &str, policy: ServicePolicy) {
        self.services.write().await.insert(service.to_string(), policy);
    }

    pub async fn remove_service_policy(&self, service: &str) {
        self.services.write().await.remove(service);
    }

    pub async fn set_resource_rules(&self, resource_id: &str, rules: Vec<AccessRule>) {
        self.resources.write().await.insert(resource_id.to_string(), rules);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of queries answered so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::server("policy store unavailable"))
        }
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn get_active_service_rules(&self, service: &str, op: Option<&str>) -> Result<ServicePolicy> {
        self.check_available()?;
        if service.is_empty() {
            return Ok(ServicePolicy {
                rules: self.common.read().await.clone(),
                preconditions: Vec::new(),
            });
        }
        let mut policy = self
            .services
            .read()
            .await
            .get(service)
            .cloned()
            .unwrap_or_default();
        if let Some(op) = op {
            policy.preconditions.retain(|p| p.op == op);
        }
        Ok(policy)
    }

    async fn get_active_resource_rules(&self, resource_id: &str) -> Result<Vec<AccessRule>> {
        self.check_available()?;
        Ok(self
            .resources
            .read()
            .await
            .get(resource_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::names;
    use serde_json::json;

    fn request(op: &str, actor: &str, roles: &[&str]) -> AccessRequest {
        AccessRequest {
            op: op.to_string(),
            actor_id: actor.to_string(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    #[test]
    fn test_lower_ordinal_wins() {
        let rules = vec![
            AccessRule::deny("deny_all", 100).with_description("nobody"),
            AccessRule::permit("members", 10).for_roles(["MEMBER"]),
        ];
        let evaluator = TargetMatcher;
        assert_eq!(
            decide(&rules, &request("read", "bob", &["MEMBER"]), &evaluator),
            Decision::Permit
        );
        assert_eq!(
            decide(&rules, &request("read", "eve", &[]), &evaluator),
            Decision::Deny("nobody".to_string())
        );
    }

    #[test]
    fn test_equal_ordinals_keep_order() {
        let rules = vec![
            AccessRule::deny("first", 5),
            AccessRule::permit("second", 5),
        ];
        assert_eq!(
            decide(&rules, &request("x", "a", &[]), &TargetMatcher),
            Decision::Deny("denied by policy rule first".to_string())
        );
    }

    #[test]
    fn test_no_applicable_rule() {
        let rules = vec![AccessRule::deny("ops", 1).for_operations(["delete"])];
        assert_eq!(
            decide(&rules, &request("read", "a", &[]), &TargetMatcher),
            Decision::NotApplicable
        );
        assert_eq!(
            decide(&[], &request("read", "a", &[]), &TargetMatcher),
            Decision::NotApplicable
        );
    }

    #[test]
    fn test_request_from_headers_flattens_roles() {
        let headers = Headers::new()
            .with(names::OP, "read")
            .with(names::ACTOR_ID, "alice")
            .with(names::ACTOR_ROLES, json!({"org1": ["MEMBER"], "org2": ["OPERATOR"]}));
        let req = AccessRequest::from_headers(&headers);
        assert_eq!(req.op, "read");
        assert_eq!(req.actor_id, "alice");
        assert!(req.roles.contains("MEMBER") && req.roles.contains("OPERATOR"));
    }

    #[test]
    fn test_rule_deserializes_with_defaults() {
        let rule: AccessRule =
            serde_json::from_value(json!({"id": "r1", "effect": "deny"})).unwrap();
        assert_eq!(rule.ordinal, 0);
        assert!(rule.target.operations.is_empty());
    }

    #[tokio::test]
    async fn test_store_filters_preconditions_by_op() {
        let store = InMemoryPolicyStore::new();
        store
            .set_service_policy(
                "bank",
                ServicePolicy {
                    rules: vec![AccessRule::permit("p", 1)],
                    preconditions: vec![
                        PreconditionRule { op: "withdraw".into(), check: "has_funds".into() },
                        PreconditionRule { op: "close".into(), check: "is_owner".into() },
                    ],
                },
            )
            .await;

        let all = store.get_active_service_rules("bank", None).await.unwrap();
        assert_eq!(all.preconditions.len(), 2);
        let one = store.get_active_service_rules("bank", Some("close")).await.unwrap();
        assert_eq!(one.preconditions.len(), 1);
        assert_eq!(one.preconditions[0].check, "is_owner");
        assert_eq!(store.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let store = InMemoryPolicyStore::new();
        store.set_available(false);
        assert!(!store.is_available().await);
        assert!(store.get_active_resource_rules("r1").await.is_err());
        assert!(store.get_active_common_rules().await.is_err());
    }
}

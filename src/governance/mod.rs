//! Governance: access policy and operation preconditions.
//!
//! The [`GovernanceController`] caches policy per scope and holds the
//! precondition table. The [`PolicyInterceptor`] applies access rules to
//! inbound requests; the RPC server runs operation preconditions at
//! dispatch. The [`PolicyEventListener`] keeps the caches current as policy
//! changes are announced.

mod controller;
mod events;
mod interceptor;
mod policy;
mod preconditions;

pub use controller::{GovernanceController, PolicyAction, PolicyScope, PolicySnapshot, PolicyUpdateRecord};
pub use events::{PolicyEvent, PolicyEventListener};
pub use interceptor::PolicyInterceptor;
pub use policy::{
    decide, AccessRequest, AccessRule, Decision, Effect, InMemoryPolicyStore, PolicyStore,
    PreconditionRule, RuleEvaluator, RuleTarget, ServicePolicy, TargetMatcher,
};
pub use preconditions::{
    evaluate_preconditions, Precondition, PreconditionChecks, PreconditionFn, PreconditionOrigin,
    PreconditionTable, Verdict,
};

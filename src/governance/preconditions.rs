//! Operation preconditions.
//!
//! A precondition is a predicate over `(body, headers)` attached to one
//! `(process name, operation)` pair. Entries registered in code are
//! [`PreconditionOrigin::Local`]; entries attached by policy data are
//! [`PreconditionOrigin::Policy`] and are replaced whenever that policy is
//! reloaded.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::envelope::Headers;
use crate::types::{Error, PreconditionFailureMode, Result};

/// Outcome of one precondition check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny(String),
}

impl Verdict {
    pub fn deny(reason: impl Into<String>) -> Self {
        Self::Deny(reason.into())
    }
}

pub type PreconditionFn = Arc<dyn Fn(&Value, &Headers) -> Result<Verdict> + Send + Sync>;

/// Checks a process exposes by name for policy data to reference.
pub type PreconditionChecks = HashMap<String, PreconditionFn>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreconditionOrigin {
    Local,
    Policy,
}

#[derive(Clone)]
pub struct Precondition {
    name: String,
    origin: PreconditionOrigin,
    check: PreconditionFn,
}

impl Precondition {
    pub fn local<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&Value, &Headers) -> Result<Verdict> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            origin: PreconditionOrigin::Local,
            check: Arc::new(check),
        }
    }

    pub fn policy(name: impl Into<String>, check: PreconditionFn) -> Self {
        Self {
            name: name.into(),
            origin: PreconditionOrigin::Policy,
            check,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn origin(&self) -> PreconditionOrigin {
        self.origin
    }

    pub fn evaluate(&self, body: &Value, headers: &Headers) -> Result<Verdict> {
        (self.check)(body, headers)
    }
}

/// Local entries compare by predicate identity, policy entries by check name.
impl PartialEq for Precondition {
    fn eq(&self, other: &Self) -> bool {
        match (self.origin, other.origin) {
            (PreconditionOrigin::Local, PreconditionOrigin::Local) => {
                Arc::as_ptr(&self.check) as *const () == Arc::as_ptr(&other.check) as *const ()
            }
            (PreconditionOrigin::Policy, PreconditionOrigin::Policy) => self.name == other.name,
            _ => false,
        }
    }
}

impl fmt::Debug for Precondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Precondition")
            .field("name", &self.name)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Ordered precondition lists keyed by (process name, operation).
#[derive(Debug, Default)]
pub struct PreconditionTable {
    entries: HashMap<(String, String), Vec<Precondition>>,
}

impl PreconditionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, process_name: &str, op: &str, precondition: Precondition) {
        self.entries
            .entry((process_name.to_string(), op.to_string()))
            .or_default()
            .push(precondition);
    }

    /// Remove the first entry equal to `precondition`. The list itself goes
    /// away only once empty.
    pub fn unregister(&mut self, process_name: &str, op: &str, precondition: &Precondition) -> bool {
        let key = (process_name.to_string(), op.to_string());
        let Some(list) = self.entries.get_mut(&key) else {
            return false;
        };
        let Some(pos) = list.iter().position(|p| p == precondition) else {
            return false;
        };
        list.remove(pos);
        if list.is_empty() {
            self.entries.remove(&key);
        }
        true
    }

    pub fn unregister_all(&mut self, process_name: &str, op: &str) -> usize {
        self.entries
            .remove(&(process_name.to_string(), op.to_string()))
            .map_or(0, |list| list.len())
    }

    /// Drop policy-sourced entries for one process, optionally one operation.
    pub fn remove_policy_sourced(&mut self, process_name: &str, op: Option<&str>) {
        self.entries.retain(|(name, entry_op), list| {
            if name != process_name || op.is_some_and(|op| op != entry_op) {
                return true;
            }
            list.retain(|p| p.origin == PreconditionOrigin::Local);
            !list.is_empty()
        });
    }

    /// Drop every policy-sourced entry.
    pub fn clear_policy_sourced(&mut self) {
        self.entries.retain(|_, list| {
            list.retain(|p| p.origin == PreconditionOrigin::Local);
            !list.is_empty()
        });
    }

    pub fn get(&self, process_name: &str, op: &str) -> Vec<Precondition> {
        self.entries
            .get(&(process_name.to_string(), op.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn count(&self, process_name: &str, op: &str) -> usize {
        self.entries
            .get(&(process_name.to_string(), op.to_string()))
            .map_or(0, Vec::len)
    }

    pub fn total(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }
}

/// Evaluate newest first. The first deny becomes Unauthorized; a predicate
/// error is handled per `mode`.
pub fn evaluate_preconditions(
    preconditions: &[Precondition],
    body: &Value,
    headers: &Headers,
    mode: PreconditionFailureMode,
) -> Result<()> {
    for precondition in preconditions.iter().rev() {
        match precondition.evaluate(body, headers) {
            Ok(Verdict::Allow) => {}
            Ok(Verdict::Deny(reason)) => return Err(Error::unauthorized(reason)),
            Err(e) => match mode {
                PreconditionFailureMode::FailClosed => {
                    tracing::warn!(precondition = precondition.name(), error = %e, "precondition check failed");
                    return Err(Error::unauthorized(format!(
                        "precondition check failed: {}",
                        e.message()
                    )));
                }
                PreconditionFailureMode::FailOpen => {
                    tracing::warn!(
                        precondition = precondition.name(),
                        error = %e,
                        "precondition check failed, allowing"
                    );
                }
            },
        }
    }
    Ok(())
}

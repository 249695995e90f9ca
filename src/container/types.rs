//! Process types and lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::Error;

/// Process type; decides which endpoints a process is wired with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessType {
    /// RPC listener on a shared, service-named queue.
    Service,
    /// RPC listener on its id, a subscriber on an input binding, publishers.
    Stream,
    /// RPC listener on its id and optionally on its target resource id.
    Agent,
    /// RPC listener on its id and publishers.
    Standalone,
    /// Publishers only.
    Simple,
    /// No messaging; runs once and exits.
    Immediate,
}

impl ProcessType {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessType::Service => "service",
            ProcessType::Stream => "stream",
            ProcessType::Agent => "agent",
            ProcessType::Standalone => "standalone",
            ProcessType::Simple => "simple",
            ProcessType::Immediate => "immediate",
        }
    }

    pub fn has_publishers(self) -> bool {
        matches!(
            self,
            ProcessType::Stream | ProcessType::Standalone | ProcessType::Simple
        )
    }
}

impl fmt::Display for ProcessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "service" => Ok(ProcessType::Service),
            "stream_process" | "stream" => Ok(ProcessType::Stream),
            "agent" => Ok(ProcessType::Agent),
            "standalone" => Ok(ProcessType::Standalone),
            "simple" => Ok(ProcessType::Simple),
            "immediate" => Ok(ProcessType::Immediate),
            other => Err(Error::bad_request(format!("unknown process type: {}", other))),
        }
    }
}

/// Process lifecycle state.
///
/// State transitions:
/// ```text
/// PENDING → RUNNING → TERMINATING → TERMINATED
///    ↓         ↓ ↘
///  FAILED   FAILED  EXITED (immediate processes only)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcessState {
    Pending,
    Running,
    Terminating,
    Terminated,
    Failed,
    Exited,
}

impl ProcessState {
    /// Check if this is a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessState::Terminated | ProcessState::Failed | ProcessState::Exited
        )
    }

    /// Check if transition is valid.
    pub fn can_transition_to(self, to: ProcessState) -> bool {
        match (self, to) {
            // PENDING
            (ProcessState::Pending, ProcessState::Running) => true,
            (ProcessState::Pending, ProcessState::Failed) => true,
            // RUNNING
            (ProcessState::Running, ProcessState::Terminating) => true,
            (ProcessState::Running, ProcessState::Failed) => true,
            (ProcessState::Running, ProcessState::Exited) => true,
            // TERMINATING
            (ProcessState::Terminating, ProcessState::Terminated) => true,
            // All other transitions invalid
            _ => false,
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use ProcessState::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Failed));
        assert!(Running.can_transition_to(Terminating));
        assert!(Running.can_transition_to(Exited));
        assert!(Terminating.can_transition_to(Terminated));

        assert!(!Pending.can_transition_to(Terminated));
        assert!(!Terminated.can_transition_to(Running));
        assert!(!Exited.can_transition_to(Terminating));
        assert!(!Terminating.can_transition_to(Failed));
    }

    #[test]
    fn test_terminal_states() {
        assert!(ProcessState::Terminated.is_terminal());
        assert!(ProcessState::Failed.is_terminal());
        assert!(ProcessState::Exited.is_terminal());
        assert!(!ProcessState::Terminating.is_terminal());
    }

    #[test]
    fn test_parse_process_type() {
        assert_eq!("SERVICE".parse::<ProcessType>().unwrap(), ProcessType::Service);
        assert_eq!("stream_process".parse::<ProcessType>().unwrap(), ProcessType::Stream);
        let err = "daemon".parse::<ProcessType>().unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_state_serializes_uppercase() {
        assert_eq!(
            serde_json::to_string(&ProcessState::Terminating).unwrap(),
            "\"TERMINATING\""
        );
    }
}

//! Configuration structures.
//!
//! Container configuration is loaded from a JSON file (see
//! [`Config::from_file`]); every section falls back to its defaults.
//! Per-process configuration stays an untyped JSON tree and is merged over
//! `container.process_defaults` with [`merge_config`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

use super::errors::{Error, Result};

/// Global container configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Container identity and process defaults.
    #[serde(default)]
    pub container: ContainerConfig,

    /// RPC and listener timing.
    #[serde(default)]
    pub messaging: MessagingConfig,

    /// Interceptor and policy settings.
    #[serde(default)]
    pub governance: GovernanceConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }
}

/// Container identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Fixed container id; generated when absent.
    pub id: Option<String>,

    /// Namespace prefix for service queues.
    pub sys_name: String,

    /// Upper bound for a process's quit hook and listener shutdown.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Configuration tree merged under every spawn config.
    pub process_defaults: Value,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            id: None,
            sys_name: "ion".to_string(),
            shutdown_timeout: Duration::from_secs(5),
            process_defaults: Value::Object(Default::default()),
        }
    }
}

/// RPC and listener timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Default RPC client timeout when the caller gives none.
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,

    /// Bound operation handlers by the budget derived from `reply-by`.
    pub enforce_handler_timeout: bool,

    /// Latency assumed for each broker leg when computing the handler budget.
    #[serde(with = "humantime_serde")]
    pub assumed_latency: Duration,

    /// Receive timeout used by listen loops between cancellation checks.
    #[serde(with = "humantime_serde")]
    pub receive_poll: Duration,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(10),
            enforce_handler_timeout: false,
            assumed_latency: Duration::ZERO,
            receive_poll: Duration::from_millis(250),
        }
    }
}

/// What to do when a precondition predicate itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PreconditionFailureMode {
    /// Treat the failure as a deny.
    #[default]
    FailClosed,
    /// Log the failure and allow the call.
    FailOpen,
}

/// Interceptor and policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    /// Master switch for policy enforcement.
    pub enabled: bool,

    /// Interceptor names, in inbound order.
    pub interceptor_order: Vec<String>,

    /// Actor id exempt from policy checks.
    pub system_actor_id: Option<String>,

    pub precondition_errors: PreconditionFailureMode,

    /// Processes expected to start before the policy store exists.
    pub bootstrap_processes: Vec<String>,

    /// Broker topic carrying policy change events.
    pub policy_event_topic: String,

    /// Number of policy update records retained.
    pub policy_log_size: usize,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interceptor_order: vec![
                "message_log".to_string(),
                "conversation".to_string(),
                "governance".to_string(),
            ],
            system_actor_id: None,
            precondition_errors: PreconditionFailureMode::default(),
            bootstrap_processes: Vec::new(),
            policy_event_topic: "policy_events".to_string(),
            policy_log_size: 100,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Deep-merge `overlay` into `base`. Maps merge key by key; anything else in
/// the overlay replaces the base value.
pub fn merge_config(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_config(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Read a dotted path (`"process.listen_name"`) out of a config tree.
pub fn config_path<'a>(config: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(config, |node, key| node.get(key))
}

/// Read a dotted path as a string.
pub fn config_str<'a>(config: &'a Value, path: &str) -> Option<&'a str> {
    config_path(config, path).and_then(Value::as_str)
}

/// Fail with a config error when the tree is not a mapping.
pub fn ensure_object(config: &Value) -> Result<()> {
    if config.is_object() || config.is_null() {
        Ok(())
    } else {
        Err(Error::container_config("process config must be a mapping"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.container.sys_name, "ion");
        assert_eq!(config.messaging.rpc_timeout, Duration::from_secs(10));
        assert_eq!(
            config.governance.precondition_errors,
            PreconditionFailureMode::FailClosed
        );
        assert_eq!(config.governance.policy_log_size, 100);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = Config::from_json_str(
            r#"{"messaging": {"rpc_timeout": "2s"}, "governance": {"precondition_errors": "fail_open"}}"#,
        )
        .unwrap();
        assert_eq!(config.messaging.rpc_timeout, Duration::from_secs(2));
        assert_eq!(config.messaging.receive_poll, Duration::from_millis(250));
        assert_eq!(
            config.governance.precondition_errors,
            PreconditionFailureMode::FailOpen
        );
        assert!(config.governance.enabled);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"container": {{"id": "cc1", "sys_name": "test"}}}}"#).unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.container.id.as_deref(), Some("cc1"));
        assert_eq!(config.container.sys_name, "test");
    }

    #[test]
    fn test_merge_config_nested() {
        let mut base = json!({"process": {"type": "service", "listen_name": "a"}, "x": 1});
        merge_config(&mut base, &json!({"process": {"listen_name": "b"}, "y": [1]}));
        assert_eq!(
            base,
            json!({"process": {"type": "service", "listen_name": "b"}, "x": 1, "y": [1]})
        );
        assert_eq!(config_str(&base, "process.listen_name"), Some("b"));
        assert_eq!(config_str(&base, "process.missing"), None);
    }

    #[test]
    fn test_ensure_object() {
        assert!(ensure_object(&json!({})).is_ok());
        assert!(ensure_object(&Value::Null).is_ok());
        assert!(ensure_object(&json!([1])).is_err());
    }

    proptest! {
        #[test]
        fn prop_merge_overlay_wins(key in "[a-z]{1,8}", a in any::<i64>(), b in any::<i64>()) {
            let mut base = json!({ key.clone(): a });
            merge_config(&mut base, &json!({ key.clone(): b }));
            prop_assert_eq!(base.get(&key).and_then(Value::as_i64), Some(b));
        }
    }
}

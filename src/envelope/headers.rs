//! Message header map and the wire header names.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Canonical header names. These are shared with every other implementation
/// attached to the same broker and must not change.
pub mod names {
    pub const OP: &str = "op";
    pub const CONV_ID: &str = "conv-id";
    pub const CONV_SEQ: &str = "conv-seq";
    pub const TS: &str = "ts";
    pub const REPLY_BY: &str = "reply-by";
    pub const REPLY_TO: &str = "reply-to";
    pub const STATUS_CODE: &str = "status_code";
    pub const ERROR_MESSAGE: &str = "error_message";
    pub const SENDER: &str = "sender";
    pub const SENDER_NAME: &str = "sender-name";
    pub const SENDER_TYPE: &str = "sender-type";
    pub const SENDER_SERVICE: &str = "sender-service";
    pub const RECEIVER: &str = "receiver";
    pub const PERFORMATIVE: &str = "performative";
    pub const ACTOR_ID: &str = "ion-actor-id";
    pub const ACTOR_ROLES: &str = "ion-actor-roles";
    pub const ORIGINAL_CONV_ID: &str = "original-conv-id";
    pub const RESOURCE_ID: &str = "resource-id";
}

use names::*;

/// String-keyed header map. Values stay JSON so integer headers (`ts`,
/// `conv-seq`, `status_code`) keep their type on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Map<String, Value>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    /// Integer header; numeric strings are accepted from older peers.
    pub fn get_i64(&self, name: &str) -> Option<i64> {
        match self.0.get(name)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.0.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Copy every header from `other`, overwriting existing ones.
    pub fn extend(&mut self, other: &Headers) {
        for (k, v) in other.iter() {
            self.0.insert(k.clone(), v.clone());
        }
    }

    // =========================================================================
    // Typed accessors
    // =========================================================================

    pub fn op(&self) -> Option<&str> {
        self.get_str(OP)
    }

    pub fn conv_id(&self) -> Option<&str> {
        self.get_str(CONV_ID)
    }

    pub fn conv_seq(&self) -> Option<i64> {
        self.get_i64(CONV_SEQ)
    }

    pub fn ts(&self) -> Option<i64> {
        self.get_i64(TS)
    }

    pub fn reply_by(&self) -> Option<i64> {
        self.get_i64(REPLY_BY)
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.get_str(REPLY_TO)
    }

    pub fn status_code(&self) -> Option<u16> {
        self.get_i64(STATUS_CODE).and_then(|c| u16::try_from(c).ok())
    }

    pub fn error_message(&self) -> &str {
        self.0.get(ERROR_MESSAGE).and_then(Value::as_str).unwrap_or("")
    }

    pub fn sender(&self) -> Option<&str> {
        self.get_str(SENDER)
    }

    pub fn receiver(&self) -> Option<&str> {
        self.get_str(RECEIVER)
    }

    pub fn performative(&self) -> Option<&str> {
        self.get_str(PERFORMATIVE)
    }

    pub fn actor_id(&self) -> Option<&str> {
        self.get_str(ACTOR_ID)
    }

    pub fn resource_id(&self) -> Option<&str> {
        self.get_str(RESOURCE_ID)
    }

    /// Actor roles as a scope → role-name list mapping. Malformed entries are
    /// ignored.
    pub fn actor_roles(&self) -> HashMap<String, Vec<String>> {
        let Some(Value::Object(scopes)) = self.0.get(ACTOR_ROLES) else {
            return HashMap::new();
        };
        scopes
            .iter()
            .map(|(scope, roles)| {
                let roles = roles
                    .as_array()
                    .map(|list| {
                        list.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                (scope.clone(), roles)
            })
            .collect()
    }
}

impl From<Map<String, Value>> for Headers {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, Value)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_integer_headers_accept_strings() {
        let headers = Headers::new()
            .with(CONV_SEQ, 2)
            .with(TS, "1700000000000")
            .with(STATUS_CODE, 404);
        assert_eq!(headers.conv_seq(), Some(2));
        assert_eq!(headers.ts(), Some(1_700_000_000_000));
        assert_eq!(headers.status_code(), Some(404));
    }

    #[test]
    fn test_empty_string_reads_as_absent() {
        let headers = Headers::new().with(RESOURCE_ID, "").with(OP, "echo");
        assert_eq!(headers.resource_id(), None);
        assert_eq!(headers.op(), Some("echo"));
        assert_eq!(headers.error_message(), "");
    }

    #[test]
    fn test_actor_roles() {
        let headers = Headers::new().with(
            ACTOR_ROLES,
            json!({"org_a": ["MEMBER", "OPERATOR"], "org_b": "bogus"}),
        );
        let roles = headers.actor_roles();
        assert_eq!(roles["org_a"], vec!["MEMBER", "OPERATOR"]);
        assert!(roles["org_b"].is_empty());
    }

    #[test]
    fn test_serializes_as_plain_map() {
        let headers = Headers::new().with(OP, "echo").with(CONV_SEQ, 1);
        let value = serde_json::to_value(&headers).unwrap();
        assert_eq!(value, json!({"op": "echo", "conv-seq": 1}));
    }
}

//! Strongly-typed identifiers.
//!
//! All IDs are validated at construction time and implement common traits.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Macro to define a strongly-typed ID newtype wrapper.
///
/// Generates: struct, `from_string()`, `as_str()`, Display, Serialize, Deserialize.
/// Optionally generates `new()` (UUID v4) and `Default` if `uuid` flag is passed.
macro_rules! define_id {
    ($name:ident, uuid) => {
        define_id!($name);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4().simple().to_string())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn from_string(s: String) -> Result<Self, &'static str> {
                if s.is_empty() {
                    return Err(concat!(stringify!($name), " cannot be empty"));
                }
                Ok(Self(s))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(ContainerId, uuid);
define_id!(ProcessId);
define_id!(ConvId);

/// Check that a caller-supplied identifier is usable as a queue/process name.
pub fn is_valid_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

impl ProcessId {
    /// Validate an explicit process id.
    pub fn parse(s: &str) -> Result<Self, &'static str> {
        if !is_valid_identifier(s) {
            return Err("ProcessId must be a valid identifier");
        }
        Ok(Self(s.to_string()))
    }
}

/// Generates container-local process ids of the form `<container_id>.<n>`.
#[derive(Debug)]
pub struct ProcessIdPool {
    prefix: String,
    next: AtomicU64,
}

impl ProcessIdPool {
    pub fn new(container_id: &ContainerId) -> Self {
        Self {
            prefix: container_id.as_str().to_string(),
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ProcessId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        ProcessId(format!("{}.{}", self.prefix, n))
    }
}

/// Generates globally unique conversation ids: a host root plus a counter.
#[derive(Debug)]
pub struct ConvIdGenerator {
    root: String,
    counter: AtomicU64,
}

impl ConvIdGenerator {
    pub fn new(host: &str) -> Self {
        Self {
            root: format!("{}_{}", host, &uuid::Uuid::new_v4().simple().to_string()[..8]),
            counter: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> ConvId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        ConvId(format!("{}-{}", self.root, n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_empty_id_rejected() {
        assert!(ConvId::from_string(String::new()).is_err());
        assert!(ProcessId::parse("").is_err());
        assert!(ProcessId::parse("has space").is_err());
        assert!(ProcessId::parse("c1.proc-1_a").is_ok());
    }

    #[test]
    fn test_process_ids_are_prefixed_and_sequential() {
        let cid = ContainerId::from_string("cc".to_string()).unwrap();
        let pool = ProcessIdPool::new(&cid);
        assert_eq!(pool.next_id().as_str(), "cc.1");
        assert_eq!(pool.next_id().as_str(), "cc.2");
    }

    #[test]
    fn test_conv_ids_unique() {
        let gen = ConvIdGenerator::new("host");
        let ids: HashSet<_> = (0..500).map(|_| gen.next_id()).collect();
        assert_eq!(ids.len(), 500);
    }

    proptest! {
        #[test]
        fn prop_identifier_chars(s in "[A-Za-z0-9_.-]{1,40}") {
            prop_assert!(is_valid_identifier(&s));
            prop_assert!(ProcessId::parse(&s).is_ok());
        }

        #[test]
        fn prop_whitespace_is_invalid(prefix in "[a-z]{0,5}", suffix in "[a-z]{0,5}") {
            let s = format!("{} {}", prefix, suffix);
            prop_assert!(!is_valid_identifier(&s));
        }
    }
}

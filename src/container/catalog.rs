//! Process catalog: maps `module.class` references to service factories.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::process::Service;
use super::types::ProcessType;
use crate::types::{Error, Result};

pub type ServiceFactory = Arc<dyn Fn(&Value) -> Result<Box<dyn Service>> + Send + Sync>;

#[derive(Clone)]
pub struct CatalogEntry {
    /// Type used when the spawn config does not name one.
    pub process_type: ProcessType,
    factory: ServiceFactory,
}

impl CatalogEntry {
    /// Build a fresh service instance from the merged spawn config.
    pub fn create(&self, config: &Value) -> Result<Box<dyn Service>> {
        (self.factory)(config)
    }
}

impl fmt::Debug for CatalogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogEntry")
            .field("process_type", &self.process_type)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessCatalog {
    entries: HashMap<String, CatalogEntry>,
}

impl ProcessCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, module: &str, class: &str, process_type: ProcessType, factory: F)
    where
        F: Fn(&Value) -> Result<Box<dyn Service>> + Send + Sync + 'static,
    {
        self.entries.insert(
            Self::key(module, class),
            CatalogEntry {
                process_type,
                factory: Arc::new(factory),
            },
        );
    }

    /// Builder form of [`ProcessCatalog::register`].
    pub fn with<F>(mut self, module: &str, class: &str, process_type: ProcessType, factory: F) -> Self
    where
        F: Fn(&Value) -> Result<Box<dyn Service>> + Send + Sync + 'static,
    {
        self.register(module, class, process_type, factory);
        self
    }

    pub fn resolve(&self, module: &str, class: &str) -> Result<&CatalogEntry> {
        self.entries.get(&Self::key(module, class)).ok_or_else(|| {
            Error::container_config(format!("unknown process class: {}.{}", module, class))
        })
    }

    pub fn contains(&self, module: &str, class: &str) -> bool {
        self.entries.contains_key(&Self::key(module, class))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn key(module: &str, class: &str) -> String {
        format!("{}.{}", module, class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::CallContext;
    use async_trait::async_trait;
    use serde_json::Map;

    struct Nop;

    #[async_trait]
    impl Service for Nop {
        fn operations(&self) -> Vec<&'static str> {
            vec!["noop"]
        }

        async fn call(&mut self, _op: &str, _args: Map<String, Value>, _ctx: &CallContext) -> Result<Value> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn test_resolve_known_and_unknown() {
        let catalog = ProcessCatalog::new().with("demo.nop", "Nop", ProcessType::Service, |_| Ok(Box::new(Nop)));
        assert!(catalog.contains("demo.nop", "Nop"));

        let entry = catalog.resolve("demo.nop", "Nop").unwrap();
        assert_eq!(entry.process_type, ProcessType::Service);
        let service = entry.create(&Value::Null).unwrap();
        assert_eq!(service.operations(), vec!["noop"]);

        let err = catalog.resolve("demo.nop", "Missing").unwrap_err();
        assert_eq!(err.kind(), crate::types::ErrorKind::ContainerConfig);
    }
}

//! Resource registry seam.

use async_trait::async_trait;
use std::fmt;

use super::process::ProcessInfo;
use crate::types::Result;

/// Bookkeeping of processes in an external resource registry.
#[async_trait]
pub trait ResourceRegistry: Send + Sync + fmt::Debug {
    /// Record a started process. Returns the registry's id for it, if any.
    async fn register_process(&self, process: &ProcessInfo) -> Result<Option<String>>;

    async fn unregister_process(&self, resource_id: &str) -> Result<()>;
}

/// Registry that records nothing.
#[derive(Debug, Default)]
pub struct NoopResourceRegistry;

#[async_trait]
impl ResourceRegistry for NoopResourceRegistry {
    async fn register_process(&self, _process: &ProcessInfo) -> Result<Option<String>> {
        Ok(None)
    }

    async fn unregister_process(&self, _resource_id: &str) -> Result<()> {
        Ok(())
    }
}

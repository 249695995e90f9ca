//! The governance interceptor.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::controller::GovernanceController;
use crate::envelope::{names, Performative};
use crate::interceptor::{AnnotationCategory, AnnotationStatus, Interceptor, Invocation};
use crate::types::{ErrorKind, Result};

/// Enforces access rules on inbound requests.
#[derive(Debug)]
pub struct PolicyInterceptor {
    controller: Arc<GovernanceController>,
}

impl PolicyInterceptor {
    pub fn new(controller: Arc<GovernanceController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl Interceptor for PolicyInterceptor {
    fn name(&self) -> &str {
        "governance"
    }

    async fn incoming(&self, inv: &mut Invocation) -> Result<()> {
        if !self.controller.is_enabled() || inv.message.performative() != Some(Performative::Request) {
            return Ok(());
        }
        let Some(process) = inv.process.clone() else {
            return Ok(());
        };
        if inv
            .headers()
            .actor_id()
            .is_some_and(|actor| self.controller.is_system_actor(actor))
        {
            inv.annotate(AnnotationCategory::Policy, AnnotationStatus::Skipped);
            return Ok(());
        }

        inv.annotate(AnnotationCategory::Policy, AnnotationStatus::Started);
        match self
            .controller
            .authorize(&process, &inv.message.headers)
            .await
        {
            Ok(()) => inv.annotate(AnnotationCategory::Policy, AnnotationStatus::Complete),
            Err(e) if e.kind() == ErrorKind::Unauthorized => {
                inv.reject(AnnotationCategory::Policy, e.message());
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Stamp the target resource on outgoing messages that name one in the
    /// body but not in the headers.
    async fn outgoing(&self, inv: &mut Invocation) -> Result<()> {
        if inv.headers().contains(names::RESOURCE_ID) {
            return Ok(());
        }
        let resource_id = inv
            .message
            .body
            .get("resource_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(resource_id) = resource_id {
            inv.headers_mut().insert(names::RESOURCE_ID, resource_id);
        }
        Ok(())
    }
}

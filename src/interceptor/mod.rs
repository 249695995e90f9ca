//! Interceptor pipeline.
//!
//! Every endpoint runs its messages through an [`InterceptorStack`]: an
//! ordered list of [`Interceptor`]s per direction. Interceptors see an
//! [`Invocation`], may rewrite its headers and may veto delivery by setting
//! a `Reject` annotation for a category. The stack stops at the first reject;
//! the calling endpoint decides what a reject means:
//!
//! - **Policy** reject → Unauthorized reply to the originator
//! - **Conversation** reject → message is dropped

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::container::ProcessInfo;
use crate::envelope::{Headers, Message};
use crate::types::{Error, Result};

mod builtin;

pub use builtin::{ConversationInterceptor, MessageLogInterceptor};

// =============================================================================
// Invocation
// =============================================================================

/// Which way a message is flowing relative to the local process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Annotation categories that can veto a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnnotationCategory {
    Policy,
    Conversation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnnotationStatus {
    Started,
    Complete,
    Skipped,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub status: AnnotationStatus,
    pub reason: Option<String>,
}

/// The veto left behind by a rejecting interceptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub category: AnnotationCategory,
    pub reason: String,
}

/// One message passing through the stack.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub direction: Direction,
    pub message: Message,
    /// The local process sending or receiving, if any.
    pub process: Option<Arc<ProcessInfo>>,
    annotations: HashMap<AnnotationCategory, Annotation>,
}

impl Invocation {
    pub fn new(direction: Direction, message: Message) -> Self {
        Self {
            direction,
            message,
            process: None,
            annotations: HashMap::new(),
        }
    }

    pub fn with_process(mut self, process: Option<Arc<ProcessInfo>>) -> Self {
        self.process = process;
        self
    }

    pub fn headers(&self) -> &Headers {
        &self.message.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.message.headers
    }

    pub fn annotate(&mut self, category: AnnotationCategory, status: AnnotationStatus) {
        self.annotations.insert(
            category,
            Annotation {
                status,
                reason: None,
            },
        );
    }

    pub fn reject(&mut self, category: AnnotationCategory, reason: impl Into<String>) {
        self.annotations.insert(
            category,
            Annotation {
                status: AnnotationStatus::Reject,
                reason: Some(reason.into()),
            },
        );
    }

    pub fn annotation(&self, category: AnnotationCategory) -> Option<&Annotation> {
        self.annotations.get(&category)
    }

    /// The first reject found; policy takes precedence over conversation.
    pub fn rejection(&self) -> Option<Rejection> {
        [AnnotationCategory::Policy, AnnotationCategory::Conversation]
            .into_iter()
            .find_map(|category| {
                let ann = self.annotations.get(&category)?;
                (ann.status == AnnotationStatus::Reject).then(|| Rejection {
                    category,
                    reason: ann.reason.clone().unwrap_or_default(),
                })
            })
    }

    pub fn is_rejected(&self) -> bool {
        self.annotations
            .values()
            .any(|a| a.status == AnnotationStatus::Reject)
    }
}

// =============================================================================
// Interceptor
// =============================================================================

/// A named, direction-aware message transformer.
#[async_trait]
pub trait Interceptor: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    async fn incoming(&self, _invocation: &mut Invocation) -> Result<()> {
        Ok(())
    }

    async fn outgoing(&self, _invocation: &mut Invocation) -> Result<()> {
        Ok(())
    }
}

/// Ordered interceptor lists, one per direction.
#[derive(Debug, Clone, Default)]
pub struct InterceptorStack {
    incoming: Vec<Arc<dyn Interceptor>>,
    outgoing: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorStack {
    /// Incoming runs in the given order, outgoing in reverse.
    pub fn new(interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        let outgoing = interceptors.iter().rev().cloned().collect();
        Self {
            incoming: interceptors,
            outgoing,
        }
    }

    pub fn with_directions(
        incoming: Vec<Arc<dyn Interceptor>>,
        outgoing: Vec<Arc<dyn Interceptor>>,
    ) -> Self {
        Self { incoming, outgoing }
    }

    /// Build a stack from configured names.
    pub fn from_order(
        order: &[String],
        available: &HashMap<String, Arc<dyn Interceptor>>,
    ) -> Result<Self> {
        let interceptors = order
            .iter()
            .map(|name| {
                available.get(name).cloned().ok_or_else(|| {
                    Error::container_config(format!("unknown interceptor: {}", name))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(interceptors))
    }

    pub fn names(&self, direction: Direction) -> Vec<&str> {
        self.chain(direction).iter().map(|i| i.name()).collect()
    }

    fn chain(&self, direction: Direction) -> &[Arc<dyn Interceptor>] {
        match direction {
            Direction::Incoming => &self.incoming,
            Direction::Outgoing => &self.outgoing,
        }
    }

    /// Run the chain for the invocation's direction, stopping after the
    /// first interceptor that leaves a reject annotation.
    pub async fn process(&self, mut invocation: Invocation) -> Result<Invocation> {
        for interceptor in self.chain(invocation.direction) {
            match invocation.direction {
                Direction::Incoming => interceptor.incoming(&mut invocation).await?,
                Direction::Outgoing => interceptor.outgoing(&mut invocation).await?,
            }
            if invocation.is_rejected() {
                tracing::debug!(
                    interceptor = interceptor.name(),
                    direction = ?invocation.direction,
                    "interceptor chain stopped on reject"
                );
                break;
            }
        }
        Ok(invocation)
    }
}

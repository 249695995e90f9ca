//! Process state notifications.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::process::ProcessInfo;
use super::types::{ProcessState, ProcessType};
use crate::types::ProcessId;

/// One lifecycle transition of one process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessStateEvent {
    pub process_id: ProcessId,
    pub name: String,
    pub process_type: Option<ProcessType>,
    pub state: ProcessState,
    pub timestamp: DateTime<Utc>,
}

impl ProcessStateEvent {
    pub fn new(process_id: ProcessId, name: impl Into<String>, state: ProcessState) -> Self {
        Self {
            process_id,
            name: name.into(),
            process_type: None,
            state,
            timestamp: Utc::now(),
        }
    }

    pub fn for_process(info: &ProcessInfo, state: ProcessState) -> Self {
        Self {
            process_type: Some(info.process_type),
            ..Self::new(info.id.clone(), info.name.clone(), state)
        }
    }
}

pub type StateCallback = Arc<dyn Fn(&ProcessStateEvent) + Send + Sync>;

/// Handle returned when registering a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Fans process state changes out to registered callbacks, in
/// registration order.
#[derive(Default)]
pub struct LifecycleNotifier {
    next_id: AtomicU64,
    callbacks: RwLock<Vec<(CallbackId, StateCallback)>>,
}

impl fmt::Debug for LifecycleNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleNotifier")
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

impl LifecycleNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&ProcessStateEvent) + Send + Sync + 'static,
    {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks.write().await.push((id, Arc::new(callback)));
        id
    }

    pub async fn remove(&self, id: CallbackId) -> bool {
        let mut callbacks = self.callbacks.write().await;
        let before = callbacks.len();
        callbacks.retain(|(cb_id, _)| *cb_id != id);
        callbacks.len() != before
    }

    pub async fn emit(&self, event: ProcessStateEvent) {
        tracing::info!(
            process_id = %event.process_id,
            name = %event.name,
            "Process state {}",
            event.state
        );
        let callbacks: Vec<StateCallback> = self
            .callbacks
            .read()
            .await
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(&event);
        }
    }
}
